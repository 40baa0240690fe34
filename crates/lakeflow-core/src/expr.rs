// Condition expression evaluator for workflow tasks.
// A small deterministic language over prior task outputs:
//
//   outputs of task "extract" are addressed as `extract`, fields as
//   `extract.row_count`, loop iterations as `extract[0].row_count`.
//
// Operators: == != < <= > >= && || !  with parentheses. Literals: single- or
// double-quoted strings, numbers, true/false/null. A bare reference is truthy
// when it resolves to true, a non-zero number, a non-empty string, or any
// array/object.

use serde_json::{Map, Value};

use crate::error::CoreError;

pub fn evaluate(expr: &str, outputs: &Map<String, Value>) -> Result<bool, CoreError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        outputs,
    };
    let value = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(CoreError::InvalidExpression(format!(
            "unexpected trailing input in {expr:?}"
        )));
    }
    Ok(truthy(&value))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Reference(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, CoreError> {
    let bytes: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let err = |msg: String| CoreError::InvalidExpression(msg);

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(err(format!("single '=' at offset {i}")));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(err(format!("single '&' at offset {i}")));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(err(format!("single '|' at offset {i}")));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] != quote {
                    j += 1;
                }
                if j == bytes.len() {
                    return Err(err("unterminated string literal".into()));
                }
                tokens.push(Token::Str(bytes[start..j].iter().collect()));
                i = j + 1;
            }
            c if c.is_ascii_digit()
                || (c == '-' && bytes.get(i + 1).is_some_and(|d| d.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == '.') {
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| CoreError::InvalidExpression(format!("bad number {text:?}")))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric()
                        || matches!(bytes[i], '_' | '.' | '[' | ']'))
                {
                    i += 1;
                }
                let word: String = bytes[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    "null" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Reference(word)),
                }
            }
            other => return Err(err(format!("unexpected character {other:?}"))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    outputs: &'a Map<String, Value>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn or_expr(&mut self) -> Result<Value, CoreError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.and_expr()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Value, CoreError> {
        let mut left = self.comparison()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.comparison()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Value, CoreError> {
        let left = self.unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Token::Eq,
            Some(Token::Ne) => Token::Ne,
            Some(Token::Lt) => Token::Lt,
            Some(Token::Le) => Token::Le,
            Some(Token::Gt) => Token::Gt,
            Some(Token::Ge) => Token::Ge,
            _ => return Ok(left),
        };
        self.next();
        let right = self.unary()?;
        Ok(Value::Bool(compare(&op, &left, &right)))
    }

    fn unary(&mut self) -> Result<Value, CoreError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let value = self.unary()?;
            return Ok(Value::Bool(!truthy(&value)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Value, CoreError> {
        match self.next().cloned() {
            Some(Token::LParen) => {
                let value = self.or_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(CoreError::InvalidExpression("missing ')'".into())),
                }
            }
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Num(n)) => Ok(serde_json::json!(n)),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Reference(path)) => Ok(resolve(&path, self.outputs)),
            other => Err(CoreError::InvalidExpression(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

/// Walk a dotted/indexed path through the outputs map.
/// Unresolvable paths yield null rather than an error, so conditions over a
/// task that produced no output simply evaluate false.
fn resolve(path: &str, outputs: &Map<String, Value>) -> Value {
    let mut current: Option<&Value> = None;
    for segment in split_path(path) {
        current = match (current, segment) {
            (None, Segment::Key(k)) => outputs.get(k),
            (Some(Value::Object(map)), Segment::Key(k)) => map.get(k),
            (Some(Value::Array(items)), Segment::Index(i)) => items.get(i),
            _ => None,
        };
        if current.is_none() {
            return Value::Null;
        }
    }
    current.cloned().unwrap_or(Value::Null)
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

fn split_path(path: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    for dotted in path.split('.') {
        let mut rest = dotted;
        while let Some(open) = rest.find('[') {
            if open > 0 {
                segments.push(Segment::Key(&rest[..open]));
            }
            match rest[open + 1..].find(']') {
                Some(close) => {
                    let idx = &rest[open + 1..open + 1 + close];
                    match idx.parse::<usize>() {
                        Ok(i) => segments.push(Segment::Index(i)),
                        Err(_) => segments.push(Segment::Key(idx)),
                    }
                    rest = &rest[open + close + 2..];
                }
                None => {
                    segments.push(Segment::Key(rest));
                    rest = "";
                }
            }
        }
        if !rest.is_empty() {
            segments.push(Segment::Key(rest));
        }
    }
    segments
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(op: &Token, left: &Value, right: &Value) -> bool {
    match op {
        Token::Eq => values_equal(left, right),
        Token::Ne => !values_equal(left, right),
        _ => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .zip(b.as_f64())
                    .and_then(|(a, b)| a.partial_cmp(&b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            match (op, ordering) {
                (Token::Lt, Some(o)) => o.is_lt(),
                (Token::Le, Some(o)) => o.is_le(),
                (Token::Gt, Some(o)) => o.is_gt(),
                (Token::Ge, Some(o)) => o.is_ge(),
                _ => false,
            }
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        // 1 == 1.0 regardless of the underlying json number repr
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> Map<String, Value> {
        let value = json!({
            "extract": {"row_count": 42, "status": "SUCCESS", "empty": ""},
            "load": [{"rows": 10}, {"rows": 0}],
            "flag": true,
        });
        value.as_object().unwrap().clone()
    }

    #[test]
    fn comparisons_on_task_outputs() {
        let out = outputs();
        assert!(evaluate("extract.row_count > 10", &out).unwrap());
        assert!(evaluate("extract.row_count == 42", &out).unwrap());
        assert!(evaluate("extract.status == 'SUCCESS'", &out).unwrap());
        assert!(!evaluate("extract.status != \"SUCCESS\"", &out).unwrap());
        assert!(evaluate("extract.row_count <= 42", &out).unwrap());
    }

    #[test]
    fn boolean_connectives() {
        let out = outputs();
        assert!(evaluate("extract.row_count > 0 && flag", &out).unwrap());
        assert!(evaluate("extract.row_count > 100 || flag", &out).unwrap());
        assert!(!evaluate("!(flag)", &out).unwrap());
        assert!(evaluate("!(extract.row_count > 100) && flag", &out).unwrap());
    }

    #[test]
    fn loop_outputs_by_index() {
        let out = outputs();
        assert!(evaluate("load[0].rows == 10", &out).unwrap());
        assert!(evaluate("load[1].rows == 0", &out).unwrap());
        assert!(!evaluate("load[2].rows == 0", &out).unwrap());
    }

    #[test]
    fn missing_references_are_null_and_falsy() {
        let out = outputs();
        assert!(!evaluate("ghost.row_count > 0", &out).unwrap());
        assert!(evaluate("ghost == null", &out).unwrap());
        assert!(!evaluate("ghost", &out).unwrap());
    }

    #[test]
    fn truthiness_of_bare_references() {
        let out = outputs();
        assert!(evaluate("extract", &out).unwrap());
        assert!(!evaluate("extract.empty", &out).unwrap());
        assert!(evaluate("extract.row_count", &out).unwrap());
    }

    #[test]
    fn malformed_expressions_error() {
        let out = outputs();
        assert!(evaluate("a = b", &out).is_err());
        assert!(evaluate("(a == 1", &out).is_err());
        assert!(evaluate("a == 'open", &out).is_err());
        assert!(evaluate("a && ", &out).is_err());
        assert!(evaluate("a == 1 b", &out).is_err());
    }

    #[test]
    fn numeric_equality_across_representations() {
        let out = outputs();
        assert!(evaluate("extract.row_count == 42.0", &out).unwrap());
    }
}
