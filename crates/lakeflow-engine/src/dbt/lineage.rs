// Column-level lineage from a compiled SELECT list.
// Select items with a discernible single source column produce qualified
// edges; expressions that cannot be attributed get an empty source_column.

/// (source_column, target_column) pairs extracted from the outermost
/// SELECT list of `compiled_sql`. Empty for `SELECT *`.
pub fn select_list_columns(compiled_sql: &str) -> Vec<(String, String)> {
    let Some(items) = outer_select_list(compiled_sql) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| classify_item(item))
        .collect()
}

/// Text between the outermost SELECT and its FROM, split on top-level commas
fn outer_select_list(sql: &str) -> Option<Vec<String>> {
    let lower = sql.to_lowercase();
    let select_at = find_keyword(&lower, "select", 0)?;
    let mut depth = 0usize;
    let mut from_at = None;
    let bytes = lower.as_bytes();
    let mut i = select_at + "select".len();
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b'f' | b'F' if depth == 0 => {
                if lower[i..].starts_with("from") && is_word_boundary(&lower, i, 4) {
                    from_at = Some(i);
                    break;
                }
            }
            _ => {}
        }
        i += 1;
    }
    let from_at = from_at?;
    let list = &sql[select_at + "select".len()..from_at];

    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in list.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                items.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }
    Some(items)
}

fn find_keyword(lower: &str, keyword: &str, from: usize) -> Option<usize> {
    let at = lower[from..].find(keyword)? + from;
    is_word_boundary(lower, at, keyword.len()).then_some(at)
}

fn is_word_boundary(text: &str, at: usize, len: usize) -> bool {
    let before_ok = at == 0
        || !text.as_bytes()[at - 1].is_ascii_alphanumeric() && text.as_bytes()[at - 1] != b'_';
    let after = at + len;
    let after_ok = after >= text.len()
        || !text.as_bytes()[after].is_ascii_alphanumeric() && text.as_bytes()[after] != b'_';
    before_ok && after_ok
}

/// None for `*`; (source, target) with empty source for expressions
fn classify_item(item: &str) -> Option<(String, String)> {
    let trimmed = item.trim();
    if trimmed == "*" || trimmed.ends_with(".*") || trimmed.is_empty() {
        return None;
    }

    // Split off an alias: `expr AS alias` or trailing bare alias
    let lower = trimmed.to_lowercase();
    let (expr, alias) = match lower.rfind(" as ") {
        Some(pos) if paren_depth_at(trimmed, pos) == 0 => {
            (trimmed[..pos].trim(), Some(trimmed[pos + 4..].trim()))
        }
        _ => (trimmed, None),
    };

    if is_simple_column(expr) {
        let source = expr
            .rsplit('.')
            .next()
            .unwrap_or(expr)
            .trim_matches('"')
            .to_string();
        let target = alias
            .map(|a| a.trim_matches('"').to_string())
            .unwrap_or_else(|| source.clone());
        Some((source, target))
    } else {
        // Expression: attributable only when aliased
        alias.map(|a| (String::new(), a.trim_matches('"').to_string()))
    }
}

fn paren_depth_at(text: &str, at: usize) -> usize {
    let mut depth = 0usize;
    for (i, c) in text.char_indices() {
        if i >= at {
            break;
        }
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    depth
}

fn is_simple_column(expr: &str) -> bool {
    !expr.is_empty()
        && expr.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '"')
        })
        && !expr.chars().next().is_some_and(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_columns_map_to_themselves() {
        let cols = select_list_columns("SELECT id, name FROM t");
        assert_eq!(
            cols,
            vec![
                ("id".to_string(), "id".to_string()),
                ("name".to_string(), "name".to_string()),
            ]
        );
    }

    #[test]
    fn qualified_and_aliased_columns() {
        let cols = select_list_columns("SELECT o.id AS order_id, o.total FROM orders o");
        assert_eq!(
            cols,
            vec![
                ("id".to_string(), "order_id".to_string()),
                ("total".to_string(), "total".to_string()),
            ]
        );
    }

    #[test]
    fn expressions_get_empty_source() {
        let cols = select_list_columns("SELECT SUM(total) AS revenue, id FROM t");
        assert_eq!(
            cols,
            vec![
                (String::new(), "revenue".to_string()),
                ("id".to_string(), "id".to_string()),
            ]
        );
    }

    #[test]
    fn unaliased_expressions_are_dropped() {
        let cols = select_list_columns("SELECT COUNT(*), id FROM t");
        assert_eq!(cols, vec![("id".to_string(), "id".to_string())]);
    }

    #[test]
    fn star_produces_nothing() {
        assert!(select_list_columns("SELECT * FROM t").is_empty());
        assert!(select_list_columns("SELECT t.* FROM t").is_empty());
    }

    #[test]
    fn commas_inside_functions_do_not_split() {
        let cols = select_list_columns("SELECT COALESCE(a, b) AS ab, c FROM t");
        assert_eq!(
            cols,
            vec![
                (String::new(), "ab".to_string()),
                ("c".to_string(), "c".to_string()),
            ]
        );
    }

    #[test]
    fn nested_from_inside_function_is_skipped() {
        let cols = select_list_columns("SELECT EXTRACT(EPOCH FROM created_at) AS ts, id FROM t");
        assert_eq!(
            cols,
            vec![
                (String::new(), "ts".to_string()),
                ("id".to_string(), "id".to_string()),
            ]
        );
    }
}
