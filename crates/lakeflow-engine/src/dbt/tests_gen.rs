// Generated check SQL per test type. A test passes when its check counts
// zero rows.

use lakeflow_core::model::qualified_name;
use lakeflow_core::TestType;
use lakeflow_storage::DbtTestRow;
use regex::Regex;
use serde_json::Value;

/// None when the test is misconfigured (missing column/config)
pub fn generate_test_sql(test: &DbtTestRow, model_name: &str, relation: &str) -> Option<String> {
    let test_type: TestType = test.test_type.parse().ok()?;
    match test_type {
        TestType::NotNull => {
            let column = quoted_column(test.column_name.as_deref()?);
            Some(format!(
                "SELECT COUNT(*) FROM {relation} WHERE {column} IS NULL"
            ))
        }
        TestType::Unique => {
            let column = quoted_column(test.column_name.as_deref()?);
            Some(format!(
                "SELECT COUNT(*) FROM (SELECT {column}, COUNT(*) AS cnt FROM {relation} \
                 GROUP BY {column} HAVING COUNT(*) > 1) AS duplicates"
            ))
        }
        TestType::Relationships => {
            let column = quoted_column(test.column_name.as_deref()?);
            let to = test.test_config.get("to").and_then(Value::as_str)?;
            let to_relation = match to.split_once('.') {
                Some((schema, table)) => qualified_name(schema, table),
                None => to.to_string(),
            };
            let field = test
                .test_config
                .get("field")
                .and_then(Value::as_str)
                .map(quoted_column)
                .unwrap_or_else(|| column.clone());
            Some(format!(
                "SELECT COUNT(*) FROM {relation} t1 \
                 LEFT JOIN {to_relation} t2 ON t1.{column} = t2.{field} \
                 WHERE t2.{field} IS NULL AND t1.{column} IS NOT NULL"
            ))
        }
        TestType::AcceptedValues => {
            let column = quoted_column(test.column_name.as_deref()?);
            let values = test.test_config.get("values").and_then(Value::as_array)?;
            if values.is_empty() {
                return None;
            }
            let list = values
                .iter()
                .map(|v| match v {
                    Value::String(s) => format!("'{}'", s.replace('\'', "''")),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", ");
            Some(format!(
                "SELECT COUNT(*) FROM {relation} WHERE {column} NOT IN ({list})"
            ))
        }
        TestType::Expression | TestType::Custom => {
            let sql = test.test_sql.as_deref()?;
            // Resolve only the self-reference; anything else stays literal
            let pattern = Regex::new(&format!(
                r#"\{{\{{\s*ref\s*\(\s*['"]?{}['"]?\s*\)\s*\}}\}}"#,
                regex::escape(model_name)
            ))
            .ok()?;
            Some(pattern.replace_all(sql, relation).into_owned())
        }
    }
}

fn quoted_column(column: &str) -> String {
    format!("\"{}\"", column.replace('"', ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_row(test_type: &str, column: Option<&str>, config: Value) -> DbtTestRow {
        DbtTestRow {
            id: 1,
            test_name: "t".into(),
            model_name: "orders".into(),
            test_type: test_type.into(),
            column_name: column.map(String::from),
            test_config: config,
            test_sql: None,
            severity: "error".into(),
            active: true,
        }
    }

    const REL: &str = "\"analytics\".\"orders\"";

    #[test]
    fn not_null_check() {
        let t = test_row("not_null", Some("id"), json!(null));
        assert_eq!(
            generate_test_sql(&t, "orders", REL).unwrap(),
            format!("SELECT COUNT(*) FROM {REL} WHERE \"id\" IS NULL")
        );
    }

    #[test]
    fn unique_check_counts_duplicates() {
        let t = test_row("unique", Some("id"), json!(null));
        let sql = generate_test_sql(&t, "orders", REL).unwrap();
        assert!(sql.contains("GROUP BY \"id\" HAVING COUNT(*) > 1"));
    }

    #[test]
    fn relationships_left_anti_join() {
        let t = test_row(
            "relationships",
            Some("customer_id"),
            json!({"to": "analytics.customers", "field": "id"}),
        );
        let sql = generate_test_sql(&t, "orders", REL).unwrap();
        assert!(sql.contains("LEFT JOIN \"analytics\".\"customers\" t2"));
        assert!(sql.contains("ON t1.\"customer_id\" = t2.\"id\""));
        assert!(sql.contains("WHERE t2.\"id\" IS NULL"));
    }

    #[test]
    fn accepted_values_list() {
        let t = test_row(
            "accepted_values",
            Some("status"),
            json!({"values": ["open", "closed"]}),
        );
        let sql = generate_test_sql(&t, "orders", REL).unwrap();
        assert!(sql.contains("NOT IN ('open', 'closed')"));
    }

    #[test]
    fn accepted_values_escapes_quotes() {
        let t = test_row(
            "accepted_values",
            Some("status"),
            json!({"values": ["it's"]}),
        );
        let sql = generate_test_sql(&t, "orders", REL).unwrap();
        assert!(sql.contains("'it''s'"));
    }

    #[test]
    fn custom_test_resolves_self_ref() {
        let mut t = test_row("custom", None, json!(null));
        t.test_sql = Some("SELECT COUNT(*) FROM {{ ref('orders') }} WHERE total < 0".into());
        assert_eq!(
            generate_test_sql(&t, "orders", REL).unwrap(),
            format!("SELECT COUNT(*) FROM {REL} WHERE total < 0")
        );
    }

    #[test]
    fn misconfigured_tests_yield_none() {
        let t = test_row("not_null", None, json!(null));
        assert!(generate_test_sql(&t, "orders", REL).is_none());
        let t = test_row("accepted_values", Some("s"), json!({"values": []}));
        assert!(generate_test_sql(&t, "orders", REL).is_none());
        let t = test_row("nonsense", Some("s"), json!(null));
        assert!(generate_test_sql(&t, "orders", REL).is_none());
    }
}
