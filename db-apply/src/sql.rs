use serde_json::{Map, Value};

/// Identifiers are wrapped verbatim; the op/table allow-lists are the sole
/// defense against injection through identifiers.
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

/// Standard-conforming-strings escape: double every single quote.
pub fn escape_string(s: &str) -> String {
    s.replace('\'', "''")
}

/// Render one JSON value as a SQL literal. Objects and arrays are stored as
/// their JSON text in a string literal.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(s) => format!("'{}'", escape_string(s)),
        other => {
            let json = serde_json::to_string(other)
                .expect("serde_json::Value serialization cannot fail");
            format!("'{}'", escape_string(&json))
        }
    }
}

/// ` WHERE "k1" = v1 AND "k2" = v2` in insertion order; an empty filter
/// yields no clause at all (match-all).
pub fn where_clause(filter: &Map<String, Value>) -> String {
    if filter.is_empty() {
        return String::new();
    }
    let mut clause = String::from(" WHERE ");
    for (index, (column, value)) in filter.iter().enumerate() {
        if index > 0 {
            clause.push_str(" AND ");
        }
        clause.push_str(&quote_identifier(column));
        clause.push_str(" = ");
        clause.push_str(&literal(value));
    }
    clause
}

pub fn build_insert(table: &str, values: &Map<String, Value>) -> String {
    let columns: Vec<String> = values.keys().map(|key| quote_identifier(key)).collect();
    let literals: Vec<String> = values.values().map(literal).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({});",
        quote_identifier(table),
        columns.join(","),
        literals.join(",")
    )
}

pub fn build_update(
    table: &str,
    values: &Map<String, Value>,
    filter: &Map<String, Value>,
) -> String {
    let assignments: Vec<String> = values
        .iter()
        .map(|(column, value)| format!("{} = {}", quote_identifier(column), literal(value)))
        .collect();
    format!(
        "UPDATE {} SET {}{};",
        quote_identifier(table),
        assignments.join(","),
        where_clause(filter)
    )
}

pub fn build_delete(table: &str, filter: &Map<String, Value>) -> String {
    format!(
        "DELETE FROM {}{};",
        quote_identifier(table),
        where_clause(filter)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn literals_cover_every_json_type() {
        assert_eq!(literal(&Value::Null), "NULL");
        assert_eq!(literal(&json!(true)), "TRUE");
        assert_eq!(literal(&json!(false)), "FALSE");
        assert_eq!(literal(&json!(42)), "42");
        assert_eq!(literal(&json!(-7)), "-7");
        assert_eq!(literal(&json!(1.5)), "1.5");
        assert_eq!(literal(&json!("Ada")), "'Ada'");
        assert_eq!(literal(&json!("O'Brien")), "'O''Brien'");
        assert_eq!(literal(&json!({"a": 1})), "'{\"a\":1}'");
        assert_eq!(literal(&json!([1, "x'"])), "'[1,\"x''\"]'");
    }

    #[test]
    fn insert_preserves_key_order() {
        let values = map(json!({"id": 1, "name": "Ada"}));
        assert_eq!(
            build_insert("users", &values),
            r#"INSERT INTO "users" ("id","name") VALUES (1,'Ada');"#
        );
    }

    #[test]
    fn update_with_filter() {
        let values = map(json!({"name": "Ada", "active": true}));
        let filter = map(json!({"id": 1}));
        assert_eq!(
            build_update("users", &values, &filter),
            r#"UPDATE "users" SET "name" = 'Ada',"active" = TRUE WHERE "id" = 1;"#
        );
    }

    #[test]
    fn empty_filter_means_match_all() {
        let values = map(json!({"active": false}));
        assert_eq!(
            build_update("users", &values, &Map::new()),
            r#"UPDATE "users" SET "active" = FALSE;"#
        );
        assert_eq!(build_delete("users", &Map::new()), r#"DELETE FROM "users";"#);
    }

    #[test]
    fn delete_with_multiple_conditions_keeps_insertion_order() {
        let filter = map(json!({"tenant": "acme", "id": 7}));
        assert_eq!(
            build_delete("sessions", &filter),
            r#"DELETE FROM "sessions" WHERE "tenant" = 'acme' AND "id" = 7;"#
        );
    }
}
