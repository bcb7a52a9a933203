use serde_json::{Map, Value};

use crate::error::ApplyError;

/// One job message off the wire: either a single statement or a batch to be
/// applied in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum JobMessage {
    Single(Statement),
    Batch(Vec<Statement>),
}

/// The two statement forms. `op` stays a string here: the allow-list is
/// consulted before the op is matched against the supported set, so an
/// unknown op with a non-empty allow-list reports a policy denial, not an
/// unsupported op.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    RawSql {
        sql: String,
    },
    Structured {
        op: String,
        table: String,
        values: Map<String, Value>,
        filter: Map<String, Value>,
    },
}

impl JobMessage {
    /// Parse a message body. Shape errors here never touch the database.
    pub fn parse(body: &str) -> Result<Self, ApplyError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|err| ApplyError::MalformedJson(err.to_string()))?;
        let Value::Object(object) = value else {
            return Err(ApplyError::MalformedShape(
                "not a JSON object".to_string(),
            ));
        };

        // A "batch" key with a non-array value falls through to the single
        // statement path and fails its shape checks there.
        if let Some(Value::Array(items)) = object.get("batch") {
            let mut statements = Vec::with_capacity(items.len());
            for item in items {
                let Value::Object(item) = item else {
                    return Err(ApplyError::MalformedShape(
                        "batch item must be an object".to_string(),
                    ));
                };
                statements.push(Statement::from_object(item)?);
            }
            return Ok(JobMessage::Batch(statements));
        }

        Ok(JobMessage::Single(Statement::from_object(&object)?))
    }
}

impl Statement {
    pub fn from_object(object: &Map<String, Value>) -> Result<Self, ApplyError> {
        if let Some(sql) = object.get("sql") {
            let Value::String(sql) = sql else {
                return Err(ApplyError::MalformedShape("sql must be a string".to_string()));
            };
            return Ok(Statement::RawSql { sql: sql.clone() });
        }

        if let (Some(op), Some(table)) = (object.get("op"), object.get("table")) {
            let (Value::String(op), Value::String(table)) = (op, table) else {
                return Err(ApplyError::MalformedShape(
                    "op and table must be strings".to_string(),
                ));
            };
            return Ok(Statement::Structured {
                op: op.clone(),
                table: table.clone(),
                values: object_field(object, "values"),
                filter: object_field(object, "where"),
            });
        }

        Err(ApplyError::UnsupportedShape)
    }
}

/// Missing or non-object `values`/`where` entries are treated as empty.
fn object_field(object: &Map<String, Value>, key: &str) -> Map<String, Value> {
    match object.get(key) {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_json() {
        assert!(matches!(
            JobMessage::parse("{not json"),
            Err(ApplyError::MalformedJson(_))
        ));
    }

    #[test]
    fn rejects_non_object_roots() {
        for body in ["[1,2]", "\"text\"", "42", "null"] {
            assert!(matches!(
                JobMessage::parse(body),
                Err(ApplyError::MalformedShape(_))
            ));
        }
    }

    #[test]
    fn parses_raw_sql_form() {
        let message = JobMessage::parse(r#"{"sql":"SELECT 1;"}"#).unwrap();
        assert_eq!(
            message,
            JobMessage::Single(Statement::RawSql {
                sql: "SELECT 1;".to_string()
            })
        );
    }

    #[test]
    fn parses_structured_form_with_defaults() {
        let message =
            JobMessage::parse(r#"{"op":"delete","table":"users"}"#).unwrap();
        let JobMessage::Single(Statement::Structured { op, table, values, filter }) = message
        else {
            panic!("expected structured statement");
        };
        assert_eq!(op, "delete");
        assert_eq!(table, "users");
        assert!(values.is_empty());
        assert!(filter.is_empty());
    }

    #[test]
    fn non_object_values_are_treated_as_empty() {
        let message =
            JobMessage::parse(r#"{"op":"insert","table":"t","values":[1,2]}"#).unwrap();
        let JobMessage::Single(Statement::Structured { values, .. }) = message else {
            panic!("expected structured statement");
        };
        assert!(values.is_empty());
    }

    #[test]
    fn parses_batches_and_rejects_non_object_items() {
        let message = JobMessage::parse(
            r#"{"batch":[{"sql":"SELECT 1;"},{"op":"insert","table":"t","values":{"id":1}}]}"#,
        )
        .unwrap();
        let JobMessage::Batch(statements) = message else {
            panic!("expected batch");
        };
        assert_eq!(statements.len(), 2);

        assert!(matches!(
            JobMessage::parse(r#"{"batch":[1]}"#),
            Err(ApplyError::MalformedShape(_))
        ));
    }

    #[test]
    fn batch_key_with_non_array_value_is_unsupported_shape() {
        assert!(matches!(
            JobMessage::parse(r#"{"batch":{"op":"insert"}}"#),
            Err(ApplyError::UnsupportedShape)
        ));
    }

    #[test]
    fn message_without_known_keys_is_unsupported_shape() {
        assert!(matches!(
            JobMessage::parse(r#"{"table":"users"}"#),
            Err(ApplyError::UnsupportedShape)
        ));
    }
}
