use std::sync::Arc;

use tracing::debug;

use crate::database::Database;
use crate::error::ApplyError;
use crate::job::{JobMessage, Statement};
use crate::sql;

/// Translates one job message into SQL and executes it. Policy first, then
/// SQL construction, then execution; batches run in a single transaction.
/// Retry and dead-lettering are the runtime's concern, never this type's.
pub struct DbJobExecutor {
    database: Arc<dyn Database>,
    allowed_ops: Vec<String>,
    allowed_tables: Vec<String>,
}

impl DbJobExecutor {
    pub fn new(
        database: Arc<dyn Database>,
        allowed_ops: Vec<String>,
        allowed_tables: Vec<String>,
    ) -> Self {
        Self {
            database,
            allowed_ops,
            allowed_tables,
        }
    }

    pub async fn handle_message(&self, body: &str) -> Result<(), ApplyError> {
        match JobMessage::parse(body)? {
            JobMessage::Batch(statements) => {
                // Translate everything up front: a batch with any bad item
                // must not touch the database at all.
                let mut sqls = Vec::with_capacity(statements.len());
                for statement in &statements {
                    sqls.push(self.to_sql(statement)?);
                }
                self.execute_batch(&sqls).await
            }
            JobMessage::Single(statement) => {
                let sql = self.to_sql(&statement)?;
                debug!(%sql, "executing statement");
                self.database
                    .execute_command(&sql)
                    .await
                    .map_err(|err| ApplyError::Database(err.to_string()))
            }
        }
    }

    fn op_allowed(&self, op: &str) -> bool {
        self.allowed_ops.is_empty() || self.allowed_ops.iter().any(|allowed| allowed == op)
    }

    fn table_allowed(&self, table: &str) -> bool {
        self.allowed_tables.is_empty()
            || self.allowed_tables.iter().any(|allowed| allowed == table)
    }

    fn to_sql(&self, statement: &Statement) -> Result<String, ApplyError> {
        match statement {
            Statement::RawSql { sql } => {
                if !self.op_allowed("exec") {
                    return Err(ApplyError::OpDenied("exec".to_string()));
                }
                Ok(sql.clone())
            }
            Statement::Structured {
                op,
                table,
                values,
                filter,
            } => {
                if !self.op_allowed(op) {
                    return Err(ApplyError::OpDenied(op.clone()));
                }
                if !self.table_allowed(table) {
                    return Err(ApplyError::TableDenied(table.clone()));
                }
                match op.as_str() {
                    "insert" => Ok(sql::build_insert(table, values)),
                    "update" => Ok(sql::build_update(table, values, filter)),
                    "delete" => Ok(sql::build_delete(table, filter)),
                    other => Err(ApplyError::UnsupportedOp(other.to_string())),
                }
            }
        }
    }

    async fn execute_batch(&self, sqls: &[String]) -> Result<(), ApplyError> {
        let mut session = self
            .database
            .session()
            .await
            .map_err(|err| ApplyError::Database(err.to_string()))?;

        session
            .execute_command("BEGIN;")
            .await
            .map_err(|err| ApplyError::Database(err.to_string()))?;

        for sql in sqls {
            debug!(%sql, "executing batch statement");
            if let Err(err) = session.execute_command(sql).await {
                // Roll back best-effort; the statement's own error is what
                // the caller needs to see.
                session.execute_command("ROLLBACK;").await.ok();
                return Err(ApplyError::Database(err.to_string()));
            }
        }

        session
            .execute_command("COMMIT;")
            .await
            .map_err(|err| ApplyError::Database(err.to_string()))
    }
}
