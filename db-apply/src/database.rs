use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Postgres};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("{0}")]
    Query(String),
    #[error("failed to acquire connection: {0}")]
    Connection(String),
}

/// The slice of the database driver the executor consumes: raw command
/// execution against the pool, and single-connection sessions for
/// transactional batches.
#[async_trait]
pub trait Database: Send + Sync {
    async fn execute_command(&self, sql: &str) -> Result<(), DatabaseError>;

    /// A dedicated connection, so `BEGIN`/`COMMIT`/`ROLLBACK` and the
    /// statements in between run on the same session.
    async fn session(&self) -> Result<Box<dyn DatabaseSession>, DatabaseError>;
}

#[async_trait]
pub trait DatabaseSession: Send {
    async fn execute_command(&mut self, sql: &str) -> Result<(), DatabaseError>;
}

pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub async fn connect(conn: &str, max_connections: u32) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(conn)
            .await
            .map_err(|err| DatabaseError::Connection(err.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn execute_command(&self, sql: &str) -> Result<(), DatabaseError> {
        // raw_sql uses the simple query protocol, which also covers
        // transaction control statements.
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| DatabaseError::Query(err.to_string()))
    }

    async fn session(&self) -> Result<Box<dyn DatabaseSession>, DatabaseError> {
        let connection = self
            .pool
            .acquire()
            .await
            .map_err(|err| DatabaseError::Connection(err.to_string()))?;
        Ok(Box::new(PgSession { connection }))
    }
}

struct PgSession {
    connection: PoolConnection<Postgres>,
}

#[async_trait]
impl DatabaseSession for PgSession {
    async fn execute_command(&mut self, sql: &str) -> Result<(), DatabaseError> {
        let connection: &mut sqlx::PgConnection = &mut self.connection;
        // Fully-qualified so the Executor impl is resolved without going
        // through the HRTB inference that `raw_sql(..).execute(..)` trips
        // over once the future is boxed by #[async_trait].
        Executor::execute(connection, sqlx::raw_sql(sql))
            .await
            .map(|_| ())
            .map_err(|err| DatabaseError::Query(err.to_string()))
    }
}
