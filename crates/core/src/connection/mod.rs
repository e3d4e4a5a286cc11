//! Database collaborator interfaces.
//!
//! Pooling, authentication and TLS belong to the host; the executor only asks
//! a [`ConnectionProvider`] for a [`Connection`] each time a task runs.

pub mod memory;

use crate::error::DbError;
use crate::types::{ConnectionTarget, Row};
use std::sync::Arc;

pub use memory::{MemoryConnectionProvider, MemoryDatabase};

/// A live handle to one database.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Run a statement that returns no rows. Returns rows affected.
    async fn execute(&self, statement: &str) -> Result<u64, DbError>;

    /// Run a query and return every row.
    async fn query(&self, statement: &str) -> Result<Vec<Row>, DbError>;

    /// Insert rows using the target's native insert path. Returns rows written.
    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64, DbError>;
}

/// Hands out connections by target.
#[async_trait::async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn get_connection(
        &self,
        target: &ConnectionTarget,
    ) -> Result<Arc<dyn Connection>, DbError>;
}
