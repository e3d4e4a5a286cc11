//! Generic row transfer between two connections.
//!
//! Reads the full result of a source query, then writes it to the destination
//! table in fixed-size chunks. Delivery is at-least-once: a re-run repeats the
//! whole read+write cycle and nothing is deduplicated here.

use crate::connection::ConnectionProvider;
use crate::error::{TaskError, TransferPhase};
use crate::template::Template;
use crate::types::{ConnectionTarget, ParameterSet};
use std::time::Instant;

/// Default number of rows handed to one `insert_rows` call.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Declarative description of a transfer task.
#[derive(Debug, Clone)]
pub struct TransferSpec {
    pub source: ConnectionTarget,
    pub destination: ConnectionTarget,
    /// Query run against `source`.
    pub sql: Template,
    /// Destination table; may be qualified (`db.schema.table`).
    pub destination_table: Template,
    /// Statements run on `destination` before any row is written.
    pub preoperator: Vec<Template>,
    /// Overrides the executor-wide batch size.
    pub batch_size: Option<usize>,
}

impl TransferSpec {
    pub fn new(
        source: ConnectionTarget,
        destination: ConnectionTarget,
        sql: impl Into<Template>,
        destination_table: impl Into<Template>,
    ) -> Self {
        Self {
            source,
            destination,
            sql: sql.into(),
            destination_table: destination_table.into(),
            preoperator: Vec::new(),
            batch_size: None,
        }
    }

    pub fn with_preoperator(mut self, statement: impl Into<Template>) -> Self {
        self.preoperator.push(statement.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// One execution of a [`TransferSpec`].
pub struct GenericTransfer<'a> {
    spec: &'a TransferSpec,
    batch_size: usize,
}

impl<'a> GenericTransfer<'a> {
    pub fn new(spec: &'a TransferSpec, default_batch_size: usize) -> Self {
        let batch_size = spec.batch_size.unwrap_or(default_batch_size).max(1);
        Self { spec, batch_size }
    }

    /// Run the transfer and return the number of rows written.
    ///
    /// An empty source result is a success with a count of zero.
    pub async fn run(
        &self,
        connections: &dyn ConnectionProvider,
        params: &ParameterSet,
    ) -> Result<u64, TaskError> {
        // Resolve everything up front so a bad template never leaves a half-done transfer.
        let query = self.spec.sql.resolve(params)?;
        let table = self.spec.destination_table.resolve(params)?;
        let preoperator = self
            .spec
            .preoperator
            .iter()
            .map(|t| t.resolve(params))
            .collect::<Result<Vec<_>, _>>()?;

        let source_id = &self.spec.source.connection.0;
        let dest_id = &self.spec.destination.connection.0;

        let source = connections
            .get_connection(&self.spec.source)
            .await
            .map_err(|e| TaskError::from_db(source_id, e))?;
        let destination = connections
            .get_connection(&self.spec.destination)
            .await
            .map_err(|e| TaskError::from_db(dest_id, e))?;

        for statement in &preoperator {
            tracing::debug!(connection = %dest_id, "Running preoperator: {}", statement);
            destination.execute(statement).await.map_err(|e| TaskError::Transfer {
                phase: TransferPhase::Prepare,
                rows_written: 0,
                message: e.to_string(),
            })?;
        }

        let started = Instant::now();
        tracing::info!(source = %source_id, "Extracting rows: {}", query);
        let rows = source.query(&query).await.map_err(|e| TaskError::Transfer {
            phase: TransferPhase::Read,
            rows_written: 0,
            message: e.to_string(),
        })?;

        if rows.is_empty() {
            tracing::info!(destination = %dest_id, table = %table, "Source returned no rows");
            return Ok(0);
        }

        tracing::info!(
            destination = %dest_id,
            table = %table,
            "Inserting {} row(s) in chunks of {}",
            rows.len(),
            self.batch_size
        );

        let mut written: u64 = 0;
        for chunk in rows.chunks(self.batch_size) {
            let n = destination
                .insert_rows(&table, chunk)
                .await
                .map_err(|e| TaskError::Transfer {
                    phase: TransferPhase::Write,
                    rows_written: written,
                    message: e.to_string(),
                })?;
            written += n;
            tracing::debug!(table = %table, "Wrote chunk of {} row(s), {} so far", n, written);
        }

        tracing::info!(
            table = %table,
            "Transferred {} row(s) in {:.3}s",
            written,
            started.elapsed().as_secs_f64()
        );
        Ok(written)
    }
}
