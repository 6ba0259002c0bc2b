use crate::error::error_chain_fmt;
use crate::record::FieldValue;
use std::future::Future;

/// Trait which defines a sink that writes records in atomic batches
pub trait BatchSink: Send + Sync + 'static {
    type Batch: Batch;

    /// opens a new batch writing to `target` (table, topic or prefix depending on the sink)
    fn open_batch(&self, target: &str) -> impl Future<Output = Result<Self::Batch, SinkError>> + Send;
}

/// An open, append only batch. Sending consumes it, so a finalized batch can never be appended to.
pub trait Batch: Send + 'static {
    /// Appends one row. A rejected row must leave the batch unchanged.
    fn append(&mut self, fields: &[FieldValue]) -> Result<(), SinkError>;

    /// number of rows appended so far
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// writes all rows at once, either all of them are written or none
    fn send(self) -> impl Future<Output = Result<(), SinkError>> + Send;
}

#[derive(thiserror::Error)]
pub enum SinkError {
    #[error("Failed to open batch for {target}")]
    OpenBatch {
        target: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to append record")]
    Append(#[source] anyhow::Error),
    #[error("Record does not match the sink schema: {0}")]
    SchemaMismatch(String),
    #[error("Failed to send batch")]
    Send(#[source] anyhow::Error),
}

impl std::fmt::Debug for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
