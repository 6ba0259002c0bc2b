//! In process source and sink, used to run the pipeline without any broker or object store

pub mod sink;
pub mod source;

pub use sink::{MemoryBatch, MemorySink, SentBatch};
pub use source::{AckLog, MemoryAck, MemoryPushSource, MemorySubscription};
