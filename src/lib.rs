pub mod config;
pub mod delivery;
pub mod domain;
pub mod error;
pub mod kafka_sink;
pub mod kafka_source;
pub mod memory;
pub mod object_store_sink;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod writer;
