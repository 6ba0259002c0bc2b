pub mod general;
pub mod kafka_batch_sink;
