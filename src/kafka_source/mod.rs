pub mod general;
pub mod kafka_push_source;
