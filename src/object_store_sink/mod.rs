pub mod general;
pub mod parquet_sink;
