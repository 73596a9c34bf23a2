//! # Connections Module
//!
//! Backends for the two external systems the pipeline talks to:
//! a Redis Streams topic transport and a PostgreSQL telemetry store.

/// PostgreSQL store behind a `deadpool_postgres` pool.
pub mod db_postgres;

/// Redis Streams topic producer and consumer.
pub mod cache_redis;

pub use cache_redis::{RedisConsumer, RedisProducer, RedisTopicSettings};
pub use db_postgres::{MAX_CHUNK_ROWS, PostgresStore};
