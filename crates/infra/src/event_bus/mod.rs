//! Infrastructure event bus implementations.
//!
//! The bus abstraction lives in `hasty-events` as pure mechanics. This module
//! provides infrastructure-backed implementations (Redis Streams).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{DEFAULT_STREAM_PREFIX, RedisStreamsEventBus};
