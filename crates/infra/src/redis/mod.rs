//! Redis adapters: connection lifecycle, lock store, job queue, dead-letter stream.
//!
//! ## Keys
//!
//! - Lock: the configured key (default `retention:sweep:lock`), value = token, PX = TTL
//! - Queue `<name>`: `queue:<name>:job:<id>` hash per job, plus `:wait` (list),
//!   `:delayed` / `:completed` / `:failed` (zsets by ms timestamp), `:active` (zset by
//!   lease expiry), `:id` (counter for queue-assigned ids)
//! - Dead-letter stream `<name>-dlq`: key `queue:<name>-dlq:stream`, one `envelope` field
//!   (JSON) per entry

pub mod backend;
pub mod connection;
pub mod dead_letter;
pub mod lock;
pub mod queue;

pub use backend::RedisBackend;
pub use connection::{RedisConnection, summarize_dsn};
pub use dead_letter::RedisDeadLetterQueue;
pub use lock::RedisLockStore;
pub use queue::RedisJobQueue;

use crate::store::StoreError;

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_io_error()
            || err.is_timeout()
        {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}
