//! keymux — an LLM API reverse proxy that fronts a pool of upstream keys.
//!
//! One endpoint in, many credentials out: requests are multiplexed across
//! the pool with per-key circuit breakers, token buckets, and cooldowns;
//! transient upstream failures retry on a different key; tier-based model
//! routing steers each request to the cheapest model with capacity.
//!
//! The binary in `main.rs` wires these together; everything else is a
//! library so integration tests can drive the full pipeline in-process.

pub mod aimd;
pub mod api;
pub mod breaker;
pub mod bucket;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod keypool;
pub mod proxy;
pub mod queue;
pub mod ring;
pub mod router;
pub mod trace;
pub mod upstream;

pub use config::Config;
pub use error::{AppError, ErrorKind};
pub use proxy::ProxyState;
pub use trace::TraceLog;
