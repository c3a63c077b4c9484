pub mod filesystem;
mod http;
mod inflight;
mod shard_store;

pub use http::*;
pub use inflight::*;
pub use shard_store::*;
