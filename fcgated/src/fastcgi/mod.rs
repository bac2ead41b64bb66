//! FastCGI responder client: wire codec, bounded connection pool, request
//! writer and response demultiplexer.

mod client;
mod error;
mod pool;
pub mod proto;
mod reader;

pub use client::{Client, ClientSettings, FastCgiRequest, Params};
pub use error::FastCgiError;
pub use pool::{
    Pool, PoolConn, PoolSettings, UpstreamAddr, ACQUIRE_TIMEOUTS_METRIC, LIVE_CONNECTIONS_METRIC,
};
pub use reader::FastCgiResponse;
