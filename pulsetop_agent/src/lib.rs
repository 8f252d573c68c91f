//! pulsetop_agent: samples host CPU, memory and the process table, streams
//! them to WebSocket viewers, and terminates processes on request.

pub mod cache;
pub mod collector;
pub mod config;
pub mod error;
pub mod fallback;
pub mod hub;
pub mod kill;
pub mod metrics;
pub mod proto;
pub mod sampler;
pub mod server;
pub mod state;
pub mod tls;
pub mod types;
pub mod ws;
