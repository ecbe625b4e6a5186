pub mod config;
pub mod discovery;
pub mod hetzner;
pub mod http;
pub mod metrics;
pub mod server;
pub mod store;
pub mod targets;
pub mod tls;
pub mod trace;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type Result<T> = std::result::Result<T, Error>;

pub fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
