//! DNS, DHCP and TLS inspection on top of kernel socket filters: record
//! decoding, DNS response filtering, device discovery and the manager that
//! ties them together.

pub mod addr;
pub mod api;
pub mod collab;
pub mod config;
pub mod dhcp;
pub mod discovery;
pub mod dns;
pub mod domains;
pub mod error;
pub mod events;
pub mod handler;
pub mod loader;
pub mod manager;
pub mod response;
pub mod source;
pub mod stats;
pub mod storage;
pub mod task;
pub mod tls;
pub mod vendor;
mod wire;

pub use config::Config;
pub use error::{Error, Result};
pub use manager::Manager;
