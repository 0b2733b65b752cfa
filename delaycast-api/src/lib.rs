//! Delaycast admin API
//!
//! HTTP/JSON control surface over `delaycast_relay::RelayRegistry`, plus the
//! configuration, logging and server bootstrap shared by deployments. The
//! embedding application supplies the real-time SDK binding as a
//! `SessionConnector` and calls [`server::serve`].

pub mod config;
pub mod http;
pub mod logging;
pub mod server;

pub use config::Config;
pub use server::{build_registry, serve};
