//! Glidein controller service: configuration, component wiring and the
//! HTTP API

pub mod api;
pub mod config;
pub mod service;

pub use config::GlideinConfig;
pub use service::Service;
