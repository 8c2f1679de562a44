//! Utilities shared by the network providers.
//!
//! - [`tls`]: TLS mode parsing and the rustls connector

pub mod tls;

pub use tls::{SslMode, TlsBuilder};
