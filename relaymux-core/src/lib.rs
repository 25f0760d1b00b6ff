//! Core types for relaymux: configuration, authentication, errors and
//! external hooks.
//!
//! Everything in this crate is protocol-agnostic. Protocol servers and the
//! admin API consume these types; nothing here performs socket I/O except the
//! outbound auth hook and JWKS fetches.

pub mod auth;
pub mod conf;
pub mod error;
pub mod hook;
pub mod logging;

pub use conf::{Conf, PathConf, RecordFormat};
pub use error::{Error, Result};
