//! Core traits shared between [ftp-datalink](https://crates.io/crates/ftp-datalink) and the code
//! embedding it.
//!
//! The data-connection engine never looks up users or decides on client addresses itself. It asks
//! the implementations of the traits in this crate.

pub mod auth;
pub mod filter;

/// A boxed error that can cross task boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
