//! Host-side client for Transbank POS payment terminals.
//!
//! The [`pos`] module speaks the terminal's framed serial protocol;
//! [`config`] holds the settings the `tbk-pos` binary runs with.

pub mod config;
pub mod error;
pub mod pos;

pub use error::{PosError, Result};
