//! Configuration and closed-loop alignment of detector front-end boards reached through a
//! register-access server
//!
//! Devices lease pooled sessions from a [`manager::ConnectionManager`], which keeps each session
//! open for an idle timeout after its last lease is dropped. On top of single register access with
//! retry and skip lists, [`devices`] models the board types and [`alignment`] implements the
//! reset, deskew and strobe procedures.
#![warn(clippy::pedantic)]

pub mod alignment;
pub mod config;
pub mod core;
pub mod devices;
pub mod error;
pub mod manager;
pub mod prelude;
pub mod protocol;
pub mod telemetry;
pub mod transport;

pub use error::{
    Error,
    Result,
};
