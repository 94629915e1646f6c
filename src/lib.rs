//! The in-kernel core of a capability-oriented, name-routed message bus.
//!
//! A [`bus::Bus`] is a logically isolated communication space. Peers attach to
//! it through an [`endpoint::Endpoint`] and act through a
//! [`connection::Connection`], which carries a unique numeric id, a receive
//! [`pool::Pool`] and the well-known names it owns or waits for. Arbitration
//! of well-known names lives in [`name_registry::NameRegistry`]; the command
//! surface callers go through is in [`cmd`].

pub mod bus;
pub mod cmd;
pub mod connection;
pub mod endpoint;
mod error;
pub mod name_registry;
pub mod notify;
pub mod pool;
#[cfg(feature = "tracing-subscriber")]
pub mod tracing_subscriber;

pub use error::{Error, Result};
