//! Host-side access to guestlink guest agents.
//!
//! [`AgentClient`] speaks the framed protocol to one agent; [`AgentRegistry`]
//! keeps one client per guest.

pub mod client;
pub mod config;
pub mod error;
pub mod registry;
pub mod transport;

pub use client::{sha256_hex, AgentClient};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use registry::AgentRegistry;
pub use transport::AgentAddress;

pub use guestlink_protocol as protocol;
