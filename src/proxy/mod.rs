//! Transport adapter that drives the decision hooks.
//!
//! This module provides an explicit HTTP proxy that asks a
//! [`TunnelDecision`](crate::engine::TunnelDecision) about every CONNECT and
//! a [`RequestDecision`](crate::engine::RequestDecision) about every request
//! it can see in plaintext.

mod error;
mod forward;
mod server;
mod tls;
mod tunnel;

pub use error::ProxyError;
pub use forward::{Origin, ProxyBody};
pub use server::{ProxyServer, ProxyState};
pub use tls::TlsAcceptor;
pub use tunnel::{Tunnel, TunnelError};
