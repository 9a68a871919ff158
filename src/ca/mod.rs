//! Certificate authority for TLS interception.
//!
//! Holds the root the client trusts and issues cached per-host certificates.

mod generator;

pub use generator::{CA_CERT_FILE, CA_KEY_FILE, CaError, CaState, CertCache, HOST_CERT_VALIDITY};
