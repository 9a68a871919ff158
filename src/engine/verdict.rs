use http::StatusCode;

use crate::rules::Endpoint;

/// Outcome of classifying a connection or a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Forward untouched; for tunnels, relay the bytes without decrypting.
    PassThrough,
    /// Terminate TLS locally and route every request on the connection.
    Decrypt,
    /// Known telemetry path. Answer 404 without contacting any backend.
    Block,
    /// In-scope request that matched no endpoint. Answer 404 and drop it.
    Blackhole,
    /// Send the request to a local endpoint instead of its original host.
    Redirect(Endpoint),
}

impl Verdict {
    /// Status the transport must inject instead of forwarding, if any.
    pub fn synthesized_status(&self) -> Option<StatusCode> {
        match self {
            Verdict::Block | Verdict::Blackhole => Some(StatusCode::NOT_FOUND),
            _ => None,
        }
    }

    /// Reason phrase sent with a synthesized response.
    pub fn reason(&self) -> &'static str {
        match self {
            Verdict::Blackhole => "Blackholed",
            _ => "",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::PassThrough => f.write_str("pass-through"),
            Verdict::Decrypt => f.write_str("decrypt"),
            Verdict::Block => f.write_str("block"),
            Verdict::Blackhole => f.write_str("blackhole"),
            Verdict::Redirect(endpoint) => write!(f, "redirect to {}", endpoint),
        }
    }
}
