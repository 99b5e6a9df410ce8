use std::io;

/// Error taxonomy, spec §7. Every variant maps to exactly one counter bucket
/// in the registry, incremented once at the forwarder boundary.
#[derive(thiserror::Error, Debug)]
pub(crate) enum ProxyError {
    #[error("connection timed out: {0}")]
    ConnectionTimeout(String),

    #[error("socket error: {0}")]
    SocketError(#[from] io::Error),

    #[error("SOCKS5 handshake failed: {0}")]
    SocksHandshake(String),

    #[error("DNS resolution failed for {0}: {1}")]
    DnsFailure(String, String),

    #[error("SOCKS5 authentication rejected")]
    AuthFailure,

    #[error("original destination unavailable")]
    OriginalDstUnavailable,

    #[error("flow dropped by policy")]
    PolicyDropped,
}

impl ProxyError {
    /// Name of the counter bucket this error increments (spec §7, §9).
    pub(crate) fn bucket(&self) -> &'static str {
        match self {
            ProxyError::ConnectionTimeout(_) => "connection_timeout",
            ProxyError::SocketError(_) => "socket_error",
            ProxyError::SocksHandshake(_) => "socks_handshake",
            ProxyError::DnsFailure(..) => "dns_failure",
            ProxyError::AuthFailure => "auth_failure",
            ProxyError::OriginalDstUnavailable => "original_dst_unavailable",
            ProxyError::PolicyDropped => "policy_dropped",
        }
    }

    /// Retries only ever apply to dial-class failures, never to protocol
    /// errors (spec §4.6 step 5, §7).
    pub(crate) fn is_retryable_dial_error(&self) -> bool {
        matches!(
            self,
            ProxyError::ConnectionTimeout(_) | ProxyError::SocketError(_)
        )
    }
}

pub(crate) type Result<T> = std::result::Result<T, ProxyError>;
