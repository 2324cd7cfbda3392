use thiserror::Error;

/// The terminal reason a client connection was closed.
///
/// Every connection ends in exactly one `CloseReason`: `Ok` on a normal
/// splice teardown, or one of the admission/parse/dial/transport failures
/// below. The handler never retries, each variant here is terminal for the
/// connection it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("ok")]
    Ok,
    #[error("source address denied by allow-list")]
    IpDenied,
    #[error("source address exceeded rate limit")]
    RateLimited,
    #[error("first byte is not a TLS handshake record")]
    NotTls,
    #[error("client hello did not fit in the preread buffer")]
    HelloTooLarge,
    #[error("client hello did not arrive before the preread deadline")]
    PrereadTimeout,
    #[error("client hello parsed but carried no usable SNI")]
    NoSni,
    #[error("SNI is not present in the route table")]
    SniNotAllowed,
    #[error("upstream dial failed or timed out")]
    UpstreamUnreachable,
    #[error("transport error during splice")]
    TransportError,
}

impl CloseReason {
    /// Label used for stats counters and structured log fields.
    pub fn label(&self) -> &'static str {
        match self {
            CloseReason::Ok => "ok",
            CloseReason::IpDenied => "ip_denied",
            CloseReason::RateLimited => "rate_limited",
            CloseReason::NotTls => "not_tls",
            CloseReason::HelloTooLarge => "hello_too_large",
            CloseReason::PrereadTimeout => "preread_timeout",
            CloseReason::NoSni => "no_sni",
            CloseReason::SniNotAllowed => "sni_not_allowed",
            CloseReason::UpstreamUnreachable => "upstream_unreachable",
            CloseReason::TransportError => "transport_error",
        }
    }

    /// Whether this reason counts as a successful connection for stats purposes.
    pub fn is_success(&self) -> bool {
        matches!(self, CloseReason::Ok)
    }
}
