use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    /// The circuit breaker for the target is open; no call was made.
    BreakerOpen,
    /// The half-open probe budget for the target is exhausted.
    TooManyRequests,
    /// The target address could not be turned into a forward URL.
    InvalidTarget(String),
    /// Transport-level failure talking to the upstream (connect, reset, DNS).
    Upstream(hyper_util::client::legacy::Error),
    /// The forwarded request exceeded the configured request timeout.
    Timeout,
    /// The incoming request body could not be read.
    Body(hyper::Error),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::BreakerOpen => write!(f, "circuit breaker is open"),
            GatewayError::TooManyRequests => write!(f, "too many requests in half-open state"),
            GatewayError::InvalidTarget(msg) => write!(f, "invalid forward target: {}", msg),
            GatewayError::Upstream(e) => write!(f, "upstream error: {}", e),
            GatewayError::Timeout => write!(f, "upstream timeout"),
            GatewayError::Body(e) => write!(f, "failed to read request body: {}", e),
        }
    }
}

impl std::error::Error for GatewayError {}
