//! Error types for the forwarding path

/// Error type for a single forward attempt.
///
/// A returned `ForwardError` guarantees that nothing has been written to the
/// client for this attempt, so the dispatcher may safely retry against
/// another backend.
#[derive(Debug)]
pub enum ForwardError {
    /// The upstream request failed: connect, read or write error, or timeout
    Upstream(hyper_util::client::legacy::Error),
    /// The outbound request could not be built
    RequestBuild(String),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Upstream(e) => write!(f, "upstream error: {}", e),
            ForwardError::RequestBuild(s) => write!(f, "request build error: {}", s),
        }
    }
}

impl std::error::Error for ForwardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ForwardError::Upstream(e) => Some(e),
            ForwardError::RequestBuild(_) => None,
        }
    }
}

impl From<hyper_util::client::legacy::Error> for ForwardError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        ForwardError::Upstream(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_build_display() {
        let err = ForwardError::RequestBuild("bad uri".to_string());
        assert_eq!(err.to_string(), "request build error: bad uri");
    }
}
