use thiserror::Error;

/// Unified error type for rotanet
#[derive(Error, Debug)]
pub enum RotanetError {
    // Proxy descriptor errors
    #[error("Invalid proxy URL: {0}")]
    InvalidProxyUrl(String),

    #[error("Malformed proxy line {line}: {content:?} ({reason})")]
    MalformedProxyLine {
        line: usize,
        content: String,
        reason: String,
    },

    #[error("Proxy source exhausted")]
    ExhaustedSource,

    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    // Anonymity network errors
    #[error("Anonymity process error: {0}")]
    AnonymityProcess(String),

    #[error("Anonymity control authentication failed: {0}")]
    AnonymityAuthFailed(String),

    #[error("Unexpected control channel reply: {0}")]
    ControlProtocol(String),

    #[error("Session context has not been entered")]
    NotEntered,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for rotanet operations
pub type Result<T> = std::result::Result<T, RotanetError>;

impl RotanetError {
    /// Errors caused by caller input or API misuse rather than the environment
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            RotanetError::InvalidProxyUrl(_)
                | RotanetError::MalformedProxyLine { .. }
                | RotanetError::NotEntered
                | RotanetError::InvalidConfig(_)
        )
    }

    /// Errors raised while driving the anonymity process or its control channel
    pub fn is_anonymity_error(&self) -> bool {
        matches!(
            self,
            RotanetError::AnonymityProcess(_)
                | RotanetError::AnonymityAuthFailed(_)
                | RotanetError::ControlProtocol(_)
        )
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RotanetError {
    fn from(err: url::ParseError) -> Self {
        RotanetError::InvalidProxyUrl(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(RotanetError::InvalidProxyUrl("bad".to_string()).is_usage_error());
        assert!(RotanetError::NotEntered.is_usage_error());
        assert!(RotanetError::MalformedProxyLine {
            line: 1,
            content: "badformat".to_string(),
            reason: "missing port".to_string(),
        }
        .is_usage_error());
        assert!(!RotanetError::ExhaustedSource.is_usage_error());

        assert!(RotanetError::AnonymityAuthFailed("515".to_string()).is_anonymity_error());
        assert!(RotanetError::AnonymityProcess("spawn".to_string()).is_anonymity_error());
        assert!(!RotanetError::NotEntered.is_anonymity_error());
    }

    #[test]
    fn test_url_parse_error_conversion() {
        let err: RotanetError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, RotanetError::InvalidProxyUrl(_)));
    }

    #[test]
    fn test_malformed_line_message() {
        let err = RotanetError::MalformedProxyLine {
            line: 3,
            content: "badformat".to_string(),
            reason: "expected host:port".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Malformed proxy line 3: \"badformat\" (expected host:port)"
        );
    }
}
