use serde_json::Value;

pub type Result<T> = std::result::Result<T, Flux2Error>;

pub type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Flux2Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: BoxedSource,
    },

    #[error("request to {url} failed ({code}): {body}")]
    Status { url: String, code: u16, body: String },

    #[error("unexpected FLUX.2 response: {0}")]
    Protocol(String),

    #[error("FLUX.2 request failed with status '{status}': {payload}")]
    GenerationFailed { status: String, payload: Value },

    #[error("timed out after {seconds:.1}s while waiting for the FLUX.2 result")]
    Timeout { seconds: f64 },

    #[error("{0}")]
    Validation(String),

    #[error("image codec error: {0}")]
    Codec(String),
}

impl Flux2Error {
    pub fn transport(url: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::Transport {
            url: url.into(),
            source: source.into(),
        }
    }

    /// Status string carried by a terminal failure, if this is one.
    pub fn failure_status(&self) -> Option<&str> {
        match self {
            Self::GenerationFailed { status, .. } => Some(status.as_str()),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::Flux2Error;

    #[test]
    fn generation_failure_message_carries_status_and_payload() {
        let err = Flux2Error::GenerationFailed {
            status: "Content Moderated".to_string(),
            payload: json!({"status": "Content Moderated"}),
        };
        assert_eq!(err.failure_status(), Some("Content Moderated"));
        let text = err.to_string();
        assert!(text.contains("'Content Moderated'"));
        assert!(text.contains("\"status\""));
    }

    #[test]
    fn transport_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Flux2Error::transport("http://localhost/x", io);
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("refused"));
        assert!(!err.is_timeout());
    }
}
