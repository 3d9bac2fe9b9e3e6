use std::fmt::Write as _;

use http::{Method, StatusCode};
use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by the compute and load balancer clients.
///
/// Callers classify these through [`Error::status`], [`Error::is_not_found`],
/// [`Error::is_forbidden`] and [`Error::code`] rather than by matching on variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to send {method} request to {url}"))]
    SendRequest {
        source: reqwest::Error,
        method: Method,
        url: String,
    },

    #[snafu(display("{method} {url} returned {status}: {}", messages.join("; ")))]
    UnexpectedStatus {
        method: Method,
        url: String,
        status: StatusCode,
        code: Option<String>,
        messages: Vec<String>,
    },

    #[snafu(display("failed to decode response body of {url}"))]
    DecodeResponse { source: reqwest::Error, url: String },

    #[snafu(display("failed to parse {input:?} as URL"))]
    ParseUrl {
        source: url::ParseError,
        input: String,
    },

    #[snafu(display("failed to join {path:?} onto base URL {base}"))]
    JoinUrl {
        source: url::ParseError,
        base: String,
        path: String,
    },

    #[snafu(display("failed to exchange the API key for a load balancer token"))]
    ExchangeToken {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// An error that did not originate from an HTTP exchange.
    #[snafu(display("{message}"))]
    Other { message: String },
}

impl Error {
    /// Builds an error equivalent to an HTTP error response, mainly useful for clients that do
    /// not talk HTTP themselves.
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::UnexpectedStatus {
            method: Method::GET,
            url: String::new(),
            status,
            code: None,
            messages: vec![message.into()],
        }
    }

    /// Like [`Error::from_status`], but carrying a structured provider error code.
    pub fn with_code(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnexpectedStatus {
            method: Method::POST,
            url: String::new(),
            status,
            code: Some(code.into()),
            messages: vec![message.into()],
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// The HTTP status of the failed response, if the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::UnexpectedStatus { status, .. } => Some(*status),
            Self::SendRequest { source, .. } | Self::DecodeResponse { source, .. } => {
                source.status()
            }
            Self::ExchangeToken { source } => source.status(),
            Self::ParseUrl { .. } | Self::JoinUrl { .. } | Self::Other { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    pub fn is_forbidden(&self) -> bool {
        self.status() == Some(StatusCode::FORBIDDEN)
    }

    /// The structured error code reported by the provider, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::UnexpectedStatus { code, .. } => code.as_deref(),
            Self::ExchangeToken { source } => source.code(),
            _ => None,
        }
    }

    /// Renders the error together with all of its sources, separated by `": "`.
    pub fn full_message(&self) -> String {
        let mut buf = self.to_string();
        let mut err: &dyn std::error::Error = self;
        while let Some(source) = err.source() {
            // Writing into a String cannot fail
            let _ = write!(buf, ": {source}");
            err = source;
        }
        buf
    }
}

/// The error document returned by the provider APIs.
#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub errors: Vec<String>,
}

impl ErrorBody {
    pub(crate) fn into_messages(self) -> Vec<String> {
        let mut messages = self.errors;
        messages.extend(self.error);
        messages
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::not_found(StatusCode::NOT_FOUND, true, false)]
    #[case::forbidden(StatusCode::FORBIDDEN, false, true)]
    #[case::server_error(StatusCode::INTERNAL_SERVER_ERROR, false, false)]
    fn status_classification(
        #[case] status: StatusCode,
        #[case] not_found: bool,
        #[case] forbidden: bool,
    ) {
        let err = Error::from_status(status, "boom");
        assert_eq!(err.is_not_found(), not_found);
        assert_eq!(err.is_forbidden(), forbidden);
    }

    #[test]
    fn token_exchange_keeps_inner_status() {
        let err = Error::ExchangeToken {
            source: Box::new(Error::from_status(StatusCode::FORBIDDEN, "bad key")),
        };
        assert!(err.is_forbidden());
        assert_eq!(
            err.full_message(),
            "failed to exchange the API key for a load balancer token: GET  returned 403 Forbidden: bad key"
        );
    }

    #[test]
    fn error_body_collects_all_messages() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"errors": ["a", "b"], "error": "c"}"#).expect("valid body");
        assert_eq!(body.into_messages(), vec!["a", "b", "c"]);
    }
}
