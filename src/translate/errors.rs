//! Classification of backend and gateway failures into the caller-facing error taxonomy.
//!
//! Everything that goes wrong on the way to or from the backend ends up as a
//! [`ClassifiedError`]: an HTTP status for the caller, a fixed [`ErrorKind`], and a
//! message that is safe to show (no transport internals).

use std::fmt;

use super::anthropic_types::{ErrorBody, ErrorResponse, StreamEvent};
use super::openai_types::ChatErrorResponse;
use crate::error::GatewayError;

const MAX_DETAIL_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    Permission,
    RateLimit,
    InvalidRequest,
    NotFound,
    Overloaded,
    ApiError,
    Timeout,
    ClientDisconnected,
}

impl ErrorKind {
    /// The `error.type` value used on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::Permission => "permission_error",
            ErrorKind::RateLimit => "rate_limit_error",
            ErrorKind::InvalidRequest => "invalid_request_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::Overloaded => "overloaded_error",
            ErrorKind::ApiError => "api_error",
            ErrorKind::Timeout => "timeout_error",
            ErrorKind::ClientDisconnected => "client_disconnected_error",
        }
    }

    /// The status returned to the caller for this kind.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Authentication => 401,
            ErrorKind::Permission => 403,
            ErrorKind::RateLimit => 429,
            ErrorKind::InvalidRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Overloaded => 529,
            ErrorKind::ApiError => 500,
            ErrorKind::Timeout => 504,
            ErrorKind::ClientDisconnected => 499,
        }
    }

    fn summary(self) -> &'static str {
        match self {
            ErrorKind::Authentication => {
                "Authentication with the backend failed. Check the configured API key."
            }
            ErrorKind::Permission => "The backend API key lacks permission for this request.",
            ErrorKind::RateLimit => "The backend rate limit was exceeded. Retry after a pause.",
            ErrorKind::InvalidRequest => "The request was rejected as invalid.",
            ErrorKind::NotFound => "The requested model or resource was not found on the backend.",
            ErrorKind::Overloaded => "The backend is overloaded or unavailable.",
            ErrorKind::ApiError => "The backend returned an unexpected error.",
            ErrorKind::Timeout => "The backend did not respond in time.",
            ErrorKind::ClientDisconnected => "The client disconnected.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub status: u16,
    pub kind: ErrorKind,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, detail: Option<&str>) -> Self {
        let message = match detail.map(str::trim).filter(|d| !d.is_empty()) {
            Some(d) => format!("{} {}", kind.summary(), truncate(d, MAX_DETAIL_LEN)),
            None => kind.summary().to_string(),
        };
        Self {
            status: kind.http_status(),
            kind,
            message,
        }
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.kind.wire_name(), self.message.clone())
    }

    /// The same envelope as a terminal stream event.
    pub fn to_event(&self) -> StreamEvent {
        StreamEvent::Error {
            error: ErrorBody {
                error_type: self.kind.wire_name().to_string(),
                message: self.message.clone(),
            },
        }
    }
}

/// Classify a backend response with a non-success status.
pub fn classify_status(status: u16, body: &str) -> ClassifiedError {
    let parsed = serde_json::from_str::<ChatErrorResponse>(body).ok();
    let detail = parsed
        .as_ref()
        .map(|e| e.error.message.as_str())
        .filter(|m| !m.is_empty())
        .unwrap_or(body);

    let kind = match status {
        400 | 413 | 422 => ErrorKind::InvalidRequest,
        401 => ErrorKind::Authentication,
        403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        408 | 504 => ErrorKind::Timeout,
        429 => ErrorKind::RateLimit,
        502 | 503 | 529 => ErrorKind::Overloaded,
        500..=599 => ErrorKind::ApiError,
        _ => classify_message(detail).unwrap_or(ErrorKind::ApiError),
    };

    ClassifiedError::new(kind, Some(detail))
}

/// Classify a failure that came with no status code at all, by keywords in its message.
/// The message is only inspected; it is never echoed back.
pub fn classify_transport(message: &str) -> ClassifiedError {
    let kind = classify_message(message).unwrap_or(ErrorKind::ApiError);
    ClassifiedError::new(kind, None)
}

/// Classify an error payload that arrived inside an otherwise healthy stream.
pub fn classify_stream_payload(err: &ChatErrorResponse) -> ClassifiedError {
    let type_hint = err.error.error_type.as_deref().unwrap_or_default();
    let kind = match type_hint {
        "invalid_request_error" => ErrorKind::InvalidRequest,
        "authentication_error" => ErrorKind::Authentication,
        "permission_error" => ErrorKind::Permission,
        "rate_limit_error" | "rate_limit_exceeded" | "insufficient_quota" => ErrorKind::RateLimit,
        "not_found_error" => ErrorKind::NotFound,
        "overloaded_error" | "server_overloaded" => ErrorKind::Overloaded,
        _ => classify_message(&err.error.message).unwrap_or(ErrorKind::ApiError),
    };
    ClassifiedError::new(kind, Some(err.error.message.as_str()))
}

fn classify_message(message: &str) -> Option<ErrorKind> {
    let lowered = message.to_lowercase();

    if contains_any(&lowered, &["timed out", "timeout", "deadline exceeded"]) {
        Some(ErrorKind::Timeout)
    } else if contains_any(&lowered, &[
        "connection refused",
        "connection reset",
        "error trying to connect",
        "dns error",
        "unreachable",
    ]) {
        Some(ErrorKind::Overloaded)
    } else if contains_any(&lowered, &["rate limit", "too many requests", "quota"]) {
        Some(ErrorKind::RateLimit)
    } else if contains_any(&lowered, &["unauthorized", "invalid api key", "incorrect api key"]) {
        Some(ErrorKind::Authentication)
    } else if contains_any(&lowered, &["overloaded"]) {
        Some(ErrorKind::Overloaded)
    } else {
        None
    }
}

/// Map any gateway error onto the caller-facing taxonomy.
pub fn classify(err: &GatewayError) -> ClassifiedError {
    match err {
        GatewayError::InvalidRequest { message } => {
            ClassifiedError::new(ErrorKind::InvalidRequest, Some(message.as_str()))
        }
        GatewayError::Upstream { status, body } => classify_status(*status, body),
        GatewayError::UpstreamResponseMalformed { .. } | GatewayError::UpstreamStreamError { .. } => {
            ClassifiedError::new(ErrorKind::ApiError, Some("The backend broke the response format."))
                .with_status(502)
        }
        GatewayError::Transport(e) => {
            if e.is_timeout() {
                ClassifiedError::new(ErrorKind::Timeout, None)
            } else if e.is_connect() {
                ClassifiedError::new(ErrorKind::Overloaded, Some("Could not connect to the backend."))
            } else {
                classify_transport(&e.to_string())
            }
        }
        GatewayError::Timeout => ClassifiedError::new(ErrorKind::Timeout, None),
        GatewayError::ClientDisconnected => {
            ClassifiedError::new(ErrorKind::ClientDisconnected, None)
        }
        _ => ClassifiedError::new(ErrorKind::ApiError, None),
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_status() {
        let body = r#"{"error":{"message":"Rate limit reached for gpt-4o","type":"requests","code":"rate_limit_exceeded"}}"#;
        let classified = classify_status(429, body);
        assert_eq!(classified.kind, ErrorKind::RateLimit);
        assert_eq!(classified.status, 429);
        assert!(classified.message.contains("Rate limit reached for gpt-4o"));

        let envelope = serde_json::to_value(classified.to_response()).unwrap();
        assert_eq!(envelope["type"], "error");
        assert_eq!(envelope["error"]["type"], "rate_limit_error");
    }

    #[test]
    fn test_status_table() {
        assert_eq!(classify_status(401, "").kind, ErrorKind::Authentication);
        assert_eq!(classify_status(403, "").kind, ErrorKind::Permission);
        assert_eq!(classify_status(404, "").kind, ErrorKind::NotFound);
        assert_eq!(classify_status(400, "").kind, ErrorKind::InvalidRequest);
        assert_eq!(classify_status(503, "").kind, ErrorKind::Overloaded);
        assert_eq!(classify_status(500, "").kind, ErrorKind::ApiError);
        assert_eq!(classify_status(504, "").kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_plain_text_body_becomes_detail() {
        let classified = classify_status(502, "upstream connect error");
        assert_eq!(classified.kind, ErrorKind::Overloaded);
        assert!(classified.message.ends_with("upstream connect error"));
    }

    #[test]
    fn test_transport_keywords() {
        assert_eq!(
            classify_transport("operation timed out").kind,
            ErrorKind::Timeout
        );
        assert_eq!(
            classify_transport("tcp connect error: Connection refused (os error 111)").kind,
            ErrorKind::Overloaded
        );
        assert_eq!(classify_transport("something odd").kind, ErrorKind::ApiError);
    }

    #[test]
    fn test_transport_message_is_not_echoed() {
        let classified = classify_transport("hyper::Error(Connect, ConnectError(\"tcp connect error\", Os { code: 111 }))");
        assert!(!classified.message.contains("hyper"));
        assert!(!classified.message.contains("os error"));
    }

    #[test]
    fn test_stream_payload() {
        let err: ChatErrorResponse = serde_json::from_str(
            r#"{"error":{"message":"The server is overloaded","type":"server_error"}}"#,
        )
        .unwrap();
        assert_eq!(classify_stream_payload(&err).kind, ErrorKind::Overloaded);
    }

    #[test]
    fn test_contract_violations_are_api_errors() {
        let classified = classify(&GatewayError::malformed("no choices"));
        assert_eq!(classified.kind, ErrorKind::ApiError);
        assert_eq!(classified.status, 502);
        assert!(!classified.message.contains("no choices"));

        let classified = classify(&GatewayError::invalid_request("messages must not be empty"));
        assert_eq!(classified.kind, ErrorKind::InvalidRequest);
        assert_eq!(classified.status, 400);
        assert!(classified.message.contains("messages must not be empty"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "é".repeat(400);
        let t = truncate(&s, 501);
        assert!(t.len() <= 501);
        assert!(s.starts_with(t));
    }
}
