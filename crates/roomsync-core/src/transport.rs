use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::{
    error::{SessionError, SessionErrorCategory, classify_http_status},
    wire::ServerErrorBody,
};

const RATE_LIMIT_ERRCODE: &str = "M_LIMIT_EXCEEDED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

/// One request against the homeserver.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    /// Bearer token; `None` for unauthenticated endpoints.
    pub access_token: Option<String>,
    pub body: Option<Value>,
}

/// Raw response; interpretation is left to [`decode_response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Moves requests to the homeserver.
///
/// Implementations report only failures to exchange bytes (connect errors,
/// timeouts, ...). Every received response, whatever its status, is `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, SessionError>;
}

/// Decode a successful body, or turn a failed one into a typed error.
pub fn decode_response<T: DeserializeOwned>(response: &ApiResponse) -> Result<T, SessionError> {
    if response.is_success() {
        return serde_json::from_slice(&response.body).map_err(|err| {
            SessionError::new(
                SessionErrorCategory::Serialization,
                "invalid_payload",
                format!("response body did not match schema: {err}"),
            )
        });
    }

    match serde_json::from_slice::<ServerErrorBody>(&response.body) {
        Ok(body) => Err(server_error(response.status, body)),
        Err(_) => Err(SessionError::new(
            classify_http_status(response.status),
            format!("http_{}", response.status),
            format!("homeserver answered with status {}", response.status),
        )),
    }
}

fn server_error(status: u16, body: ServerErrorBody) -> SessionError {
    let message = body
        .error
        .unwrap_or_else(|| format!("homeserver rejected request with status {status}"));
    if body.errcode == RATE_LIMIT_ERRCODE {
        let mut err = SessionError::new(SessionErrorCategory::RateLimited, body.errcode, message);
        err.retry_after_ms = body.retry_after_ms;
        return err;
    }
    SessionError::new(SessionErrorCategory::Server, body.errcode, message)
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::wire::VersionsResponse;

    fn response(status: u16, body: &str) -> ApiResponse {
        ApiResponse {
            status,
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn decodes_success_body() {
        let versions: VersionsResponse =
            decode_response(&response(200, r#"{"versions":["v1.1"]}"#)).expect("decodes");
        assert_eq!(versions.versions, vec!["v1.1"]);
    }

    #[test]
    fn schema_mismatch_is_serialization_error() {
        let err = decode_response::<VersionsResponse>(&response(200, r#"{"nope":1}"#))
            .expect_err("missing field");
        assert_eq!(err.category, SessionErrorCategory::Serialization);
        assert!(err.is_transient());
    }

    #[test]
    fn structured_rate_limit_carries_hint() {
        let body = json!({ "errcode": "M_LIMIT_EXCEEDED", "retry_after_ms": 2000 }).to_string();
        let err = decode_response::<Value>(&response(429, &body)).expect_err("limited");
        assert_eq!(err.category, SessionErrorCategory::RateLimited);
        assert_eq!(err.retry_after_ms, Some(2000));
    }

    #[test]
    fn structured_rejection_keeps_errcode() {
        let body = json!({ "errcode": "M_FORBIDDEN", "error": "not in room" }).to_string();
        let err = decode_response::<Value>(&response(403, &body)).expect_err("rejected");
        assert_eq!(err.category, SessionErrorCategory::Server);
        assert_eq!(err.code, "M_FORBIDDEN");
        assert_eq!(err.message, "not in room");
        assert!(!err.is_transient());
    }

    #[test]
    fn unstructured_failures_follow_status() {
        let limited = decode_response::<Value>(&response(429, "slow down")).expect_err("429");
        assert_eq!(limited.category, SessionErrorCategory::RateLimited);
        assert_eq!(limited.retry_after_ms, None);

        let gateway = decode_response::<Value>(&response(502, "<html>")).expect_err("502");
        assert_eq!(gateway.category, SessionErrorCategory::Network);
        assert_eq!(gateway.code, "http_502");
    }
}
