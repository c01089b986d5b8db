use std::time::Duration;

use async_trait::async_trait;
use roomsync_core::{
    ApiRequest, ApiResponse, Method, SessionError, SessionErrorCategory, Transport,
    api::SYNC_TIMEOUT,
};
use tracing::trace;

/// Client-side ceiling for one request; leaves room above the sync long-poll.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(SYNC_TIMEOUT.as_secs() + 30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`Transport`] over `reqwest` with rustls.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("roomsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| {
                SessionError::new(
                    SessionErrorCategory::Config,
                    "http_client_build_error",
                    err.to_string(),
                )
            })?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        trace!(method = ?request.method, path = request.url.path(), "sending request");
        let mut builder = self
            .client
            .request(reqwest_method(request.method), request.url);
        if let Some(token) = &request.access_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        Ok(ApiResponse {
            status,
            body: body.to_vec(),
        })
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
    }
}

fn map_reqwest_error(err: reqwest::Error) -> SessionError {
    if err.is_builder() {
        return SessionError::new(
            SessionErrorCategory::Config,
            "invalid_request",
            err.to_string(),
        );
    }
    let mut mapped = SessionError::transport(err.to_string());
    if err.is_timeout() {
        mapped.code = "timeout".to_owned();
    }
    mapped
}
