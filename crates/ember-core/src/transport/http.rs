//! HTTP/1.1 transport over loopback.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;

use crate::error::{Error, Result};

use super::{
    ResponseBody, Transport, TransportError, TransportRequest, TransportResponse,
    parse_callee_error,
};

/// Separates the JSON header from raw module bytes in stream requests.
pub const STREAM_BOUNDARY: &str = "--Ember-Stream-Boundary--";

/// Transport that POSTs invocations to the worker's HTTP server.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        // Timeouts are enforced per attempt by the orchestrator.
        let client = reqwest::Client::builder()
            .no_proxy()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn body(request: TransportRequest) -> (Vec<u8>, &'static str) {
        match request.payload {
            None => (request.header, "application/json"),
            Some(payload) => {
                let mut body = request.header;
                body.reserve(STREAM_BOUNDARY.len() + payload.len());
                body.extend_from_slice(STREAM_BOUNDARY.as_bytes());
                body.extend_from_slice(&payload);
                (body, "application/octet-stream")
            }
        }
    }
}

impl Transport for HttpTransport {
    async fn send(
        &self,
        endpoint: &str,
        request: TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let (body, content_type) = Self::body(request);

        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let status = response.status();
        let kind = match response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            Some(ct) if ct.starts_with("application/json") => super::BodyKind::Json,
            Some(ct) if ct.starts_with("text/") => super::BodyKind::Text,
            Some(_) => super::BodyKind::Binary,
            None => super::BodyKind::Json,
        };
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        match status {
            StatusCode::OK => Ok(TransportResponse::Success(ResponseBody {
                kind,
                bytes: bytes.to_vec(),
            })),
            StatusCode::NOT_FOUND => Ok(TransportResponse::NotFound),
            StatusCode::INTERNAL_SERVER_ERROR => Err(parse_callee_error(&bytes)),
            other => Err(TransportError::UnexpectedStatus {
                status: other.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_body() {
        let (body, content_type) = HttpTransport::body(TransportRequest {
            header: b"{}".to_vec(),
            payload: None,
        });
        assert_eq!(body, b"{}");
        assert_eq!(content_type, "application/json");
    }

    #[test]
    fn test_stream_body_layout() {
        let (body, content_type) = HttpTransport::body(TransportRequest {
            header: br#"{"sourceKind":"ByteStream"}"#.to_vec(),
            payload: Some(b"export default 1".to_vec()),
        });
        let expected = format!(
            r#"{{"sourceKind":"ByteStream"}}{}export default 1"#,
            STREAM_BOUNDARY
        );
        assert_eq!(body, expected.as_bytes());
        assert_eq!(content_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_io_error() {
        let transport = HttpTransport::new().unwrap();
        let result = transport
            .send(
                "http://127.0.0.1:9",
                TransportRequest {
                    header: b"{}".to_vec(),
                    payload: None,
                },
            )
            .await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }
}
