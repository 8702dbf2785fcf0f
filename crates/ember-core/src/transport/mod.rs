//! Request/response exchange with a connected worker.
//!
//! The orchestrator only needs one operation per invocation: send the encoded
//! request to the worker's endpoint and classify what came back.

mod http;

use std::future::Future;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

pub use http::{HttpTransport, STREAM_BOUNDARY};

/// An encoded invocation.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// JSON request header.
    pub header: Vec<u8>,
    /// Raw module bytes for stream sources.
    pub payload: Option<Vec<u8>>,
}

/// How a successful response body is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Json,
    Text,
    Binary,
}

/// Successful response body.
#[derive(Debug, Clone)]
pub struct ResponseBody {
    pub kind: BodyKind,
    pub bytes: Vec<u8>,
}

impl ResponseBody {
    pub fn json(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: BodyKind::Json,
            bytes: bytes.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: BodyKind::Text,
            bytes: text.into().into_bytes(),
        }
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: BodyKind::Binary,
            bytes: bytes.into(),
        }
    }

    /// Decode into `T`.
    ///
    /// Text bodies bypass JSON and deserialize as a string; an empty JSON body
    /// is treated as `null`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        match self.kind {
            BodyKind::Json if self.bytes.is_empty() => Ok(T::deserialize(Value::Null)?),
            BodyKind::Json => Ok(serde_json::from_slice(&self.bytes)?),
            BodyKind::Text => Ok(T::deserialize(Value::String(self.into_text()))?),
            BodyKind::Binary => Ok(T::deserialize(Value::from(self.bytes))?),
        }
    }

    pub fn into_text(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// What a worker answered.
#[derive(Debug, Clone)]
pub enum TransportResponse {
    Success(ResponseBody),
    /// Cache lookup missed.
    NotFound,
}

/// A failed exchange.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The invoked code raised an error.
    #[error("{message}")]
    Callee {
        message: String,
        stack: Option<String>,
    },

    /// The worker answered with a status outside the contract.
    #[error("worker returned unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    /// The request could not be delivered or the response not read.
    #[error("transport failure: {0}")]
    Io(String),
}

impl TransportError {
    pub fn is_callee(&self) -> bool {
        matches!(self, TransportError::Callee { .. })
    }
}

/// Sends encoded invocations to a worker endpoint.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        endpoint: &str,
        request: TransportRequest,
    ) -> impl Future<Output = std::result::Result<TransportResponse, TransportError>> + Send;
}

/// Parse the `{errorMessage, errorStack}` body of a 500 response.
pub(crate) fn parse_callee_error(body: &[u8]) -> TransportError {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct CalleeError {
        error_message: Option<String>,
        error_stack: Option<String>,
    }

    match serde_json::from_slice::<CalleeError>(body) {
        Ok(error) => TransportError::Callee {
            message: error
                .error_message
                .unwrap_or_else(|| "worker reported an error without a message".to_string()),
            stack: error.error_stack,
        },
        Err(_) => TransportError::Callee {
            message: String::from_utf8_lossy(body).into_owned(),
            stack: None,
        },
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Callee { message, stack } => Error::Invocation { message, stack },
            other => Error::Invocation {
                message: other.to_string(),
                stack: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_json_and_text() {
        let value: Vec<i32> = ResponseBody::json("[1,2,3]").decode().unwrap();
        assert_eq!(value, vec![1, 2, 3]);

        let text: String = ResponseBody::text("plain words").decode().unwrap();
        assert_eq!(text, "plain words");

        let unit: () = ResponseBody::json(Vec::new()).decode().unwrap();
        assert_eq!(unit, ());

        let bytes: Vec<u8> = ResponseBody::binary(vec![0u8, 255]).decode().unwrap();
        assert_eq!(bytes, vec![0, 255]);
    }

    #[test]
    fn test_decode_mismatch_is_serialization_error() {
        let result: Result<u32> = ResponseBody::json("\"nope\"").decode();
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_parse_callee_error() {
        let error =
            parse_callee_error(br#"{"errorMessage":"boom","errorStack":"Error: boom\n  at x"}"#);
        match error {
            TransportError::Callee { message, stack } => {
                assert_eq!(message, "boom");
                assert_eq!(stack.as_deref(), Some("Error: boom\n  at x"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(parse_callee_error(b"not json").is_callee());
    }
}
