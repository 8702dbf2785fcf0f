//! Invocation requests.

use std::io::SeekFrom;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::error::{Error, Result};

/// A readable and seekable module stream.
pub trait SeekableStream: AsyncRead + AsyncSeek + Send + Unpin {}

impl<S: AsyncRead + AsyncSeek + Send + Unpin> SeekableStream for S {}

/// Module source carried as raw bytes.
pub enum RequestStream {
    /// Can be rewound before a retry.
    Seekable(Box<dyn SeekableStream>),
    /// Read-once; a failure is never retried.
    Sequential(Box<dyn AsyncRead + Send + Unpin>),
}

impl RequestStream {
    pub fn seekable(stream: impl SeekableStream + 'static) -> Self {
        Self::Seekable(Box::new(stream))
    }

    pub fn sequential(stream: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Sequential(Box::new(stream))
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self, Self::Seekable(_))
    }

    async fn read_remaining(&mut self) -> std::io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        match self {
            Self::Seekable(stream) => stream.read_to_end(&mut bytes).await?,
            Self::Sequential(stream) => stream.read_to_end(&mut bytes).await?,
        };
        Ok(bytes)
    }
}

impl std::fmt::Debug for RequestStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Seekable(_) => f.write_str("RequestStream::Seekable"),
            Self::Sequential(_) => f.write_str("RequestStream::Sequential"),
        }
    }
}

/// Where the invoked module comes from.
#[derive(Debug)]
pub enum ModuleSource {
    /// Path relative to the project root (or absolute).
    File(PathBuf),
    /// Module source text.
    Inline(String),
    /// Module source bytes.
    Stream(RequestStream),
    /// A module previously cached by the worker under `cache_key`.
    Cache,
}

/// Wire name of the source kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceKind {
    File,
    InlineSource,
    ByteStream,
    Cache,
}

/// One invocation of an exported function.
#[derive(Debug)]
pub struct InvocationRequest {
    source: ModuleSource,
    cache_key: Option<String>,
    export_name: Option<String>,
    args: Vec<Value>,
}

/// JSON header sent ahead of every invocation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RequestHeader<'a> {
    source_kind: SourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    export_name: Option<&'a str>,
    args: &'a [Value],
}

impl InvocationRequest {
    pub fn new(source: ModuleSource) -> Self {
        Self {
            source,
            cache_key: None,
            export_name: None,
            args: Vec::new(),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(ModuleSource::File(path.into()))
    }

    pub fn inline(source: impl Into<String>) -> Self {
        Self::new(ModuleSource::Inline(source.into()))
    }

    pub fn stream(stream: RequestStream) -> Self {
        Self::new(ModuleSource::Stream(stream))
    }

    /// Look up a module the worker cached earlier.
    pub fn cached(cache_key: impl Into<String>) -> Self {
        Self::new(ModuleSource::Cache).with_cache_key(cache_key)
    }

    pub fn with_cache_key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = Some(cache_key.into());
        self
    }

    pub fn with_export(mut self, export_name: impl Into<String>) -> Self {
        self.export_name = Some(export_name.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Append one argument.
    pub fn arg(mut self, value: impl Serialize) -> Result<Self> {
        self.args.push(serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn source(&self) -> &ModuleSource {
        &self.source
    }

    pub fn kind(&self) -> SourceKind {
        match self.source {
            ModuleSource::File(_) => SourceKind::File,
            ModuleSource::Inline(_) => SourceKind::InlineSource,
            ModuleSource::Stream(_) => SourceKind::ByteStream,
            ModuleSource::Cache => SourceKind::Cache,
        }
    }

    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }

    pub fn export_name(&self) -> Option<&str> {
        self.export_name.as_deref()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Check the per-kind invariants.
    pub fn validate(&self) -> Result<()> {
        match &self.source {
            ModuleSource::File(path) if path.as_os_str().is_empty() => Err(
                Error::InvalidArgument("file module path must not be empty".to_string()),
            ),
            ModuleSource::Inline(text) if text.is_empty() => Err(Error::InvalidArgument(
                "inline module source must not be empty".to_string(),
            )),
            ModuleSource::Cache if self.cache_key.as_deref().is_none_or(str::is_empty) => Err(
                Error::InvalidArgument("cache lookup requires a cache key".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Whether a failed attempt may be retried at all.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.source,
            ModuleSource::Stream(RequestStream::Sequential(_))
        )
    }

    /// Current position of a seekable source stream.
    pub(crate) async fn stream_position(&mut self) -> Result<Option<u64>> {
        match &mut self.source {
            ModuleSource::Stream(RequestStream::Seekable(stream)) => {
                Ok(Some(stream.stream_position().await?))
            }
            _ => Ok(None),
        }
    }

    /// Move a seekable source stream back to `position` if it has moved.
    ///
    /// Returns whether a seek happened.
    pub(crate) async fn rewind(&mut self, position: u64) -> Result<bool> {
        if let ModuleSource::Stream(RequestStream::Seekable(stream)) = &mut self.source
            && stream.stream_position().await? != position
        {
            stream.seek(SeekFrom::Start(position)).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Encode the JSON header and, for stream sources, read the payload.
    pub(crate) async fn encode(&mut self) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let source = match &self.source {
            ModuleSource::File(path) => Some(path.to_string_lossy().into_owned()),
            ModuleSource::Inline(text) => Some(text.clone()),
            ModuleSource::Stream(_) | ModuleSource::Cache => None,
        };
        let header = RequestHeader {
            source_kind: self.kind(),
            source,
            cache_key: self.cache_key.as_deref(),
            export_name: self.export_name.as_deref(),
            args: &self.args,
        };
        let header = serde_json::to_vec(&header)?;

        let payload = match &mut self.source {
            ModuleSource::Stream(stream) => Some(stream.read_remaining().await?),
            _ => None,
        };

        Ok((header, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_validate() {
        assert!(InvocationRequest::file("index.js").validate().is_ok());
        assert!(InvocationRequest::inline("export default () => 1").validate().is_ok());
        assert!(InvocationRequest::cached("key").validate().is_ok());

        assert!(matches!(
            InvocationRequest::file("").validate(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            InvocationRequest::inline("").validate(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            InvocationRequest::new(ModuleSource::Cache).validate(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            InvocationRequest::cached("").validate(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_encode_inline_header() {
        let mut request = InvocationRequest::inline("export const add = (a, b) => a + b;")
            .with_cache_key("adder")
            .with_export("add")
            .arg(1)
            .unwrap()
            .arg(2)
            .unwrap();

        let (header, payload) = request.encode().await.unwrap();
        let header: Value = serde_json::from_slice(&header).unwrap();
        assert_eq!(header["sourceKind"], "InlineSource");
        assert_eq!(header["source"], "export const add = (a, b) => a + b;");
        assert_eq!(header["cacheKey"], "adder");
        assert_eq!(header["exportName"], "add");
        assert_eq!(header["args"], serde_json::json!([1, 2]));
        assert!(payload.is_none());
    }

    #[tokio::test]
    async fn test_encode_cache_omits_source() {
        let mut request = InvocationRequest::cached("adder");
        let (header, _) = request.encode().await.unwrap();
        let header: Value = serde_json::from_slice(&header).unwrap();
        assert_eq!(header["sourceKind"], "Cache");
        assert!(header.get("source").is_none());
        assert!(header.get("exportName").is_none());
    }

    #[tokio::test]
    async fn test_stream_payload_and_rewind() {
        let bytes = b"export default () => 'streamed';".to_vec();
        let mut request =
            InvocationRequest::stream(RequestStream::seekable(Cursor::new(bytes.clone())));
        assert_eq!(request.kind(), SourceKind::ByteStream);
        assert!(request.is_retryable());

        let start = request.stream_position().await.unwrap();
        assert_eq!(start, Some(0));

        let (_, payload) = request.encode().await.unwrap();
        assert_eq!(payload.as_deref(), Some(bytes.as_slice()));

        assert!(request.rewind(0).await.unwrap());
        assert!(!request.rewind(0).await.unwrap());
        let (_, payload) = request.encode().await.unwrap();
        assert_eq!(payload.as_deref(), Some(bytes.as_slice()));
    }

    #[test]
    fn test_sequential_stream_not_retryable() {
        let request = InvocationRequest::stream(RequestStream::sequential(tokio::io::empty()));
        assert!(!request.is_retryable());
    }
}
