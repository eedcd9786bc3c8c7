//! Event stream transport.
//!
//! [`StreamClient::open`] yields an [`EventStream`] of raw body chunks. The
//! stream never reconnects by itself; it only tells a clean end
//! ([`StreamError::Closed`]) apart from a failed read ([`StreamError::Read`]).

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const DEFAULT_READ_CAPACITY: usize = 64 * 1024;

/// Errors that can occur while opening or reading the event stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("event stream connection failed with status {status}")]
    Connection { status: u16 },

    #[error("event stream request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("event stream closed by server")]
    Closed,

    #[error("event stream read failed: {0}")]
    Read(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StreamError {
    /// Whether reopening the stream can succeed.
    ///
    /// A request that could not even be built (bad URL) never will.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(e) => !e.is_builder(),
            Self::Connection { .. } | Self::Closed | Self::Read(_) => true,
        }
    }
}

/// A source of raw body bytes. `Ok(None)` marks a clean end of input.
#[async_trait]
pub trait ChunkSource: Send {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError>;
}

#[async_trait]
impl ChunkSource for reqwest::Response {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        self.chunk().await.map_err(|e| StreamError::Read(Box::new(e)))
    }
}

/// Adapts any async reader, e.g. one end of a pipe.
pub struct ReaderSource<R> {
    reader: R,
    buf: BytesMut,
    capacity: usize,
}

impl<R> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self::with_capacity(reader, DEFAULT_READ_CAPACITY)
    }

    pub fn with_capacity(reader: R, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            reader,
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }
}

#[async_trait]
impl<R> ChunkSource for ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        self.buf.reserve(self.capacity);
        let n = self
            .reader
            .read_buf(&mut self.buf)
            .await
            .map_err(|e| StreamError::Read(Box::new(e)))?;

        if n == 0 {
            return Ok(None);
        }

        Ok(Some(self.buf.split().freeze()))
    }
}

/// An open event stream.
pub struct EventStream {
    source: Box<dyn ChunkSource>,
}

impl EventStream {
    pub fn new(source: impl ChunkSource + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    pub fn from_response(response: reqwest::Response) -> Self {
        Self::new(response)
    }

    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self::new(ReaderSource::new(reader))
    }

    /// Next non-empty chunk of body bytes.
    ///
    /// Returns [`StreamError::Closed`] once the server has ended the body.
    pub async fn next_chunk(&mut self) -> Result<Bytes, StreamError> {
        loop {
            match self.source.next_chunk().await? {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => return Ok(chunk),
                None => return Err(StreamError::Closed),
            }
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

/// Opens event streams.
#[async_trait]
pub trait StreamClient: Send + Sync {
    async fn open(&self) -> Result<EventStream, StreamError>;
}

#[async_trait]
impl<T: StreamClient + ?Sized> StreamClient for std::sync::Arc<T> {
    async fn open(&self) -> Result<EventStream, StreamError> {
        (**self).open().await
    }
}
