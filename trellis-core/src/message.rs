//! Protocol-level parts and streaming request/response envelopes.
//!
//! Parts are what flows over a stream: leading metadata, zero or more typed
//! messages, and (for responses) a trailing status. Envelopes are what
//! interceptors and handlers see: call metadata plus a lazy, single-pass
//! sequence of typed messages.
//!
//! Message encoding is a collaborator concern; the part types here are
//! generic over the message type so a transport may carry either raw bytes or
//! already-decoded values.

use std::pin::Pin;

use futures::{Stream, StreamExt};

use crate::error::{Code, RpcError};

/// Call metadata carried in leading/trailing parts and envelopes.
pub type Metadata = http::HeaderMap;

/// A part of a request stream.
#[derive(Clone, Debug)]
pub enum RequestPart<T> {
    /// Leading call metadata. Sent exactly once, before any message.
    Metadata(Metadata),
    /// A request message.
    Message(T),
}

/// A part of a response stream.
#[derive(Clone, Debug)]
pub enum ResponsePart<T> {
    /// Leading call metadata. Receiving it commits the call: the attempt is
    /// accepted and will not be retried.
    Metadata(Metadata),
    /// A response message.
    Message(T),
    /// Trailing status with trailing metadata; always the final part. A
    /// status carrying [`Code::Ok`] terminates the stream successfully.
    Status(RpcError, Metadata),
}

impl<T> ResponsePart<T> {
    /// A successful trailing status with empty trailing metadata.
    pub fn ok_status() -> Self {
        ResponsePart::Status(RpcError::from_code(Code::Ok), Metadata::new())
    }
}

/// A lazy, single-pass sequence of typed messages terminating in either
/// end-of-stream or a propagated error.
pub struct MessageStream<T> {
    inner: Pin<Box<dyn Stream<Item = Result<T, RpcError>> + Send + 'static>>,
}

impl<T: Send + 'static> MessageStream<T> {
    /// Wrap an existing stream of message results.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T, RpcError>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// An empty sequence.
    pub fn empty() -> Self {
        Self::from_stream(futures::stream::empty())
    }

    /// A sequence yielding a single message.
    pub fn once(message: T) -> Self {
        Self::from_stream(futures::stream::once(async move { Ok(message) }))
    }

    /// A sequence yielding each message of an iterator in order.
    pub fn from_iter<I>(messages: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(futures::stream::iter(messages.into_iter().map(Ok)))
    }

    /// Pull the next message.
    ///
    /// Returns `None` at end-of-stream; an `Err` item is terminal.
    pub async fn next(&mut self) -> Option<Result<T, RpcError>> {
        self.inner.next().await
    }

    /// Drain the sequence into a vector, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<T>, RpcError> {
        let mut messages = Vec::new();
        while let Some(message) = self.next().await {
            messages.push(message?);
        }
        Ok(messages)
    }
}

impl<T> Stream for MessageStream<T> {
    type Item = Result<T, RpcError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<T> std::fmt::Debug for MessageStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream").finish_non_exhaustive()
    }
}

/// A streaming request envelope: call metadata plus a producer of typed
/// messages. Owned by the caller until handed to the pipeline.
#[derive(Debug)]
pub struct StreamingRequest<T> {
    /// Leading call metadata.
    pub metadata: Metadata,
    /// The request messages, produced lazily.
    pub messages: MessageStream<T>,
}

impl<T: Send + 'static> StreamingRequest<T> {
    /// Create a request envelope from metadata and a message sequence.
    pub fn new(metadata: Metadata, messages: MessageStream<T>) -> Self {
        Self { metadata, messages }
    }

    /// A unary-shaped request: empty metadata and a single message.
    pub fn single(message: T) -> Self {
        Self::new(Metadata::new(), MessageStream::once(message))
    }
}

/// A streaming response envelope: call metadata plus a consumer of typed
/// messages. Produced by the pipeline/transport, handed back to the caller.
#[derive(Debug)]
pub struct StreamingResponse<T> {
    /// Leading call metadata.
    pub metadata: Metadata,
    /// The response messages, consumed lazily.
    pub messages: MessageStream<T>,
}

impl<T: Send + 'static> StreamingResponse<T> {
    /// Create a response envelope from metadata and a message sequence.
    pub fn new(metadata: Metadata, messages: MessageStream<T>) -> Self {
        Self { metadata, messages }
    }

    /// A unary-shaped response: empty metadata and a single message.
    pub fn single(message: T) -> Self {
        Self::new(Metadata::new(), MessageStream::once(message))
    }
}
