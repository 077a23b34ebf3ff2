//! Ordered, closable, backpressured stream primitives.
//!
//! A call attempt owns exactly one [`RpcStream`]: a paired [`Inbound`] /
//! [`Outbound`] handle created by the transport when the attempt starts.
//! Writes are delivered in submission order and suspend the writer while the
//! consumer is out of capacity; reads suspend until a part (or the terminal
//! error) is available. Cancelling the owning call scope unblocks any
//! suspended read or write with a cancellation failure.
//!
//! Closure is guaranteed on every exit path: [`Outbound`] closes when dropped,
//! so a body that returns, fails, or is cancelled always releases the stream.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{RpcError, StreamError};
use crate::method::MethodDescriptor;

/// Create a connected pair of stream halves with the given capacity.
///
/// Backpressure is the channel capacity: writers suspend once `capacity`
/// parts are buffered and the consumer has not caught up. The token is the
/// owning call's cancellation signal; both halves observe it.
pub fn pipe<T>(capacity: usize, token: CancellationToken) -> (Outbound<T>, Inbound<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        Outbound {
            tx: Some(tx),
            token: token.clone(),
        },
        Inbound { rx, token },
    )
}

/// The writable half of a stream: a closable sink of ordered parts.
pub struct Outbound<T> {
    tx: Option<mpsc::Sender<Result<T, RpcError>>>,
    token: CancellationToken,
}

impl<T> Outbound<T> {
    /// Write a part, suspending while the consumer is out of capacity.
    ///
    /// Fails with [`StreamError::Closed`] if the sink was closed (locally or
    /// because the peer went away) and with [`StreamError::Cancelled`] if the
    /// call scope is cancelled while the write is suspended.
    pub async fn write(&mut self, part: T) -> Result<(), StreamError> {
        let Some(tx) = &self.tx else {
            return Err(StreamError::Closed);
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(StreamError::Cancelled),
            sent = tx.send(Ok(part)) => sent.map_err(|_| StreamError::Closed),
        }
    }

    /// Close the sink, signalling "no more writes" to the peer.
    ///
    /// Idempotent: closing an already-closed sink is a no-op. Subsequent
    /// writes fail with [`StreamError::Closed`].
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Terminate the stream with an error and close it.
    ///
    /// The error is delivered to the peer on a best-effort basis: if the
    /// consumer's buffer is full the stream is simply closed.
    pub fn abort(&mut self, error: RpcError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.try_send(Err(error));
        }
    }

    /// Returns whether the sink has been closed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

impl<T> std::fmt::Debug for Outbound<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The readable half of a stream: a single-pass, pull-based sequence of parts.
///
/// The sequence terminates with `None` on graceful end-of-stream or with
/// `Some(Err(_))` carrying the propagated terminal error. Exclusive `&mut`
/// access enforces the at-most-one-reader invariant.
pub struct Inbound<T> {
    rx: mpsc::Receiver<Result<T, RpcError>>,
    token: CancellationToken,
}

impl<T> Inbound<T> {
    /// Pull the next part, suspending until one is available.
    ///
    /// Returns `None` once the peer has closed the stream. A pending `recv`
    /// unblocks with a cancellation error when the call scope is cancelled.
    pub async fn recv(&mut self) -> Option<Result<T, RpcError>> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Some(Err(RpcError::cancelled("call scope cancelled"))),
            part = self.rx.recv() => part,
        }
    }
}

impl<T> std::fmt::Debug for Inbound<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound").finish_non_exhaustive()
    }
}

/// The paired stream handles bound to one call attempt.
///
/// `In` is the part type read from the peer and `Out` the part type written
/// to it; a client reads response parts and writes request parts, a server
/// the reverse. The stream is created by the transport when the call starts
/// and is invalidated when the enclosing call scope exits.
#[derive(Debug)]
pub struct RpcStream<In, Out> {
    /// The method this stream was opened for.
    pub descriptor: MethodDescriptor,
    /// Parts arriving from the peer.
    pub inbound: Inbound<In>,
    /// Parts sent to the peer.
    pub outbound: Outbound<Out>,
}

impl<In, Out> RpcStream<In, Out> {
    /// Assemble a stream from its halves.
    pub fn new(descriptor: MethodDescriptor, inbound: Inbound<In>, outbound: Outbound<Out>) -> Self {
        Self {
            descriptor,
            inbound,
            outbound,
        }
    }
}
