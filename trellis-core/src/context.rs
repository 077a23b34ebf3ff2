//! Per-call context and options.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::method::MethodDescriptor;

/// Options for a single call.
#[derive(Clone, Debug)]
pub struct CallOptions {
    /// Deadline applied to the whole call, covering every attempt. Falls back
    /// to the method config's timeout when unset.
    pub timeout: Option<Duration>,

    /// Buffer capacity of each stream half; writers suspend once this many
    /// parts are queued.
    pub stream_capacity: usize,

    /// Cancellation signal for the call. When unset the transport creates an
    /// independent token for the stream.
    pub cancellation: Option<CancellationToken>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            stream_capacity: 16,
            cancellation: None,
        }
    }
}

impl CallOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the call deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the per-stream buffer capacity.
    pub fn stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity;
        self
    }

    /// Set the cancellation token governing the call's streams.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Context threaded down the client interceptor chain.
///
/// The context is scoped to the call: interceptors read it but do not own it,
/// and a retried call re-enters the chain with a fresh context whose only
/// difference is the attempt counter.
#[derive(Clone, Debug)]
pub struct CallContext {
    descriptor: MethodDescriptor,
    attempt: u32,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl CallContext {
    /// Create a context for the first attempt of a call.
    pub fn new(descriptor: MethodDescriptor) -> Self {
        Self {
            descriptor,
            attempt: 1,
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Replace the cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Set the call deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Derive the context for the given attempt (1-indexed).
    pub fn with_attempt(&self, attempt: u32) -> Self {
        let mut context = self.clone();
        context.attempt = attempt;
        context
    }

    /// The method being called.
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    /// The 1-indexed attempt counter. Interceptors observe a retried call
    /// only through this field.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The call deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The call's cancellation signal.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Cancel the call scope.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Returns whether the call scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Context handed to server interceptors and handlers alongside an inbound
/// stream.
#[derive(Clone, Debug)]
pub struct ServerContext {
    descriptor: MethodDescriptor,
    peer: String,
    cancellation: CancellationToken,
}

impl ServerContext {
    /// Create a context for one inbound stream.
    pub fn new<S: Into<String>>(descriptor: MethodDescriptor, peer: S) -> Self {
        Self {
            descriptor,
            peer: peer.into(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Replace the cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// The method being called.
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    /// A transport-specific description of the remote peer.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// The stream's cancellation signal.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}
