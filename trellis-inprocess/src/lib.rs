//! An in-process transport pairing a client and a server over channels.
//!
//! [`InProcess::pair`] creates a connected client/server transport pair that
//! exchanges parts through in-memory streams, with no serialization and no
//! I/O. It is primarily a test transport: everything above the transport
//! seam (interceptors, retries, throttling, deadlines) behaves exactly as it
//! would over a network transport.
//!
//! ## Example
//!
//! ```ignore
//! let (client, server) = InProcess::pair::<String, String>();
//!
//! tokio::spawn(async move {
//!     server
//!         .listen(|stream, context| async move {
//!             serve_stream(stream, context, &ServerInterceptorChain::new(), echo).await;
//!         })
//!         .await
//! });
//!
//! client.connect().await?;
//! ```

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use trellis_core::{
    CallOptions, ClientTransport, ConnectError, ListenError, MethodConfig, MethodDescriptor,
    RequestPart, ResponsePart, RetryThrottle, RpcError, RpcStream, ServerContext, ServerTransport,
    pipe,
};

type Accepted<Req, Resp> = (
    RpcStream<RequestPart<Req>, ResponsePart<Resp>>,
    ServerContext,
);

/// Factory for connected in-process transport pairs.
pub struct InProcess;

impl InProcess {
    /// Create a connected client/server pair carrying `Req` and `Resp`
    /// messages.
    ///
    /// The client carries the standard retry throttle; override it with
    /// [`InProcessClient::with_throttle`].
    pub fn pair<Req, Resp>() -> (InProcessClient<Req, Resp>, InProcessServer<Req, Resp>)
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            InProcessClient {
                accept_tx,
                shutdown: CancellationToken::new(),
                throttle: RetryThrottle::default(),
                configs: HashMap::new(),
            },
            InProcessServer {
                accept_rx: Mutex::new(Some(accept_rx)),
                shutdown: CancellationToken::new(),
            },
        )
    }
}

/// The client half of an in-process pair.
pub struct InProcessClient<Req, Resp> {
    accept_tx: mpsc::UnboundedSender<Accepted<Req, Resp>>,
    shutdown: CancellationToken,
    throttle: RetryThrottle,
    configs: HashMap<MethodDescriptor, MethodConfig>,
}

impl<Req, Resp> InProcessClient<Req, Resp> {
    /// Attach per-method policy, looked up by descriptor.
    pub fn with_config(mut self, descriptor: MethodDescriptor, config: MethodConfig) -> Self {
        self.configs.insert(descriptor, config);
        self
    }

    /// Replace the retry throttle.
    pub fn with_throttle(mut self, throttle: RetryThrottle) -> Self {
        self.throttle = throttle;
        self
    }
}

impl<Req, Resp> ClientTransport for InProcessClient<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type ReqPart = RequestPart<Req>;
    type RespPart = ResponsePart<Resp>;

    async fn connect(&self) -> Result<(), ConnectError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectError::ShuttingDown);
        }
        if self.accept_tx.is_closed() {
            return Err(ConnectError::Unreachable("server stopped listening".into()));
        }
        Ok(())
    }

    async fn with_stream<T, F, Fut>(
        &self,
        descriptor: &MethodDescriptor,
        options: CallOptions,
        body: F,
    ) -> Result<T, RpcError>
    where
        T: Send + 'static,
        F: FnOnce(RpcStream<ResponsePart<Resp>, RequestPart<Req>>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, RpcError>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(RpcError::unavailable("transport is shutting down"));
        }

        let token = options.cancellation.clone().unwrap_or_default();
        let (client_out, server_in) = pipe(options.stream_capacity, token.clone());
        let (server_out, client_in) = pipe(options.stream_capacity, token.clone());

        let context = ServerContext::new(descriptor.clone(), "in-process").with_cancellation(token);
        let server_stream = RpcStream::new(descriptor.clone(), server_in, server_out);
        self.accept_tx
            .send((server_stream, context))
            .map_err(|_| RpcError::unavailable("server is not accepting streams"))?;
        trace!(method = %descriptor, "stream handed to in-process server");

        body(RpcStream::new(descriptor.clone(), client_in, client_out)).await
    }

    fn begin_graceful_shutdown(&self) {
        self.shutdown.cancel();
    }

    fn retry_throttle(&self) -> Option<&RetryThrottle> {
        Some(&self.throttle)
    }

    fn config(&self, descriptor: &MethodDescriptor) -> Option<MethodConfig> {
        self.configs.get(descriptor).cloned()
    }
}

/// The server half of an in-process pair.
///
/// Accepts the streams its paired client opens and runs the handler for each
/// on its own task. [`listen`](ServerTransport::listen) may be called once.
pub struct InProcessServer<Req, Resp> {
    accept_rx: Mutex<Option<mpsc::UnboundedReceiver<Accepted<Req, Resp>>>>,
    shutdown: CancellationToken,
}

impl<Req, Resp> ServerTransport for InProcessServer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type ReqPart = RequestPart<Req>;
    type RespPart = ResponsePart<Resp>;

    async fn listen<H, Fut>(&self, handler: H) -> Result<(), ListenError>
    where
        H: Fn(RpcStream<RequestPart<Req>, ResponsePart<Resp>>, ServerContext) -> Fut
            + Clone
            + Send
            + Sync
            + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut accept_rx = self
            .accept_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(ListenError::AlreadyListening)?;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    trace!("in-process server stopped accepting streams");
                    return Ok(());
                }
                accepted = accept_rx.recv() => {
                    // The channel closes when the paired client is dropped.
                    let Some((stream, context)) = accepted else {
                        return Ok(());
                    };
                    trace!(method = %stream.descriptor, "in-process server accepted stream");
                    let handler = handler.clone();
                    tokio::spawn(handler(stream, context));
                }
            }
        }
    }

    fn begin_graceful_shutdown(&self) {
        self.shutdown.cancel();
    }
}
