//! Transport contracts and type erasure.
//!
//! Transports decouple call execution from any concrete network
//! implementation: a [`ClientTransport`] opens streams for outgoing calls and
//! a [`ServerTransport`] hands inbound streams to a handler. Both are generic
//! over their exact part types, so storing heterogeneous transports behind
//! one concrete handle requires the [`AnyClientTransport`] /
//! [`AnyServerTransport`] wrappers, which capture each operation as a closure
//! over the concrete transport at construction time.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use crate::config::MethodConfig;
use crate::context::{CallOptions, ServerContext};
use crate::error::{ConnectError, ListenError, RpcError};
use crate::interceptor::BoxFuture;
use crate::method::MethodDescriptor;
use crate::stream::RpcStream;
use crate::throttle::RetryThrottle;

/// A transport able to open streams for outgoing calls.
pub trait ClientTransport: Send + Sync {
    /// The part type written to the peer.
    type ReqPart: Send + 'static;
    /// The part type read from the peer.
    type RespPart: Send + 'static;

    /// Establish the transport. Idempotent; fails with a [`ConnectError`]
    /// when the peer cannot be reached.
    fn connect(&self) -> impl Future<Output = Result<(), ConnectError>> + Send;

    /// Open a stream for the given method, scoped to the duration of `body`.
    ///
    /// The stream is owned by `body` and is released on every exit path:
    /// return, error, and cancellation (the outbound half closes on drop).
    /// Returns `body`'s result or propagates its failure.
    fn with_stream<T, F, Fut>(
        &self,
        descriptor: &MethodDescriptor,
        options: CallOptions,
        body: F,
    ) -> impl Future<Output = Result<T, RpcError>> + Send
    where
        T: Send + 'static,
        F: FnOnce(RpcStream<Self::RespPart, Self::ReqPart>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RpcError>> + Send + 'static;

    /// Signal that no new streams will be opened; in-flight streams run to
    /// completion.
    fn begin_graceful_shutdown(&self);

    /// The retry throttle shared by calls on this transport. `None` means the
    /// transport applies a fixed policy instead of throttling.
    fn retry_throttle(&self) -> Option<&RetryThrottle> {
        None
    }

    /// Look up per-method policy.
    fn config(&self, descriptor: &MethodDescriptor) -> Option<MethodConfig> {
        let _ = descriptor;
        None
    }
}

/// A transport able to accept inbound streams.
pub trait ServerTransport: Send + Sync {
    /// The part type read from the peer.
    type ReqPart: Send + 'static;
    /// The part type written to the peer.
    type RespPart: Send + 'static;

    /// Run the accept loop until shutdown.
    ///
    /// Every inbound stream is handed to `handler` concurrently with other
    /// streams; a slow or blocked handler for one stream must not stall
    /// another.
    fn listen<H, Fut>(&self, handler: H) -> impl Future<Output = Result<(), ListenError>> + Send
    where
        H: Fn(RpcStream<Self::ReqPart, Self::RespPart>, ServerContext) -> Fut
            + Clone
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = ()> + Send + 'static;

    /// Stop accepting new streams; accepted streams run to completion.
    fn begin_graceful_shutdown(&self);
}

type ErasedValue = Box<dyn Any + Send>;
type ErasedResult = Result<ErasedValue, RpcError>;
type ErasedBody<In, Out> =
    Box<dyn FnOnce(RpcStream<In, Out>) -> BoxFuture<'static, ErasedResult> + Send>;

/// A type-erased [`ClientTransport`] with fixed part types.
///
/// Captures each operation of the wrapped transport as a closure; call
/// results round-trip through `Box<dyn Any>` at the erasure boundary. A
/// mismatch between the type the caller expects and the type the wrapped
/// transport produced is a programming error and panics rather than surfacing
/// as a recoverable error.
pub struct AnyClientTransport<In, Out> {
    connect: Arc<dyn Fn() -> BoxFuture<'static, Result<(), ConnectError>> + Send + Sync>,
    with_stream: Arc<
        dyn Fn(MethodDescriptor, CallOptions, ErasedBody<In, Out>) -> BoxFuture<'static, ErasedResult>
            + Send
            + Sync,
    >,
    shutdown: Arc<dyn Fn() + Send + Sync>,
    throttle: Option<RetryThrottle>,
    config: Arc<dyn Fn(&MethodDescriptor) -> Option<MethodConfig> + Send + Sync>,
}

impl<In, Out> Clone for AnyClientTransport<In, Out> {
    fn clone(&self) -> Self {
        Self {
            connect: self.connect.clone(),
            with_stream: self.with_stream.clone(),
            shutdown: self.shutdown.clone(),
            throttle: self.throttle.clone(),
            config: self.config.clone(),
        }
    }
}

impl<In, Out> std::fmt::Debug for AnyClientTransport<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyClientTransport").finish_non_exhaustive()
    }
}

impl<In: Send + 'static, Out: Send + 'static> AnyClientTransport<In, Out> {
    /// Wrap a concrete transport with matching part types.
    pub fn new<T>(transport: T) -> Self
    where
        T: ClientTransport<RespPart = In, ReqPart = Out> + 'static,
    {
        let transport = Arc::new(transport);
        let throttle = transport.retry_throttle().cloned();

        let connect = {
            let transport = transport.clone();
            Arc::new(move || {
                let transport = transport.clone();
                Box::pin(async move { transport.connect().await })
                    as BoxFuture<'static, Result<(), ConnectError>>
            })
        };

        let with_stream = {
            let transport = transport.clone();
            Arc::new(
                move |descriptor: MethodDescriptor,
                      options: CallOptions,
                      body: ErasedBody<In, Out>| {
                    let transport = transport.clone();
                    Box::pin(async move {
                        transport
                            .with_stream(&descriptor, options, |stream| body(stream))
                            .await
                    }) as BoxFuture<'static, ErasedResult>
                },
            )
        };

        let shutdown = {
            let transport = transport.clone();
            Arc::new(move || transport.begin_graceful_shutdown())
        };

        let config = {
            let transport = transport.clone();
            Arc::new(move |descriptor: &MethodDescriptor| transport.config(descriptor))
        };

        Self {
            connect,
            with_stream,
            shutdown,
            throttle,
            config,
        }
    }
}

impl<In: Send + 'static, Out: Send + 'static> ClientTransport for AnyClientTransport<In, Out> {
    type ReqPart = Out;
    type RespPart = In;

    async fn connect(&self) -> Result<(), ConnectError> {
        (self.connect)().await
    }

    async fn with_stream<T, F, Fut>(
        &self,
        descriptor: &MethodDescriptor,
        options: CallOptions,
        body: F,
    ) -> Result<T, RpcError>
    where
        T: Send + 'static,
        F: FnOnce(RpcStream<In, Out>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RpcError>> + Send + 'static,
    {
        let erased: ErasedBody<In, Out> = Box::new(move |stream| {
            Box::pin(async move {
                body(stream)
                    .await
                    .map(|value| Box::new(value) as ErasedValue)
            })
        });
        let result = (self.with_stream)(descriptor.clone(), options, erased).await?;
        match result.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(_) => panic!(
                "type mismatch at transport erasure boundary: expected {}",
                std::any::type_name::<T>()
            ),
        }
    }

    fn begin_graceful_shutdown(&self) {
        (self.shutdown)()
    }

    fn retry_throttle(&self) -> Option<&RetryThrottle> {
        self.throttle.as_ref()
    }

    fn config(&self, descriptor: &MethodDescriptor) -> Option<MethodConfig> {
        (self.config)(descriptor)
    }
}

type ErasedHandler<In, Out> =
    Arc<dyn Fn(RpcStream<In, Out>, ServerContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// A type-erased [`ServerTransport`] with fixed part types.
pub struct AnyServerTransport<In, Out> {
    listen: Arc<dyn Fn(ErasedHandler<In, Out>) -> BoxFuture<'static, Result<(), ListenError>> + Send + Sync>,
    shutdown: Arc<dyn Fn() + Send + Sync>,
}

impl<In, Out> Clone for AnyServerTransport<In, Out> {
    fn clone(&self) -> Self {
        Self {
            listen: self.listen.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<In, Out> std::fmt::Debug for AnyServerTransport<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyServerTransport").finish_non_exhaustive()
    }
}

impl<In: Send + 'static, Out: Send + 'static> AnyServerTransport<In, Out> {
    /// Wrap a concrete transport with matching part types.
    pub fn new<T>(transport: T) -> Self
    where
        T: ServerTransport<ReqPart = In, RespPart = Out> + 'static,
    {
        let transport = Arc::new(transport);

        let listen = {
            let transport = transport.clone();
            Arc::new(move |handler: ErasedHandler<In, Out>| {
                let transport = transport.clone();
                Box::pin(async move {
                    transport
                        .listen(move |stream, context| {
                            let handler = handler.clone();
                            async move { handler(stream, context).await }
                        })
                        .await
                }) as BoxFuture<'static, Result<(), ListenError>>
            })
        };

        let shutdown = {
            let transport = transport.clone();
            Arc::new(move || transport.begin_graceful_shutdown())
        };

        Self { listen, shutdown }
    }
}

impl<In: Send + 'static, Out: Send + 'static> ServerTransport for AnyServerTransport<In, Out> {
    type ReqPart = In;
    type RespPart = Out;

    async fn listen<H, Fut>(&self, handler: H) -> Result<(), ListenError>
    where
        H: Fn(RpcStream<In, Out>, ServerContext) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let erased: ErasedHandler<In, Out> =
            Arc::new(move |stream, context| Box::pin(handler(stream, context)));
        (self.listen)(erased).await
    }

    fn begin_graceful_shutdown(&self) {
        (self.shutdown)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::pipe;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_util::sync::CancellationToken;

    /// A loopback transport whose streams dangle: the peer halves are kept
    /// alive for the duration of `body` so reads suspend and writes succeed.
    struct LoopbackTransport {
        shut_down: AtomicBool,
        throttle: RetryThrottle,
    }

    impl LoopbackTransport {
        fn new() -> Self {
            Self {
                shut_down: AtomicBool::new(false),
                throttle: RetryThrottle::new(10.0, 0.1).unwrap(),
            }
        }
    }

    impl ClientTransport for LoopbackTransport {
        type ReqPart = u32;
        type RespPart = u32;

        async fn connect(&self) -> Result<(), ConnectError> {
            if self.shut_down.load(Ordering::SeqCst) {
                Err(ConnectError::ShuttingDown)
            } else {
                Ok(())
            }
        }

        async fn with_stream<T, F, Fut>(
            &self,
            descriptor: &MethodDescriptor,
            options: CallOptions,
            body: F,
        ) -> Result<T, RpcError>
        where
            T: Send + 'static,
            F: FnOnce(RpcStream<u32, u32>) -> Fut + Send + 'static,
            Fut: Future<Output = Result<T, RpcError>> + Send + 'static,
        {
            let token = CancellationToken::new();
            let (outbound, _peer_inbound) = pipe(options.stream_capacity, token.clone());
            let (_peer_outbound, inbound) = pipe(options.stream_capacity, token);
            body(RpcStream::new(descriptor.clone(), inbound, outbound)).await
        }

        fn begin_graceful_shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }

        fn retry_throttle(&self) -> Option<&RetryThrottle> {
            Some(&self.throttle)
        }

        fn config(&self, descriptor: &MethodDescriptor) -> Option<MethodConfig> {
            (descriptor.method() == "Configured").then(MethodConfig::default)
        }
    }

    #[tokio::test]
    async fn test_erased_transport_forwards_operations() {
        let any = AnyClientTransport::new(LoopbackTransport::new());
        let descriptor = MethodDescriptor::new("test.Service", "Method");

        any.connect().await.unwrap();
        assert!(any.retry_throttle().is_some());
        assert!(any.config(&descriptor).is_none());
        assert!(
            any.config(&MethodDescriptor::new("test.Service", "Configured"))
                .is_some()
        );

        let result: u32 = any
            .with_stream(&descriptor, CallOptions::default(), |mut stream| async move {
                stream.outbound.write(5).await.map_err(RpcError::from)?;
                Ok(11)
            })
            .await
            .unwrap();
        assert_eq!(result, 11);

        any.begin_graceful_shutdown();
        assert!(any.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_erased_transport_propagates_body_failure() {
        let any = AnyClientTransport::new(LoopbackTransport::new());
        let descriptor = MethodDescriptor::new("test.Service", "Method");

        let err = any
            .with_stream::<u32, _, _>(&descriptor, CallOptions::default(), |_stream| async move {
                Err(RpcError::aborted("gave up"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::Code::Aborted);
    }

    #[tokio::test]
    #[should_panic(expected = "type mismatch at transport erasure boundary")]
    async fn test_erasure_boundary_type_mismatch_panics() {
        // Wire the erased with_stream to yield a value of the wrong type,
        // simulating a misbehaving wrapped transport.
        let inner = AnyClientTransport::<u32, u32>::new(LoopbackTransport::new());
        let broken = AnyClientTransport::<u32, u32> {
            with_stream: Arc::new(move |_descriptor, _options, _body| {
                Box::pin(async move { Ok(Box::new("not a u32".to_string()) as ErasedValue) })
            }),
            ..inner
        };

        let descriptor = MethodDescriptor::new("test.Service", "Method");
        let _: u32 = broken
            .with_stream(&descriptor, CallOptions::default(), |_stream| async move {
                Ok(0u32)
            })
            .await
            .unwrap();
    }

    struct NeverServer {
        shut_down: AtomicBool,
    }

    impl ServerTransport for NeverServer {
        type ReqPart = u32;
        type RespPart = u32;

        async fn listen<H, Fut>(&self, _handler: H) -> Result<(), ListenError>
        where
            H: Fn(RpcStream<u32, u32>, ServerContext) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = ()> + Send + 'static,
        {
            Ok(())
        }

        fn begin_graceful_shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_erased_server_transport_forwards() {
        let any = AnyServerTransport::new(NeverServer {
            shut_down: AtomicBool::new(false),
        });
        any.listen(|_stream, _context| async {}).await.unwrap();
        any.begin_graceful_shutdown();
    }
}
