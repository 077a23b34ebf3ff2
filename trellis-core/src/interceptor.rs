//! Interceptor pipelines for the client and server call paths.
//!
//! Interceptors add cross-cutting logic to RPC calls: authentication,
//! logging, metrics, request validation. Each interceptor receives the
//! (possibly already-modified) request envelope, the call context, and a
//! `next` continuation representing the remainder of the chain; it may
//! forward the request (modified or not) by calling `next`, or short-circuit
//! by returning its own response or error, in which case later stages and the
//! terminal dispatch never run.
//!
//! Chains invoke interceptors in registration order, identically for every
//! attempt of a call. `next` consumes itself, so an interceptor can invoke it
//! at most once; the contract is exactly one of "calls `next` once" or
//! "short-circuits".
//!
//! Interceptors are generic over the request and response message types, so a
//! single implementation applies to every RPC method.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::{CallContext, ServerContext};
use crate::error::RpcError;
use crate::message::{StreamingRequest, StreamingResponse};

/// Type alias for a boxed future returning a result.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The signature of a client call: a request and context in, a streaming
/// response (or error) out. The innermost one dispatches to the transport.
pub type ClientCallFn<Req, Resp> = Arc<
    dyn Fn(StreamingRequest<Req>, CallContext) -> BoxFuture<'static, Result<StreamingResponse<Resp>, RpcError>>
        + Send
        + Sync,
>;

/// The continuation handed to a client interceptor.
///
/// Calling it forwards the request to the rest of the chain. It consumes
/// itself, so it can be invoked at most once.
pub struct ClientNext<Req, Resp> {
    inner: ClientCallFn<Req, Resp>,
}

impl<Req, Resp> ClientNext<Req, Resp> {
    pub(crate) fn new(inner: ClientCallFn<Req, Resp>) -> Self {
        Self { inner }
    }

    /// Hand the request and context to the next interceptor, or to the
    /// terminal transport dispatch.
    pub async fn call(
        self,
        request: StreamingRequest<Req>,
        context: CallContext,
    ) -> Result<StreamingResponse<Resp>, RpcError> {
        (self.inner)(request, context).await
    }
}

/// An interceptor on the client outbound path.
///
/// # Example
///
/// ```ignore
/// struct AuthInterceptor;
///
/// impl<Req: Send + 'static, Resp: Send + 'static> ClientInterceptor<Req, Resp> for AuthInterceptor {
///     fn intercept(
///         &self,
///         request: StreamingRequest<Req>,
///         context: CallContext,
///         next: ClientNext<Req, Resp>,
///     ) -> BoxFuture<'static, Result<StreamingResponse<Resp>, RpcError>> {
///         Box::pin(async move {
///             if !request.metadata.contains_key("authorization") {
///                 return Err(RpcError::unauthenticated("missing token"));
///             }
///             next.call(request, context).await
///         })
///     }
/// }
/// ```
pub trait ClientInterceptor<Req, Resp>: Send + Sync {
    /// Intercept a request on its way to the transport.
    fn intercept(
        &self,
        request: StreamingRequest<Req>,
        context: CallContext,
        next: ClientNext<Req, Resp>,
    ) -> BoxFuture<'static, Result<StreamingResponse<Resp>, RpcError>>;
}

/// An ordered chain of client interceptors.
pub struct ClientInterceptorChain<Req, Resp> {
    stages: Vec<Arc<dyn ClientInterceptor<Req, Resp>>>,
}

impl<Req, Resp> Clone for ClientInterceptorChain<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}

impl<Req, Resp> std::fmt::Debug for ClientInterceptorChain<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInterceptorChain")
            .field("count", &self.stages.len())
            .finish()
    }
}

impl<Req, Resp> Default for ClientInterceptorChain<Req, Resp> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<Req: Send + 'static, Resp: Send + 'static> ClientInterceptorChain<Req, Resp> {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append an interceptor. Registration order is invocation order.
    pub fn push(&mut self, interceptor: Arc<dyn ClientInterceptor<Req, Resp>>) {
        self.stages.push(interceptor);
    }

    /// Append an interceptor, returning the chain for further building.
    pub fn with(mut self, interceptor: Arc<dyn ClientInterceptor<Req, Resp>>) -> Self {
        self.push(interceptor);
        self
    }

    /// Check if the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Get the number of interceptors in the chain.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Wrap a terminal dispatch with every interceptor in the chain.
    ///
    /// Stages are applied in reverse so the first registered interceptor sees
    /// the request first.
    pub fn wrap(&self, terminal: ClientCallFn<Req, Resp>) -> ClientCallFn<Req, Resp> {
        let mut wrapped = terminal;
        for stage in self.stages.iter().rev() {
            let stage = stage.clone();
            let next_fn = wrapped;
            wrapped = Arc::new(move |request, context| {
                stage.intercept(request, context, ClientNext::new(next_fn.clone()))
            });
        }
        wrapped
    }

    /// Thread a request through the chain down to the terminal dispatch.
    pub async fn execute(
        &self,
        request: StreamingRequest<Req>,
        context: CallContext,
        terminal: ClientCallFn<Req, Resp>,
    ) -> Result<StreamingResponse<Resp>, RpcError> {
        (self.wrap(terminal))(request, context).await
    }
}

/// A function-based client interceptor.
///
/// # Example
///
/// ```ignore
/// let logging = FnClientInterceptor::new(|request, context, next| async move {
///     tracing::debug!(method = %context.descriptor(), "call starting");
///     next.call(request, context).await
/// });
/// ```
pub struct FnClientInterceptor<F> {
    func: F,
}

impl<F> FnClientInterceptor<F> {
    /// Create an interceptor from a function.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<Req, Resp, F, Fut> ClientInterceptor<Req, Resp> for FnClientInterceptor<F>
where
    F: Fn(StreamingRequest<Req>, CallContext, ClientNext<Req, Resp>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StreamingResponse<Resp>, RpcError>> + Send + 'static,
{
    fn intercept(
        &self,
        request: StreamingRequest<Req>,
        context: CallContext,
        next: ClientNext<Req, Resp>,
    ) -> BoxFuture<'static, Result<StreamingResponse<Resp>, RpcError>> {
        Box::pin((self.func)(request, context, next))
    }
}

/// The signature of a server-side dispatch: a request envelope and context
/// in, a response envelope (or error) out. The innermost one invokes the
/// method handler.
pub type ServerHandleFn<Req, Resp> = Arc<
    dyn Fn(StreamingRequest<Req>, ServerContext) -> BoxFuture<'static, Result<StreamingResponse<Resp>, RpcError>>
        + Send
        + Sync,
>;

/// The continuation handed to a server interceptor. Consumes itself, so it
/// can be invoked at most once.
pub struct ServerNext<Req, Resp> {
    inner: ServerHandleFn<Req, Resp>,
}

impl<Req, Resp> ServerNext<Req, Resp> {
    pub(crate) fn new(inner: ServerHandleFn<Req, Resp>) -> Self {
        Self { inner }
    }

    /// Hand the request and context to the next interceptor, or to the
    /// handler.
    pub async fn call(
        self,
        request: StreamingRequest<Req>,
        context: ServerContext,
    ) -> Result<StreamingResponse<Resp>, RpcError> {
        (self.inner)(request, context).await
    }
}

/// An interceptor on the server inbound path.
///
/// Requests are intercepted after the transport has accepted the stream and
/// before the handler runs; a rejection here means the handler is never
/// invoked.
pub trait ServerInterceptor<Req, Resp>: Send + Sync {
    /// Intercept a request on its way to the handler.
    fn intercept(
        &self,
        request: StreamingRequest<Req>,
        context: ServerContext,
        next: ServerNext<Req, Resp>,
    ) -> BoxFuture<'static, Result<StreamingResponse<Resp>, RpcError>>;
}

/// An ordered chain of server interceptors.
pub struct ServerInterceptorChain<Req, Resp> {
    stages: Vec<Arc<dyn ServerInterceptor<Req, Resp>>>,
}

impl<Req, Resp> Clone for ServerInterceptorChain<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
        }
    }
}

impl<Req, Resp> std::fmt::Debug for ServerInterceptorChain<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInterceptorChain")
            .field("count", &self.stages.len())
            .finish()
    }
}

impl<Req, Resp> Default for ServerInterceptorChain<Req, Resp> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<Req: Send + 'static, Resp: Send + 'static> ServerInterceptorChain<Req, Resp> {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append an interceptor. Registration order is invocation order.
    pub fn push(&mut self, interceptor: Arc<dyn ServerInterceptor<Req, Resp>>) {
        self.stages.push(interceptor);
    }

    /// Append an interceptor, returning the chain for further building.
    pub fn with(mut self, interceptor: Arc<dyn ServerInterceptor<Req, Resp>>) -> Self {
        self.push(interceptor);
        self
    }

    /// Check if the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Get the number of interceptors in the chain.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Wrap a terminal handler dispatch with every interceptor in the chain.
    pub fn wrap(&self, terminal: ServerHandleFn<Req, Resp>) -> ServerHandleFn<Req, Resp> {
        let mut wrapped = terminal;
        for stage in self.stages.iter().rev() {
            let stage = stage.clone();
            let next_fn = wrapped;
            wrapped = Arc::new(move |request, context| {
                stage.intercept(request, context, ServerNext::new(next_fn.clone()))
            });
        }
        wrapped
    }

    /// Thread a request through the chain down to the handler.
    pub async fn execute(
        &self,
        request: StreamingRequest<Req>,
        context: ServerContext,
        terminal: ServerHandleFn<Req, Resp>,
    ) -> Result<StreamingResponse<Resp>, RpcError> {
        (self.wrap(terminal))(request, context).await
    }
}

/// A function-based server interceptor.
pub struct FnServerInterceptor<F> {
    func: F,
}

impl<F> FnServerInterceptor<F> {
    /// Create an interceptor from a function.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<Req, Resp, F, Fut> ServerInterceptor<Req, Resp> for FnServerInterceptor<F>
where
    F: Fn(StreamingRequest<Req>, ServerContext, ServerNext<Req, Resp>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StreamingResponse<Resp>, RpcError>> + Send + 'static,
{
    fn intercept(
        &self,
        request: StreamingRequest<Req>,
        context: ServerContext,
        next: ServerNext<Req, Resp>,
    ) -> BoxFuture<'static, Result<StreamingResponse<Resp>, RpcError>> {
        Box::pin((self.func)(request, context, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodDescriptor;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_context() -> CallContext {
        CallContext::new(MethodDescriptor::new("test.Service", "Method"))
    }

    fn recording_terminal(
        calls: Arc<AtomicU32>,
        metadata_log: Arc<Mutex<Option<Metadata>>>,
    ) -> ClientCallFn<u32, u32> {
        Arc::new(move |request, _context| {
            let calls = calls.clone();
            let metadata_log = metadata_log.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                *metadata_log.lock().unwrap() = Some(request.metadata.clone());
                Ok(StreamingResponse::single(7))
            })
        })
    }

    use crate::message::Metadata;

    struct HeaderStamp {
        name: &'static str,
        value: &'static str,
    }

    impl<Req: Send + 'static, Resp: Send + 'static> ClientInterceptor<Req, Resp> for HeaderStamp {
        fn intercept(
            &self,
            mut request: StreamingRequest<Req>,
            context: CallContext,
            next: ClientNext<Req, Resp>,
        ) -> BoxFuture<'static, Result<StreamingResponse<Resp>, RpcError>> {
            request
                .metadata
                .insert(self.name, self.value.parse().unwrap());
            Box::pin(next.call(request, context))
        }
    }

    #[tokio::test]
    async fn test_chain_invokes_in_registration_order() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(None));

        let chain = ClientInterceptorChain::new()
            .with(Arc::new(HeaderStamp {
                name: "x-order",
                value: "first",
            }))
            .with(Arc::new(HeaderStamp {
                name: "x-order",
                value: "second",
            }));

        let terminal = recording_terminal(calls.clone(), seen.clone());
        let response = chain
            .execute(StreamingRequest::single(1), test_context(), terminal)
            .await
            .unwrap();

        assert_eq!(response.messages.collect().await.unwrap(), vec![7]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The second interceptor ran after the first and overwrote the header.
        let metadata = seen.lock().unwrap().take().unwrap();
        assert_eq!(metadata.get("x-order").unwrap(), "second");
    }

    #[tokio::test]
    async fn test_short_circuit_skips_rest_of_chain() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(None));
        let later_ran = Arc::new(AtomicU32::new(0));

        let rejecting = FnClientInterceptor::new(
            |_request: StreamingRequest<u32>, _context: CallContext, _next: ClientNext<u32, u32>| async move {
                Err::<StreamingResponse<u32>, _>(RpcError::unauthenticated("no token"))
            },
        );
        let counting = {
            let later_ran = later_ran.clone();
            FnClientInterceptor::new(move |request, context, next: ClientNext<u32, u32>| {
                later_ran.fetch_add(1, Ordering::SeqCst);
                Box::pin(next.call(request, context))
            })
        };

        let chain = ClientInterceptorChain::new()
            .with(Arc::new(rejecting))
            .with(Arc::new(counting));

        let err = chain
            .execute(
                StreamingRequest::single(1),
                test_context(),
                recording_terminal(calls.clone(), seen),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), crate::Code::Unauthenticated);
        assert_eq!(later_ran.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_interceptor_translates_error_from_next() {
        let failing: ClientCallFn<u32, u32> = Arc::new(|_request, _context| {
            Box::pin(async move { Err(RpcError::not_found("missing")) })
        });

        let translating = FnClientInterceptor::new(|request, context, next: ClientNext<u32, u32>| {
            Box::pin(async move {
                next.call(request, context)
                    .await
                    .map_err(|err| RpcError::new(err.code(), "wrapped"))
            })
        });

        let chain = ClientInterceptorChain::new().with(Arc::new(translating));
        let err = chain
            .execute(StreamingRequest::single(1), test_context(), failing)
            .await
            .unwrap_err();

        assert_eq!(err.code(), crate::Code::NotFound);
        assert_eq!(err.message(), Some("wrapped"));
    }

    #[tokio::test]
    async fn test_server_chain_order_and_short_circuit() {
        let handler_ran = Arc::new(AtomicU32::new(0));
        let terminal: ServerHandleFn<u32, u32> = {
            let handler_ran = handler_ran.clone();
            Arc::new(move |_request, _context| {
                let handler_ran = handler_ran.clone();
                Box::pin(async move {
                    handler_ran.fetch_add(1, Ordering::SeqCst);
                    Ok(StreamingResponse::single(1))
                })
            })
        };

        let rejecting = FnServerInterceptor::new(|request: StreamingRequest<u32>, context, next: ServerNext<u32, u32>| {
            Box::pin(async move {
                if request.metadata.contains_key("authorization") {
                    next.call(request, context).await
                } else {
                    Err(RpcError::unauthenticated("missing token"))
                }
            })
        });

        let chain = ServerInterceptorChain::new().with(Arc::new(rejecting));
        let context = ServerContext::new(MethodDescriptor::new("test.Service", "Method"), "test");

        let err = chain
            .execute(StreamingRequest::single(1), context.clone(), terminal.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::Code::Unauthenticated);
        assert_eq!(handler_ran.load(Ordering::SeqCst), 0);

        let mut request = StreamingRequest::single(1);
        request
            .metadata
            .insert("authorization", "token".parse().unwrap());
        chain.execute(request, context, terminal).await.unwrap();
        assert_eq!(handler_ran.load(Ordering::SeqCst), 1);
    }
}
