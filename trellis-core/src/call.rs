//! Client call execution.
//!
//! [`execute`] drives one logical call: it threads a request through the
//! client interceptor chain, across the transport, and back, re-entering the
//! chain as a fresh attempt when a failed attempt qualifies for a retry under
//! the method's policy and the transport's throttle permits it.
//!
//! The caller supplies a request factory (each attempt consumes a fresh
//! request envelope) and a response handler closure. The handler consumes the
//! streaming response while the underlying stream is still alive and is
//! invoked exactly once, on the final attempt. Once the transport has
//! accepted a response (leading metadata received) the call is committed and
//! will not be retried, even if the message stream later fails.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::debug;

use crate::config::RetryPolicy;
use crate::context::{CallContext, CallOptions};
use crate::error::{Code, RpcError};
use crate::interceptor::{ClientCallFn, ClientInterceptorChain};
use crate::message::{MessageStream, RequestPart, ResponsePart, StreamingRequest, StreamingResponse};
use crate::stream::RpcStream;
use crate::throttle::RetryThrottle;
use crate::transport::ClientTransport;

/// Execute a call over a transport, retrying failed attempts as permitted.
///
/// `make_request` is invoked once per attempt; `handler` consumes the
/// response inside the stream's scope and produces the call's result.
///
/// The deadline (from `options`, then the context deadline, then the method
/// config) covers all attempts. Cancelling the context unblocks any suspended
/// stream operation and fails the call with a cancellation error.
pub async fn execute<T, Req, Resp, B, H, Fut, R>(
    transport: &T,
    context: CallContext,
    options: CallOptions,
    interceptors: &ClientInterceptorChain<Req, Resp>,
    make_request: B,
    handler: H,
) -> Result<R, RpcError>
where
    T: ClientTransport<ReqPart = RequestPart<Req>, RespPart = ResponsePart<Resp>>,
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Fn() -> StreamingRequest<Req>,
    H: FnOnce(StreamingResponse<Resp>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    R: Send + 'static,
{
    let config = transport.config(context.descriptor());
    let policy = config.as_ref().and_then(|c| c.retry.clone());
    let timeout = options
        .timeout
        .or_else(|| {
            context
                .deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        })
        .or(config.as_ref().and_then(|c| c.timeout));
    let options = CallOptions {
        cancellation: Some(
            options
                .cancellation
                .clone()
                .unwrap_or_else(|| context.cancellation().clone()),
        ),
        ..options
    };

    let attempts = run_attempts(
        transport,
        context.clone(),
        options,
        interceptors,
        policy,
        make_request,
        handler,
    );

    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, attempts)
            .await
            .unwrap_or_else(|_| Err(RpcError::deadline_exceeded("call deadline exceeded"))),
        None => attempts.await,
    }
}

async fn run_attempts<T, Req, Resp, B, H, Fut, R>(
    transport: &T,
    context: CallContext,
    options: CallOptions,
    interceptors: &ClientInterceptorChain<Req, Resp>,
    policy: Option<RetryPolicy>,
    make_request: B,
    handler: H,
) -> Result<R, RpcError>
where
    T: ClientTransport<ReqPart = RequestPart<Req>, RespPart = ResponsePart<Resp>>,
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Fn() -> StreamingRequest<Req>,
    H: FnOnce(StreamingResponse<Resp>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    R: Send + 'static,
{
    let throttle = transport.retry_throttle().cloned();
    // The handler runs on at most one attempt: the one whose response was
    // accepted by the peer.
    let handler_slot = Arc::new(Mutex::new(Some(handler)));

    let mut attempt: u32 = 1;
    loop {
        if context.is_cancelled() {
            return Err(RpcError::cancelled("call scope cancelled"));
        }

        let result = run_attempt(
            transport,
            context.with_attempt(attempt),
            options.clone(),
            interceptors.clone(),
            make_request(),
            handler_slot.clone(),
        )
        .await;

        let err = match result {
            Ok(value) => {
                if let Some(throttle) = &throttle {
                    throttle.record_success();
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        // A consumed handler means the response was accepted before the
        // failure; the call is committed and must not be retried.
        let committed = lock_unpoisoned(&handler_slot).is_none();

        let code_retryable = policy
            .as_ref()
            .map(|p| p.is_code_retryable(err.code()))
            .unwrap_or(false);
        if let Some(throttle) = &throttle {
            if code_retryable && !committed {
                throttle.record_retryable_failure();
            } else {
                throttle.record_success();
            }
        }

        if committed || err.is_cancellation() {
            return Err(err);
        }

        let Some(policy) = policy.as_ref() else {
            return Err(err);
        };
        let budget_left = attempt < policy.max_attempts;
        let permitted = throttle
            .as_ref()
            .map(RetryThrottle::is_retry_permitted)
            .unwrap_or(true);
        if !code_retryable || !budget_left || !permitted {
            debug!(
                method = %context.descriptor(),
                attempt,
                code = err.code().as_str(),
                permitted,
                "not retrying failed attempt"
            );
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            method = %context.descriptor(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            code = err.code().as_str(),
            "retrying after transient failure"
        );
        tokio::select! {
            biased;
            _ = context.cancellation().cancelled() => {
                return Err(RpcError::cancelled("call scope cancelled"));
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

async fn run_attempt<T, Req, Resp, H, Fut, R>(
    transport: &T,
    context: CallContext,
    options: CallOptions,
    interceptors: ClientInterceptorChain<Req, Resp>,
    request: StreamingRequest<Req>,
    handler_slot: Arc<Mutex<Option<H>>>,
) -> Result<R, RpcError>
where
    T: ClientTransport<ReqPart = RequestPart<Req>, RespPart = ResponsePart<Resp>>,
    Req: Send + 'static,
    Resp: Send + 'static,
    H: FnOnce(StreamingResponse<Resp>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    R: Send + 'static,
{
    let descriptor = context.descriptor().clone();

    // The chain runs outside the stream scope; the transport stream is only
    // opened once an interceptor lets the call reach the terminal dispatch.
    // A short-circuiting interceptor never touches the transport.
    let (dispatch_tx, dispatch_rx) = oneshot::channel::<(StreamingRequest<Req>, CallContext)>();
    let (response_tx, response_rx) =
        oneshot::channel::<Result<StreamingResponse<Resp>, RpcError>>();
    let (done_tx, done_rx) = oneshot::channel::<()>();

    // The terminal dispatch may run at most once per attempt; the slot
    // enforces the chain's call-next-exactly-once contract.
    let relay_slot = Arc::new(Mutex::new(Some((dispatch_tx, response_rx))));
    let terminal: ClientCallFn<Req, Resp> = Arc::new(move |request, context| {
        let relay_slot = relay_slot.clone();
        Box::pin(async move {
            let (dispatch_tx, response_rx) = lock_unpoisoned(&relay_slot)
                .take()
                .ok_or_else(|| RpcError::internal("interceptor invoked next more than once"))?;
            if dispatch_tx.send((request, context)).is_err() {
                return Err(RpcError::unavailable("stream closed before response"));
            }
            response_rx
                .await
                .unwrap_or_else(|_| Err(RpcError::unavailable("stream closed before response")))
        })
    });

    let pipeline = async move {
        // Holds the stream scope open until the handler finishes.
        let _done = done_tx;
        let response = interceptors.execute(request, context, terminal).await?;
        let handler = lock_unpoisoned(&handler_slot)
            .take()
            .ok_or_else(|| RpcError::internal("response handler already consumed"))?;
        handler(response).await
    };

    let transport_side = async move {
        let Ok((request, context)) = dispatch_rx.await else {
            // The chain finished without reaching the terminal dispatch.
            return;
        };
        let response_slot = Arc::new(Mutex::new(Some(response_tx)));
        let body_slot = response_slot.clone();
        let opened = transport
            .with_stream(&descriptor, options, move |stream| async move {
                let response = dispatch(stream, request, context).await;
                let accepted = response.is_ok();
                let delivered = match lock_unpoisoned(&body_slot).take() {
                    Some(response_tx) => response_tx.send(response).is_ok(),
                    None => false,
                };
                if delivered && accepted {
                    // Keep the stream alive while the handler consumes the
                    // response; resolves when the pipeline finishes.
                    let _ = done_rx.await;
                }
                Ok(())
            })
            .await;
        if let Err(err) = opened {
            if let Some(response_tx) = lock_unpoisoned(&response_slot).take() {
                let _ = response_tx.send(Err(err));
            }
        }
    };

    let (result, ()) = tokio::join!(pipeline, transport_side);
    result
}

/// Terminal dispatch: pump the request over the stream and classify the
/// response by its first part. Leading metadata accepts the response; a
/// leading status rejects the attempt with that status.
async fn dispatch<Req, Resp>(
    stream: RpcStream<ResponsePart<Resp>, RequestPart<Req>>,
    request: StreamingRequest<Req>,
    context: CallContext,
) -> Result<StreamingResponse<Resp>, RpcError>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let RpcStream {
        mut inbound,
        mut outbound,
        ..
    } = stream;

    // Pump the request concurrently so response reads and request writes can
    // interleave under backpressure.
    tokio::spawn(async move {
        if outbound
            .write(RequestPart::Metadata(request.metadata))
            .await
            .is_err()
        {
            return;
        }
        let mut messages = request.messages;
        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => {
                    if outbound.write(RequestPart::Message(message)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    outbound.abort(err);
                    return;
                }
            }
        }
        outbound.close();
    });

    match inbound.recv().await {
        Some(Ok(ResponsePart::Metadata(metadata))) => {
            tracing::trace!(
                method = %context.descriptor(),
                attempt = context.attempt(),
                "response accepted"
            );
            let messages = MessageStream::from_stream(async_stream::stream! {
                while let Some(part) = inbound.recv().await {
                    match part {
                        Ok(ResponsePart::Message(message)) => yield Ok(message),
                        Ok(ResponsePart::Status(status, _trailers)) => {
                            if status.code() != Code::Ok {
                                yield Err(status);
                            }
                            break;
                        }
                        Ok(ResponsePart::Metadata(_)) => {
                            yield Err(RpcError::internal("unexpected metadata part mid-stream"));
                            break;
                        }
                        Err(err) => {
                            yield Err(err);
                            break;
                        }
                    }
                }
            });
            Ok(StreamingResponse::new(metadata, messages))
        }
        // Trailers-only responses carry the status before any metadata.
        Some(Ok(ResponsePart::Status(status, trailers))) => {
            if status.code() == Code::Ok {
                Ok(StreamingResponse::new(trailers, MessageStream::empty()))
            } else {
                Err(status)
            }
        }
        Some(Ok(ResponsePart::Message(_))) => {
            Err(RpcError::internal("message part before response metadata"))
        }
        Some(Err(err)) => Err(err),
        None => Err(RpcError::unavailable("stream closed before response")),
    }
}

fn lock_unpoisoned<T>(slot: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
