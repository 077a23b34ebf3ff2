//! Server-side stream handling.
//!
//! [`serve_stream`] adapts one accepted stream into the envelope world:
//! it reads the leading request metadata, threads the request through the
//! server interceptor chain to the method handler, and writes the handler's
//! response back as parts, always terminating the stream with a trailing
//! status. A rejection from an interceptor produces a trailers-only response
//! and the handler never runs.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::context::ServerContext;
use crate::error::RpcError;
use crate::interceptor::{ServerHandleFn, ServerInterceptorChain};
use crate::message::{
    Metadata, MessageStream, RequestPart, ResponsePart, StreamingRequest, StreamingResponse,
};
use crate::stream::{Outbound, RpcStream};

/// Serve a single accepted stream with the given handler.
///
/// The handler is invoked at most once, after every interceptor has forwarded
/// the request. All outcomes are reported to the peer over the stream; this
/// function itself does not fail. Writes to a peer that has gone away are
/// dropped silently.
pub async fn serve_stream<Req, Resp, H, Fut>(
    stream: RpcStream<RequestPart<Req>, ResponsePart<Resp>>,
    context: ServerContext,
    interceptors: &ServerInterceptorChain<Req, Resp>,
    handler: H,
) where
    Req: Send + 'static,
    Resp: Send + 'static,
    H: FnOnce(StreamingRequest<Req>, ServerContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<StreamingResponse<Resp>, RpcError>> + Send + 'static,
{
    let RpcStream {
        descriptor,
        mut inbound,
        mut outbound,
    } = stream;

    // The stream must open with the call metadata.
    let metadata = match inbound.recv().await {
        Some(Ok(RequestPart::Metadata(metadata))) => metadata,
        Some(Ok(RequestPart::Message(_))) => {
            let err = RpcError::internal("message part before request metadata");
            write_status(&mut outbound, err, Metadata::new()).await;
            return;
        }
        Some(Err(err)) => {
            debug!(method = %descriptor, peer = context.peer(), error = %err, "request stream failed before metadata");
            write_status(&mut outbound, err, Metadata::new()).await;
            return;
        }
        None => {
            trace!(method = %descriptor, peer = context.peer(), "stream closed before request metadata");
            return;
        }
    };

    // Request messages are pulled lazily, so a handler that interleaves reads
    // and writes sees backpressure end to end.
    let messages = MessageStream::from_stream(async_stream::stream! {
        while let Some(part) = inbound.recv().await {
            match part {
                Ok(RequestPart::Message(message)) => yield Ok(message),
                Ok(RequestPart::Metadata(_)) => {
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
    let request = StreamingRequest::new(metadata, messages);

    let handler_slot = Arc::new(Mutex::new(Some(handler)));
    let terminal: ServerHandleFn<Req, Resp> = Arc::new(move |request, context| {
        let handler_slot = handler_slot.clone();
        Box::pin(async move {
            let handler = handler_slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
                .ok_or_else(|| RpcError::internal("interceptor invoked next more than once"))?;
            handler(request, context).await
        })
    });

    match interceptors.execute(request, context.clone(), terminal).await {
        Ok(response) => {
            if outbound
                .write(ResponsePart::Metadata(response.metadata))
                .await
                .is_err()
            {
                return;
            }
            let mut messages = response.messages;
            while let Some(message) = messages.next().await {
                match message {
                    Ok(message) => {
                        if outbound.write(ResponsePart::Message(message)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(method = %descriptor, peer = context.peer(), error = %err, "response stream failed");
                        write_status(&mut outbound, err, Metadata::new()).await;
                        return;
                    }
                }
            }
            let _ = outbound.write(ResponsePart::ok_status()).await;
        }
        Err(err) => {
            trace!(method = %descriptor, peer = context.peer(), code = err.code().as_str(), "call rejected");
            write_status(&mut outbound, err, Metadata::new()).await;
        }
    }
}

async fn write_status<Resp>(
    outbound: &mut Outbound<ResponsePart<Resp>>,
    status: RpcError,
    trailers: Metadata,
) {
    let _ = outbound.write(ResponsePart::Status(status, trailers)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;
    use crate::interceptor::{FnServerInterceptor, ServerNext};
    use crate::method::MethodDescriptor;
    use crate::stream::pipe;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn descriptor() -> MethodDescriptor {
        MethodDescriptor::new("test.Echo", "Echo")
    }

    /// Drive `serve_stream` over in-memory pipes and return the client-side
    /// halves.
    fn spawn_server<H, Fut>(
        chain: ServerInterceptorChain<String, String>,
        handler: H,
    ) -> (
        crate::stream::Outbound<RequestPart<String>>,
        crate::stream::Inbound<ResponsePart<String>>,
    )
    where
        H: FnOnce(StreamingRequest<String>, ServerContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<StreamingResponse<String>, RpcError>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let (client_out, server_in) = pipe(4, token.clone());
        let (server_out, client_in) = pipe(4, token);
        let stream = RpcStream::new(descriptor(), server_in, server_out);
        let context = ServerContext::new(descriptor(), "in-memory");
        tokio::spawn(async move {
            serve_stream(stream, context, &chain, handler).await;
        });
        (client_out, client_in)
    }

    async fn send_request(
        client_out: &mut crate::stream::Outbound<RequestPart<String>>,
        messages: Vec<&str>,
    ) {
        client_out
            .write(RequestPart::Metadata(Metadata::new()))
            .await
            .unwrap();
        for message in messages {
            client_out
                .write(RequestPart::Message(message.to_string()))
                .await
                .unwrap();
        }
        client_out.close();
    }

    #[tokio::test]
    async fn test_serve_stream_echoes_messages() {
        let (mut client_out, mut client_in) =
            spawn_server(ServerInterceptorChain::new(), |request, _context| async {
                Ok(StreamingResponse::new(request.metadata, request.messages))
            });

        send_request(&mut client_out, vec!["a", "b"]).await;

        assert!(matches!(
            client_in.recv().await.unwrap().unwrap(),
            ResponsePart::Metadata(_)
        ));
        for expected in ["a", "b"] {
            match client_in.recv().await.unwrap().unwrap() {
                ResponsePart::Message(message) => assert_eq!(message, expected),
                other => panic!("expected message, got {other:?}"),
            }
        }
        match client_in.recv().await.unwrap().unwrap() {
            ResponsePart::Status(status, _) => assert_eq!(status.code(), Code::Ok),
            other => panic!("expected status, got {other:?}"),
        }
        assert!(client_in.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_serve_stream_handler_error_becomes_trailers_only_status() {
        let (mut client_out, mut client_in) =
            spawn_server(ServerInterceptorChain::new(), |_request, _context| async {
                Err(RpcError::not_found("no such resource"))
            });

        send_request(&mut client_out, vec!["a"]).await;

        match client_in.recv().await.unwrap().unwrap() {
            ResponsePart::Status(status, _) => {
                assert_eq!(status.code(), Code::NotFound);
            }
            other => panic!("expected status, got {other:?}"),
        }
        assert!(client_in.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_serve_stream_interceptor_rejection_skips_handler() {
        let handler_runs = Arc::new(AtomicU32::new(0));
        let gate = FnServerInterceptor::new(
            |request: StreamingRequest<String>, context, next: ServerNext<String, String>| {
                Box::pin(async move {
                    if request.metadata.contains_key("authorization") {
                        next.call(request, context).await
                    } else {
                        Err(RpcError::unauthenticated("missing token"))
                    }
                })
            },
        );
        let chain = ServerInterceptorChain::new().with(Arc::new(gate));

        let (mut client_out, mut client_in) = spawn_server(chain, {
            let handler_runs = handler_runs.clone();
            move |request: StreamingRequest<String>, _context| {
                handler_runs.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(StreamingResponse::new(request.metadata, request.messages))
                }
            }
        });

        send_request(&mut client_out, vec!["a"]).await;

        match client_in.recv().await.unwrap().unwrap() {
            ResponsePart::Status(status, _) => {
                assert_eq!(status.code(), Code::Unauthenticated);
            }
            other => panic!("expected status, got {other:?}"),
        }
        assert_eq!(handler_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_serve_stream_rejects_message_before_metadata() {
        let (mut client_out, mut client_in) =
            spawn_server(ServerInterceptorChain::new(), |request, _context| async {
                Ok(StreamingResponse::new(request.metadata, request.messages))
            });

        client_out
            .write(RequestPart::Message("early".to_string()))
            .await
            .unwrap();
        client_out.close();

        match client_in.recv().await.unwrap().unwrap() {
            ResponsePart::Status(status, _) => assert_eq!(status.code(), Code::Internal),
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_serve_stream_silent_close_before_metadata() {
        let (client_out, mut client_in) =
            spawn_server(ServerInterceptorChain::new(), |request, _context| async {
                Ok(StreamingResponse::new(request.metadata, request.messages))
            });

        drop(client_out);
        // The server closes its side without writing anything.
        assert!(client_in.recv().await.is_none());
    }
}
