//! Per-connection serving loop.
//!
//! Each accepted connection is served independently. The first frame
//! decides the framing mode: classic frames are answered in order on
//! the same connection (serial clients send one request at a time),
//! enhanced frames are dispatched concurrently and answered by request
//! id through a shared writer.
//!
//! Requests may arrive bare or inside the [`Message`] envelope;
//! cancellation envelopes are control traffic and get no reply.

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use super::cancel::CancelRegistry;
use super::router::{RequestContext, Router};
use crate::codec::CodecKind;
use crate::error::Error;
use crate::protocol::{Frame, Framer, InboundFrame, Message, Request, Response};

pub(crate) async fn serve_connection(
    stream: UnixStream,
    router: Arc<Router>,
    cancels: Arc<CancelRegistry>,
    codec: CodecKind,
    max_frame_size: usize,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = Framer::with_max_size(read_half, max_frame_size);
    let writer = Arc::new(Mutex::new(Framer::with_max_size(write_half, max_frame_size)));

    loop {
        match reader.read_any().await {
            Ok(Some(InboundFrame::Classic(payload))) => {
                match parse_message(codec, &payload) {
                    Some(Message::Request(req)) => {
                        // Serial clients expect FIFO replies; handle
                        // in order on this connection.
                        let resp = run_handler(&router, &cancels, req).await;
                        if write_classic(&writer, codec, &resp).await.is_err() {
                            return;
                        }
                    }
                    Some(Message::Cancellation(c)) => {
                        cancels.cancel(c.id, &c.reason);
                    }
                    Some(Message::Response(_)) => {
                        tracing::warn!("ignoring response frame from driver");
                    }
                    None => {
                        tracing::error!("unparseable classic frame, dropping connection");
                        return;
                    }
                }
            }
            Ok(Some(InboundFrame::Enhanced(frame))) => {
                match parse_message(codec, &frame.payload) {
                    Some(Message::Request(mut req)) => {
                        req.id = frame.request_id();
                        let router = router.clone();
                        let cancels = cancels.clone();
                        let writer = writer.clone();
                        tokio::spawn(async move {
                            let resp = run_handler(&router, &cancels, req).await;
                            let _ = write_enhanced(&writer, codec, resp).await;
                        });
                    }
                    Some(Message::Cancellation(c)) => {
                        cancels.cancel(c.id, &c.reason);
                    }
                    Some(Message::Response(_)) => {
                        tracing::warn!("ignoring response frame from driver");
                    }
                    None => {
                        tracing::error!("unparseable enhanced frame, dropping connection");
                        return;
                    }
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "framing error, dropping connection");
                return;
            }
        }
    }
}

/// Parse a payload as an envelope, falling back to a bare request.
fn parse_message(codec: CodecKind, payload: &Bytes) -> Option<Message> {
    if let Ok(msg) = codec.unmarshal::<Message>(payload) {
        return Some(msg);
    }
    codec
        .unmarshal::<Request>(payload)
        .ok()
        .map(Message::Request)
}

async fn run_handler(router: &Router, cancels: &Arc<CancelRegistry>, req: Request) -> Response {
    let token = cancels.register(req.id);
    let ctx = RequestContext::new(req.id, token, cancels.clone());

    tracing::debug!(request_id = req.id, method = %req.method, "dispatching request");
    let result = router.dispatch(&req.method, req.body, ctx).await;
    cancels.unregister(req.id);

    match result {
        Ok(body) => Response::success(req.id, body),
        Err(Error::Cancelled(reason)) => Response::failure(req.id, format!("Cancelled: {reason}")),
        Err(e) => Response::failure(req.id, e.to_string()),
    }
}

async fn write_classic(
    writer: &Mutex<Framer<OwnedWriteHalf>>,
    codec: CodecKind,
    resp: &Response,
) -> crate::error::Result<()> {
    let data = codec.marshal(resp)?;
    writer.lock().await.write_message(&data).await
}

async fn write_enhanced(
    writer: &Mutex<Framer<OwnedWriteHalf>>,
    codec: CodecKind,
    resp: Response,
) -> crate::error::Result<()> {
    let id = resp.id;
    let payload = codec.marshal(&Message::Response(resp))?;
    let frame = Frame::new(id, payload);
    writer.lock().await.write_frame(&frame).await
}
