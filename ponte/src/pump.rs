use std::{pin::pin, sync::Arc};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use tokio::sync::{mpsc, oneshot};
use tonic::{metadata::MetadataMap, Code, Status, Streaming};
use tracing::debug;

use crate::{
    framing::{self, FrameDecoder, FramingError, WireFormat},
    observe::CallObserver,
    BoxError,
};

/// Bound on in-flight frames between the two transports; keeps a fast
/// producer from outrunning a slow consumer.
pub(crate) const PUMP_DEPTH: usize = 16;

/// Inbound half of a call: client body frames in, backend messages out.
///
/// Dropping `messages` on return is the half-close; the backend keeps
/// streaming its response after the request side completes. Decode failures
/// go out on `fault` and terminate the call.
pub(crate) async fn client_to_backend<B>(
    body: B,
    mut decoder: FrameDecoder,
    messages: mpsc::Sender<Bytes>,
    fault: oneshot::Sender<Status>,
) where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let mut body = pin!(body);
    let failure = 'read: loop {
        let frame = match body.frame().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                break 'read Some(Status::cancelled(format!(
                    "client stream failed: {}",
                    err.into()
                )));
            }
            None => break 'read None,
        };
        // HTTP-level request trailers are not part of the call
        let Ok(chunk) = frame.into_data() else { continue };
        if let Err(err) = decoder.extend(&chunk) {
            break 'read Some(err.into());
        }
        loop {
            match decoder.next_frame() {
                Ok(Some(framing::WireFrame::Data(message))) => {
                    if messages.send(message).await.is_err() {
                        // backend side gone, nothing left to feed
                        return;
                    }
                }
                Ok(Some(framing::WireFrame::Trailers(_))) => {
                    break 'read Some(FramingError::UnexpectedTrailers.into());
                }
                Ok(None) => break,
                Err(err) => break 'read Some(err.into()),
            }
        }
    };

    let failure = failure.or_else(|| decoder.finish().err().map(Into::into));
    if let Some(status) = failure {
        debug!("inbound pump failed: {status}");
        let _ = fault.send(status);
    }
}

enum End {
    Complete(Option<MetadataMap>),
    Fail(Status),
    ClientGone,
}

/// Outbound half: backend messages in, client body frames out, exactly one
/// trailer at the end. Returning drops the backend stream, which is the
/// cancellation path when the client goes away first.
pub(crate) async fn backend_to_client(
    mut messages: Streaming<Bytes>,
    sink: mpsc::Sender<Frame<Bytes>>,
    mut inbound_fault: oneshot::Receiver<Status>,
    format: WireFormat,
    max_frame: usize,
    method: String,
    observer: Arc<dyn CallObserver>,
) {
    enum Step {
        Message(Result<Option<Bytes>, Status>),
        Fault(Status),
    }

    let mut fault_armed = true;
    let end = loop {
        let step = if fault_armed {
            tokio::select! {
                outcome = &mut inbound_fault => match outcome {
                    Ok(status) => Step::Fault(status),
                    Err(_) => {
                        // inbound pump finished cleanly
                        fault_armed = false;
                        continue;
                    }
                },
                message = messages.message() => Step::Message(message),
            }
        } else {
            Step::Message(messages.message().await)
        };

        match step {
            Step::Fault(status) => break End::Fail(status),
            Step::Message(Ok(Some(payload))) => {
                let frame = match framing::encode_data(&payload, max_frame) {
                    Ok(frame) => frame,
                    Err(err) => break End::Fail(err.into()),
                };
                let frame = match format {
                    WireFormat::WebText => framing::to_text(&frame),
                    _ => frame,
                };
                if sink.send(Frame::data(frame)).await.is_err() {
                    break End::ClientGone;
                }
            }
            Step::Message(Ok(None)) => match messages.trailers().await {
                Ok(trailers) => break End::Complete(trailers),
                Err(status) => break End::Fail(status),
            },
            Step::Message(Err(status)) => break End::Fail(status),
        }
    };

    let code = match end {
        End::Complete(trailers) => {
            deliver_trailers(&sink, format, &Status::new(Code::Ok, ""), trailers).await;
            Code::Ok
        }
        End::Fail(status) => {
            deliver_trailers(&sink, format, &status, None).await;
            status.code()
        }
        End::ClientGone => Code::Cancelled,
    };
    observer.call_closed(&method, code);
}

async fn deliver_trailers(
    sink: &mpsc::Sender<Frame<Bytes>>,
    format: WireFormat,
    status: &Status,
    trailers: Option<MetadataMap>,
) {
    let frame = match format {
        WireFormat::Native => Frame::trailers(framing::trailer_headers(status, trailers)),
        WireFormat::Web => Frame::data(framing::encode_trailers(status, trailers)),
        WireFormat::WebText => {
            Frame::data(framing::to_text(&framing::encode_trailers(status, trailers)))
        }
    };
    let _ = sink.send(frame).await;
}
