//! Bidirectional request/response transport over a byte stream.
//!
//! The engine and a plugin are peers on one unix-domain socket: either
//! side can initiate a call and multiple calls may be outstanding in both
//! directions. Messages are length-delimited frames carrying a serialized
//! envelope with a correlation ID. The wire schema is deliberately the
//! only place in the crate that knows how messages are encoded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::api::*;

/// Hard cap on a single framed message.
pub(crate) const MAX_FRAME_SIZE: usize = 16 << 20;

const OUTBOUND_QUEUE: usize = 64;

/// Calls either peer can initiate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum Request {
    // Plugin-initiated.
    RegisterPlugin(RegisterPluginRequest),
    UpdateContainers(UpdateContainersRequest),
    // Engine-initiated.
    Configure(ConfigureRequest),
    Synchronize(SynchronizeRequest),
    CreateContainer(CreateContainerRequest),
    UpdateContainer(UpdateContainerRequest),
    StopContainer(StopContainerRequest),
    UpdatePodSandbox(UpdatePodSandboxRequest),
    StateChange(StateChangeEvent),
    ValidateContainerAdjustment(Box<ValidateContainerAdjustmentRequest>),
    Shutdown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum Response {
    Empty,
    Configure(ConfigureResponse),
    Synchronize(SynchronizeResponse),
    CreateContainer(CreateContainerResponse),
    UpdateContainer(UpdateContainerResponse),
    StopContainer(StopContainerResponse),
    UpdateContainers(UpdateContainersResponse),
    ValidateContainerAdjustment(ValidateContainerAdjustmentResponse),
    /// The remote handler failed.
    Error(String),
}

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Call(u64, Request),
    Reply(u64, Response),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum TransportError {
    #[error("connection closed")]
    Closed,
}

/// An inbound call with its reply slot. Dropping `reply` without sending
/// answers the caller with an error.
pub(crate) struct IncomingCall {
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// One side of a connection. Cheap to share behind `Arc`.
pub(crate) struct Peer {
    next_id: AtomicU64,
    pending: Pending,
    out_tx: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

impl Peer {
    /// Wrap a byte stream, spawning its reader and writer tasks. Inbound
    /// calls are delivered on the returned channel.
    pub fn open<S>(stream: S) -> (Arc<Peer>, mpsc::Receiver<IncomingCall>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(
            read_half,
            LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
        );
        let writer = FramedWrite::new(
            write_half,
            LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
        );

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (in_tx, in_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(writer, out_rx, closed.clone()));
        tokio::spawn(read_loop(
            reader,
            in_tx,
            out_tx.clone(),
            pending.clone(),
            closed.clone(),
        ));

        let peer = Arc::new(Peer {
            next_id: AtomicU64::new(1),
            pending,
            out_tx,
            closed,
        });
        (peer, in_rx)
    }

    /// Issue a call and suspend until the reply arrives or the connection
    /// closes. Deadlines are the caller's business.
    pub async fn call(&self, request: Request) -> Result<Response, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        if self.out_tx.send(Frame::Call(id, request)).await.is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(TransportError::Closed);
        }
        rx.await.map_err(|_| TransportError::Closed)
    }

    /// Tear the connection down. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the connection goes away, for observers.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, LengthDelimitedCodec>,
    mut out_rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = out_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let buf = match serde_json::to_vec(&frame) {
            Ok(buf) => buf,
            Err(e) => {
                warn!("failed to encode frame: {}", e);
                continue;
            }
        };
        if let Err(e) = writer.send(Bytes::from(buf)).await {
            debug!("transport write failed: {}", e);
            break;
        }
    }
    closed.cancel();
}

async fn read_loop<R>(
    mut reader: FramedRead<R, LengthDelimitedCodec>,
    in_tx: mpsc::Sender<IncomingCall>,
    out_tx: mpsc::Sender<Frame>,
    pending: Pending,
    closed: CancellationToken,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = reader.next() => frame,
        };
        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                debug!("transport read failed: {}", e);
                break;
            }
            None => break,
        };
        let frame: Frame = match serde_json::from_slice(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("malformed frame, closing connection: {}", e);
                break;
            }
        };
        match frame {
            Frame::Call(id, request) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if in_tx
                    .send(IncomingCall {
                        request,
                        reply: reply_tx,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
                let out = out_tx.clone();
                tokio::spawn(async move {
                    let response = reply_rx
                        .await
                        .unwrap_or_else(|_| Response::Error("request handler dropped".to_string()));
                    let _ = out.send(Frame::Reply(id, response)).await;
                });
            }
            Frame::Reply(id, response) => {
                let tx = pending.lock().unwrap().remove(&id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!("dropping reply to unknown call {}", id),
                }
            }
        }
    }
    closed.cancel();
    // Fail every outstanding call.
    pending.lock().unwrap().clear();
}
