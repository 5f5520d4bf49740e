//! Agent control channel handle

use futures::{Sink, SinkExt};
use sshgate_proto::{CodecError, ControlMessage};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outbound queue depth per control channel
const OUTBOUND_QUEUE_SIZE: usize = 256;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Control channel {0} is closed")]
pub struct ChannelClosed(pub u64);

/// Write handle for one agent control connection
///
/// Cloning is cheap. Every clone feeds the same queue, and a single writer
/// task drains it onto the wire, so messages from one producer arrive in the
/// order they were queued.
#[derive(Debug, Clone)]
pub struct AgentChannel {
    channel_id: u64,
    peer_addr: SocketAddr,
    tx: mpsc::Sender<ControlMessage>,
    shutdown: CancellationToken,
}

impl AgentChannel {
    /// Create a channel handle and the receiving end of its outbound queue
    pub fn new(peer_addr: SocketAddr) -> (Self, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let channel = Self {
            channel_id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            tx,
            shutdown: CancellationToken::new(),
        };
        (channel, rx)
    }

    pub fn id(&self) -> u64 {
        self.channel_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue a message, waiting for room if the queue is full
    pub async fn send(&self, msg: ControlMessage) -> Result<(), ChannelClosed> {
        if self.is_closed() {
            return Err(ChannelClosed(self.channel_id));
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(ChannelClosed(self.channel_id)),
            res = self.tx.send(msg) => res.map_err(|_| ChannelClosed(self.channel_id)),
        }
    }

    /// Queue a message without waiting
    ///
    /// Used from synchronous cleanup paths. When the queue is full the message
    /// is handed to a short-lived task so it still goes out after everything
    /// already queued.
    pub fn notify(&self, msg: ControlMessage) {
        if self.is_closed() {
            return;
        }
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                let channel = self.clone();
                tokio::spawn(async move {
                    let _ = channel.send(msg).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Mark the channel dead; readers and the writer task stop promptly
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once [`AgentChannel::close`] has been called
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Spawn the single writer task for this channel
    ///
    /// The task exits when the channel is closed, when every sender is gone,
    /// or when the sink fails. A sink failure closes the channel.
    pub fn spawn_writer<W>(&self, mut sink: W, mut rx: mpsc::Receiver<ControlMessage>) -> JoinHandle<()>
    where
        W: Sink<ControlMessage, Error = CodecError> + Unpin + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let channel_id = self.channel_id;

        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };

                if let Err(e) = sink.send(msg).await {
                    tracing::warn!(channel_id, "Failed to write control message: {}", e);
                    shutdown.cancel();
                    break;
                }
            }

            let _ = sink.close().await;
            tracing::debug!(channel_id, "Control channel writer stopped");
        })
    }
}
