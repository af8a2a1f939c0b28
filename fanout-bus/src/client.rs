use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type ClientId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    /// The response body was delivered to the end (finished or failed).
    Finished,
    /// The consumer went away before the stream ended.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The client's queue is full; it cannot keep up.
    Full,
    /// The client is gone.
    Closed,
}

/// Creates the two halves of one client: the sender kept by the pipeline and
/// the body stream handed to the HTTP response.
pub fn channel(capacity: usize) -> (ClientSender, ClientStream) {
    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let abort = CancellationToken::new();
    (
        ClientSender {
            id,
            tx,
            abort: abort.clone(),
        },
        ClientStream {
            id,
            rx,
            abort,
            on_detach: None,
            ended: false,
        },
    )
}

/// Write side of a client. Writes never block; dropping the sender ends the
/// response cleanly, [`ClientSender::fail`] ends it without a terminator.
#[derive(Debug)]
pub struct ClientSender {
    id: ClientId,
    tx: mpsc::Sender<Bytes>,
    abort: CancellationToken,
}

impl ClientSender {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn write(&self, data: Bytes) -> Delivery {
        match self.tx.try_send(data) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Marks the response as failed; takes effect once the sender is dropped.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn finish(self) {}

    pub fn fail(self) {
        self.abort();
    }
}

type DetachFn = Box<dyn FnOnce(ClientId, DetachReason) + Send>;

/// Read side of a client, usable directly as an HTTP body stream.
pub struct ClientStream {
    id: ClientId,
    rx: mpsc::Receiver<Bytes>,
    abort: CancellationToken,
    on_detach: Option<DetachFn>,
    ended: bool,
}

impl ClientStream {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Registers the callback run when the stream is dropped.
    pub fn on_detach(
        mut self,
        callback: impl FnOnce(ClientId, DetachReason) + Send + 'static,
    ) -> Self {
        self.on_detach = Some(Box::new(callback));
        self
    }
}

impl Stream for ClientStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.ended {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => Poll::Ready(Some(Ok(data))),
            Poll::Ready(None) => {
                this.ended = true;
                if this.abort.is_cancelled() {
                    Poll::Ready(Some(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "transcoding stream aborted",
                    ))))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        if let Some(callback) = self.on_detach.take() {
            let reason = if self.ended {
                DetachReason::Finished
            } else {
                DetachReason::Disconnected
            };
            callback(self.id, reason);
        }
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod client_test;
