//! Boundary to the external media pipeline engine.
//!
//! An [`Engine`] turns a materialized topology description into a running
//! graph and reports what the graph produces as [`EngineEvent`]s on a
//! channel: zero or more chunks (optionally preceded by segment markers),
//! then exactly one terminal event. Once [`EngineHandle::stop`] is called
//! the engine must not deliver anything else.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Result, TranscodeError},
    header::HeaderProbe,
};

/// Capacity of the channel between an engine and its pipeline.
pub const EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    /// Set for structural header chunks (stream headers of the container).
    pub header: bool,
}

impl Chunk {
    pub fn payload(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            header: false,
        }
    }

    pub fn header(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            header: true,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Start of a new segment of timed media.
    Segment,
    Chunk(Chunk),
    Eos,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Eos,
    Error,
}

pub type EngineEventSender = mpsc::Sender<EngineEvent>;
pub type EngineEventReceiver = mpsc::Receiver<EngineEvent>;

/// A topology ready to be launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Topology with the source locator already interpolated.
    pub description: String,
    /// Name of the element whose output is the produced byte stream.
    pub output: String,
    pub header: HeaderProbe,
}

pub trait Engine: Send + Sync {
    fn launch(
        &self,
        request: LaunchRequest,
        events: EngineEventSender,
    ) -> Result<Box<dyn EngineHandle>>;
}

/// Exclusive ownership of one running graph.
pub trait EngineHandle: Send {
    fn stop(&mut self);
}

/// Engine driven by the caller: every launch yields a [`ManualFeed`] through
/// which chunks and terminal events are pushed by hand. Useful for feeding
/// an in-process producer into the fan-out, and for tests.
#[derive(Default)]
pub struct ManualEngine {
    feeds: Mutex<Vec<ManualFeed>>,
    reject: Mutex<Option<String>>,
    launches: AtomicUsize,
    stops: Arc<AtomicUsize>,
}

impl ManualEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next launch fail as if the topology were malformed.
    pub fn reject_next(&self, reason: impl Into<String>) {
        *self.reject.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    /// Takes the oldest feed not yet handed out.
    pub fn take_feed(&self) -> Option<ManualFeed> {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        if feeds.is_empty() {
            None
        } else {
            Some(feeds.remove(0))
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Number of times any launched graph was released.
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Engine for ManualEngine {
    fn launch(
        &self,
        request: LaunchRequest,
        events: EngineEventSender,
    ) -> Result<Box<dyn EngineHandle>> {
        if let Some(reason) = self
            .reject
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(TranscodeError::build(reason));
        }

        self.launches.fetch_add(1, Ordering::SeqCst);
        let stopped = CancellationToken::new();
        self.feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ManualFeed {
                request,
                events,
                stopped: stopped.clone(),
            });

        Ok(Box::new(ManualHandle {
            stopped,
            stops: Arc::clone(&self.stops),
        }))
    }
}

struct ManualHandle {
    stopped: CancellationToken,
    stops: Arc<AtomicUsize>,
}

impl EngineHandle for ManualHandle {
    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stopped.cancel();
    }
}

#[derive(Clone)]
pub struct ManualFeed {
    request: LaunchRequest,
    events: EngineEventSender,
    stopped: CancellationToken,
}

impl ManualFeed {
    pub fn request(&self) -> &LaunchRequest {
        &self.request
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Delivers an event; returns false once the graph was stopped or the
    /// pipeline is gone.
    pub async fn send(&self, event: EngineEvent) -> bool {
        if self.stopped.is_cancelled() {
            return false;
        }
        self.events.send(event).await.is_ok()
    }

    pub async fn chunk(&self, data: impl Into<Bytes>) -> bool {
        self.send(EngineEvent::Chunk(Chunk::payload(data))).await
    }

    pub async fn header(&self, data: impl Into<Bytes>) -> bool {
        self.send(EngineEvent::Chunk(Chunk::header(data))).await
    }

    pub async fn segment(&self) -> bool {
        self.send(EngineEvent::Segment).await
    }

    pub async fn eos(&self) -> bool {
        self.send(EngineEvent::Eos).await
    }

    pub async fn error(&self, msg: impl Into<String>) -> bool {
        self.send(EngineEvent::Error(msg.into())).await
    }
}
