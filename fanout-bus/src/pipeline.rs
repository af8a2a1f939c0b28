//! One running transformation graph and the clients reading its output.
//!
//! ```text
//!                                   ┌─► header chunks ──► HeaderCache ──┐
//! Engine ──► [FakeHeaderRewriter] ──┤                                   ├─► clients (attach order)
//!                                   └─► payload ──► OutputSink flush ───┘
//! ```
//!
//! [`PipelineInstance`] is the state machine. [`PipelineHandle::spawn`] runs
//! it inside a task that serializes engine events and client attach/detach
//! commands, so no two of them ever touch the instance at the same time.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    client::{self, ClientId, ClientSender, ClientStream, Delivery, DetachReason},
    engine::{
        Chunk, EVENT_QUEUE, Engine, EngineEvent, EngineEventReceiver, EngineEventSender,
        EngineHandle, LaunchRequest, TerminalKind,
    },
    error::{Result, TranscodeError},
    faker::FakeHeaderRewriter,
    header::HeaderCache,
    profile::TranscoderProfile,
    sink::{DEFAULT_FLUSH_THRESHOLD, OutputSink},
};

/// Default number of flushes queued per client before it counts as stalled.
pub const DEFAULT_CLIENT_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Starting,
    Streaming,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub clients: usize,
    pub bytes_out: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub flush_threshold: usize,
    pub client_queue: usize,
    /// Cap on the fake header accumulation; `None` keeps it unbounded.
    pub fake_header_limit: Option<usize>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            client_queue: DEFAULT_CLIENT_QUEUE,
            fake_header_limit: None,
        }
    }
}

pub struct PipelineInstance {
    resource: String,
    state: PipelineState,
    engine: Option<Box<dyn EngineHandle>>,
    clients: Vec<ClientSender>,
    header: HeaderCache,
    sink: OutputSink,
    rewriter: Option<FakeHeaderRewriter>,
    had_clients: bool,
    bytes_out: u64,
}

impl PipelineInstance {
    pub fn new(resource: &str, sink: OutputSink, rewriter: Option<FakeHeaderRewriter>) -> Self {
        Self {
            resource: resource.to_string(),
            state: PipelineState::Idle,
            engine: None,
            clients: Vec::new(),
            header: HeaderCache::new(),
            sink,
            rewriter,
            had_clients: false,
            bytes_out: 0,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == PipelineState::Terminated
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn header(&self) -> &HeaderCache {
        &self.header
    }

    pub fn has_engine(&self) -> bool {
        self.engine.is_some()
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            state: self.state,
            clients: self.clients.len(),
            bytes_out: self.bytes_out,
        }
    }

    /// Launches the graph. A launch failure leaves the instance terminated.
    pub fn start(
        &mut self,
        engine: &dyn Engine,
        request: LaunchRequest,
        events: EngineEventSender,
    ) -> Result<()> {
        if self.state != PipelineState::Idle {
            return Err(TranscodeError::build(format!(
                "{}: start in state {:?}",
                self.resource, self.state
            )));
        }
        self.state = PipelineState::Starting;
        log::info!("{}: starting {}", self.resource, request.description);

        match engine.launch(request, events) {
            Ok(handle) => {
                self.engine = Some(handle);
                Ok(())
            }
            Err(e) => {
                log::error!("{}: build failed: {}", self.resource, e);
                self.sink.abandon();
                self.state = PipelineState::Terminated;
                Err(e)
            }
        }
    }

    /// Adds a client. Cached header chunks are written to it before it joins
    /// the broadcast set; a client whose queue cannot hold them is refused.
    pub fn attach(&mut self, client: ClientSender) -> Result<()> {
        if matches!(
            self.state,
            PipelineState::Draining | PipelineState::Terminated
        ) {
            return Err(TranscodeError::Terminated);
        }

        for chunk in self.header.chunks() {
            if client.write(chunk.clone()) != Delivery::Queued {
                log::warn!(
                    "{}: client {} cannot take the header replay",
                    self.resource,
                    client.id()
                );
                return Err(TranscodeError::ClientQueueFull {
                    chunks: self.header.chunks().len(),
                });
            }
        }

        log::info!(
            "{}: client {} attached ({} header chunks replayed)",
            self.resource,
            client.id(),
            self.header.chunks().len()
        );
        self.clients.push(client);
        self.had_clients = true;
        Ok(())
    }

    /// Removes a client. Losing the last one tears the pipeline down.
    pub fn detach(&mut self, id: ClientId, reason: DetachReason) {
        let before = self.clients.len();
        self.clients.retain(|client| client.id() != id);
        if self.clients.len() < before {
            log::info!("{}: client {} detached ({:?})", self.resource, id, reason);
        }
        self.teardown_if_idle();
    }

    pub fn on_segment(&mut self) {
        if self.is_stopping() {
            return;
        }
        if self.sink.on_segment_marker() {
            log::warn!(
                "{}: second segment marker, closing sink and dropping further output",
                self.resource
            );
        }
    }

    pub async fn on_chunk(&mut self, chunk: Chunk) {
        match self.state {
            PipelineState::Starting => self.state = PipelineState::Streaming,
            PipelineState::Streaming => {}
            _ => {
                log::trace!(
                    "{}: dropping {} byte chunk in state {:?}",
                    self.resource,
                    chunk.len(),
                    self.state
                );
                return;
            }
        }

        let chunks = match self.rewriter.as_mut() {
            Some(rewriter) => match rewriter.push(chunk.data) {
                Ok(chunks) => chunks,
                Err(e) => return self.fail(e).await,
            },
            None => vec![chunk],
        };

        for chunk in chunks {
            if let Err(e) = self.deliver(chunk).await {
                return self.fail(e).await;
            }
        }
        self.teardown_if_idle();
    }

    async fn deliver(&mut self, chunk: Chunk) -> Result<()> {
        if self.sink.is_closed() {
            return Ok(());
        }

        if self.sink.is_file() {
            self.sink.write(chunk.data).await?;
            return Ok(());
        }

        if chunk.header && !self.header.is_sealed() {
            if !self.header.is_set() {
                log::info!("{}: stream header detected", self.resource);
            }
            self.header.push(chunk.data.clone());
            self.broadcast(chunk.data);
            return Ok(());
        }

        self.header.seal();
        if let Some(flush) = self.sink.write(chunk.data).await? {
            self.broadcast(flush);
        }
        Ok(())
    }

    async fn fail(&mut self, e: TranscodeError) {
        log::error!("{}: {}", self.resource, e);
        self.on_engine_terminal(TerminalKind::Error).await;
    }

    /// Ends the stream for everyone after the engine finished or failed.
    pub async fn on_engine_terminal(&mut self, kind: TerminalKind) {
        if self.is_stopping() {
            return;
        }
        self.state = PipelineState::Draining;

        let mut kind = kind;
        match self.sink.finish().await {
            Ok(Some(rest)) => self.broadcast(rest),
            Ok(None) => {}
            Err(e) => {
                log::error!("{}: closing sink: {}", self.resource, e);
                kind = TerminalKind::Error;
            }
        }

        let clients = std::mem::take(&mut self.clients);
        log::info!(
            "{}: engine {:?}, ending {} clients",
            self.resource,
            kind,
            clients.len()
        );
        for client in clients {
            match kind {
                TerminalKind::Eos => client.finish(),
                TerminalKind::Error => client.fail(),
            }
        }

        self.terminate();
    }

    /// Forced teardown, e.g. on server shutdown. Clients see a failed stream.
    pub fn shutdown(&mut self) {
        if self.is_stopping() {
            return;
        }
        self.state = PipelineState::Draining;
        for client in std::mem::take(&mut self.clients) {
            client.fail();
        }
        self.sink.abandon();
        self.terminate();
    }

    fn broadcast(&mut self, data: Bytes) {
        let resource = &self.resource;
        self.clients.retain(|client| match client.write(data.clone()) {
            Delivery::Queued => true,
            Delivery::Full => {
                log::warn!("{}: client {} cannot keep up, evicting", resource, client.id());
                client.abort();
                false
            }
            Delivery::Closed => {
                log::debug!("{}: client {} went away", resource, client.id());
                false
            }
        });
        self.bytes_out += data.len() as u64;
    }

    fn teardown_if_idle(&mut self) {
        if !self.had_clients || !self.clients.is_empty() || self.is_stopping() {
            return;
        }
        log::info!("{}: no listeners left, tearing down", self.resource);
        self.state = PipelineState::Draining;
        self.sink.abandon();
        self.terminate();
    }

    fn terminate(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.stop();
        }
        self.header.clear();
        self.state = PipelineState::Terminated;
        log::debug!("{}: terminated", self.resource);
    }

    fn is_stopping(&self) -> bool {
        matches!(
            self.state,
            PipelineState::Draining | PipelineState::Terminated
        )
    }
}

enum PipelineCommand {
    Attach {
        client: ClientSender,
        result: oneshot::Sender<Result<()>>,
    },
    Detach {
        id: ClientId,
        reason: DetachReason,
    },
    Shutdown,
}

/// Cheap handle to a pipeline task.
#[derive(Clone)]
pub struct PipelineHandle {
    id: Uuid,
    resource: String,
    content_type: &'static str,
    client_queue: usize,
    tx: mpsc::UnboundedSender<PipelineCommand>,
    status: watch::Receiver<PipelineStatus>,
    terminated: CancellationToken,
}

impl PipelineHandle {
    /// Builds the instance for `profile`, launches its graph and starts the
    /// task driving it.
    pub async fn spawn(
        resource: &str,
        profile: &TranscoderProfile,
        engine: &dyn Engine,
        options: &PipelineOptions,
    ) -> Result<Self> {
        let request = profile.launch_request()?;
        let sink = match profile.destination() {
            Some(path) => OutputSink::file(path).await?,
            None => OutputSink::broadcast(options.flush_threshold),
        };
        let rewriter = profile
            .kind()
            .fake_header()
            .then(|| match options.fake_header_limit {
                Some(limit) => FakeHeaderRewriter::with_limit(limit),
                None => FakeHeaderRewriter::new(),
            });

        let mut instance = PipelineInstance::new(resource, sink, rewriter);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        instance.start(engine, request, event_tx)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(instance.status());
        let terminated = CancellationToken::new();
        tokio::spawn(run(instance, rx, event_rx, status_tx, terminated.clone()));

        Ok(Self {
            id: Uuid::new_v4(),
            resource: resource.to_string(),
            content_type: profile.content_type(),
            client_queue: options.client_queue,
            tx,
            status: status_rx,
            terminated,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    pub fn status(&self) -> PipelineStatus {
        self.status.borrow().clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Resolves once the pipeline reached its terminal state.
    pub async fn terminated(&self) {
        self.terminated.cancelled().await
    }

    /// Attaches a new client and returns its body stream. Dropping the stream
    /// detaches the client.
    ///
    /// The detach hook is armed before the attach command goes out, so a
    /// caller cancelled mid-attach still detaches; commands are handled in
    /// order, hence the detach always follows the attach.
    pub async fn attach(&self) -> Result<ClientStream> {
        let (client, stream) = client::channel(self.client_queue);
        let tx = self.tx.clone();
        let stream = stream.on_detach(move |id, reason| {
            let _ = tx.send(PipelineCommand::Detach { id, reason });
        });

        let (result_tx, result_rx) = oneshot::channel();
        self.tx
            .send(PipelineCommand::Attach {
                client,
                result: result_tx,
            })
            .map_err(|_| TranscodeError::Terminated)?;
        result_rx.await.map_err(|_| TranscodeError::Terminated)??;
        Ok(stream)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(PipelineCommand::Shutdown);
    }
}

async fn run(
    mut instance: PipelineInstance,
    mut commands: mpsc::UnboundedReceiver<PipelineCommand>,
    mut events: EngineEventReceiver,
    status: watch::Sender<PipelineStatus>,
    terminated: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            Some(cmd) = commands.recv() => match cmd {
                PipelineCommand::Attach { client, result } => {
                    let _ = result.send(instance.attach(client));
                }
                PipelineCommand::Detach { id, reason } => instance.detach(id, reason),
                PipelineCommand::Shutdown => instance.shutdown(),
            },
            event = events.recv() => match event {
                Some(EngineEvent::Chunk(chunk)) => instance.on_chunk(chunk).await,
                Some(EngineEvent::Segment) => instance.on_segment(),
                Some(EngineEvent::Eos) => {
                    log::info!("{}: end of stream", instance.resource());
                    instance.on_engine_terminal(TerminalKind::Eos).await;
                }
                Some(EngineEvent::Error(msg)) => {
                    log::error!("{}: {}", instance.resource(), TranscodeError::EngineRuntime(msg));
                    instance.on_engine_terminal(TerminalKind::Error).await;
                }
                None => {
                    log::warn!("{}: engine went away without a terminal event", instance.resource());
                    instance.on_engine_terminal(TerminalKind::Error).await;
                }
            },
        }

        status.send_replace(instance.status());
        if instance.is_terminated() {
            break;
        }
    }
    terminated.cancel();
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
