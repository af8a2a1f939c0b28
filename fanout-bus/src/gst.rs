//! Engine running each graph in a `gst-launch-1.0` child process.
//!
//! The materialized topology is extended with `<output>. ! fdsink fd=1` so
//! the produced stream arrives on the child's stdout.

use std::{
    collections::VecDeque,
    process::{ExitStatus, Stdio},
};

use futures::StreamExt;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};

use crate::{
    engine::{Engine, EngineEvent, EngineEventSender, EngineHandle, LaunchRequest},
    error::{Result, TranscodeError},
    header::{HeaderProbe, HeaderSplitter},
};

pub const DEFAULT_GST_LAUNCH: &str = "gst-launch-1.0";

const READ_SIZE: usize = 64 * 1024;
const STDERR_TAIL_LINES: usize = 8;

pub struct GstLaunchEngine {
    program: String,
}

impl GstLaunchEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments passed to the launcher for one request.
    pub fn arguments(request: &LaunchRequest) -> Vec<String> {
        let mut args = vec!["-q".to_string()];
        args.extend(request.description.split_whitespace().map(str::to_string));
        args.push(format!("{}.", request.output));
        args.extend(["!", "fdsink", "fd=1"].map(str::to_string));
        args
    }
}

impl Default for GstLaunchEngine {
    fn default() -> Self {
        Self::new(DEFAULT_GST_LAUNCH)
    }
}

impl Engine for GstLaunchEngine {
    fn launch(
        &self,
        request: LaunchRequest,
        events: EngineEventSender,
    ) -> Result<Box<dyn EngineHandle>> {
        let args = Self::arguments(&request);
        log::debug!("gst: {} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranscodeError::build(format!("spawn {}: {}", self.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TranscodeError::build("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscodeError::build("child stderr not captured"))?;

        let cancel = CancellationToken::new();
        tokio::spawn(drive(
            child,
            stdout,
            stderr,
            request.header,
            events,
            cancel.clone(),
        ));

        Ok(Box::new(GstHandle { cancel }))
    }
}

struct GstHandle {
    cancel: CancellationToken,
}

impl EngineHandle for GstHandle {
    fn stop(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for GstHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Sends unless the graph was torn down in the meantime.
async fn emit(events: &EngineEventSender, cancel: &CancellationToken, event: EngineEvent) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        result = events.send(event) => result.is_ok(),
    }
}

async fn drive(
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    probe: HeaderProbe,
    events: EngineEventSender,
    cancel: CancellationToken,
) {
    let stderr_task = tokio::spawn(collect_stderr(stderr));
    let mut reader = ReaderStream::with_capacity(stdout, READ_SIZE);
    let mut splitter = HeaderSplitter::new(probe);
    let mut started = false;
    let mut read_error = None;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("gst: graph stopped, killing child");
                let _ = child.kill().await;
                stderr_task.abort();
                return;
            }
            next = reader.next() => next,
        };

        match next {
            Some(Ok(data)) => {
                if !started {
                    started = true;
                    if !emit(&events, &cancel, EngineEvent::Segment).await {
                        let _ = child.kill().await;
                        return;
                    }
                }
                for chunk in splitter.push(data) {
                    if !emit(&events, &cancel, EngineEvent::Chunk(chunk)).await {
                        let _ = child.kill().await;
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                read_error = Some(format!("reading output: {}", e));
                break;
            }
            None => break,
        }
    }

    if let Some(rest) = splitter.finish() {
        if !emit(&events, &cancel, EngineEvent::Chunk(rest)).await {
            let _ = child.kill().await;
            return;
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return;
        }
        status = child.wait() => status,
    };
    let stderr_tail = stderr_task.await.unwrap_or_default();

    let terminal = match (read_error, status) {
        (Some(msg), _) => EngineEvent::Error(msg),
        (None, Ok(status)) if status.success() => EngineEvent::Eos,
        (None, Ok(status)) => EngineEvent::Error(describe_exit(status, &stderr_tail)),
        (None, Err(e)) => EngineEvent::Error(format!("waiting for child: {}", e)),
    };
    if let EngineEvent::Error(msg) = &terminal {
        log::warn!("gst: {}", msg);
    }
    emit(&events, &cancel, terminal).await;
}

fn describe_exit(status: ExitStatus, stderr_tail: &VecDeque<String>) -> String {
    if stderr_tail.is_empty() {
        format!("launcher exited with {}", status)
    } else {
        let tail: Vec<&str> = stderr_tail.iter().map(String::as_str).collect();
        format!("launcher exited with {}: {}", status, tail.join(" | "))
    }
}

/// Logs every stderr line and keeps the last few for the error report.
async fn collect_stderr(stderr: ChildStderr) -> VecDeque<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        log::debug!("gst: {}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail
}

#[cfg(test)]
#[path = "gst_test.rs"]
mod gst_test;
