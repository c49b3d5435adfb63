use std::sync::Arc;
use std::time::{Duration, Instant};

use mobox_agent_events::{Adapter, EventParser, Framework, NormalizedEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::accumulator::Accumulator;
use super::formatter::Formatter;
use super::frames::OutputFrame;
use super::hub::{StreamHub, StreamPublisher};
use super::registry::StreamRegistry;
use crate::persistence::{ChatStore, PersistedTurn};
use crate::sandbox::{ProcessControl, SandboxProcess};

const CLIENT_CHANNEL_SIZE: usize = 256;
const EXIT_GRACE: Duration = Duration::from_secs(5);
const PREVIEW_BYTES: usize = 200;

/// Identifies one agent turn being streamed.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub session_id: String,
    pub stream_id: String,
    pub message_id: String,
    pub framework: Framework,
}

#[derive(Debug, Clone)]
pub struct BridgeReport {
    pub turn: PersistedTurn,
    pub frames_sent: usize,
    pub lines_skipped: u64,
    pub resumable: bool,
}

/// Sends every frame to the connected client and, when resumable, to the
/// replay buffer. A vanished client never stops the stream.
struct FrameSink {
    client: Option<mpsc::Sender<OutputFrame>>,
    publisher: Option<StreamPublisher>,
    sent: usize,
}

impl FrameSink {
    async fn send_all(&mut self, frames: Vec<OutputFrame>) {
        for frame in frames {
            self.send(frame).await;
        }
    }

    async fn send(&mut self, frame: OutputFrame) {
        self.sent += 1;
        if let Some(publisher) = &self.publisher {
            publisher.publish(frame.clone()).await;
        }
        let done = frame.is_done();
        if let Some(client) = &self.client {
            if client.send(frame).await.is_err() {
                tracing::info!("client disconnected, agent keeps running");
                self.client = None;
            }
        }
        if done {
            // Lets the client response end without waiting for teardown.
            self.client = None;
        }
    }
}

#[derive(Clone)]
pub struct StreamBridge {
    hub: StreamHub,
    registry: Option<StreamRegistry>,
    store: Option<Arc<dyn ChatStore>>,
}

impl std::fmt::Debug for StreamBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBridge")
            .field("resumable", &self.registry.is_some())
            .field("persisting", &self.store.is_some())
            .finish()
    }
}

impl StreamBridge {
    pub fn new(
        hub: StreamHub,
        registry: Option<StreamRegistry>,
        store: Option<Arc<dyn ChatStore>>,
    ) -> Self {
        Self {
            hub,
            registry,
            store,
        }
    }

    pub fn hub(&self) -> &StreamHub {
        &self.hub
    }

    pub fn registry(&self) -> Option<&StreamRegistry> {
        self.registry.as_ref()
    }

    /// Registers the stream, then drives `process` on a background task.
    /// Returns the client side of the frame channel. The task outlives the
    /// client if it disconnects.
    pub async fn start(
        &self,
        request: StreamRequest,
        process: SandboxProcess,
    ) -> (mpsc::Receiver<OutputFrame>, JoinHandle<BridgeReport>) {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_SIZE);
        let publisher = self.register(&request).await;
        let bridge = self.clone();
        let handle = tokio::spawn(async move {
            bridge
                .run_registered(request, process, Some(tx), publisher)
                .await
        });
        (rx, handle)
    }

    /// Runs one stream to completion on the current task.
    pub async fn run(
        &self,
        request: StreamRequest,
        process: SandboxProcess,
        client: Option<mpsc::Sender<OutputFrame>>,
    ) -> BridgeReport {
        let publisher = self.register(&request).await;
        self.run_registered(request, process, client, publisher)
            .await
    }

    async fn run_registered(
        &self,
        request: StreamRequest,
        process: SandboxProcess,
        client: Option<mpsc::Sender<OutputFrame>>,
        publisher: Option<StreamPublisher>,
    ) -> BridgeReport {
        let resumable = publisher.is_some();
        let mut sink = FrameSink {
            client,
            publisher,
            sent: 0,
        };

        let started_at = Instant::now();
        let (turn, lines_skipped) = drive(&request, process, &mut sink).await;
        tracing::info!(
            session_id = %request.session_id,
            stream_id = %request.stream_id,
            frames = sink.sent,
            lines_skipped,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "stream finished"
        );

        if let Some(store) = &self.store {
            if let Err(err) = store.save_turn(&request.session_id, turn.clone()).await {
                tracing::error!(session_id = %request.session_id, error = %err, "failed to persist turn");
            }
        }

        if resumable {
            if let Some(registry) = &self.registry {
                if let Err(err) = registry
                    .clear_if_current(&request.session_id, &request.stream_id)
                    .await
                {
                    tracing::warn!(session_id = %request.session_id, error = %err, "failed to clear stream entry");
                }
            }
        }
        if let Some(publisher) = sink.publisher.take() {
            publisher.close().await;
        }

        BridgeReport {
            turn,
            frames_sent: sink.sent,
            lines_skipped,
            resumable,
        }
    }

    /// Opens the replay buffer and registers it. Any registry failure
    /// disables resumption for this stream only.
    async fn register(&self, request: &StreamRequest) -> Option<StreamPublisher> {
        let registry = self.registry.as_ref()?;
        let publisher = self.hub.open(&request.stream_id).await;
        match registry
            .register(&request.session_id, &request.stream_id)
            .await
        {
            Ok(()) => Some(publisher),
            Err(err) => {
                tracing::warn!(
                    session_id = %request.session_id,
                    error = %err,
                    "stream registry unavailable, resumption disabled"
                );
                publisher.close().await;
                None
            }
        }
    }
}

fn preview(line: &str) -> String {
    if line.len() <= PREVIEW_BYTES {
        return line.to_string();
    }
    let mut cut = PREVIEW_BYTES;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &line[..cut])
}

/// Reads agent stdout line by line through parser, accumulator and formatter.
async fn drive(
    request: &StreamRequest,
    process: SandboxProcess,
    sink: &mut FrameSink,
) -> (PersistedTurn, u64) {
    let SandboxProcess {
        stdout,
        mut control,
    } = process;
    let mut parser = EventParser::new(Adapter::for_framework(request.framework));
    let mut formatter = Formatter::new(request.message_id.clone());
    let mut accumulator = Accumulator::new();
    sink.send_all(formatter.begin()).await;

    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut line_number: u64 = 0;
    let mut skipped: u64 = 0;
    let mut terminal = false;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, line_number, "agent stdout read failed");
                break;
            }
        }
        line_number += 1;
        let line = String::from_utf8_lossy(&buf);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let event = match parser.parse_line(trimmed) {
            Ok(event) => event,
            Err(err) => {
                skipped += 1;
                tracing::warn!(
                    error = %err,
                    line_number,
                    raw = %preview(trimmed),
                    "agent stdout: skipping malformed line"
                );
                continue;
            }
        };

        accumulator.observe(&event);
        sink.send_all(formatter.format(&event)).await;
        if event.kind().is_terminal() {
            terminal = true;
            break;
        }
    }

    if terminal {
        // After an error frame only finish/done remain.
        sink.send_all(formatter.finish()).await;
        stop_after_terminal(&mut control).await;
    } else {
        let message = match control.wait(EXIT_GRACE).await {
            Some(report) => report
                .failure_message()
                .unwrap_or_else(|| "Agent stream ended unexpectedly".to_string()),
            None => {
                // stdout closed but the agent is still running.
                control.terminate();
                "Agent stream ended unexpectedly".to_string()
            }
        };
        tracing::warn!(
            session_id = %request.session_id,
            line_number,
            message = %message,
            "agent output ended without a terminal event"
        );
        let error = NormalizedEvent::error(message);
        accumulator.observe(&error);
        sink.send_all(formatter.format(&error)).await;
        sink.send_all(formatter.finish()).await;
    }

    let mut turn = PersistedTurn::from_snapshot(accumulator.into_snapshot());
    if turn.sdk_session_id.is_none() {
        turn.sdk_session_id = parser.sdk_session_id().map(str::to_string);
    }
    (turn, skipped)
}

/// Gives the agent a moment to exit on its own, then stops it.
async fn stop_after_terminal(control: &mut ProcessControl) {
    match control.wait(EXIT_GRACE).await {
        Some(report) => {
            tracing::debug!(code = ?report.code, reason = ?report.reason, "agent exited after terminal event")
        }
        None => control.terminate(),
    }
}
