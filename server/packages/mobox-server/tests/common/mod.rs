#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use mobox_agent_events::Framework;
use mobox_server::sandbox::{ExitReport, LaunchRequest, ProcessControl, SandboxProcess};
use mobox_server::stream::{OutputFrame, StreamRequest};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};

pub fn status_line(message: &str) -> String {
    serde_json::json!({"type": "status", "data": {"message": message}}).to_string()
}

pub fn text_line(content: &str) -> String {
    serde_json::json!({"type": "text", "data": {"content": content}}).to_string()
}

pub fn done_line() -> String {
    r#"{"type":"done","data":{}}"#.to_string()
}

pub fn stream_request(session_id: &str, stream_id: &str) -> StreamRequest {
    StreamRequest {
        session_id: session_id.to_string(),
        stream_id: stream_id.to_string(),
        message_id: format!("msg_{stream_id}"),
        framework: Framework::DeepAgents,
    }
}

pub fn launch_request(session_id: &str) -> LaunchRequest {
    LaunchRequest {
        session_id: session_id.to_string(),
        agent_id: "test-agent".to_string(),
        agent_dir: PathBuf::from("."),
        command: vec!["agent".to_string()],
        prompt: "hello".to_string(),
        history: None,
        env: HashMap::new(),
        timeout: Duration::from_secs(60),
        idle_timeout: Duration::from_secs(60),
    }
}

/// An agent whose stdout the test writes by hand. The exit report is ready
/// up front so teardown never waits.
pub struct PipedAgent {
    stdout: DuplexStream,
}

impl PipedAgent {
    pub fn spawn() -> (SandboxProcess, PipedAgent) {
        let (reader, writer) = tokio::io::duplex(64 * 1024);
        let (kill_tx, _kill_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = oneshot::channel();
        let _ = exit_tx.send(ExitReport::success());
        let process = SandboxProcess {
            stdout: Box::pin(reader),
            control: ProcessControl::new(kill_tx, exit_rx),
        };
        (process, PipedAgent { stdout: writer })
    }

    pub async fn emit(&mut self, line: &str) {
        self.stdout
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write agent line");
    }
}

pub async fn recv_frames(rx: &mut mpsc::Receiver<OutputFrame>, count: usize) -> Vec<OutputFrame> {
    let mut frames = Vec::with_capacity(count);
    while frames.len() < count {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame within timeout")
            .expect("stream still open");
        frames.push(frame);
    }
    frames
}

pub async fn drain(mut rx: mpsc::Receiver<OutputFrame>) -> Vec<OutputFrame> {
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    frames
}

pub fn frame_types(frames: &[OutputFrame]) -> Vec<&'static str> {
    frames.iter().map(OutputFrame::frame_type).collect()
}
