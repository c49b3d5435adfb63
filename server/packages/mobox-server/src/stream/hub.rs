use std::collections::HashMap;
use std::sync::Arc;

use futures::{future, stream, Stream, StreamExt};
use tokio::sync::{watch, Mutex, RwLock};

use super::frames::OutputFrame;

#[derive(Debug, Default)]
struct Buffered {
    frames: Vec<OutputFrame>,
    closed: bool,
}

/// Subscribers read only from the buffer; `progress` wakes them when it
/// grows or closes, so a slow reader never loses frames.
#[derive(Debug)]
struct LiveStream {
    buffer: Mutex<Buffered>,
    progress: watch::Sender<usize>,
}

enum NextFrame {
    Ready(OutputFrame),
    Pending,
    Closed,
}

impl LiveStream {
    async fn next_frame(&self, position: usize) -> NextFrame {
        let buffer = self.buffer.lock().await;
        match buffer.frames.get(position) {
            Some(frame) => NextFrame::Ready(frame.clone()),
            None if buffer.closed => NextFrame::Closed,
            None => NextFrame::Pending,
        }
    }
}

/// Replay buffers for streams that are still running, keyed by stream id.
#[derive(Debug, Clone, Default)]
pub struct StreamHub {
    streams: Arc<RwLock<HashMap<String, Arc<LiveStream>>>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&self, stream_id: &str) -> StreamPublisher {
        let (progress, _rx) = watch::channel(0);
        let live = Arc::new(LiveStream {
            buffer: Mutex::new(Buffered::default()),
            progress,
        });
        self.streams
            .write()
            .await
            .insert(stream_id.to_string(), live.clone());
        StreamPublisher {
            hub: self.clone(),
            stream_id: stream_id.to_string(),
            live,
        }
    }

    pub async fn is_live(&self, stream_id: &str) -> bool {
        self.streams.read().await.contains_key(stream_id)
    }

    /// Everything published so far followed by live frames, ending after
    /// `done` or when the stream closes. `None` if the stream is not live.
    pub async fn subscribe(
        &self,
        stream_id: &str,
    ) -> Option<impl Stream<Item = OutputFrame> + Send + 'static> {
        let live = self.streams.read().await.get(stream_id).cloned()?;
        let changes = live.progress.subscribe();

        let frames = stream::unfold(
            (live, changes, 0usize),
            |(live, mut changes, position)| async move {
                loop {
                    // Mark the current version seen before looking, so a
                    // publish after the lookup still wakes `changed`.
                    changes.borrow_and_update();
                    match live.next_frame(position).await {
                        NextFrame::Ready(frame) => {
                            return Some((frame, (live, changes, position + 1)))
                        }
                        NextFrame::Closed => return None,
                        NextFrame::Pending => {}
                    }
                    if changes.changed().await.is_err() {
                        return None;
                    }
                }
            },
        )
        .scan(false, |finished, frame| {
            if *finished {
                return future::ready(None);
            }
            *finished = frame.is_done();
            future::ready(Some(frame))
        });
        Some(frames)
    }
}

/// Write side of one live stream. Closing removes it from the hub.
#[derive(Debug)]
pub struct StreamPublisher {
    hub: StreamHub,
    stream_id: String,
    live: Arc<LiveStream>,
}

impl StreamPublisher {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub async fn publish(&self, frame: OutputFrame) {
        let mut buffer = self.live.buffer.lock().await;
        buffer.frames.push(frame);
        self.live.progress.send_replace(buffer.frames.len());
    }

    pub async fn close(self) {
        self.hub.streams.write().await.remove(&self.stream_id);
        let mut buffer = self.live.buffer.lock().await;
        buffer.closed = true;
        self.live.progress.send_modify(|_| {});
        tracing::debug!(stream_id = %self.stream_id, frames = buffer.frames.len(), "closed stream buffer");
    }
}
