//! Control-event delivery
//!
//! Listens for stop/resume events on the server's SSE stream; when the
//! stream cannot be established or drops, falls back to polling the
//! cheap status endpoint. Both paths converge on one boolean: the
//! `stopped` watch channel that the sync controller observes. The
//! controller never knows which path produced the value.

use crate::clock::jittered;
use futures::StreamExt;
use simulcast_common::model::BroadcastStatus;
use simulcast_common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Fallback polling cadence; jittered per request
const POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Pause before retrying the SSE stream after it drops
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

// ============================================================================
// SSE wire parsing
// ============================================================================

/// One parsed frame from an SSE byte stream
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Event { name: Option<String>, data: String },
    Comment(String),
}

/// Incremental SSE parser.
///
/// Fed raw body chunks in whatever sizes the transport delivers them;
/// emits complete frames. Handles CRLF line endings, multi-line data
/// fields, and UTF-8 sequences split across chunk boundaries.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning any frames it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop(); // the \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            // Blank line dispatches the accumulated frame
            if self.event_name.is_none() && self.data_lines.is_empty() {
                return None;
            }
            let frame = SseFrame::Event {
                name: self.event_name.take(),
                data: self.data_lines.join("\n"),
            };
            self.data_lines.clear();
            return Some(frame);
        }
        if let Some(comment) = line.strip_prefix(':') {
            return Some(SseFrame::Comment(comment.trim_start().to_string()));
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            // id and retry are irrelevant here; events are not replayed
            _ => {}
        }
        None
    }
}

// ============================================================================
// Delivery adapter
// ============================================================================

/// Handle to a running delivery task
pub struct DeliveryHandle {
    stopped: watch::Receiver<bool>,
    refresh: Arc<Notify>,
    cancel: CancellationToken,
}

impl DeliveryHandle {
    /// The flag the sync controller watches
    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stopped.clone()
    }

    /// Check for missed state immediately, typically on return from the
    /// background where the stream may have silently died
    pub fn on_foreground(&self) {
        self.refresh.notify_one();
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for DeliveryHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum StreamEnd {
    /// Terminal stop observed; nothing more will ever arrive
    Stopped,
    /// Stream closed or failed; caller decides what to do next
    Disconnected,
}

/// Watches one broadcast's control events on behalf of a viewer
pub struct DeliveryAdapter {
    client: reqwest::Client,
    base_url: String,
    slug: String,
}

impl DeliveryAdapter {
    pub fn new(base_url: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            slug: slug.into(),
        }
    }

    /// Spawn the delivery task and return its handle
    pub fn start(self) -> DeliveryHandle {
        let (tx, rx) = watch::channel(false);
        let refresh = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let task_refresh = Arc::clone(&refresh);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            self.run(tx, task_refresh, task_cancel).await;
        });

        DeliveryHandle {
            stopped: rx,
            refresh,
            cancel,
        }
    }

    async fn run(self, tx: watch::Sender<bool>, refresh: Arc<Notify>, cancel: CancellationToken) {
        loop {
            match self.stream_events(&tx, &cancel).await {
                Ok(StreamEnd::Stopped) => {
                    info!("Broadcast '{}' stopped, delivery finished", self.slug);
                    return;
                }
                Ok(StreamEnd::Disconnected) => {
                    debug!("Event stream for '{}' closed, retrying", self.slug);
                }
                Err(e) => {
                    warn!("Event stream for '{}' unavailable: {}", self.slug, e);
                }
            }
            if cancel.is_cancelled() {
                return;
            }

            // Polling covers the gap until the stream comes back
            if self.poll_until_reconnect(&tx, &refresh, &cancel).await {
                info!("Broadcast '{}' stopped (polled), delivery finished", self.slug);
                return;
            }
            if cancel.is_cancelled() {
                return;
            }
        }
    }

    /// Consume the SSE stream until it ends or delivers a terminal stop
    async fn stream_events(
        &self,
        tx: &watch::Sender<bool>,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd> {
        let url = format!("{}/broadcasts/{}/events", self.base_url, self.slug);
        let response = self
            .client
            .get(&url)
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("event stream connect: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Unavailable(format!("event stream rejected: {e}")))?;

        debug!("Event stream open for '{}'", self.slug);
        let mut body = response.bytes_stream();
        let mut parser = SseParser::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamEnd::Disconnected),
                chunk = body.next() => chunk,
            };
            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    warn!("Event stream read error: {}", e);
                    return Ok(StreamEnd::Disconnected);
                }
                None => return Ok(StreamEnd::Disconnected),
            };

            for frame in parser.push(&chunk) {
                match frame {
                    SseFrame::Event { name, .. } => match name.as_deref() {
                        Some("stopped") => {
                            tx.send_replace(true);
                            return Ok(StreamEnd::Stopped);
                        }
                        Some("resumed") => {
                            tx.send_replace(false);
                        }
                        Some("connected") => debug!("Event stream confirmed for '{}'", self.slug),
                        // Server-directed downgrade to polling
                        Some("fallback") => {
                            info!("Server requested polling fallback for '{}'", self.slug);
                            return Ok(StreamEnd::Disconnected);
                        }
                        other => debug!("Ignoring event {:?}", other),
                    },
                    SseFrame::Comment(_) => trace!("Heartbeat on '{}'", self.slug),
                }
            }
        }
    }

    /// Poll the status endpoint until the broadcast stops (`true`), the
    /// task is cancelled, or a backoff elapses and the stream should be
    /// retried (`false`).
    async fn poll_until_reconnect(
        &self,
        tx: &watch::Sender<bool>,
        refresh: &Notify,
        cancel: &CancellationToken,
    ) -> bool {
        let mut polls = 0u32;
        loop {
            match self.poll_status().await {
                Ok(status) => {
                    tx.send_replace(status.is_stopped());
                    if status.is_stopped() {
                        return true;
                    }
                }
                Err(e) => warn!("Status poll for '{}' failed: {}", self.slug, e),
            }

            polls += 1;
            if polls >= 2 {
                // Give the stream another chance rather than polling forever
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(jittered(RECONNECT_BACKOFF)) => return false,
                    _ = refresh.notified() => {}
                }
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(jittered(POLL_INTERVAL)) => {}
                _ = refresh.notified() => debug!("Foreground refresh, polling now"),
            }
        }
    }

    async fn poll_status(&self) -> Result<BroadcastStatus> {
        let url = format!("{}/broadcasts/{}/status", self.base_url, self.slug);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("status poll: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Unavailable(format!("status poll rejected: {e}")))?;
        response
            .json::<BroadcastStatus>()
            .await
            .map_err(|e| Error::Unavailable(format!("invalid status body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, data: &str) -> SseFrame {
        SseFrame::Event {
            name: Some(name.to_string()),
            data: data.to_string(),
        }
    }

    #[test]
    fn parses_a_complete_named_event() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"event: stopped\ndata: {\"slug\":\"s\"}\n\n");
        assert_eq!(frames, vec![event("stopped", "{\"slug\":\"s\"}")]);
    }

    #[test]
    fn reassembles_events_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: conn").is_empty());
        assert!(parser.push(b"ected\ndata: {}").is_empty());
        let frames = parser.push(b"\n\n");
        assert_eq!(frames, vec![event("connected", "{}")]);
    }

    #[test]
    fn joins_multi_line_data() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"data: first\ndata: second\n\n");
        assert_eq!(
            frames,
            vec![SseFrame::Event {
                name: None,
                data: "first\nsecond".to_string(),
            }]
        );
    }

    #[test]
    fn comments_are_surfaced_separately() {
        let mut parser = SseParser::new();
        let frames = parser.push(b": keep-alive\nevent: resumed\ndata: {}\n\n");
        assert_eq!(
            frames,
            vec![
                SseFrame::Comment("keep-alive".to_string()),
                event("resumed", "{}"),
            ]
        );
    }

    #[test]
    fn handles_crlf_line_endings() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"event: stopped\r\ndata: {}\r\n\r\n");
        assert_eq!(frames, vec![event("stopped", "{}")]);
    }

    #[test]
    fn ignores_unknown_fields_and_stray_blank_lines() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"\n\nid: 7\nretry: 1000\n").is_empty());
        let frames = parser.push(b"event: stopped\ndata: {}\n\n");
        assert_eq!(frames, vec![event("stopped", "{}")]);
    }

    #[test]
    fn utf8_split_across_chunks_survives() {
        let mut parser = SseParser::new();
        let bytes = "data: caf\u{e9}\n\n".as_bytes();
        // Split inside the two-byte e-acute sequence
        let split = bytes.len() - 3;
        assert!(parser.push(&bytes[..split]).is_empty());
        let frames = parser.push(&bytes[split..]);
        assert_eq!(
            frames,
            vec![SseFrame::Event {
                name: None,
                data: "caf\u{e9}".to_string(),
            }]
        );
    }

    #[test]
    fn successive_events_on_one_connection() {
        let mut parser = SseParser::new();
        let frames =
            parser.push(b"event: connected\ndata: {}\n\nevent: resumed\ndata: {}\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], event("connected", "{}"));
        assert_eq!(frames[1], event("resumed", "{}"));
    }
}
