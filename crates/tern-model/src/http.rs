// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Shared HTTP plumbing for provider adapters: a pooled client, SSE frame
//! assembly, and transient-failure retry.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Per-request timeout for provider HTTP calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Base delay for in-adapter network retries.
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// Maximum attempts for one logical provider request.
const MAX_ATTEMPTS: u32 = 3;

/// Shared connection-pooled client.
pub fn client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static config")
    })
}

/// One server-sent event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// The `event:` field, when present.
    pub event: Option<String>,
    /// Concatenated `data:` lines of the frame.
    pub data: String,
}

/// Incremental SSE parser over a raw byte stream.
///
/// TCP chunking does not respect event boundaries: a single frame can be
/// split across reads, and one read can carry several frames.  The reader
/// carries a remainder buffer forward and only surfaces frames once their
/// terminating blank line has arrived.  Bytes are decoded lossily, so
/// malformed UTF-8 degrades to U+FFFD instead of failing the stream.
pub struct SseReader<S> {
    stream: S,
    buf: String,
    eof: bool,
}

impl<S> SseReader<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: String::new(),
            eof: false,
        }
    }

    /// Next complete frame, or `None` at end of stream.
    pub async fn next_frame(&mut self) -> Option<Result<SseFrame>> {
        loop {
            if let Some(frame) = self.take_frame() {
                return Some(Ok(frame));
            }
            if self.eof {
                // Some servers omit the final blank line; flush what is left.
                return self.take_trailing_frame().map(Ok);
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    self.buf.push_str(&String::from_utf8_lossy(&chunk));
                }
                Some(Err(e)) => return Some(Err(anyhow!(e).context("reading SSE stream"))),
                None => self.eof = true,
            }
        }
    }

    /// Next frame's `data` payload, skipping keep-alive frames.
    pub async fn next_data(&mut self) -> Option<Result<String>> {
        loop {
            match self.next_frame().await? {
                Ok(frame) if frame.data.is_empty() => continue,
                Ok(frame) => return Some(Ok(frame.data)),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Extract one complete frame (terminated by a blank line) from the
    /// buffer, if present.  Both LF and CRLF framing are accepted.
    fn take_frame(&mut self) -> Option<SseFrame> {
        let lf = self.buf.find("\n\n");
        let crlf = self.buf.find("\r\n\r\n");
        let (end, sep_len) = match (lf, crlf) {
            (Some(l), Some(c)) if c < l => (c, 4),
            (Some(l), _) => (l, 2),
            (None, Some(c)) => (c, 4),
            (None, None) => return None,
        };
        let raw: String = self.buf.drain(..end + sep_len).collect();
        Some(parse_frame(&raw))
    }

    fn take_trailing_frame(&mut self) -> Option<SseFrame> {
        if self.buf.trim().is_empty() {
            self.buf.clear();
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        let frame = parse_frame(&raw);
        if frame.data.is_empty() && frame.event.is_none() {
            None
        } else {
            Some(frame)
        }
    }
}

fn parse_frame(raw: &str) -> SseFrame {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // Comment lines (":") and unknown fields are ignored.
    }
    SseFrame {
        event,
        data: data_lines.join("\n"),
    }
}

/// Whether an HTTP status warrants an in-adapter retry.
pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

/// Send a request, retrying 429/5xx responses and connection failures with
/// exponential backoff (base 1 s).  `max_retry_delay_ms` caps a single
/// sleep; a fired `cancel` token aborts the wait immediately.
///
/// Returns the first non-retryable response (success or client error) or the
/// last error once attempts are exhausted.
pub async fn send_with_retry(
    build_request: impl Fn() -> reqwest::RequestBuilder,
    max_retry_delay_ms: Option<u64>,
    cancel: Option<&CancellationToken>,
) -> Result<reqwest::Response> {
    let mut last_error: Option<anyhow::Error> = None;

    for attempt in 1..=MAX_ATTEMPTS {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(anyhow!("request aborted"));
            }
        }

        match build_request().send().await {
            Ok(resp) if !is_retryable_status(resp.status()) => return Ok(resp),
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                last_error = Some(anyhow!("provider returned {status}: {body}"));
            }
            Err(e) => {
                last_error = Some(anyhow!(e).context("provider request failed"));
            }
        }

        if attempt < MAX_ATTEMPTS {
            let mut delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempt - 1);
            if let Some(cap) = max_retry_delay_ms {
                delay = delay.min(cap);
            }
            warn!(attempt, delay_ms = delay, "retrying provider request");
            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(anyhow!("request aborted")),
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    }
                }
                None => tokio::time::sleep(Duration::from_millis(delay)).await,
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("provider request failed")))
}

/// Read an error response body into a displayable string.
pub async fn error_body(resp: reqwest::Response) -> String {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    format!("{status}: {body}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
