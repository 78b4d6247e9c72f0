// Copyright (c) 2024-2026 Tern Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Generic push/pull event stream with an awaitable final result.
//!
//! A producer task pushes typed events; a single consumer pulls them with
//! [`EventStream::next`].  A terminal event (per the stream's `is_terminal`
//! predicate) resolves the final result and closes the stream; the consumer
//! still observes the terminal event as the last item.  The stream itself
//! never fails — producers that hit an error must push a terminal
//! error-typed event and then call [`EventStream::end`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::types::{AssistantMessage, AssistantMessageEvent};

enum Item<T> {
    Event(T),
    End,
}

struct Shared<T, R> {
    tx: mpsc::UnboundedSender<Item<T>>,
    rx: tokio::sync::Mutex<Receiver<T>>,
    done: AtomicBool,
    result: Mutex<Option<R>>,
    result_ready: Notify,
    is_terminal: Box<dyn Fn(&T) -> bool + Send + Sync>,
    extract_result: Box<dyn Fn(&T) -> R + Send + Sync>,
}

struct Receiver<T> {
    rx: mpsc::UnboundedReceiver<Item<T>>,
    finished: bool,
}

/// Cloneable handle shared by the producer and the (single) consumer.
pub struct EventStream<T, R> {
    shared: Arc<Shared<T, R>>,
}

impl<T, R> Clone for EventStream<T, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, R: Clone> EventStream<T, R> {
    pub fn new(
        is_terminal: impl Fn(&T) -> bool + Send + Sync + 'static,
        extract_result: impl Fn(&T) -> R + Send + Sync + 'static,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                tx,
                rx: tokio::sync::Mutex::new(Receiver {
                    rx,
                    finished: false,
                }),
                done: AtomicBool::new(false),
                result: Mutex::new(None),
                result_ready: Notify::new(),
                is_terminal: Box::new(is_terminal),
                extract_result: Box::new(extract_result),
            }),
        }
    }

    /// Enqueue an event.  No-op once the stream is terminated.  A terminal
    /// event resolves the final result and closes the stream, but is still
    /// enqueued so the consumer observes it.
    pub fn push(&self, event: T) {
        let s = &self.shared;
        if s.done.load(Ordering::SeqCst) {
            return;
        }
        let terminal = (s.is_terminal)(&event);
        if terminal {
            let result = (s.extract_result)(&event);
            s.done.store(true, Ordering::SeqCst);
            self.set_result(result);
        }
        let _ = s.tx.send(Item::Event(event));
        if terminal {
            let _ = s.tx.send(Item::End);
        }
    }

    /// Forcibly terminate the stream.  When no terminal event resolved the
    /// result yet, `result` (if given) resolves it.
    pub fn end(&self, result: Option<R>) {
        let s = &self.shared;
        let was_done = s.done.swap(true, Ordering::SeqCst);
        if let Some(r) = result {
            self.set_result(r);
        }
        if !was_done {
            let _ = s.tx.send(Item::End);
        }
    }

    fn set_result(&self, result: R) {
        let mut slot = self.shared.result.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(result);
            self.shared.result_ready.notify_waiters();
            // A waiter that registers after the store still wakes immediately.
            self.shared.result_ready.notify_one();
        }
    }

    /// Pull the next event.  Returns `None` once the stream has delivered its
    /// last event.  Single consumer; concurrent callers contend on an
    /// internal lock and the interleaving is unspecified.
    pub async fn next(&self) -> Option<T> {
        let mut rx = self.shared.rx.lock().await;
        if rx.finished {
            return None;
        }
        match rx.rx.recv().await {
            Some(Item::Event(e)) => Some(e),
            Some(Item::End) | None => {
                rx.finished = true;
                None
            }
        }
    }

    /// Drain all remaining events into a vector (consumes through the
    /// terminal event).
    pub async fn collect(&self) -> Vec<T> {
        let mut events = Vec::new();
        while let Some(e) = self.next().await {
            events.push(e);
        }
        events
    }

    /// Await the final result.  Resolves exactly once logically; later calls
    /// observe the same value.
    pub async fn result(&self) -> R {
        loop {
            {
                let slot = self.shared.result.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(r) = slot.as_ref() {
                    return r.clone();
                }
            }
            self.shared.result_ready.notified().await;
        }
    }

    /// True once a terminal event or `end` closed the stream.
    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::SeqCst)
    }
}

/// Event stream specialised to assistant-message streaming: terminal events
/// are `done` and `error`, and the final result is the finished (or
/// error-annotated) [`AssistantMessage`].
pub type AssistantMessageEventStream = EventStream<AssistantMessageEvent, AssistantMessage>;

/// Build an [`AssistantMessageEventStream`] with the standard terminal
/// predicate and result extraction.
pub fn assistant_message_event_stream() -> AssistantMessageEventStream {
    EventStream::new(AssistantMessageEvent::is_terminal, |event| {
        event
            .final_message()
            .cloned()
            .unwrap_or_else(|| AssistantMessage {
                content: Vec::new(),
                api: String::new(),
                provider: String::new(),
                model: String::new(),
                usage: Default::default(),
                stop_reason: crate::types::StopReason::Error,
                error_message: Some("stream ended without a terminal event".into()),
                timestamp: crate::types::now_ms(),
            })
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
