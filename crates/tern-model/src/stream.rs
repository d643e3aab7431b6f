// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ordered event queue with a one-shot terminal value.
//!
//! Both providers and the agent loop deliver their output through this
//! primitive: the producer pushes events in order, then ends the stream with
//! a terminal value (the finalized assistant message, or the run's full
//! message list). The consumer iterates events with [`EventStream::next`] and
//! may await [`EventStream::result`] at any point — before, during, or after
//! the stream ends.
//!
//! Contract: the terminal value becomes visible to `result()` *before* the
//! closing sentinel is observable to `next()`, so `push(done); end(msg)` can
//! never race a consumer into seeing the end of iteration without a result.
//! Errors are ordinary events; no failure is delivered through the iterator
//! itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream finished without a result")]
    NoResult,
}

#[derive(Debug, Clone)]
enum ResultState<R> {
    Pending,
    Set(R),
    /// The stream ended without a terminal value.
    Closed,
}

struct Shared<E, R> {
    events: mpsc::UnboundedSender<Option<E>>,
    result: watch::Sender<ResultState<R>>,
    done: AtomicBool,
}

/// Producer half. Cheap to clone; all methods take `&self`.
pub struct EventSender<E, R> {
    shared: Arc<Shared<E, R>>,
}

impl<E, R> Clone for EventSender<E, R> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<E, R> EventSender<E, R> {
    /// Enqueue an event. Silently ignored once the stream has ended.
    pub fn push(&self, event: E) {
        if self.shared.done.load(Ordering::Acquire) {
            return;
        }
        let _ = self.shared.events.send(Some(event));
    }

    /// Set the terminal value (first call wins) and close the stream.
    ///
    /// The result is published before the closing sentinel is enqueued.
    pub fn end(&self, result: Option<R>) {
        self.shared.result.send_if_modified(|state| {
            if matches!(state, ResultState::Pending) {
                *state = match result {
                    Some(r) => ResultState::Set(r),
                    None => ResultState::Closed,
                };
                true
            } else {
                false
            }
        });
        if !self.shared.done.swap(true, Ordering::AcqRel) {
            let _ = self.shared.events.send(None);
        }
    }
}

/// Consumer half: FIFO event iteration plus the awaitable terminal value.
pub struct EventStream<E, R> {
    events: mpsc::UnboundedReceiver<Option<E>>,
    result: watch::Receiver<ResultState<R>>,
    closed: bool,
}

impl<E, R: Clone> EventStream<E, R> {
    /// Next event in order, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<E> {
        if self.closed {
            return None;
        }
        match self.events.recv().await {
            Some(Some(event)) => Some(event),
            // Sentinel, or every sender dropped without calling end().
            Some(None) | None => {
                self.closed = true;
                None
            }
        }
    }

    /// Await the terminal value. Fails if the stream ended (or the producer
    /// disappeared) without setting one.
    pub async fn result(&mut self) -> Result<R, StreamError> {
        let state = self
            .result
            .wait_for(|s| !matches!(s, ResultState::Pending))
            .await
            .map_err(|_| StreamError::NoResult)?;
        match &*state {
            ResultState::Set(r) => Ok(r.clone()),
            _ => Err(StreamError::NoResult),
        }
    }

    /// Drain all remaining events, then return the terminal value.
    pub async fn collect(mut self) -> (Vec<E>, Result<R, StreamError>) {
        let mut events = Vec::new();
        while let Some(e) = self.next().await {
            events.push(e);
        }
        let result = self.result().await;
        (events, result)
    }
}

impl<E, R> std::fmt::Debug for EventSender<E, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender")
            .field("done", &self.shared.done.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<E, R> std::fmt::Debug for EventStream<E, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").field("closed", &self.closed).finish_non_exhaustive()
    }
}

/// Create a connected sender/stream pair.
pub fn event_stream<E, R>() -> (EventSender<E, R>, EventStream<E, R>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (result_tx, result_rx) = watch::channel(ResultState::Pending);
    let sender = EventSender {
        shared: Arc::new(Shared { events: events_tx, result: result_tx, done: AtomicBool::new(false) }),
    };
    let stream = EventStream { events: events_rx, result: result_rx, closed: false };
    (sender, stream)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
