// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Steering and follow-up queues.
//!
//! Callers enqueue at any time; the agent polls only at its defined safe
//! points (before the first turn, after each tool call, at the end of a
//! tool-call turn for steering; on a tool-free turn end for follow-up).

use std::collections::VecDeque;
use std::sync::Mutex;

use tern_model::Message;

/// How much of the queue one poll hands over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Each poll returns at most one message; the rest stay queued.
    #[default]
    OneAtATime,
    /// Each poll drains the whole queue atomically.
    All,
}

#[derive(Debug, Default)]
pub struct MessageQueue {
    mode: QueueMode,
    items: Mutex<VecDeque<Message>>,
}

impl MessageQueue {
    pub fn new(mode: QueueMode) -> Self {
        Self { mode, items: Mutex::new(VecDeque::new()) }
    }

    pub fn push(&self, message: Message) {
        self.items.lock().unwrap().push_back(message);
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    /// Take the next batch according to the queue mode.
    pub fn poll(&self) -> Vec<Message> {
        let mut items = self.items.lock().unwrap();
        match self.mode {
            QueueMode::OneAtATime => items.pop_front().into_iter().collect(),
            QueueMode::All => items.drain(..).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_at_a_time_returns_single_message_per_poll() {
        let queue = MessageQueue::new(QueueMode::OneAtATime);
        queue.push(Message::user("a"));
        queue.push(Message::user("b"));
        assert_eq!(queue.poll().len(), 1);
        assert!(!queue.is_empty());
        assert_eq!(queue.poll().len(), 1);
        assert!(queue.poll().is_empty());
    }

    #[test]
    fn all_mode_drains_atomically() {
        let queue = MessageQueue::new(QueueMode::All);
        queue.push(Message::user("a"));
        queue.push(Message::user("b"));
        assert_eq!(queue.poll().len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn poll_on_empty_queue_returns_nothing() {
        let queue = MessageQueue::new(QueueMode::All);
        assert!(queue.poll().is_empty());
    }
}
