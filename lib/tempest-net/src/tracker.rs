// Copyright 2026 - developers of the `tempest` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use tokio::sync::oneshot;
use tokio::time::Instant;

use tempest_proto::{Message, MessageId};

use crate::errors::InvocationError;

type Completer = oneshot::Sender<Result<Box<dyn Message>, InvocationError>>;

struct PendingResponse {
    completer: Completer,
    deadline: Option<Instant>,
}

/// Correlates outbound messages awaiting a response with the inbound
/// responses that answer them, enforcing per-message deadlines.
///
/// Owned by the connection driver; everything here is synchronous and
/// runs on its task.
#[derive(Default)]
pub struct ResponseTracker {
    pending: HashMap<u32, PendingResponse>,
}

impl ResponseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an outbound message as awaiting a response.
    pub fn register(&mut self, id: MessageId, completer: Completer, timeout: Option<Duration>) {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        self.pending.insert(
            id.0,
            PendingResponse {
                completer,
                deadline,
            },
        );
    }

    /// Completes a pending entry as cancelled because the send itself
    /// failed.
    pub fn fail_send(&mut self, id: MessageId) {
        if let Some(entry) = self.pending.remove(&id.0) {
            drop(entry.completer.send(Err(InvocationError::Dropped)));
        }
    }

    /// Delivers an inbound response to whoever is waiting on it.
    /// Responses nobody asked for are dropped.
    pub fn receive(&mut self, response_to: MessageId, message: Box<dyn Message>) {
        match self.pending.remove(&response_to.0) {
            Some(entry) => drop(entry.completer.send(Ok(message))),
            None => debug!("got a response to {:?} but no request is waiting", response_to),
        }
    }

    /// Cancels every entry whose deadline has elapsed. Called from the
    /// connection's periodic sweep.
    pub fn check_timeouts(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(&id, _)| id)
            .collect();

        for id in expired {
            debug!("response {:?} timed out", MessageId(id));
            if let Some(entry) = self.pending.remove(&id) {
                drop(entry.completer.send(Err(InvocationError::Dropped)));
            }
        }
    }

    /// Cancels everything; used at teardown so every waiter observes a
    /// single cancelled outcome.
    pub fn clear(&mut self) {
        for (_, entry) in self.pending.drain() {
            drop(entry.completer.send(Err(InvocationError::Dropped)));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
