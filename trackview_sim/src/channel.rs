//! In-memory duplex channel with fault injection.

use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use trackview_env::{DuplexChannel, EnvError, ReadyState};

/// Simulated socket. Frames the client sends are collected for the
/// scenario to inspect; inbound frames are delivered by the runner.
pub struct SimChannel {
    inner: Mutex<ChannelState>,
}

struct ChannelState {
    ready: ReadyState,

    /// Readiness polls left before a connecting channel opens
    connect_polls: Option<u32>,

    /// Sends left to fail before delivery works again
    failing_sends: u32,

    sent: Vec<String>,
    close_calls: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimChannel {
    pub fn new(ready: ReadyState) -> Self {
        Self {
            inner: Mutex::new(ChannelState {
                ready,
                connect_polls: None,
                failing_sends: 0,
                sent: Vec::new(),
                close_calls: 0,
            }),
        }
    }

    /// A channel that finishes its handshake after `polls` readiness checks.
    pub fn connecting(polls: u32) -> Self {
        let channel = Self::new(ReadyState::Connecting);
        lock(&channel.inner).connect_polls = Some(polls);
        channel
    }

    pub fn set_ready_state(&self, ready: ReadyState) {
        lock(&self.inner).ready = ready;
    }

    /// Makes the next `count` sends fail.
    pub fn fail_sends(&self, count: u32) {
        lock(&self.inner).failing_sends = count;
    }

    /// Frames sent so far.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.inner).sent.clone()
    }

    /// Takes the frames sent since the last drain.
    pub fn drain_sent(&self) -> Vec<String> {
        std::mem::take(&mut lock(&self.inner).sent)
    }

    pub fn close_calls(&self) -> u64 {
        lock(&self.inner).close_calls
    }
}

#[async_trait]
impl DuplexChannel for SimChannel {
    fn ready_state(&self) -> ReadyState {
        let mut state = lock(&self.inner);
        if state.ready == ReadyState::Connecting {
            match state.connect_polls {
                Some(0) => {
                    state.ready = ReadyState::Open;
                    state.connect_polls = None;
                }
                Some(n) => state.connect_polls = Some(n - 1),
                None => {}
            }
        }
        state.ready
    }

    async fn send_text(&self, text: String) -> Result<(), EnvError> {
        let mut state = lock(&self.inner);
        if state.ready != ReadyState::Open {
            return Err(EnvError::not_open(state.ready));
        }
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(EnvError::channel("injected send failure"));
        }
        state.sent.push(text);
        Ok(())
    }

    fn close(&self) {
        let mut state = lock(&self.inner);
        state.close_calls += 1;
        state.ready = ReadyState::Closed;
    }
}
