//! Test doubles for the environment seams.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use trackview_env::{DuplexChannel, EnvError, ReadyState, TrackViewContext};

/// Manually advanced clock. `sleep` advances it; `yield_now` only counts.
#[derive(Default)]
pub struct ManualContext {
    now: Mutex<Duration>,
    yields: AtomicU64,
}

impl ManualContext {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, duration: Duration) {
        *self.now.lock().unwrap() += duration;
    }

    pub fn yields(&self) -> u64 {
        self.yields.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrackViewContext for ManualContext {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_704_067_200) + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    async fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::SeqCst);
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }
}

/// Channel whose ready state is scripted by the test.
pub struct ScriptedChannel {
    state: Mutex<ReadyState>,
    /// Becomes open after this many readiness polls while connecting
    open_after_polls: Mutex<Option<u32>>,
    sent: Mutex<Vec<String>>,
    closes: AtomicU64,
}

impl ScriptedChannel {
    pub fn shared(state: ReadyState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            open_after_polls: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closes: AtomicU64::new(0),
        })
    }

    pub fn set_state(&self, state: ReadyState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn open_after_polls(&self, polls: u32) {
        *self.open_after_polls.lock().unwrap() = Some(polls);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DuplexChannel for ScriptedChannel {
    fn ready_state(&self) -> ReadyState {
        let mut state = self.state.lock().unwrap();
        if *state == ReadyState::Connecting {
            let mut remaining = self.open_after_polls.lock().unwrap();
            match remaining.as_mut() {
                Some(0) => {
                    *state = ReadyState::Open;
                    *remaining = None;
                }
                Some(n) => *n -= 1,
                None => {}
            }
        }
        *state
    }

    async fn send_text(&self, text: String) -> Result<(), EnvError> {
        let state = *self.state.lock().unwrap();
        if state != ReadyState::Open {
            return Err(EnvError::not_open(state));
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = ReadyState::Closed;
    }
}
