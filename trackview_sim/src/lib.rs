//! TrackView Deterministic Simulation Harness
//!
//! Runs the production TrackView client against simulated traffic with
//! every source of non-determinism under control:
//! - **Time**: a virtual clock that moves only when the runner advances it
//!   or the session sleeps
//! - **Channel**: an in-memory socket with scriptable readiness and send
//!   failures
//! - **Traffic**: stations generated from a single 64-bit seed, with
//!   duplicates, late copies, identity rollover and unconfirmed fixes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ScenarioRunner                         │
//! │                                                               │
//! │  FeedOracle ──frames──► SimChannel ──► TrackViewClient        │
//! │  (ground truth)              ▲              │                 │
//! │                              │ sent log     ▼                 │
//! │                              └──────── RecordingSurface       │
//! │                                                               │
//! │  SimContext (virtual clock) ── invariant sweep every tick     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use trackview_sim::{ScenarioId, ScenarioRunner};
//!
//! let result = ScenarioRunner::new(42).with_duration(120).run(ScenarioId::Storm).await;
//! assert!(result.passed);
//! ```

mod channel;
mod context;
mod feed;
pub mod runner;
pub mod scenarios;

pub use channel::SimChannel;
pub use context::SimContext;
pub use feed::{FeedConfig, FeedOracle, Station};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, SimError, SimHarness};
pub use scenarios::ScenarioId;
