//! The Session record (spec §3/§4.3): state and progress are read via
//! atomic load so pool-status-style readers never block on or race with
//! the single owning executor task, which is the only writer (spec §5:
//! "session fields updated by the owning executor task without
//! synchronization; the state field uses atomic load/store").

use crate::core::CancellationToken;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Pending = 0,
    Preprocessing = 1,
    Running = 2,
    Postprocessing = 3,
    Completed = 4,
    Failed = 5,
    Cancelled = 6,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed | SessionState::Cancelled)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Pending,
            1 => SessionState::Preprocessing,
            2 => SessionState::Running,
            3 => SessionState::Postprocessing,
            4 => SessionState::Completed,
            5 => SessionState::Failed,
            _ => SessionState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimingBreakdown {
    pub preprocessing_ms: Option<u64>,
    pub inference_ms: Option<u64>,
    pub postprocessing_ms: Option<u64>,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Owned snapshot of a Session's observable state, returned by
/// [`SessionManager::get_status`](crate::session::SessionManager::get_status).
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub model_id: String,
    pub device_id: String,
    pub state: SessionState,
    pub progress: u8,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    pub error_message: Option<String>,
    pub output_artifacts: Vec<String>,
    pub timing: TimingBreakdown,
}

pub struct Session {
    pub id: String,
    pub model_id: String,
    pub device_id: String,
    pub started_at: u64,
    pub cancel_token: CancellationToken,
    state: AtomicU8,
    progress: AtomicU8,
    completed_at: AtomicU64,
    has_completed_at: AtomicBool,
    error_message: StdMutex<Option<String>>,
    output_artifacts: StdMutex<Vec<String>>,
    timing: StdMutex<TimingBreakdown>,
}

impl Session {
    pub fn new(id: String, model_id: String, device_id: String) -> Self {
        Self {
            id,
            model_id,
            device_id,
            started_at: now(),
            cancel_token: CancellationToken::new(),
            state: AtomicU8::new(SessionState::Pending as u8),
            progress: AtomicU8::new(0),
            completed_at: AtomicU64::new(0),
            has_completed_at: AtomicBool::new(false),
            error_message: StdMutex::new(None),
            output_artifacts: StdMutex::new(Vec::new()),
            timing: StdMutex::new(TimingBreakdown::default()),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Progress is monotonic: a lower value than already recorded is
    /// silently dropped (spec §4.3: "may never decrease").
    pub fn set_progress(&self, value: u8) {
        let value = value.min(100);
        let mut current = self.progress.load(Ordering::SeqCst);
        while value > current {
            match self
                .progress
                .compare_exchange(current, value, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Moves to `next` unless already in a terminal state. Terminal states
    /// are sticky (spec §3 invariant); returns whether the transition took.
    pub fn transition(&self, next: SessionState) -> bool {
        let prev = self.state();
        if prev.is_terminal() {
            return false;
        }
        self.state.store(next as u8, Ordering::SeqCst);
        tracing::info!(session_id = %self.id, from = ?prev, to = ?next, "session state transition");
        if next.is_terminal() {
            self.completed_at.store(now(), Ordering::SeqCst);
            self.has_completed_at.store(true, Ordering::SeqCst);
        }
        true
    }

    pub fn mark_completed(&self, artifacts: Vec<String>) -> bool {
        if !self.transition(SessionState::Completed) {
            return false;
        }
        *self.output_artifacts.lock().unwrap() = artifacts;
        true
    }

    pub fn mark_failed(&self, message: impl Into<String>) -> bool {
        if !self.transition(SessionState::Failed) {
            return false;
        }
        *self.error_message.lock().unwrap() = Some(message.into());
        true
    }

    /// Best-effort, idempotent cancel (spec §4.3): no-op returning `false`
    /// if the session is already terminal.
    pub fn cancel(&self) -> bool {
        if !self.transition(SessionState::Cancelled) {
            return false;
        }
        self.cancel_token.cancel();
        true
    }

    pub fn record_timing(&self, f: impl FnOnce(&mut TimingBreakdown)) {
        f(&mut self.timing.lock().unwrap());
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            model_id: self.model_id.clone(),
            device_id: self.device_id.clone(),
            state: self.state(),
            progress: self.progress(),
            started_at: self.started_at,
            completed_at: self
                .has_completed_at
                .load(Ordering::SeqCst)
                .then(|| self.completed_at.load(Ordering::SeqCst)),
            error_message: self.error_message.lock().unwrap().clone(),
            output_artifacts: self.output_artifacts.lock().unwrap().clone(),
            timing: self.timing.lock().unwrap().clone(),
        }
    }
}
