//! Process-wide run state of the proxy
//!
//! Transitions are compare-and-set on a single atomic, so two concurrent
//! callers can never both observe `Stopped` and start the proxy twice.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    /// Not running
    #[default]
    Stopped,
    /// Start in progress
    Starting,
    /// Accepting connections
    Running,
    /// Shutdown in progress
    Stopping,
}

impl RunState {
    fn as_u8(self) -> u8 {
        match self {
            RunState::Stopped => 0,
            RunState::Starting => 1,
            RunState::Running => 2,
            RunState::Stopping => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunState::Starting,
            2 => RunState::Running,
            3 => RunState::Stopping,
            _ => RunState::Stopped,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Stopped => write!(f, "stopped"),
            RunState::Starting => write!(f, "starting"),
            RunState::Running => write!(f, "running"),
            RunState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Atomic holder for [`RunState`]
#[derive(Debug, Default)]
pub struct RunStateCell(AtomicU8);

impl RunStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(RunState::Stopped.as_u8()))
    }

    pub fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`. Returns the observed state on failure.
    pub fn transition(&self, from: RunState, to: RunState) -> Result<(), RunState> {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(RunState::from_u8)
    }

    /// Claim the right to start. Only one caller wins from `Stopped`.
    pub fn begin_start(&self) -> Result<(), RunState> {
        self.transition(RunState::Stopped, RunState::Starting)
    }

    /// Claim the right to stop. Only one caller wins from `Running`.
    pub fn begin_stop(&self) -> Result<(), RunState> {
        self.transition(RunState::Running, RunState::Stopping)
    }

    /// Unconditionally set the state
    pub fn set(&self, state: RunState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_default_is_stopped() {
        assert_eq!(RunStateCell::new().get(), RunState::Stopped);
        assert_eq!(RunStateCell::default().get(), RunState::Stopped);
    }

    #[test]
    fn test_start_stop_cycle() {
        let cell = RunStateCell::new();
        assert!(cell.begin_start().is_ok());
        assert_eq!(cell.get(), RunState::Starting);

        cell.set(RunState::Running);
        assert!(cell.begin_stop().is_ok());
        assert_eq!(cell.get(), RunState::Stopping);

        cell.set(RunState::Stopped);
        assert!(cell.begin_start().is_ok());
    }

    #[test]
    fn test_double_start_rejected() {
        let cell = RunStateCell::new();
        cell.begin_start().unwrap();
        assert_eq!(cell.begin_start(), Err(RunState::Starting));

        cell.set(RunState::Running);
        assert_eq!(cell.begin_start(), Err(RunState::Running));
    }

    #[test]
    fn test_stop_when_stopped_rejected() {
        let cell = RunStateCell::new();
        assert_eq!(cell.begin_stop(), Err(RunState::Stopped));
        assert_eq!(cell.get(), RunState::Stopped);
    }

    #[test]
    fn test_concurrent_start_single_winner() {
        let cell = Arc::new(RunStateCell::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || cell.begin_start().is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(RunState::Running.to_string(), "running");
        assert_eq!(RunState::Stopped.to_string(), "stopped");
    }
}
