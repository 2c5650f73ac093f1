//! Connection state machine for the realtime job client.
//!
//! Every connection attempt gets a fresh generation number. Open and close
//! notifications carrying an older generation are stale and ignored, which
//! keeps a late callback from a torn-down socket from disturbing the
//! current connection.

use std::time::Duration;

use crate::retry::ReconnectPolicy;

/// Phase of the realtime connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionPhase {
    Connecting,
    Open,
    RetryScheduled,
    Closed,
}

/// What the client should do after a connection closed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseOutcome {
    /// Schedule attempt number `attempt` after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Reconnect ceiling reached; the client stays closed.
    Exhausted,
    /// The owner disconnected; the client stays closed.
    Manual,
    /// Notification for a generation that is no longer current.
    Stale,
}

#[derive(Clone, Debug)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    phase: ConnectionPhase,
    attempts: u32,
    manual_close: bool,
    generation: u64,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            phase: ConnectionPhase::Connecting,
            attempts: 0,
            manual_close: false,
            generation: 0,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Consecutive reconnection attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_manually_closed(&self) -> bool {
        self.manual_close
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Starts a new connection attempt and returns its generation.
    ///
    /// Returns `None` once the state is closed, including a retry timer that
    /// fires after `close_manually`.
    pub fn begin_attempt(&mut self) -> Option<u64> {
        if self.manual_close || self.phase == ConnectionPhase::Closed {
            return None;
        }
        self.generation += 1;
        self.phase = ConnectionPhase::Connecting;
        Some(self.generation)
    }

    /// Records a successful open. Returns `false` if the attempt is stale or
    /// the client was closed while connecting.
    pub fn opened(&mut self, generation: u64) -> bool {
        if self.manual_close || generation != self.generation {
            return false;
        }
        self.attempts = 0;
        self.phase = ConnectionPhase::Open;
        true
    }

    /// Records a close for `generation` and decides whether to reconnect.
    pub fn closed(&mut self, generation: u64) -> CloseOutcome {
        if generation != self.generation {
            return CloseOutcome::Stale;
        }
        if self.manual_close {
            self.phase = ConnectionPhase::Closed;
            return CloseOutcome::Manual;
        }
        if self.attempts >= self.policy.max_attempts {
            self.phase = ConnectionPhase::Closed;
            return CloseOutcome::Exhausted;
        }

        self.attempts += 1;
        self.phase = ConnectionPhase::RetryScheduled;
        CloseOutcome::Retry {
            attempt: self.attempts,
            delay: self.policy.delay_for_attempt(self.attempts),
        }
    }

    /// Marks the state closed by the owner. Terminal.
    pub fn close_manually(&mut self) {
        self.manual_close = true;
        self.phase = ConnectionPhase::Closed;
    }

    /// Marks the state closed after an unrecoverable setup failure.
    pub fn abandon(&mut self) {
        self.phase = ConnectionPhase::Closed;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CloseOutcome, ConnectionPhase, ReconnectState};
    use crate::retry::ReconnectPolicy;

    #[test]
    fn open_resets_attempts() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        let first = state.begin_attempt().expect("attempt");
        assert!(state.opened(first));
        assert_eq!(
            state.closed(first),
            CloseOutcome::Retry {
                attempt: 1,
                delay: Duration::from_millis(1000),
            }
        );
        assert_eq!(state.phase(), ConnectionPhase::RetryScheduled);

        let second = state.begin_attempt().expect("retry");
        assert!(state.opened(second));
        assert_eq!(state.attempts(), 0);
        assert_eq!(state.phase(), ConnectionPhase::Open);
    }

    #[test]
    fn backoff_grows_until_ceiling() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        let mut delays = Vec::new();
        loop {
            let generation = state.begin_attempt().expect("attempt");
            match state.closed(generation) {
                CloseOutcome::Retry { delay, .. } => delays.push(delay.as_millis()),
                CloseOutcome::Exhausted => break,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(state.phase(), ConnectionPhase::Closed);
        assert_eq!(state.begin_attempt(), None);
    }

    #[test]
    fn manual_close_is_terminal_at_every_attempt_count() {
        for failures in 0..=5 {
            let mut state = ReconnectState::new(ReconnectPolicy::default());
            let mut generation = state.begin_attempt().expect("attempt");
            for _ in 0..failures {
                assert!(matches!(
                    state.closed(generation),
                    CloseOutcome::Retry { .. }
                ));
                generation = state.begin_attempt().expect("retry");
            }

            state.close_manually();
            assert_eq!(state.closed(generation), CloseOutcome::Manual);
            assert_eq!(state.begin_attempt(), None);
            assert!(!state.opened(generation));
        }
    }

    #[test]
    fn stale_generation_is_ignored() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        let first = state.begin_attempt().expect("attempt");
        assert!(state.opened(first));
        assert!(matches!(state.closed(first), CloseOutcome::Retry { .. }));
        let second = state.begin_attempt().expect("retry");

        assert!(!state.opened(first));
        assert_eq!(state.closed(first), CloseOutcome::Stale);
        assert_eq!(state.generation(), second);
        assert_eq!(state.attempts(), 1);
    }

    #[test]
    fn disabled_policy_never_retries() {
        let mut state = ReconnectState::new(ReconnectPolicy::disabled());
        let generation = state.begin_attempt().expect("attempt");
        assert_eq!(state.closed(generation), CloseOutcome::Exhausted);
    }
}
