//! Cancellation tokens
//!
//! One token per shell session, cloned into every guest the session
//! spawns. Carries the per-command deadline and an explicit cancel
//! reason; guests observe it through `check_cancel` and every WASI/ABI
//! entry point polls it at suspension points. Once fired, the state is
//! latched until the driver resets it for the next command.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::{EXIT_CANCELLED, EXIT_TIMEOUT};

/// Why a command was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The per-command deadline expired.
    Timeout,
    /// The driver cancelled explicitly.
    Cancelled,
}

impl CancelReason {
    /// Exit code the kernel reports for processes torn down for this
    /// reason.
    pub fn exit_code(self) -> i32 {
        match self {
            CancelReason::Timeout => EXIT_TIMEOUT,
            CancelReason::Cancelled => EXIT_CANCELLED,
        }
    }
}

/// Poll result surfaced to guests via `check_cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    Ok,
    TimedOut,
    Cancelled,
}

impl CancelStatus {
    /// Wire encoding: 0 = ok, 1 = timeout, 2 = cancelled.
    pub fn as_code(self) -> i32 {
        match self {
            CancelStatus::Ok => 0,
            CancelStatus::TimedOut => 1,
            CancelStatus::Cancelled => 2,
        }
    }
}

struct CancelState {
    deadline: Option<Instant>,
    fired: Option<CancelReason>,
}

/// Shared cancellation state.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<Mutex<CancelState>>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            state: Arc::new(Mutex::new(CancelState {
                deadline: None,
                fired: None,
            })),
        }
    }

    /// Arm the deadline for the current command.
    pub fn set_deadline(&self, deadline: Instant) {
        self.state.lock().deadline = Some(deadline);
    }

    /// Clear both the deadline and any latched reason (start of a new
    /// command).
    pub fn reset(&self) {
        let mut st = self.state.lock();
        st.deadline = None;
        st.fired = None;
    }

    /// Cancel explicitly with a reason.
    pub fn cancel(&self, reason: CancelReason) {
        let mut st = self.state.lock();
        if st.fired.is_none() {
            st.fired = Some(reason);
        }
    }

    /// Poll: latches a timeout the first time the deadline is observed
    /// expired.
    pub fn status(&self) -> CancelStatus {
        let mut st = self.state.lock();
        if st.fired.is_none() {
            if let Some(deadline) = st.deadline {
                if Instant::now() >= deadline {
                    st.fired = Some(CancelReason::Timeout);
                }
            }
        }
        match st.fired {
            None => CancelStatus::Ok,
            Some(CancelReason::Timeout) => CancelStatus::TimedOut,
            Some(CancelReason::Cancelled) => CancelStatus::Cancelled,
        }
    }

    /// `Err(reason)` once fired; used by host entry points to unwind.
    pub fn check(&self) -> Result<(), CancelReason> {
        match self.status() {
            CancelStatus::Ok => Ok(()),
            CancelStatus::TimedOut => Err(CancelReason::Timeout),
            CancelStatus::Cancelled => Err(CancelReason::Cancelled),
        }
    }

    pub fn is_fired(&self) -> bool {
        self.status() != CancelStatus::Ok
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fresh_token_is_ok() {
        let token = CancelToken::new();
        assert_eq!(token.status(), CancelStatus::Ok);
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_expired_deadline_latches_timeout() {
        let token = CancelToken::new();
        token.set_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(token.status(), CancelStatus::TimedOut);
        // Latched even if the deadline is later cleared implicitly.
        assert_eq!(token.check(), Err(CancelReason::Timeout));
    }

    #[test]
    fn test_explicit_cancel_wins_over_later_timeout() {
        let token = CancelToken::new();
        token.cancel(CancelReason::Cancelled);
        token.set_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(token.status(), CancelStatus::Cancelled);
    }

    #[test]
    fn test_reset_rearms() {
        let token = CancelToken::new();
        token.cancel(CancelReason::Cancelled);
        token.reset();
        assert_eq!(token.status(), CancelStatus::Ok);
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel(CancelReason::Timeout);
        assert_eq!(clone.status(), CancelStatus::TimedOut);
        assert_eq!(CancelReason::Timeout.exit_code(), 124);
        assert_eq!(CancelReason::Cancelled.exit_code(), 130);
    }
}
