//! Session status tuple and edge-triggered status diffing.
//!
//! Every session carries a current and a previous status tuple. The
//! registry diffs the two after each reconciliation pass and fires exactly
//! one notification per observed transition.

use crate::listing::RunState;

/// The mutable status tuple of one session.
///
/// `running`, `suspended`, `terminated` and `faulty` are three-valued:
/// `None` means "not yet observed" (a virgin or disconnected session).
///
/// Invariant: at most one of `running`, `suspended`, `terminated` is true
/// once `virgin` is false; `faulty` is only true when none of the others
/// hold and the session is not virgin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Server hostname this status was observed against.
    pub server: String,
    /// Session has never been started or resumed.
    pub virgin: bool,
    /// The control session is connected and authenticated.
    pub connected: bool,
    pub running: Option<bool>,
    pub suspended: Option<bool>,
    pub terminated: Option<bool>,
    pub faulty: Option<bool>,
}

impl SessionStatus {
    /// A fresh, unobserved status for a registered session.
    pub fn virgin(server: impl Into<String>) -> Self {
        SessionStatus {
            server: server.into(),
            virgin: true,
            connected: false,
            running: None,
            suspended: None,
            terminated: None,
            faulty: None,
        }
    }

    /// Apply one server-list observation for this session.
    ///
    /// `observed` is the run state reported by the listing, or `None` when
    /// the session does not appear in the listing at all (terminated, as
    /// far as a non-virgin session is concerned).
    pub fn apply_observation(&mut self, observed: Option<RunState>) {
        match observed {
            Some(state) => {
                self.running = Some(state == RunState::Running);
                self.suspended = Some(state == RunState::Suspended);
                self.terminated = if self.virgin { None } else { Some(false) };
            }
            None => {
                self.running = Some(false);
                self.suspended = Some(false);
                self.terminated = if self.virgin { None } else { Some(true) };
            }
        }
        self.faulty = Some(
            !(self.running.unwrap_or(false)
                || self.suspended.unwrap_or(false)
                || self.terminated.unwrap_or(false)
                || self.virgin),
        );
    }

    /// Reset all observations after a disconnect.
    pub fn reset_disconnected(&mut self) {
        self.connected = false;
        self.running = None;
        self.suspended = None;
        self.terminated = None;
        self.faulty = None;
    }

    /// Mark the lifecycle flags after a successful start or resume.
    pub fn mark_running(&mut self) {
        self.virgin = false;
        self.running = Some(true);
        self.suspended = Some(false);
        self.terminated = Some(false);
        self.faulty = Some(false);
    }

    /// Mark the lifecycle flags after a suspend.
    pub fn mark_suspended(&mut self) {
        self.running = Some(false);
        self.suspended = Some(true);
        self.terminated = Some(false);
        self.faulty = Some(false);
    }

    /// Mark the lifecycle flags after a terminate.
    pub fn mark_terminated(&mut self) {
        self.running = Some(false);
        self.suspended = Some(false);
        self.terminated = Some(true);
        self.faulty = Some(false);
    }

    /// Check the documented status invariant.
    pub fn check_invariant(&self) -> bool {
        let lifecycle_flags = [self.running, self.suspended, self.terminated]
            .iter()
            .filter(|f| f.unwrap_or(false))
            .count();
        if !self.virgin && lifecycle_flags > 1 {
            return false;
        }
        if self.faulty.unwrap_or(false) && (lifecycle_flags != 0 || self.virgin) {
            return false;
        }
        true
    }
}

/// One edge-triggered lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// This client started the session and it is now running.
    StartedByMe,
    /// Another client started the session.
    StartedByOther,
    /// This client resumed the session.
    ResumedByMe,
    /// Another client resumed the session.
    ResumedByOther,
    /// The session was already running when the profile connected.
    FoundRunningAfterConnect,
    /// The session was suspended.
    Suspended,
    /// The session was terminated.
    Terminated,
    /// The configured server changed; all state for this session is stale.
    ServerChanged,
}

/// Diff two status tuples into at most one lifecycle event.
///
/// `had_terminal` distinguishes "by me" from "by other": a session object
/// that already held a terminal session before the transition was observed
/// caused the transition itself. `newly_connected` suppresses false
/// started-by-other positives right after connecting.
pub fn diff_status(
    last: &SessionStatus,
    current: &SessionStatus,
    had_terminal: bool,
    newly_connected: bool,
    has_session_name: bool,
) -> Option<StatusEvent> {
    if last.server != current.server {
        return Some(StatusEvent::ServerChanged);
    }

    let current_faulty = current.faulty.unwrap_or(false);

    if !last.running.unwrap_or(false) && current.running.unwrap_or(false) && !current_faulty {
        if newly_connected {
            return Some(StatusEvent::FoundRunningAfterConnect);
        }
        if had_terminal {
            if last.suspended.unwrap_or(false) {
                return Some(StatusEvent::ResumedByMe);
            }
            if last.virgin {
                return Some(StatusEvent::StartedByMe);
            }
        } else {
            if last.suspended.unwrap_or(false) {
                return Some(StatusEvent::ResumedByOther);
            }
            if last.connected && last.virgin {
                return Some(StatusEvent::StartedByOther);
            }
        }
        return None;
    }

    if last.connected
        && !last.suspended.unwrap_or(false)
        && current.suspended.unwrap_or(false)
        && !current_faulty
        && has_session_name
    {
        return Some(StatusEvent::Suspended);
    }

    if last.connected
        && !last.terminated.unwrap_or(false)
        && current.terminated.unwrap_or(false)
        && !current_faulty
        && has_session_name
    {
        return Some(StatusEvent::Terminated);
    }

    None
}

// =============================================================================
// Tests
// =============================================================================
