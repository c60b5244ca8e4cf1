//! Gateway binding and device discovery window.
//!
//! ```text
//!            start                    stop / deadline
//! Idle ───────────────► Pairing ─────────────────────► Idle | Bound
//!   │                   │  ▲  │
//!   │ 001               │  └──┘ 003 / start (deadline reset)
//!   ▼                   ▼ 001
//! Bound ◄───────────────┘
//! ```
//!
//! The machine keeps at most one session. Whether the gateway is bound is tracked
//! separately so a window opened on a bound gateway falls back to `Bound`.

use chrono::{DateTime, Duration, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingSession {
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    Pairing(PairingSession),
    Bound,
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PairingState::Idle => write!(f, "idle"),
            PairingState::Pairing(session) => write!(f, "pairing until {}", session.deadline),
            PairingState::Bound => write!(f, "bound"),
        }
    }
}

/// Outcome of [`PairingMachine::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStart {
    Started(DateTime<Utc>),
    /// A session was already open; its deadline moved
    Extended(DateTime<Utc>),
}

impl PairingStart {
    pub fn deadline(&self) -> DateTime<Utc> {
        match self {
            PairingStart::Started(deadline) | PairingStart::Extended(deadline) => *deadline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingEndReason {
    Stopped,
    Expired,
    GatewayBound,
}

impl fmt::Display for PairingEndReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PairingEndReason::Stopped => write!(f, "stopped"),
            PairingEndReason::Expired => write!(f, "expired"),
            PairingEndReason::GatewayBound => write!(f, "gateway bound"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PairingMachine {
    session: Option<PairingSession>,
    bound: bool,
    window: Duration,
}

impl PairingMachine {
    pub fn new(window: Duration) -> Self {
        Self {
            session: None,
            bound: false,
            window,
        }
    }

    pub fn state(&self) -> PairingState {
        match (self.session, self.bound) {
            (Some(session), _) => PairingState::Pairing(session),
            (None, true) => PairingState::Bound,
            (None, false) => PairingState::Idle,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn session(&self) -> Option<PairingSession> {
        self.session
    }

    /// Opens the window, or pushes out the deadline of the open one.
    pub fn start(&mut self, now: DateTime<Utc>) -> PairingStart {
        let deadline = now + self.window;
        match self.session.as_mut() {
            Some(session) => {
                session.deadline = deadline;
                PairingStart::Extended(deadline)
            }
            None => {
                self.session = Some(PairingSession {
                    started_at: now,
                    deadline,
                });
                PairingStart::Started(deadline)
            }
        }
    }

    /// Closes the window immediately. Returns the session that was open, if any.
    pub fn stop(&mut self) -> Option<PairingSession> {
        self.session.take()
    }

    /// Closes the window once its deadline has passed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Option<PairingSession> {
        match self.session {
            Some(session) if now >= session.deadline => self.session.take(),
            _ => None,
        }
    }

    /// Whether a bind frame arriving at `now` falls inside the window.
    pub fn window_open(&self, now: DateTime<Utc>) -> bool {
        self.session
            .map(|session| now < session.deadline)
            .unwrap_or(false)
    }

    /// Gateway accepted the bind. Ends any open window.
    pub fn bind_gateway(&mut self) -> Option<PairingSession> {
        self.bound = true;
        self.session.take()
    }

    pub fn unbind(&mut self) {
        self.bound = false;
    }

    pub fn restore(&mut self, bound: bool) {
        self.bound = bound;
        self.session = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> PairingMachine {
        PairingMachine::new(Duration::seconds(60))
    }

    #[test]
    fn start_opens_window_until_deadline() {
        let now = Utc::now();
        let mut pairing = machine();

        assert_eq!(pairing.state(), PairingState::Idle);
        let start = pairing.start(now);
        assert_eq!(start, PairingStart::Started(now + Duration::seconds(60)));
        assert!(pairing.window_open(now + Duration::seconds(59)));
        assert!(!pairing.window_open(now + Duration::seconds(60)));
    }

    #[test]
    fn restart_resets_deadline_without_second_session() {
        let now = Utc::now();
        let mut pairing = machine();
        pairing.start(now);

        let later = now + Duration::seconds(30);
        let start = pairing.start(later);
        assert_eq!(start, PairingStart::Extended(later + Duration::seconds(60)));

        let session = pairing.session().unwrap();
        assert_eq!(session.started_at, now);
        assert_eq!(session.deadline, later + Duration::seconds(60));
    }

    #[test]
    fn stop_returns_to_idle() {
        let mut pairing = machine();
        pairing.start(Utc::now());

        assert!(pairing.stop().is_some());
        assert_eq!(pairing.state(), PairingState::Idle);
        assert!(pairing.stop().is_none());
    }

    #[test]
    fn expiry_only_after_deadline() {
        let now = Utc::now();
        let mut pairing = machine();
        pairing.start(now);

        assert!(pairing.expire(now + Duration::seconds(10)).is_none());
        assert!(pairing.expire(now + Duration::seconds(61)).is_some());
        assert_eq!(pairing.state(), PairingState::Idle);
    }

    #[test]
    fn bound_gateway_falls_back_to_bound() {
        let now = Utc::now();
        let mut pairing = machine();
        pairing.bind_gateway();
        assert_eq!(pairing.state(), PairingState::Bound);

        pairing.start(now);
        assert!(matches!(pairing.state(), PairingState::Pairing(_)));
        pairing.stop();
        assert_eq!(pairing.state(), PairingState::Bound);
    }

    #[test]
    fn bind_frame_closes_open_window() {
        let mut pairing = machine();
        pairing.start(Utc::now());

        assert!(pairing.bind_gateway().is_some());
        assert_eq!(pairing.state(), PairingState::Bound);
    }
}
