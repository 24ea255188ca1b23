//! Session continuity state owned by the gateway engine.
//!
//! `Session` holds everything the engine needs to decide between Identify and
//! Resume after a dropped connection. Only the engine worker mutates it, and
//! only through the lifecycle methods below.

use std::time::Duration;

use crate::gateway::proto::ResumeMsg;

/// Connection lifecycle of a gateway session.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingHello,
    Authenticating,
    Connected,
}

impl ConnectionState {
    /// Returns `true` while a websocket is open and writable.
    pub fn is_socket_open(self) -> bool {
        matches!(
            self,
            ConnectionState::AwaitingHello
                | ConnectionState::Authenticating
                | ConnectionState::Connected
        )
    }
}

#[derive(Debug, Default)]
pub struct Session {
    session_id: Option<String>,
    sequence: Option<u64>,
    heartbeat_interval: Option<Duration>,
    resume_url: Option<String>,
    state: ConnectionState,
    last_heartbeat_acked: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    /// Gateway URL announced by READY for resuming this session.
    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_heartbeat_acked(&self) -> bool {
        self.last_heartbeat_acked
    }

    /// Both a session id and a sequence are held.
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }

    pub fn resume_msg(&self, token: &str) -> Option<ResumeMsg> {
        match (&self.session_id, self.sequence) {
            (Some(session_id), Some(seq)) => Some(ResumeMsg {
                token: token.to_string(),
                session_id: session_id.clone(),
                seq,
            }),
            _ => None,
        }
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    pub fn socket_opened(&mut self) {
        self.state = ConnectionState::AwaitingHello;
    }

    pub fn hello(&mut self, interval: Duration) {
        self.heartbeat_interval = Some(interval);
        self.last_heartbeat_acked = true;
    }

    pub fn authenticating(&mut self) {
        self.state = ConnectionState::Authenticating;
    }

    pub fn set_heartbeat_acked(&mut self, acked: bool) {
        self.last_heartbeat_acked = acked;
    }

    /// Records a dispatch sequence. Stale or repeated values are ignored.
    ///
    /// Returns `true` when the stored sequence advanced.
    pub fn record_sequence(&mut self, sequence: u64) -> bool {
        if self.sequence.is_some_and(|current| sequence <= current) {
            return false;
        }
        self.sequence = Some(sequence);
        true
    }

    /// Marks the session as established, after READY or RESUMED.
    pub fn connected(&mut self) {
        self.state = ConnectionState::Connected;
    }

    pub fn ready(&mut self, session_id: String, resume_url: Option<String>) {
        self.session_id = Some(session_id);
        self.resume_url = resume_url;
        self.connected();
    }

    /// Handles InvalidSession: the session id is always dropped, the sequence
    /// only when the server did not flag the session as resumable.
    pub fn invalidate(&mut self, keep_sequence: bool) {
        self.session_id = None;
        self.resume_url = None;
        if !keep_sequence {
            self.sequence = None;
        }
    }

    /// Drops everything a Resume would need so the next handshake identifies.
    pub fn discard_continuity(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_url = None;
    }

    pub fn disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ConnectionState, Session};

    #[test]
    fn sequence_only_moves_forward() {
        let mut session = Session::new();
        assert!(session.record_sequence(3));
        assert!(session.record_sequence(7));
        assert!(!session.record_sequence(5));
        assert!(!session.record_sequence(7));
        assert_eq!(session.sequence(), Some(7));
    }

    #[test]
    fn resume_requires_id_and_sequence() {
        let mut session = Session::new();
        assert!(!session.can_resume());
        session.record_sequence(1);
        assert!(!session.can_resume());
        session.ready("abc".to_string(), Some("wss://resume.example".to_string()));
        assert!(session.can_resume());
        assert_eq!(session.state(), ConnectionState::Connected);

        let resume = session.resume_msg("token").expect("resume payload");
        assert_eq!(resume.session_id, "abc");
        assert_eq!(resume.seq, 1);
    }

    #[test]
    fn invalidate_clears_session_id_and_honours_sequence_flag() {
        let mut session = Session::new();
        session.record_sequence(9);
        session.ready("abc".to_string(), None);

        session.invalidate(true);
        assert_eq!(session.session_id(), None);
        assert_eq!(session.sequence(), Some(9));
        assert!(!session.can_resume());

        session.invalidate(false);
        assert_eq!(session.sequence(), None);
    }

    #[test]
    fn lifecycle_transitions_track_socket_state() {
        let mut session = Session::new();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.state().is_socket_open());

        session.begin_connect();
        assert!(!session.state().is_socket_open());
        session.socket_opened();
        assert!(session.state().is_socket_open());
        session.hello(Duration::from_millis(41250));
        session.authenticating();
        assert_eq!(session.state(), ConnectionState::Authenticating);
        assert_eq!(session.heartbeat_interval(), Some(Duration::from_millis(41250)));

        session.disconnected();
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn reset_empties_everything() {
        let mut session = Session::new();
        session.record_sequence(4);
        session.ready("abc".to_string(), None);
        session.reset();
        assert_eq!(session.session_id(), None);
        assert_eq!(session.sequence(), None);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
}
