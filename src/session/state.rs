//! Connection lifecycle as an explicit state machine.
//!
//! [`ConnectionSession::handle`] is a pure transition: it takes an event,
//! updates the state and retry counter, and returns the action the driver
//! must perform next. Nothing here touches the network or the clock, so the
//! retry, backoff and give-up rules can be exercised directly.
//!
//! ```text
//! Disconnected --Start/BackoffElapsed--> Connecting --Connected--> Streaming
//!      ^                                     |                        |
//!      +------ failure (retries left) -------+------------------------+
//!                                            |                        |
//!                        retries exhausted   v      EOS / clean close v
//!                                          Closed <--Drained-- Draining
//! ```

use std::time::Duration;

use tracing::{debug, info, warn};

use super::config::BackoffPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Streaming,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Begin the first connection attempt.
    Start,
    Connected,
    ConnectFailed,
    /// A message arrived (receiver) or a frame went out (sender).
    FrameTransferred,
    EndOfStream,
    /// Peer closed with the normal status code.
    CleanClose,
    /// Any other close code, transport failure or lost connection.
    AbnormalClose,
    ReceiveTimeout,
    BackoffElapsed,
    /// User interrupt.
    Stop,
    /// All buffered frames have been flushed.
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Connect,
    /// Keep sending or receiving on the open connection.
    Stream,
    /// Drop the connection, wait, then report `BackoffElapsed`.
    Backoff(Duration),
    /// Stop transferring and flush what is buffered, then report `Drained`.
    Drain,
    /// Retries exhausted; the session is closed.
    GiveUp,
    /// The session is closed; release resources.
    Release,
    /// The event does not apply to the current state.
    Ignore,
}

/// Why a session stopped streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    EndOfStream,
    CleanClose,
    Stopped,
    RetriesExhausted,
}

#[derive(Debug, Clone)]
pub struct ConnectionSession {
    state: SessionState,
    retries: u32,
    max_retries: u32,
    backoff: BackoffPolicy,
    end: Option<SessionEnd>,
}

impl ConnectionSession {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            state: SessionState::Disconnected,
            retries: 0,
            max_retries,
            backoff,
            end: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn end(&self) -> Option<SessionEnd> {
        self.end
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn handle(&mut self, event: SessionEvent) -> SessionAction {
        use SessionAction as A;
        use SessionEvent as E;
        use SessionState as S;

        let from = self.state;
        let action = match (self.state, event) {
            (S::Closed, _) => A::Ignore,

            (S::Disconnected, E::Start | E::BackoffElapsed) => {
                self.state = S::Connecting;
                A::Connect
            }

            (S::Connecting, E::Connected) => {
                self.retries = 0;
                self.state = S::Streaming;
                A::Stream
            }
            (S::Connecting, E::ConnectFailed) => self.fail(),

            (S::Streaming, E::FrameTransferred) => {
                self.retries = 0;
                A::Stream
            }
            (S::Streaming, E::EndOfStream) => self.drain(SessionEnd::EndOfStream),
            (S::Streaming, E::CleanClose) => self.drain(SessionEnd::CleanClose),
            (S::Streaming, E::AbnormalClose | E::ReceiveTimeout) => self.fail(),

            (S::Disconnected | S::Connecting | S::Streaming, E::Stop) => {
                self.drain(SessionEnd::Stopped)
            }

            (S::Draining, E::Drained) => {
                self.state = S::Closed;
                A::Release
            }

            _ => A::Ignore,
        };

        if action == A::Ignore {
            debug!("Session ignored {:?} in state {:?}", event, from);
        } else if from != self.state {
            debug!("Session {:?} -> {:?} on {:?}", from, self.state, event);
        }
        action
    }

    /// Counts one failed attempt; gives up once the bound is reached.
    fn fail(&mut self) -> SessionAction {
        self.retries = (self.retries + 1).min(self.max_retries);
        if self.retries >= self.max_retries {
            warn!(
                "Giving up after {} failed attempt(s)",
                self.retries.max(1)
            );
            self.state = SessionState::Closed;
            self.end = Some(SessionEnd::RetriesExhausted);
            return SessionAction::GiveUp;
        }

        let delay = self.backoff.delay(self.retries);
        info!(
            "Retry {}/{} in {:?}",
            self.retries, self.max_retries, delay
        );
        self.state = SessionState::Disconnected;
        SessionAction::Backoff(delay)
    }

    fn drain(&mut self, end: SessionEnd) -> SessionAction {
        self.state = SessionState::Draining;
        self.end = Some(end);
        SessionAction::Drain
    }
}
