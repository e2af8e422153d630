use std::time::Duration;

use crate::{
    error::ChatError,
    retry::ReconnectPolicy,
    types::{ChatEvent, ConnectionState},
};

/// What a `Connect` request should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStep {
    /// Already connected; resolve immediately.
    AlreadyConnected,
    /// A handshake is already in flight.
    InProgress,
    /// Caller must start a handshake now.
    Start,
}

/// Result of a failed handshake or an unexpected transport drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The failure came from a caller-initiated connect; stay offline.
    Offline,
    /// Another automatic attempt is due after `delay`.
    RetryScheduled { attempt: u32, delay: Duration },
    /// The attempt cap was reached; stay offline.
    Exhausted { attempts: u32 },
}

/// Outcome of a transition plus the events it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<T> {
    pub outcome: T,
    pub events: Vec<ChatEvent>,
}

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    attempts: u32,
    reconnecting: bool,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

impl ConnectionStateMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            attempts: 0,
            reconnecting: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Automatic attempts made since the last successful handshake.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts
    }

    pub fn begin_connect(&mut self) -> Transition<ConnectStep> {
        match self.state {
            ConnectionState::Connected => Transition {
                outcome: ConnectStep::AlreadyConnected,
                events: Vec::new(),
            },
            ConnectionState::Connecting => Transition {
                outcome: ConnectStep::InProgress,
                events: Vec::new(),
            },
            ConnectionState::Disconnected => {
                self.attempts = 0;
                self.reconnecting = false;
                Transition {
                    outcome: ConnectStep::Start,
                    events: self.enter(ConnectionState::Connecting),
                }
            }
            // A manual connect while waiting for backoff jumps the queue but
            // keeps counting against the cap.
            ConnectionState::Reconnecting => Transition {
                outcome: ConnectStep::Start,
                events: self.enter(ConnectionState::Connecting),
            },
        }
    }

    /// Backoff elapsed; start the scheduled automatic attempt.
    pub fn begin_reconnect_attempt(&mut self) -> Result<Vec<ChatEvent>, ChatError> {
        if self.state != ConnectionState::Reconnecting {
            return Err(ChatError::invalid_state(self.state, "reconnect_attempt"));
        }
        Ok(self.enter(ConnectionState::Connecting))
    }

    pub fn on_connected(&mut self) -> Result<Vec<ChatEvent>, ChatError> {
        if self.state != ConnectionState::Connecting {
            return Err(ChatError::invalid_state(self.state, "on_connected"));
        }
        self.attempts = 0;
        self.reconnecting = false;
        let mut events = self.enter(ConnectionState::Connected);
        events.push(ChatEvent::ConnectivityChanged { connected: true });
        Ok(events)
    }

    pub fn on_connect_failed(
        &mut self,
        retry_after_hint_ms: Option<u64>,
    ) -> Result<Transition<FailureOutcome>, ChatError> {
        if self.state != ConnectionState::Connecting {
            return Err(ChatError::invalid_state(self.state, "on_connect_failed"));
        }
        if self.reconnecting {
            return Ok(self.schedule_retry(Vec::new(), retry_after_hint_ms));
        }
        Ok(Transition {
            outcome: FailureOutcome::Offline,
            events: self.enter(ConnectionState::Disconnected),
        })
    }

    /// Unexpected drop of an established connection.
    pub fn on_transport_lost(
        &mut self,
        retry_after_hint_ms: Option<u64>,
    ) -> Result<Transition<FailureOutcome>, ChatError> {
        if self.state != ConnectionState::Connected {
            return Err(ChatError::invalid_state(self.state, "on_transport_lost"));
        }
        let events = vec![ChatEvent::ConnectivityChanged { connected: false }];
        Ok(self.schedule_retry(events, retry_after_hint_ms))
    }

    /// Explicit teardown; valid from every state.
    pub fn disconnect(&mut self) -> Vec<ChatEvent> {
        let was_connected = self.is_connected();
        self.attempts = 0;
        self.reconnecting = false;
        let mut events = Vec::new();
        if was_connected {
            events.push(ChatEvent::ConnectivityChanged { connected: false });
        }
        events.extend(self.enter(ConnectionState::Disconnected));
        events
    }

    fn schedule_retry(
        &mut self,
        mut events: Vec<ChatEvent>,
        retry_after_hint_ms: Option<u64>,
    ) -> Transition<FailureOutcome> {
        self.attempts = self.attempts.saturating_add(1);
        match self
            .policy
            .delay_for_attempt(self.attempts, retry_after_hint_ms)
        {
            Some(delay) => {
                self.reconnecting = true;
                events.extend(self.enter(ConnectionState::Reconnecting));
                events.push(ChatEvent::ReconnectScheduled {
                    attempt: self.attempts,
                    delay_ms: delay.as_millis() as u64,
                });
                Transition {
                    outcome: FailureOutcome::RetryScheduled {
                        attempt: self.attempts,
                        delay,
                    },
                    events,
                }
            }
            None => {
                let attempts = self.policy.max_attempts();
                self.reconnecting = false;
                events.extend(self.enter(ConnectionState::Disconnected));
                events.push(ChatEvent::ReconnectExhausted { attempts });
                Transition {
                    outcome: FailureOutcome::Exhausted { attempts },
                    events,
                }
            }
        }
    }

    fn enter(&mut self, next: ConnectionState) -> Vec<ChatEvent> {
        if self.state == next {
            return Vec::new();
        }
        self.state = next;
        vec![ChatEvent::StateChanged { state: next }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_machine() -> ConnectionStateMachine {
        let mut sm = ConnectionStateMachine::new(ReconnectPolicy::new(100, 5));
        assert_eq!(sm.begin_connect().outcome, ConnectStep::Start);
        sm.on_connected().expect("handshake should complete");
        sm
    }

    #[test]
    fn runs_happy_path_state_transitions() {
        let mut sm = ConnectionStateMachine::default();
        assert_eq!(sm.state(), ConnectionState::Disconnected);

        let step = sm.begin_connect();
        assert_eq!(step.outcome, ConnectStep::Start);
        assert_eq!(
            step.events,
            vec![ChatEvent::StateChanged {
                state: ConnectionState::Connecting
            }]
        );

        let events = sm.on_connected().expect("connected");
        assert!(events.contains(&ChatEvent::ConnectivityChanged { connected: true }));
        assert_eq!(sm.state(), ConnectionState::Connected);

        let events = sm.disconnect();
        assert!(events.contains(&ChatEvent::ConnectivityChanged { connected: false }));
        assert_eq!(sm.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connect_is_idempotent_once_connected() {
        let mut sm = connected_machine();
        let step = sm.begin_connect();
        assert_eq!(step.outcome, ConnectStep::AlreadyConnected);
        assert!(step.events.is_empty());
    }

    #[test]
    fn caller_connect_failure_goes_offline_without_retry() {
        let mut sm = ConnectionStateMachine::default();
        sm.begin_connect();
        let failed = sm.on_connect_failed(None).expect("failure applies");
        assert_eq!(failed.outcome, FailureOutcome::Offline);
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert_eq!(sm.reconnect_attempts(), 0);
    }

    #[test]
    fn transport_drop_schedules_linear_backoff() {
        let mut sm = connected_machine();
        let lost = sm.on_transport_lost(None).expect("drop applies");
        assert_eq!(
            lost.outcome,
            FailureOutcome::RetryScheduled {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(sm.state(), ConnectionState::Reconnecting);

        sm.begin_reconnect_attempt().expect("attempt starts");
        let failed = sm.on_connect_failed(None).expect("failure applies");
        assert_eq!(
            failed.outcome,
            FailureOutcome::RetryScheduled {
                attempt: 2,
                delay: Duration::from_millis(200)
            }
        );
    }

    #[test]
    fn gives_up_after_five_failed_attempts() {
        let mut sm = connected_machine();
        let mut outcome = sm.on_transport_lost(None).expect("drop").outcome;
        let mut attempts_started = 0;
        while let FailureOutcome::RetryScheduled { .. } = outcome {
            sm.begin_reconnect_attempt().expect("attempt starts");
            attempts_started += 1;
            outcome = sm.on_connect_failed(None).expect("failure").outcome;
        }

        assert_eq!(attempts_started, 5);
        assert_eq!(outcome, FailureOutcome::Exhausted { attempts: 5 });
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(sm.begin_reconnect_attempt().is_err());
    }

    #[test]
    fn successful_reconnect_resets_attempt_counter() {
        let mut sm = connected_machine();
        sm.on_transport_lost(None).expect("drop");
        sm.begin_reconnect_attempt().expect("attempt");
        let events = sm.on_connected().expect("reconnected");
        assert!(events.contains(&ChatEvent::ConnectivityChanged { connected: true }));
        assert_eq!(sm.reconnect_attempts(), 0);
    }

    #[test]
    fn rejects_transport_loss_when_not_connected() {
        let mut sm = ConnectionStateMachine::default();
        let err = sm
            .on_transport_lost(None)
            .expect_err("nothing to lose while disconnected");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn disconnect_is_safe_to_repeat() {
        let mut sm = connected_machine();
        assert!(!sm.disconnect().is_empty());
        assert!(sm.disconnect().is_empty());
        assert_eq!(sm.state(), ConnectionState::Disconnected);
    }
}
