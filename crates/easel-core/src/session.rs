use serde::{Deserialize, Serialize};

/// Lifecycle of one streaming session.
///
/// `Created → Connecting → Streaming → {Completed | Error}`. A provider that
/// answers with an empty body goes straight from `Connecting` to `Completed`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Created,
    Connecting,
    Streaming,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },
    #[error("unknown session state: {0}")]
    UnknownState(String),
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Connecting)
                | (Created, Error)
                | (Connecting, Streaming)
                | (Connecting, Completed)
                | (Connecting, Error)
                | (Streaming, Completed)
                | (Streaming, Error)
        )
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Connecting => "CONNECTING",
            Self::Streaming => "STREAMING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "CONNECTING" => Ok(Self::Connecting),
            "STREAMING" => Ok(Self::Streaming),
            "COMPLETED" => Ok(Self::Completed),
            "ERROR" => Ok(Self::Error),
            other => Err(SessionError::UnknownState(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut s = SessionState::default();
        s.transition(SessionState::Connecting).unwrap();
        s.transition(SessionState::Streaming).unwrap();
        s.transition(SessionState::Completed).unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut s = SessionState::Error;
        assert!(s.transition(SessionState::Connecting).is_err());
        let mut s = SessionState::Completed;
        assert_eq!(
            s.transition(SessionState::Streaming),
            Err(SessionError::InvalidTransition {
                from: SessionState::Completed,
                to: SessionState::Streaming
            })
        );
    }

    #[test]
    fn cannot_skip_connecting() {
        assert!(!SessionState::Created.can_transition_to(SessionState::Streaming));
        assert!(!SessionState::Created.can_transition_to(SessionState::Completed));
    }

    #[test]
    fn string_roundtrip() {
        for s in [
            SessionState::Created,
            SessionState::Connecting,
            SessionState::Streaming,
            SessionState::Completed,
            SessionState::Error,
        ] {
            assert_eq!(s.as_str().parse::<SessionState>().unwrap(), s);
            assert_eq!(serde_json::to_value(s).unwrap(), s.as_str());
        }
        assert!("DONE".parse::<SessionState>().is_err());
    }
}
