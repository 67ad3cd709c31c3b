//! Computation lifecycle: states, the transition graph and failure kinds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::defaults;

/// Lifecycle state of a computation.
///
/// ```text
/// QUEUED  -> STARTED           worker claims the task
/// STARTED -> SUCCESS           >= 1 artifact committed
/// STARTED -> FAILURE           user failure, internal error, heartbeat timeout
/// QUEUED  -> FAILURE           revoked before a worker claimed it
/// QUEUED  -> EXPIRED           dispatch message dead-lettered
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputationState {
    Queued,
    Started,
    Success,
    Failure,
    Expired,
}

impl ComputationState {
    pub const ALL: [ComputationState; 5] = [
        ComputationState::Queued,
        ComputationState::Started,
        ComputationState::Success,
        ComputationState::Failure,
        ComputationState::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComputationState::Queued => "QUEUED",
            ComputationState::Started => "STARTED",
            ComputationState::Success => "SUCCESS",
            ComputationState::Failure => "FAILURE",
            ComputationState::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ComputationState::Success | ComputationState::Failure | ComputationState::Expired
        )
    }

    /// States eligible for dedup matching (subject to `expires_at`).
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ComputationState::Queued | ComputationState::Started | ComputationState::Success
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition(&self, next: ComputationState) -> bool {
        use ComputationState::*;
        matches!(
            (self, next),
            (Queued, Started)
                | (Queued, Failure)
                | (Queued, Expired)
                | (Started, Success)
                | (Started, Failure)
        )
    }
}

impl fmt::Display for ComputationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ComputationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(ComputationState::Queued),
            "STARTED" => Ok(ComputationState::Started),
            "SUCCESS" => Ok(ComputationState::Success),
            "FAILURE" => Ok(ComputationState::Failure),
            "EXPIRED" => Ok(ComputationState::Expired),
            _ => Err(format!("Invalid computation state: {}", s)),
        }
    }
}

/// Why a computation did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Raised intentionally by plugin logic; message is shown verbatim.
    User,
    /// Anything else; callers only see a generic message.
    Internal,
    /// Heartbeat grace period exceeded.
    Timeout,
    /// Revoked by the caller.
    Cancelled,
    /// Dispatch message dead-lettered before any worker consumed it.
    Expired,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::User => "USER",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Expired => "EXPIRED",
        }
    }

    /// Terminal state a failure of this kind lands in.
    pub fn terminal_state(&self) -> ComputationState {
        match self {
            ErrorKind::Expired => ComputationState::Expired,
            _ => ComputationState::Failure,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USER" => Ok(ErrorKind::User),
            "INTERNAL" => Ok(ErrorKind::Internal),
            "TIMEOUT" => Ok(ErrorKind::Timeout),
            "CANCELLED" => Ok(ErrorKind::Cancelled),
            "EXPIRED" => Ok(ErrorKind::Expired),
            _ => Err(format!("Invalid error kind: {}", s)),
        }
    }
}

/// A terminal failure, as recorded on the computation row.
///
/// `message` is the caller-facing text; internal detail never ends up here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl ComputationFailure {
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::User,
            message: message.into(),
        }
    }

    pub fn internal() -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: defaults::INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }

    pub fn timeout(grace: Duration) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: defaults::timeout_message(grace),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: defaults::CANCELLED_BY_USER_MESSAGE.to_string(),
        }
    }

    pub fn expired() -> Self {
        Self {
            kind: ErrorKind::Expired,
            message: defaults::EXPIRED_MESSAGE.to_string(),
        }
    }

    /// Failure for a computation that finished without producing any artifact.
    ///
    /// With recorded artifact warnings the caller sees them; otherwise the
    /// outcome is treated as an internal error.
    pub fn no_artifacts(warnings: &BTreeMap<String, String>) -> Self {
        if warnings.is_empty() {
            return Self::internal();
        }
        let listed = serde_json::to_string(warnings).unwrap_or_default();
        Self::user(format!("{}{}", defaults::NO_ARTIFACTS_PREFIX, listed))
    }

    pub fn state(&self) -> ComputationState {
        self.kind.terminal_state()
    }

    /// Value of the row's `error_message`: only FAILURE carries one.
    /// EXPIRED keeps its text in the event log.
    pub fn row_message(&self) -> Option<&str> {
        match self.state() {
            ComputationState::Failure => Some(&self.message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in ComputationState::ALL.iter().filter(|s| s.is_terminal()) {
            for to in ComputationState::ALL {
                assert!(!from.can_transition(to), "{} -> {} allowed", from, to);
            }
        }
    }

    #[test]
    fn only_failures_store_a_row_message() {
        assert_eq!(ComputationFailure::user("bad AOI").row_message(), Some("bad AOI"));
        assert!(ComputationFailure::cancelled().row_message().is_some());
        assert_eq!(ComputationFailure::expired().row_message(), None);
    }

    #[test]
    fn timeout_message_keeps_sub_second_grace() {
        let failure = ComputationFailure::timeout(Duration::from_millis(200));
        assert!(failure.message.ends_with("within 0.2s"), "{}", failure.message);
        let failure = ComputationFailure::timeout(Duration::from_secs(30));
        assert!(failure.message.ends_with("within 30s"), "{}", failure.message);
    }

    #[test]
    fn graph_edges() {
        use ComputationState::*;
        assert!(Queued.can_transition(Started));
        assert!(Queued.can_transition(Expired));
        assert!(Started.can_transition(Success));
        assert!(Started.can_transition(Failure));
        assert!(!Started.can_transition(Expired));
        assert!(!Queued.can_transition(Success));
        assert!(!Started.can_transition(Queued));
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in ComputationState::ALL {
            assert_eq!(state.as_str().parse::<ComputationState>().unwrap(), state);
        }
        assert!("RUNNING".parse::<ComputationState>().is_err());
    }

    #[test]
    fn serde_uses_screaming_case() {
        let json = serde_json::to_string(&ComputationState::Started).unwrap();
        assert_eq!(json, "\"STARTED\"");
    }

    #[test]
    fn no_artifacts_without_warnings_is_internal() {
        let failure = ComputationFailure::no_artifacts(&BTreeMap::new());
        assert_eq!(failure.kind, ErrorKind::Internal);
        assert_eq!(failure.message, defaults::INTERNAL_ERROR_MESSAGE);
    }

    #[test]
    fn no_artifacts_lists_warnings() {
        let mut warnings = BTreeMap::new();
        warnings.insert("Heat map".to_string(), "AOI too small".to_string());
        let failure = ComputationFailure::no_artifacts(&warnings);
        assert_eq!(failure.kind, ErrorKind::User);
        assert!(failure.message.contains("\"Heat map\":\"AOI too small\""));
    }

    #[test]
    fn expired_kind_lands_in_expired_state() {
        assert_eq!(ComputationFailure::expired().state(), ComputationState::Expired);
        assert_eq!(ComputationFailure::cancelled().state(), ComputationState::Failure);
    }
}
