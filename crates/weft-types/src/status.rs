use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TypeError, TypeResult};

/// Wire values at or below this threshold denote an unrecoverable failure.
///
/// Receivers of a collective status broadcast abort locally whenever the
/// coordinator's status word is at or below this value.
pub const REMOTE_FAILURE_THRESHOLD: i64 = -4;

const WIRE_COMPLETE: i64 = 0;
const WIRE_INCOMPLETE: i64 = -1;
const WIRE_SHORT_CIRCUIT: i64 = -2;
/// Store-originated codes are offset below this base on the wire.
const WIRE_STORE_BASE: i64 = -1000;

/// Why a request failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// The underlying store call returned this (positive) error number.
    Store(u32),
    /// A prepare callback found invalid arguments.
    BadValue,
    /// A collective peer reported a failure that could not be decoded.
    Remote,
    /// The broadcast primitive failed.
    Messaging,
    /// Buffer or private-data allocation failed.
    Resource,
    /// The task engine rejected a task.
    Engine,
    /// Closing a handle failed.
    Close,
    /// A user-supplied callback failed.
    Callback,
    /// The request was canceled.
    Canceled,
    /// A broadcast delivered a different length than expected.
    Truncated,
}

impl FailureCode {
    /// Signed wire form. Always at or below [`REMOTE_FAILURE_THRESHOLD`].
    pub fn to_wire(self) -> i64 {
        match self {
            FailureCode::BadValue => -4,
            FailureCode::Remote => -5,
            FailureCode::Messaging => -6,
            FailureCode::Resource => -7,
            FailureCode::Engine => -8,
            FailureCode::Close => -9,
            FailureCode::Callback => -10,
            FailureCode::Canceled => -11,
            FailureCode::Truncated => -12,
            FailureCode::Store(code) => WIRE_STORE_BASE - i64::from(code),
        }
    }

    /// Decode a wire value produced by [`FailureCode::to_wire`].
    pub fn from_wire(word: i64) -> TypeResult<Self> {
        let code = match word {
            -4 => FailureCode::BadValue,
            -5 => FailureCode::Remote,
            -6 => FailureCode::Messaging,
            -7 => FailureCode::Resource,
            -8 => FailureCode::Engine,
            -9 => FailureCode::Close,
            -10 => FailureCode::Callback,
            -11 => FailureCode::Canceled,
            -12 => FailureCode::Truncated,
            w if w <= WIRE_STORE_BASE => {
                let store = u32::try_from(WIRE_STORE_BASE - w)
                    .map_err(|_| TypeError::InvalidStatus(word))?;
                FailureCode::Store(store)
            }
            _ => return Err(TypeError::InvalidStatus(word)),
        };
        Ok(code)
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCode::Store(code) => write!(f, "store error {code}"),
            FailureCode::BadValue => f.write_str("invalid argument"),
            FailureCode::Remote => f.write_str("failure on a remote participant"),
            FailureCode::Messaging => f.write_str("messaging failure"),
            FailureCode::Resource => f.write_str("resource allocation failure"),
            FailureCode::Engine => f.write_str("task engine failure"),
            FailureCode::Close => f.write_str("failed to close handle"),
            FailureCode::Callback => f.write_str("callback failure"),
            FailureCode::Canceled => f.write_str("canceled"),
            FailureCode::Truncated => f.write_str("truncated broadcast"),
        }
    }
}

/// Overall status of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Work is still in flight.
    Incomplete,
    /// Iteration asked to stop early; cleanup is still draining.
    ShortCircuit,
    /// Every step succeeded.
    Complete,
    /// A step failed. Sticky: later steps never overwrite it.
    Failed(FailureCode),
}

impl Status {
    /// Returns `true` once a failure has been recorded.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Status::Failed(_))
    }

    /// Returns `true` while the request has not reached a terminal state.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Status::Incomplete | Status::ShortCircuit)
    }

    pub fn failure(&self) -> Option<FailureCode> {
        match self {
            Status::Failed(code) => Some(*code),
            _ => None,
        }
    }

    /// Machine-word form used by the collective status broadcast.
    pub fn to_wire(self) -> i64 {
        match self {
            Status::Complete => WIRE_COMPLETE,
            Status::Incomplete => WIRE_INCOMPLETE,
            Status::ShortCircuit => WIRE_SHORT_CIRCUIT,
            Status::Failed(code) => code.to_wire(),
        }
    }

    /// Decode a status word. Non-negative words are completion codes.
    pub fn from_wire(word: i64) -> TypeResult<Self> {
        match word {
            w if w >= WIRE_COMPLETE => Ok(Status::Complete),
            WIRE_INCOMPLETE => Ok(Status::Incomplete),
            WIRE_SHORT_CIRCUIT => Ok(Status::ShortCircuit),
            w if w <= REMOTE_FAILURE_THRESHOLD => FailureCode::from_wire(w).map(Status::Failed),
            w => Err(TypeError::InvalidStatus(w)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Incomplete => f.write_str("incomplete"),
            Status::ShortCircuit => f.write_str("short-circuited"),
            Status::Complete => f.write_str("complete"),
            Status::Failed(code) => write!(f, "failed: {code}"),
        }
    }
}

/// Error outcome of a single task.
///
/// Only [`TaskError::Failed`] is ever recorded on a request; the other two
/// variants mark tasks that deliberately skipped their operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskError {
    /// The task completed early without error (e.g. nothing left to do).
    ShortCircuit,
    /// A previous step of the same request already failed.
    Propagated,
    /// The task's own operation failed.
    Failed(FailureCode),
}

impl TaskError {
    /// The failure worth recording on the request, if any.
    pub fn recordable(&self) -> Option<FailureCode> {
        match self {
            TaskError::Failed(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<FailureCode> for TaskError {
    fn from(code: FailureCode) -> Self {
        TaskError::Failed(code)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::ShortCircuit => f.write_str("short-circuited"),
            TaskError::Propagated => f.write_str("previous step failed"),
            TaskError::Failed(code) => write!(f, "{code}"),
        }
    }
}

/// Result of running one task.
pub type TaskResult = Result<(), TaskError>;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn every_failure_is_at_or_below_threshold() {
        let codes = [
            FailureCode::BadValue,
            FailureCode::Remote,
            FailureCode::Messaging,
            FailureCode::Resource,
            FailureCode::Engine,
            FailureCode::Close,
            FailureCode::Callback,
            FailureCode::Canceled,
            FailureCode::Truncated,
            FailureCode::Store(0),
            FailureCode::Store(5),
        ];
        for code in codes {
            assert!(code.to_wire() <= REMOTE_FAILURE_THRESHOLD, "{code:?}");
            assert_eq!(FailureCode::from_wire(code.to_wire()).unwrap(), code);
        }
    }

    #[test]
    fn in_progress_states_are_recoverable() {
        assert!(Status::Incomplete.is_in_progress());
        assert!(Status::ShortCircuit.is_in_progress());
        assert!(!Status::ShortCircuit.is_unrecoverable());
        assert!(!Status::Complete.is_in_progress());
        assert!(Status::Failed(FailureCode::Canceled).is_unrecoverable());
    }

    #[test]
    fn positive_words_are_completion_codes() {
        assert_eq!(Status::from_wire(17).unwrap(), Status::Complete);
        assert_eq!(Status::from_wire(-2).unwrap(), Status::ShortCircuit);
    }

    #[test]
    fn reserved_word_is_rejected() {
        assert_eq!(Status::from_wire(-3), Err(TypeError::InvalidStatus(-3)));
        assert_eq!(Status::from_wire(-500), Err(TypeError::InvalidStatus(-500)));
    }

    #[test]
    fn only_failed_task_errors_are_recordable() {
        assert_eq!(TaskError::ShortCircuit.recordable(), None);
        assert_eq!(TaskError::Propagated.recordable(), None);
        assert_eq!(
            TaskError::Failed(FailureCode::Close).recordable(),
            Some(FailureCode::Close)
        );
    }

    proptest! {
        #[test]
        fn store_codes_survive_the_wire(code in 0u32..1_000_000) {
            let status = Status::Failed(FailureCode::Store(code));
            prop_assert_eq!(Status::from_wire(status.to_wire()).unwrap(), status);
        }
    }
}
