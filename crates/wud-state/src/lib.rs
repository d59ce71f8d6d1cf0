//! The seven-state work-unit lattice and its transition guard.
//!
//! `AVAILABLE -> ASSIGNED -> {RECEIVED_OK, RECEIVED_ERROR} -> {VERIFIED_OK,
//! VERIFIED_ERROR}`, with `CANCELLED` reachable from any non-terminal state.
//! Status never regresses; every status-changing operation in `wud-db`
//! checks the guard here before writing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Integer values match the original `WuStatus` constants so the on-disk
/// representation (an `INTEGER` column) and any external tooling that
/// speaks the old numeric codes stay compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum WuStatus {
    Available = 0,
    Assigned = 1,
    ReceivedOk = 2,
    ReceivedError = 3,
    VerifiedOk = 4,
    VerifiedError = 5,
    Cancelled = 6,
}

impl WuStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        Some(match v {
            0 => WuStatus::Available,
            1 => WuStatus::Assigned,
            2 => WuStatus::ReceivedOk,
            3 => WuStatus::ReceivedError,
            4 => WuStatus::VerifiedOk,
            5 => WuStatus::VerifiedError,
            6 => WuStatus::Cancelled,
            _ => return None,
        })
    }

    /// Terminal states admit no further transition, including to `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WuStatus::VerifiedOk | WuStatus::VerifiedError | WuStatus::Cancelled
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected status {expected:?}, found {actual:?}")]
pub struct StateViolation {
    pub expected: WuStatus,
    pub actual: WuStatus,
}

/// Guard for a status-changing operation: fail with `StateViolation` unless
/// `actual == expected`. Every `WuAccess` mutation other than `cancel` calls
/// this before writing.
pub fn expect_status(actual: WuStatus, expected: WuStatus) -> Result<(), StateViolation> {
    if actual == expected {
        Ok(())
    } else {
        Err(StateViolation { expected, actual })
    }
}

/// `cancel` is legal from any non-terminal state; a no-op on terminal rows.
pub fn can_cancel(actual: WuStatus) -> bool {
    !actual.is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_i64() {
        for s in [
            WuStatus::Available,
            WuStatus::Assigned,
            WuStatus::ReceivedOk,
            WuStatus::ReceivedError,
            WuStatus::VerifiedOk,
            WuStatus::VerifiedError,
            WuStatus::Cancelled,
        ] {
            assert_eq!(WuStatus::from_i64(s.as_i64()), Some(s));
        }
    }

    #[test]
    fn unknown_code_is_none() {
        assert_eq!(WuStatus::from_i64(42), None);
    }

    #[test]
    fn guard_rejects_mismatch() {
        let err = expect_status(WuStatus::Assigned, WuStatus::Available).unwrap_err();
        assert_eq!(err.expected, WuStatus::Available);
        assert_eq!(err.actual, WuStatus::Assigned);
    }

    #[test]
    fn cancel_allowed_from_non_terminal_only() {
        assert!(can_cancel(WuStatus::Available));
        assert!(can_cancel(WuStatus::Assigned));
        assert!(can_cancel(WuStatus::ReceivedOk));
        assert!(!can_cancel(WuStatus::VerifiedOk));
        assert!(!can_cancel(WuStatus::VerifiedError));
        assert!(!can_cancel(WuStatus::Cancelled));
    }
}
