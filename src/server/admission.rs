use crate::protocol::{ErrorInfo, sql_state};

/// The fleet-wide flags admission depends on, published by the supervisor
/// whenever its state changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetSnapshot {
    /// A startup/recovery child is present.
    pub starting: bool,
    /// A shutdown of any severity is in progress.
    pub shutting_down: bool,
    /// A crash was observed and recovery has not completed.
    pub recovering: bool,
}

/// Decision for one incoming session request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ok,
    Starting,
    ShuttingDown,
    Recovering,
    Saturated,
}

impl Admission {
    pub fn is_ok(self) -> bool {
        matches!(self, Admission::Ok)
    }

    /// Stable category token for logs and tests.
    pub fn category(self) -> &'static str {
        match self {
            Admission::Ok => "OK",
            Admission::Starting => "STARTING",
            Admission::ShuttingDown => "SHUTTING_DOWN",
            Admission::Recovering => "RECOVERING",
            Admission::Saturated => "SATURATED",
        }
    }

    /// The error packet sent for a denied admission.
    pub fn rejection(self) -> Option<ErrorInfo> {
        let info = match self {
            Admission::Ok => return None,
            Admission::Starting => {
                ErrorInfo::fatal(sql_state::CANNOT_CONNECT_NOW, "the server is starting up")
            }
            Admission::ShuttingDown => {
                ErrorInfo::fatal(sql_state::CANNOT_CONNECT_NOW, "the server is shutting down")
            }
            Admission::Recovering => {
                ErrorInfo::fatal(sql_state::CANNOT_CONNECT_NOW, "the server is in recovery mode")
            }
            Admission::Saturated => ErrorInfo::fatal(
                sql_state::TOO_MANY_CONNECTIONS,
                "sorry, too many clients already",
            ),
        };
        Some(info)
    }
}

/// Decide whether a new session may proceed.
///
/// `children` counts every live worker child, including ones still in the
/// unauthenticated handshake phase, against the soft cap of twice the
/// configured maximum; the exact maximum is enforced again when a worker
/// joins shared session state.
pub fn assess(fleet: FleetSnapshot, children: usize, soft_cap: usize) -> Admission {
    if fleet.shutting_down {
        return Admission::ShuttingDown;
    }
    if fleet.starting {
        return Admission::Starting;
    }
    if fleet.recovering {
        return Admission::Recovering;
    }
    if children >= soft_cap {
        return Admission::Saturated;
    }
    Admission::Ok
}
