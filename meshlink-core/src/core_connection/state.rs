/*
    Connection state machine

    Init -> Offering | Answering -> Connected -> Disconnected | Failed -> Closed

    Disconnected and Failed may return to Connected while the grace period
    runs. Closed is terminal; a new `open` starts a fresh connection.
*/

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Init,
    Offering,
    Answering,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Init => "init",
            ConnectionState::Offering => "offering",
            ConnectionState::Answering => "answering",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// States that schedule the grace-period re-check
    pub fn is_degraded(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if next == Closed {
            return *self != Closed;
        }
        match self {
            Init => matches!(next, Offering | Answering | Failed),
            Offering | Answering => matches!(next, Connected | Disconnected | Failed),
            Connected => matches!(next, Disconnected | Failed),
            Disconnected => matches!(next, Connected | Failed),
            Failed => matches!(next, Connected),
            Closed => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
