//! Request progress status carried in response envelopes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Progress of a request, reported in each response envelope.
///
/// `Completed` and `Failed` are terminal; a waiter keeps waiting through any
/// number of `Pending` or `Delivered` updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The request has not yet been handed to its handler
    #[default]
    Pending,
    /// The request was delivered to the handling agent
    Delivered,
    /// The request completed; `error` is empty
    Completed,
    /// The request failed; `error` holds the reason
    Failed,
}

impl Status {
    /// Whether this status ends the request lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    /// The wire string of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Delivered => "delivered",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(Status::Completed.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Delivered.is_terminal());
    }
}
