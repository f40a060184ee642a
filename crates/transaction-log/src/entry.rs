use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{ProcessHandle, ResourceId, Xid};
use serde::{Deserialize, Serialize};

/// Slack added to a deadline so the coordinator never times out a
/// transaction before its owner does.
const DEADLINE_GRACE: Duration = Duration::from_secs(1);

/// What the log knows about a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogState {
    /// Begun; no decision yet.
    Begin,
    /// Every resource voted ok and the decision to commit is durable.
    Prepared,
    /// The deadline passed and the transaction is being rolled back.
    Timeout,
}

impl LogState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogState::Begin => "begin",
            LogState::Prepared => "prepared",
            LogState::Timeout => "timeout",
        }
    }
}

impl std::str::FromStr for LogState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "begin" => Ok(LogState::Begin),
            "prepared" => Ok(LogState::Prepared),
            "timeout" => Ok(LogState::Timeout),
            other => Err(format!("unknown log state '{other}'")),
        }
    }
}

impl std::fmt::Display for LogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transaction as recorded in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub xid: Xid,
    pub owner: ProcessHandle,
    pub state: LogState,
    /// Resources that must be driven to the decision on recovery.
    pub resources: Vec<ResourceId>,
    pub started: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

impl LogEntry {
    /// A begin fact, with a deadline when the transaction has a timeout.
    pub fn begin(xid: Xid, owner: ProcessHandle, timeout: Option<Duration>) -> Self {
        let now = Utc::now();
        let deadline = timeout
            .map(|t| t + DEADLINE_GRACE)
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| now + t);
        Self {
            xid,
            owner,
            state: LogState::Begin,
            resources: Vec::new(),
            started: now,
            updated: now,
            deadline,
        }
    }

    /// A prepared fact for a transaction that was never begun in the log.
    pub fn prepared(xid: Xid, owner: ProcessHandle, resources: Vec<ResourceId>) -> Self {
        let now = Utc::now();
        Self {
            xid,
            owner,
            state: LogState::Prepared,
            resources,
            started: now,
            updated: now,
            deadline: None,
        }
    }

    /// True once the deadline is behind `now`.
    pub fn passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline < now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_without_timeout_has_no_deadline() {
        let entry = LogEntry::begin(Xid::new(), ProcessHandle::new(1, 1), None);
        assert_eq!(entry.state, LogState::Begin);
        assert!(entry.deadline.is_none());
        assert!(!entry.passed(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn deadline_includes_grace_period() {
        let entry = LogEntry::begin(
            Xid::new(),
            ProcessHandle::new(1, 1),
            Some(Duration::from_secs(10)),
        );
        let deadline = entry.deadline.unwrap();
        assert_eq!(deadline - entry.started, chrono::Duration::seconds(11));
        assert!(!entry.passed(entry.started + chrono::Duration::seconds(10)));
        assert!(entry.passed(entry.started + chrono::Duration::seconds(12)));
    }

    #[test]
    fn state_parses_its_own_names() {
        for state in [LogState::Begin, LogState::Prepared, LogState::Timeout] {
            assert_eq!(state.as_str().parse::<LogState>(), Ok(state));
        }
        assert!("committed".parse::<LogState>().is_err());
    }
}
