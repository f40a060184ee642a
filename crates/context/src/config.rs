//! Transaction context settings.

use std::time::Duration;

use manager::ResourceConfig;
use serde::{Deserialize, Serialize};

use crate::TxError;

/// What happens to the transaction stack after a commit or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    /// The finished transaction is replaced by no transaction.
    #[default]
    Unchained,
    /// A new transaction begins right away.
    Chained,
    /// Begin nests; finishing resumes the enclosing transaction.
    Stacked,
}

impl TryFrom<i64> for Control {
    type Error = TxError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Control::Unchained),
            1 => Ok(Control::Chained),
            2 => Ok(Control::Stacked),
            other => Err(TxError::Argument(format!(
                "control has invalid value {other}"
            ))),
        }
    }
}

/// When a distributed commit returns to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitReturn {
    /// After every resource has committed.
    #[default]
    Completed,
    /// As soon as the commit decision is logged.
    DecisionLogged,
}

impl TryFrom<i64> for CommitReturn {
    type Error = TxError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(CommitReturn::Completed),
            1 => Ok(CommitReturn::DecisionLogged),
            other => Err(TxError::Argument(format!(
                "commit return has invalid value {other}"
            ))),
        }
    }
}

/// Context settings. `resources` must list the same resources, in the same
/// order, as the transaction manager's configuration: both number them from
/// one in that order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Timeout for new transactions; `None` means no timeout.
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub control: Control,
    #[serde(default)]
    pub commit_return: CommitReturn,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

impl ContextConfig {
    pub fn with_resources(mut self, resources: Vec<ResourceConfig>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_control(mut self, control: Control) -> Self {
        self.control = control;
        self
    }

    pub fn with_commit_return(mut self, commit_return: CommitReturn) -> Self {
        self.commit_return = commit_return;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_from_raw() {
        assert_eq!(Control::try_from(0).unwrap(), Control::Unchained);
        assert_eq!(Control::try_from(1).unwrap(), Control::Chained);
        assert_eq!(Control::try_from(2).unwrap(), Control::Stacked);
        assert!(matches!(Control::try_from(3), Err(TxError::Argument(_))));
        assert!(matches!(Control::try_from(-1), Err(TxError::Argument(_))));
    }

    #[test]
    fn commit_return_from_raw() {
        assert_eq!(CommitReturn::try_from(0).unwrap(), CommitReturn::Completed);
        assert_eq!(
            CommitReturn::try_from(1).unwrap(),
            CommitReturn::DecisionLogged
        );
        assert!(matches!(
            CommitReturn::try_from(7),
            Err(TxError::Argument(_))
        ));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: ContextConfig = serde_json::from_str(
            r#"{ "control": "stacked", "resources": [{ "key": "memory", "name": "orders" }] }"#,
        )
        .unwrap();

        assert_eq!(config.control, Control::Stacked);
        assert_eq!(config.commit_return, CommitReturn::Completed);
        assert_eq!(config.timeout, None);
        assert_eq!(config.resources[0].instances, 1);
    }
}
