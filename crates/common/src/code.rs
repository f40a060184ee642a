//! XA status codes and vote aggregation.

use serde::{Deserialize, Serialize};

/// Every status a resource manager (or the coordinator on its behalf) can
/// report.
///
/// Variants are declared from most to least severe; [`XaCode::severity`]
/// relies on that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XaCode {
    HeuristicHazard,
    HeuristicMixed,
    HeuristicCommit,
    HeuristicRollback,
    ResourceFail,
    ResourceError,
    RollbackIntegrity,
    RollbackCommFail,
    Rollback,
    RollbackOther,
    RollbackDeadlock,
    Protocol,
    RollbackProtocol,
    RollbackTimeout,
    RollbackTransient,
    Invalid,
    NoMigrate,
    Outside,
    Async,
    Retry,
    DuplicateId,
    NotA,
    Ok,
    ReadOnly,
}

/// Coarse classification used when combining votes.
///
/// Ordered by precedence: an error beats a rollback, which beats ok, which
/// beats read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CodeClass {
    ReadOnly,
    Ok,
    Rollback,
    Error,
}

impl XaCode {
    /// The numeric value defined by the XA standard.
    pub fn raw(self) -> i32 {
        match self {
            XaCode::Ok => 0,
            XaCode::ReadOnly => 3,
            XaCode::Retry => 4,
            XaCode::HeuristicMixed => 5,
            XaCode::HeuristicRollback => 6,
            XaCode::HeuristicCommit => 7,
            XaCode::HeuristicHazard => 8,
            XaCode::NoMigrate => 9,
            XaCode::Rollback => 100,
            XaCode::RollbackCommFail => 101,
            XaCode::RollbackDeadlock => 102,
            XaCode::RollbackIntegrity => 103,
            XaCode::RollbackOther => 104,
            XaCode::RollbackProtocol => 105,
            XaCode::RollbackTimeout => 106,
            XaCode::RollbackTransient => 107,
            XaCode::Async => -2,
            XaCode::ResourceError => -3,
            XaCode::NotA => -4,
            XaCode::Invalid => -5,
            XaCode::Protocol => -6,
            XaCode::ResourceFail => -7,
            XaCode::DuplicateId => -8,
            XaCode::Outside => -9,
        }
    }

    /// The symbolic name used by the XA standard.
    pub fn name(self) -> &'static str {
        match self {
            XaCode::Ok => "XA_OK",
            XaCode::ReadOnly => "XA_RDONLY",
            XaCode::Retry => "XA_RETRY",
            XaCode::HeuristicMixed => "XA_HEURMIX",
            XaCode::HeuristicRollback => "XA_HEURRB",
            XaCode::HeuristicCommit => "XA_HEURCOM",
            XaCode::HeuristicHazard => "XA_HEURHAZ",
            XaCode::NoMigrate => "XA_NOMIGRATE",
            XaCode::Rollback => "XA_RBROLLBACK",
            XaCode::RollbackCommFail => "XA_RBCOMMFAIL",
            XaCode::RollbackDeadlock => "XA_RBDEADLOCK",
            XaCode::RollbackIntegrity => "XA_RBINTEGRITY",
            XaCode::RollbackOther => "XA_RBOTHER",
            XaCode::RollbackProtocol => "XA_RBPROTO",
            XaCode::RollbackTimeout => "XA_RBTIMEOUT",
            XaCode::RollbackTransient => "XA_RBTRANSIENT",
            XaCode::Async => "XAER_ASYNC",
            XaCode::ResourceError => "XAER_RMERR",
            XaCode::NotA => "XAER_NOTA",
            XaCode::Invalid => "XAER_INVAL",
            XaCode::Protocol => "XAER_PROTO",
            XaCode::ResourceFail => "XAER_RMFAIL",
            XaCode::DuplicateId => "XAER_DUPID",
            XaCode::Outside => "XAER_OUTSIDE",
        }
    }

    /// Severity rank, `0` being the most severe.
    pub fn severity(self) -> u8 {
        self as u8
    }

    pub fn class(self) -> CodeClass {
        match self {
            XaCode::ReadOnly => CodeClass::ReadOnly,
            XaCode::Ok => CodeClass::Ok,
            XaCode::Rollback
            | XaCode::RollbackCommFail
            | XaCode::RollbackDeadlock
            | XaCode::RollbackIntegrity
            | XaCode::RollbackOther
            | XaCode::RollbackProtocol
            | XaCode::RollbackTimeout
            | XaCode::RollbackTransient => CodeClass::Rollback,
            _ => CodeClass::Error,
        }
    }

    /// `XA_OK` or `XA_RDONLY`.
    pub fn is_success(self) -> bool {
        matches!(self, XaCode::Ok | XaCode::ReadOnly)
    }

    /// Combines two votes: the higher class wins, and within a class the
    /// more severe code wins.
    pub fn combine(self, other: XaCode) -> XaCode {
        match self.class().cmp(&other.class()) {
            std::cmp::Ordering::Greater => self,
            std::cmp::Ordering::Less => other,
            std::cmp::Ordering::Equal => {
                if other.severity() < self.severity() {
                    other
                } else {
                    self
                }
            }
        }
    }

    /// Aggregates any number of votes. No votes at all aggregate to
    /// read-only: nothing needs to be committed.
    pub fn aggregate<I>(codes: I) -> XaCode
    where
        I: IntoIterator<Item = XaCode>,
    {
        codes
            .into_iter()
            .reduce(XaCode::combine)
            .unwrap_or(XaCode::ReadOnly)
    }
}

impl TryFrom<i32> for XaCode {
    type Error = i32;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        let code = match raw {
            0 => XaCode::Ok,
            3 => XaCode::ReadOnly,
            4 => XaCode::Retry,
            5 => XaCode::HeuristicMixed,
            6 => XaCode::HeuristicRollback,
            7 => XaCode::HeuristicCommit,
            8 => XaCode::HeuristicHazard,
            9 => XaCode::NoMigrate,
            100 => XaCode::Rollback,
            101 => XaCode::RollbackCommFail,
            102 => XaCode::RollbackDeadlock,
            103 => XaCode::RollbackIntegrity,
            104 => XaCode::RollbackOther,
            105 => XaCode::RollbackProtocol,
            106 => XaCode::RollbackTimeout,
            107 => XaCode::RollbackTransient,
            -2 => XaCode::Async,
            -3 => XaCode::ResourceError,
            -4 => XaCode::NotA,
            -5 => XaCode::Invalid,
            -6 => XaCode::Protocol,
            -7 => XaCode::ResourceFail,
            -8 => XaCode::DuplicateId,
            -9 => XaCode::Outside,
            other => return Err(other),
        };
        Ok(code)
    }
}

impl std::fmt::Display for XaCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [XaCode; 24] = [
        XaCode::HeuristicHazard,
        XaCode::HeuristicMixed,
        XaCode::HeuristicCommit,
        XaCode::HeuristicRollback,
        XaCode::ResourceFail,
        XaCode::ResourceError,
        XaCode::RollbackIntegrity,
        XaCode::RollbackCommFail,
        XaCode::Rollback,
        XaCode::RollbackOther,
        XaCode::RollbackDeadlock,
        XaCode::Protocol,
        XaCode::RollbackProtocol,
        XaCode::RollbackTimeout,
        XaCode::RollbackTransient,
        XaCode::Invalid,
        XaCode::NoMigrate,
        XaCode::Outside,
        XaCode::Async,
        XaCode::Retry,
        XaCode::DuplicateId,
        XaCode::NotA,
        XaCode::Ok,
        XaCode::ReadOnly,
    ];

    #[test]
    fn raw_values_map_back() {
        for code in ALL {
            assert_eq!(XaCode::try_from(code.raw()), Ok(code));
        }
        assert_eq!(XaCode::try_from(42), Err(42));
    }

    #[test]
    fn severity_follows_declaration_order() {
        assert!(XaCode::HeuristicHazard.severity() < XaCode::ResourceFail.severity());
        assert!(XaCode::Ok.severity() < XaCode::ReadOnly.severity());
    }

    #[test]
    fn no_votes_aggregate_to_read_only() {
        assert_eq!(XaCode::aggregate([]), XaCode::ReadOnly);
    }

    #[test]
    fn all_read_only_stays_read_only() {
        assert_eq!(
            XaCode::aggregate([XaCode::ReadOnly, XaCode::ReadOnly]),
            XaCode::ReadOnly
        );
    }

    #[test]
    fn ok_beats_read_only() {
        assert_eq!(
            XaCode::aggregate([XaCode::ReadOnly, XaCode::Ok, XaCode::ReadOnly]),
            XaCode::Ok
        );
    }

    #[test]
    fn rollback_beats_ok() {
        assert_eq!(
            XaCode::aggregate([XaCode::Ok, XaCode::RollbackDeadlock, XaCode::ReadOnly]),
            XaCode::RollbackDeadlock
        );
    }

    #[test]
    fn error_beats_everything() {
        assert_eq!(
            XaCode::aggregate([XaCode::Rollback, XaCode::Protocol, XaCode::Ok]),
            XaCode::Protocol
        );
    }

    #[test]
    fn most_severe_wins_within_a_class() {
        assert_eq!(
            XaCode::aggregate([XaCode::ResourceError, XaCode::HeuristicMixed]),
            XaCode::HeuristicMixed
        );
        assert_eq!(
            XaCode::aggregate([XaCode::RollbackTimeout, XaCode::RollbackIntegrity]),
            XaCode::RollbackIntegrity
        );
    }

    #[test]
    fn aggregation_ignores_vote_order() {
        for a in ALL {
            for b in ALL {
                assert_eq!(a.combine(b), b.combine(a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn precedence_holds_for_every_pair() {
        for a in ALL {
            for b in ALL {
                let combined = XaCode::aggregate([a, b]);
                let expected = a.class().max(b.class());
                assert_eq!(combined.class(), expected, "{a} + {b}");
            }
        }
    }
}
