//! Permission levels and their deterministic resolution

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use super::{GroupRole, User};
use crate::application::errors::BotError;

/// Permission level of a message sender, always within `0..=6`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PermissionLevel(u8);

impl PermissionLevel {
    pub const MIN: PermissionLevel = PermissionLevel(0);
    pub const MAX: PermissionLevel = PermissionLevel(6);
    pub const MASTER: PermissionLevel = PermissionLevel(5);

    pub fn new(level: u8) -> Result<Self, BotError> {
        if level > Self::MAX.0 {
            return Err(BotError::validation(format!(
                "permission level {} is outside 0..6",
                level
            )));
        }
        Ok(Self(level))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive `[min, max]` range a command accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionRange {
    pub min: PermissionLevel,
    pub max: PermissionLevel,
}

impl PermissionRange {
    pub fn new(min: u8, max: u8) -> Result<Self, BotError> {
        let min = PermissionLevel::new(min)?;
        let max = PermissionLevel::new(max)?;
        if min > max {
            return Err(BotError::validation(format!(
                "permission range {}..{} is empty",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn everyone() -> Self {
        Self {
            min: PermissionLevel::MIN,
            max: PermissionLevel::MAX,
        }
    }

    pub fn contains(&self, level: PermissionLevel) -> bool {
        self.min <= level && level <= self.max
    }
}

impl Default for PermissionRange {
    fn default() -> Self {
        Self::everyone()
    }
}

impl fmt::Display for PermissionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.min, self.max)
    }
}

/// Inputs needed to resolve a sender's level for one account
#[derive(Debug, Clone, Default)]
pub struct PermissionPolicy {
    pub maintainers: HashSet<String>,
    pub masters: HashSet<String>,
    pub high_activity: u32,
    pub low_activity: u32,
}

impl PermissionPolicy {
    /// First match wins: maintainer, master, owner, admin, high then low activity.
    pub fn resolve(&self, user: &User, in_group: bool) -> PermissionLevel {
        let level = if self.maintainers.contains(&user.id) {
            6
        } else if self.masters.contains(&user.id) {
            5
        } else if in_group && user.role == GroupRole::Owner {
            4
        } else if in_group && user.role == GroupRole::Admin {
            3
        } else if user.activity > self.high_activity {
            2
        } else if user.activity > self.low_activity {
            1
        } else {
            0
        };
        PermissionLevel(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PermissionPolicy {
        PermissionPolicy {
            maintainers: ["1".to_string()].into_iter().collect(),
            masters: ["2".to_string()].into_iter().collect(),
            high_activity: 50,
            low_activity: 20,
        }
    }

    #[test]
    fn test_precedence_first_match_wins() {
        let p = policy();
        let maintainer = User::new("1").with_role(GroupRole::Member);
        let master_owner = User::new("2").with_role(GroupRole::Owner);
        let owner = User::new("3").with_role(GroupRole::Owner).with_activity(99);
        let admin = User::new("4").with_role(GroupRole::Admin);

        assert_eq!(p.resolve(&maintainer, true).value(), 6);
        assert_eq!(p.resolve(&master_owner, true).value(), 5);
        assert_eq!(p.resolve(&owner, true).value(), 4);
        assert_eq!(p.resolve(&admin, true).value(), 3);
    }

    #[test]
    fn test_activity_thresholds_are_strict() {
        let p = policy();
        assert_eq!(p.resolve(&User::new("9").with_activity(51), true).value(), 2);
        assert_eq!(p.resolve(&User::new("9").with_activity(50), true).value(), 1);
        assert_eq!(p.resolve(&User::new("9").with_activity(21), true).value(), 1);
        assert_eq!(p.resolve(&User::new("9").with_activity(20), true).value(), 0);
    }

    #[test]
    fn test_roles_ignored_in_private_chat() {
        let p = policy();
        let owner = User::new("3").with_role(GroupRole::Owner);
        assert_eq!(p.resolve(&owner, false).value(), 0);
    }

    #[test]
    fn test_range_validation() {
        assert!(PermissionRange::new(3, 6).is_ok());
        assert!(PermissionRange::new(5, 3).is_err());
        assert!(PermissionRange::new(0, 7).is_err());

        let range = PermissionRange::new(3, 5).unwrap();
        assert!(!range.contains(PermissionLevel::new(2).unwrap()));
        assert!(range.contains(PermissionLevel::new(3).unwrap()));
        assert!(!range.contains(PermissionLevel::new(6).unwrap()));
        assert_eq!(range.to_string(), "3..5");
    }
}
