use serde::{Deserialize, Serialize};

/// Privilege level of a requester, ordered from least to most privileged.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AccountLevel {
    #[default]
    None,
    Registered,
    Vip,
    Moderator,
    Admin,
}

impl AccountLevel {
    pub fn at_least(self, required: AccountLevel) -> bool {
        self >= required
    }
}

impl std::fmt::Display for AccountLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountLevel::None => write!(f, "none"),
            AccountLevel::Registered => write!(f, "registered"),
            AccountLevel::Vip => write!(f, "vip"),
            AccountLevel::Moderator => write!(f, "moderator"),
            AccountLevel::Admin => write!(f, "admin"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(AccountLevel::None < AccountLevel::Registered);
        assert!(AccountLevel::Registered < AccountLevel::Vip);
        assert!(AccountLevel::Vip < AccountLevel::Moderator);
        assert!(AccountLevel::Moderator < AccountLevel::Admin);
    }

    #[test]
    fn test_at_least() {
        assert!(AccountLevel::Admin.at_least(AccountLevel::Moderator));
        assert!(AccountLevel::Vip.at_least(AccountLevel::Vip));
        assert!(!AccountLevel::Registered.at_least(AccountLevel::Vip));
    }

    #[test]
    fn test_level_deserializes_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            level: AccountLevel,
        }
        let w: Wrapper = toml::from_str("level = \"moderator\"").unwrap();
        assert_eq!(w.level, AccountLevel::Moderator);
    }
}
