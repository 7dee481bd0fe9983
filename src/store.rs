use crate::account::AccountLevel;
use crate::config::PolicySettings;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Reason reported when a ban record carries none.
pub const UNSPECIFIED_REASON: &str = "None Specified";

/// How many start records [`MemoryStore`] keeps; older ones are dropped.
pub const RECENT_STARTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WadDigest {
    pub name: String,
    /// Lowercase hex SHA-256 of the file contents.
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistHit {
    pub wad: String,
    pub entry: String,
    pub reason: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedRecord {
    pub hostname: String,
    pub id: String,
    pub owner: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Account, ban and content policy lookups the orchestration core consults.
pub trait Persistence: Send + Sync {
    fn get_quota(&self, owner: &str) -> Result<u32, StoreError>;
    fn account_level(&self, owner: &str) -> Result<AccountLevel, StoreError>;
    /// First blacklisted wad in the batch, if any.
    fn check_hash_blacklist(&self, wads: &[WadDigest]) -> Result<Option<BlacklistHit>, StoreError>;
    fn is_whitelisted(&self, ip: &str) -> Result<bool, StoreError>;
    /// Ban reason when `ip` is banned.
    fn check_banned(&self, ip: &str) -> Result<Option<String>, StoreError>;
    fn record_server_started(&self, hostname: &str, id: &str, owner: &str)
    -> Result<(), StoreError>;
}

/// Policy store backed by the `[policy]` config section.
#[derive(Debug, Default)]
pub struct MemoryStore {
    default_quota: u32,
    policy: Mutex<PolicySettings>,
    recent_starts: Mutex<VecDeque<StartedRecord>>,
}

impl MemoryStore {
    pub fn new(policy: PolicySettings, default_quota: u32) -> Self {
        Self {
            default_quota,
            policy: Mutex::new(policy),
            recent_starts: Mutex::new(VecDeque::with_capacity(RECENT_STARTS)),
        }
    }

    fn policy(&self) -> MutexGuard<'_, PolicySettings> {
        self.policy.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The last [`RECENT_STARTS`] recorded starts, oldest first.
    pub fn recent_starts(&self) -> Vec<StartedRecord> {
        self.recent_starts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Persistence for MemoryStore {
    fn get_quota(&self, owner: &str) -> Result<u32, StoreError> {
        Ok(self
            .policy()
            .quotas
            .get(owner)
            .copied()
            .unwrap_or(self.default_quota))
    }

    fn account_level(&self, owner: &str) -> Result<AccountLevel, StoreError> {
        Ok(self.policy().levels.get(owner).copied().unwrap_or_default())
    }

    fn check_hash_blacklist(&self, wads: &[WadDigest]) -> Result<Option<BlacklistHit>, StoreError> {
        let policy = self.policy();
        for wad in wads {
            if let Some(entry) = policy
                .blacklist
                .iter()
                .find(|e| e.hash.eq_ignore_ascii_case(&wad.hash))
            {
                return Ok(Some(BlacklistHit {
                    wad: wad.name.clone(),
                    entry: entry.name.clone(),
                    reason: entry.reason.clone(),
                    hash: entry.hash.clone(),
                }));
            }
        }
        Ok(None)
    }

    fn is_whitelisted(&self, ip: &str) -> Result<bool, StoreError> {
        Ok(self.policy().whitelist.iter().any(|w| w == ip))
    }

    fn check_banned(&self, ip: &str) -> Result<Option<String>, StoreError> {
        Ok(self.policy().bans.iter().find(|b| b.ip == ip).map(|b| {
            b.reason
                .clone()
                .unwrap_or_else(|| UNSPECIFIED_REASON.to_string())
        }))
    }

    fn record_server_started(
        &self,
        hostname: &str,
        id: &str,
        owner: &str,
    ) -> Result<(), StoreError> {
        tracing::info!(%hostname, %id, %owner, "server start recorded");
        let mut starts = self
            .recent_starts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if starts.len() == RECENT_STARTS {
            starts.pop_front();
        }
        starts.push_back(StartedRecord {
            hostname: hostname.to_string(),
            id: id.to_string(),
            owner: owner.to_string(),
        });
        Ok(())
    }
}
