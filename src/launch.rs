use crate::account::AccountLevel;
use crate::catalog::VersionEntry;
use crate::config::{Config, UnknownGamemode};
use crate::options::{OptionList, parse_bool, split_list};
use crate::ports::PortAllocator;
use crate::store::{Persistence, WadDigest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_SKILL: u8 = 3;
pub const MAX_SKILL: u8 = 4;

/// Integer bitmask options, emitted as `+<name> N` when nonzero.
pub const BITMASK_FLAGS: &[&str] = &[
    "dmflags",
    "dmflags2",
    "zadmflags",
    "compatflags",
    "zacompatflags",
];

/// Named on/off toggles, emitted as `+sv_<name> 0|1`.
pub const TOGGLE_FLAGS: &[&str] = &[
    "dmfarspawn",
    "callvote_scorelimit",
    "callvote_fraglimit",
    "callvote_restart",
    "callvote_randpickup",
    "callvote_randcaps",
    "callvote_randmap",
    "callvote_nextmap",
    "callvote_map",
    "callvote_forcestart",
    "callvote_forcespec",
    "callvote_kick",
    "callvote_coinflip",
    "vote_specvote",
    "vote_speccall",
    "vote_countabs",
    "unblockplayers",
    "forcerespawn",
    "allowshowspawns",
    "allowwidescreen",
    "allowpwo",
    "allowredscreen",
    "allowmovebob",
    "sharekeys",
    "keepkeys",
    "weaponstay",
    "nomonsters",
    "monstersrespawn",
    "respawnsuper",
    "itemsrespawn",
    "infiniteammo",
    "fragexitswitch",
    "allowtargetnames",
    "freelook",
    "forcewater",
    "doubleammo",
    "allowjump",
    "allowexit",
    "friendlyfire",
];

const IWAD_PREFIX: &str = "iwad:";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Reasons a hosting request is rejected before anything is spawned.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum LaunchError {
    #[error("unknown option `{0}`")]
    UnknownOption(String),
    #[error("invalid version `{0}`")]
    UnknownVersion(String),
    #[error("invalid iwad `{0}`")]
    UnknownIwad(String),
    #[error("unknown gamemode `{0}`")]
    UnknownGamemode(String),
    #[error("skill must be between 0-4, got `{0}`")]
    InvalidSkill(String),
    #[error("{flag} must be a non-negative integer, got `{value}`")]
    InvalidFlag { flag: String, value: String },
    #[error("you did not input a valid port: `{0}`")]
    InvalidPort(String),
    #[error("port {0} is already in use")]
    PortInUse(u16),
    #[error("config file `{0}` does not exist")]
    MissingConfig(String),
    #[error("file `{0}` does not exist")]
    MissingWad(String),
    #[error("could not read `{name}`: {reason}")]
    Unreadable { name: String, reason: String },
    #[error("you are missing an iwad")]
    IwadRequired,
    #[error("you are missing the hostname")]
    HostnameRequired,
    #[error("wad {wad} matches blacklist {entry} with reason: \"{reason}\" (hash: {hash})")]
    Blacklisted {
        wad: String,
        entry: String,
        reason: String,
        hash: String,
    },
    #[error("could not verify wad hashes: {0}")]
    HashCheckFailed(String),
    #[error("Global server limit has been reached.")]
    CapacityReached,
}

// ---------------------------------------------------------------------------
// Gamemode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gamemode {
    Deathmatch,
    Ctf,
    Teamplay,
    Terminator,
    Possession,
    TeamPossession,
    LastManStanding,
    TeamLms,
    Skulltag,
    Duel,
    Teamgame,
    Domination,
    Cooperative,
    Survival,
    Invasion,
    OneFlagCtf,
}

impl Gamemode {
    pub fn from_alias(alias: &str) -> Option<Self> {
        let mode = match alias.trim().to_lowercase().as_str() {
            "deathmatch" | "dm" | "ffa" => Gamemode::Deathmatch,
            "ctf" | "capturetheflag" => Gamemode::Ctf,
            "tdm" | "teamdm" | "tdeathmatch" | "teamdeathmatch" | "teamplay" => Gamemode::Teamplay,
            "term" | "terminator" => Gamemode::Terminator,
            "pos" | "possession" => Gamemode::Possession,
            "tpos" | "teampossession" => Gamemode::TeamPossession,
            "lms" | "lastmanstanding" => Gamemode::LastManStanding,
            "tlms" | "teamlms" | "teamlastmanstanding" => Gamemode::TeamLms,
            "skulltag" | "st" => Gamemode::Skulltag,
            "duel" => Gamemode::Duel,
            "teamgame" => Gamemode::Teamgame,
            "domination" | "dom" => Gamemode::Domination,
            "coop" | "co-op" | "cooperative" => Gamemode::Cooperative,
            "survival" => Gamemode::Survival,
            "inv" | "invasion" => Gamemode::Invasion,
            "ofctf" | "oneflagctf" => Gamemode::OneFlagCtf,
            _ => return None,
        };
        Some(mode)
    }

    /// Console variable that enables this mode.
    pub fn cvar(self) -> &'static str {
        match self {
            Gamemode::Deathmatch => "deathmatch",
            Gamemode::Ctf => "ctf",
            Gamemode::Teamplay => "teamplay",
            Gamemode::Terminator => "terminator",
            Gamemode::Possession => "possession",
            Gamemode::TeamPossession => "teampossession",
            Gamemode::LastManStanding => "lastmanstanding",
            Gamemode::TeamLms => "teamlms",
            Gamemode::Skulltag => "skulltag",
            Gamemode::Duel => "duel",
            Gamemode::Teamgame => "teamgame",
            Gamemode::Domination => "domination",
            Gamemode::Cooperative => "cooperative",
            Gamemode::Survival => "survival",
            Gamemode::Invasion => "invasion",
            Gamemode::OneFlagCtf => "oneflagctf",
        }
    }
}

/// Resolve an iwad alias such as `doom2` or `freedoom` to its file name.
pub fn iwad_alias(value: &str) -> Option<&'static str> {
    let name = match value.trim().to_lowercase().as_str() {
        "doom2" | "doom2.wad" => "doom2.wad",
        "doom" | "doom.wad" => "doom.wad",
        "tnt" | "tnt.wad" => "tnt.wad",
        "plutonia" | "plutonia.wad" => "plutonia.wad",
        "heretic" | "heretic.wad" => "heretic.wad",
        "hexen" | "hexen.wad" => "hexen.wad",
        "strife1" | "strife1.wad" => "strife1.wad",
        "sharewaredoom" | "doom1" | "doom1.wad" => "doom1.wad",
        "harmony" | "harm1" | "harmony.wad" | "harm1.wad" => "harm1.wad",
        "hacx" | "hacx.wad" => "hacx.wad",
        "chex3" | "chex3.wad" => "chex3.wad",
        "megaman" | "megagame" | "megagame.wad" => "megagame.wad",
        "freedm" | "freedm.wad" => "freedm.wad",
        "freedoom" | "freedoom.wad" | "freedoom2" | "freedoom2.wad" => "freedoom2.wad",
        "freedoom1" | "freedoom1.wad" => "freedoom1.wad",
        "nerve" | "nerve.wad" => "nerve.wad",
        "rott" | "rotttc" | "rotttcfull" | "rott_tc" | "rott_tc_full" | "rott_tc_full.pk3" => {
            "rott_tc_full.pk3"
        }
        _ => return None,
    };
    Some(name)
}

/// Strip path separators so a file name cannot leave its directory.
pub fn clean_file_name(value: &str) -> String {
    value.replace(['/', '\\'], "").trim().to_string()
}

// ---------------------------------------------------------------------------
// LaunchSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WadLocation {
    WadDir,
    IwadDir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WadRef {
    pub name: String,
    pub location: WadLocation,
}

impl WadRef {
    pub fn wad(name: &str) -> Self {
        Self {
            name: name.to_string(),
            location: WadLocation::WadDir,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FlagValue {
    Mask(u32),
    Toggle(bool),
}

/// Unique id and the passwords derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub id: String,
    pub rcon_password: String,
    pub connect_password: String,
}

impl Credentials {
    /// rcon gets the first half of the id, connect/join the second.
    pub fn from_id(id: String) -> Self {
        let half = id.len() / 2;
        let rcon_password = id[..half].to_string();
        let connect_password = id[half..].to_string();
        Self {
            id,
            rcon_password,
            connect_password,
        }
    }

    pub fn generate() -> Self {
        Self::from_id(generate_id())
    }
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 32 hex chars from a SHA-256 over the clock, a counter and the pid.
pub fn generate_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(ID_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Fully resolved, immutable description of how to start an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub owner: String,
    pub owner_level: AccountLevel,
    pub requested_port: Option<u16>,
    pub version: VersionEntry,
    pub iwad: String,
    pub wads: Vec<WadRef>,
    pub optional_wads: Vec<String>,
    pub maps: Vec<String>,
    pub gamemode: Option<Gamemode>,
    pub skill: Option<u8>,
    pub flags: BTreeMap<String, FlagValue>,
    pub instagib: bool,
    pub buckshot: bool,
    pub config: Option<String>,
    pub include_data: bool,
    pub auto_restart: bool,
    pub hostname: String,
    pub credentials: Credentials,
    /// The raw options this launch was built from, kept for display and re-hosting.
    pub options: OptionList,
}

impl LaunchSpec {
    pub fn skill_or_default(&self) -> u8 {
        self.skill.unwrap_or(DEFAULT_SKILL)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Parses hosting options into a [`LaunchSpec`].
///
/// Owns everything it needs so a build can run on a blocking thread while it
/// hashes wad files.
#[derive(Clone)]
pub struct LaunchBuilder {
    config: Arc<Config>,
    store: Arc<dyn Persistence>,
    ports: PortAllocator,
    registered: HashSet<u16>,
}

#[derive(Default)]
struct Draft {
    version: Option<VersionEntry>,
    iwad: Option<String>,
    wads: Vec<WadRef>,
    optional_wads: Vec<String>,
    maps: Vec<String>,
    gamemode: Option<Gamemode>,
    skill: Option<u8>,
    flags: BTreeMap<String, FlagValue>,
    instagib: bool,
    buckshot: bool,
    config: Option<String>,
    include_data: bool,
    auto_restart: bool,
    hostname: Option<String>,
    port: Option<u16>,
}

impl LaunchBuilder {
    /// `registered` is a snapshot of the ports currently in the registry.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Persistence>,
        ports: PortAllocator,
        registered: HashSet<u16>,
    ) -> Self {
        Self {
            config,
            store,
            ports,
            registered,
        }
    }

    pub fn build(
        &self,
        owner: &str,
        owner_level: AccountLevel,
        options: &OptionList,
        requested_port: Option<u16>,
        recovering: bool,
    ) -> Result<LaunchSpec, LaunchError> {
        let mut draft = Draft {
            port: requested_port,
            ..Draft::default()
        };

        for (key, value) in options {
            self.apply_option(&mut draft, key, value)?;
        }

        let host = &self.config.host;

        let Some(iwad) = draft.iwad else {
            return Err(LaunchError::IwadRequired);
        };
        let hostname = match draft.hostname {
            Some(h) => h,
            None if host.hostname_fallback => format!("{owner}'s server"),
            None => return Err(LaunchError::HostnameRequired),
        };

        if !host.iwad_dir.join(&iwad).is_file() {
            return Err(LaunchError::MissingWad(iwad));
        }
        for wad in &draft.wads {
            if !self.wad_path(wad).is_file() {
                return Err(LaunchError::MissingWad(wad.name.clone()));
            }
        }
        for name in &draft.optional_wads {
            if !host.wad_dir.join(name).is_file() {
                return Err(LaunchError::MissingWad(name.clone()));
            }
        }

        self.check_blacklist(&draft.wads, &draft.optional_wads)?;

        if !recovering && draft.port.is_none() && !self.ports.has_capacity() {
            return Err(LaunchError::CapacityReached);
        }

        let version = draft
            .version
            .unwrap_or_else(|| self.config.catalog.default_version().clone());

        Ok(LaunchSpec {
            owner: owner.to_string(),
            owner_level,
            requested_port: draft.port,
            version,
            iwad,
            wads: draft.wads,
            optional_wads: draft.optional_wads,
            maps: draft.maps,
            gamemode: draft.gamemode,
            skill: draft.skill,
            flags: draft.flags,
            instagib: draft.instagib,
            buckshot: draft.buckshot,
            config: draft.config,
            include_data: draft.include_data,
            auto_restart: draft.auto_restart,
            hostname,
            credentials: Credentials::generate(),
            options: options.clone(),
        })
    }

    fn apply_option(&self, draft: &mut Draft, key: &str, value: &str) -> Result<(), LaunchError> {
        let host = &self.config.host;
        match key {
            "autorestart" => draft.auto_restart = parse_bool(value),
            "version" => {
                let entry = self
                    .config
                    .catalog
                    .get(value.trim())
                    .ok_or_else(|| LaunchError::UnknownVersion(value.to_string()))?;
                draft.version = Some(entry.clone());
            }
            "config" => {
                let name = clean_file_name(value).to_lowercase();
                if name.is_empty() || !host.config_dir.join(&name).is_file() {
                    return Err(LaunchError::MissingConfig(name));
                }
                draft.config = Some(name);
            }
            "data" | "stdata" => draft.include_data = parse_bool(value),
            "gamemode" => {
                draft.gamemode = Some(match Gamemode::from_alias(value) {
                    Some(mode) => mode,
                    None => match host.unknown_gamemode {
                        UnknownGamemode::Reject => {
                            return Err(LaunchError::UnknownGamemode(value.to_string()));
                        }
                        UnknownGamemode::Cooperative => {
                            tracing::debug!(gamemode = value, "unknown gamemode, using cooperative");
                            Gamemode::Cooperative
                        }
                    },
                });
            }
            "hostname" => {
                let name = value.trim();
                if !name.is_empty() {
                    draft.hostname = Some(name.to_string());
                }
            }
            "instagib" => draft.instagib = parse_bool(value),
            "buckshot" => draft.buckshot = parse_bool(value),
            "iwad" => {
                let cleaned = clean_file_name(value).to_lowercase();
                let name = match iwad_alias(&cleaned) {
                    Some(alias) => alias.to_string(),
                    None if host.iwads.iter().any(|i| i.eq_ignore_ascii_case(&cleaned)) => cleaned,
                    None => return Err(LaunchError::UnknownIwad(value.to_string())),
                };
                draft.iwad = Some(name);
            }
            "map" | "maps" => {
                draft.maps.extend(split_list(value).map(str::to_string));
            }
            "port" => {
                let port: u16 = value
                    .trim()
                    .parse()
                    .map_err(|_| LaunchError::InvalidPort(value.to_string()))?;
                if !self.ports.in_range(port) {
                    return Err(LaunchError::InvalidPort(value.to_string()));
                }
                if self.registered.contains(&port) || self.ports.is_claimed(port) {
                    return Err(LaunchError::PortInUse(port));
                }
                draft.port = Some(port);
            }
            "skill" => draft.skill = Some(parse_skill(value)?),
            "wad" | "wads" | "file" | "files" => {
                for item in split_list(value) {
                    let lowered = item.to_lowercase();
                    let wad = match lowered.strip_prefix(IWAD_PREFIX) {
                        Some(rest) => WadRef {
                            name: clean_file_name(rest),
                            location: WadLocation::IwadDir,
                        },
                        None => WadRef::wad(&clean_file_name(&lowered)),
                    };
                    if !wad.name.is_empty() {
                        draft.wads.push(wad);
                    }
                }
            }
            "optionalwad" | "optionalwads" | "optwad" | "optwads" | "opt" | "opts" | "optfile"
            | "optfiles" => {
                for item in split_list(value) {
                    let name = clean_file_name(&item.to_lowercase());
                    if !name.is_empty() && !draft.optional_wads.contains(&name) {
                        draft.optional_wads.push(name);
                    }
                }
            }
            flag if BITMASK_FLAGS.contains(&flag) => {
                let parsed: u32 = value.trim().parse().map_err(|_| LaunchError::InvalidFlag {
                    flag: flag.to_string(),
                    value: value.to_string(),
                })?;
                draft.flags.insert(flag.to_string(), FlagValue::Mask(parsed));
            }
            toggle if TOGGLE_FLAGS.contains(&toggle) => {
                draft
                    .flags
                    .insert(toggle.to_string(), FlagValue::Toggle(parse_bool(value)));
            }
            other => {
                if host.strict_options {
                    return Err(LaunchError::UnknownOption(other.to_string()));
                }
                tracing::debug!(option = other, "ignoring unknown option");
            }
        }
        Ok(())
    }

    fn wad_path(&self, wad: &WadRef) -> PathBuf {
        resolve_wad(&self.config, wad)
    }

    fn check_blacklist(&self, wads: &[WadRef], optional: &[String]) -> Result<(), LaunchError> {
        let mut digests = Vec::with_capacity(wads.len() + optional.len());
        let optional_refs: Vec<WadRef> = optional.iter().map(|n| WadRef::wad(n)).collect();
        for wad in wads.iter().chain(optional_refs.iter()) {
            let hash = hash_file(&self.wad_path(wad)).map_err(|e| LaunchError::Unreadable {
                name: wad.name.clone(),
                reason: e.to_string(),
            })?;
            digests.push(WadDigest {
                name: wad.name.clone(),
                hash,
            });
        }
        if digests.is_empty() {
            return Ok(());
        }

        match self.store.check_hash_blacklist(&digests) {
            Ok(None) => Ok(()),
            Ok(Some(hit)) => Err(LaunchError::Blacklisted {
                wad: hit.wad,
                entry: hit.entry,
                reason: hit.reason,
                hash: hit.hash,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "hash blacklist lookup failed");
                Err(LaunchError::HashCheckFailed(e.to_string()))
            }
        }
    }
}

/// Where a wad lives on disk.
pub fn resolve_wad(config: &Config, wad: &WadRef) -> PathBuf {
    match wad.location {
        WadLocation::WadDir => config.host.wad_dir.join(&wad.name),
        WadLocation::IwadDir => config.host.iwad_dir.join(&wad.name),
    }
}

pub fn parse_skill(value: &str) -> Result<u8, LaunchError> {
    match value.trim().parse::<u8>() {
        Ok(skill) if skill <= MAX_SKILL => Ok(skill),
        _ => Err(LaunchError::InvalidSkill(value.to_string())),
    }
}

pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Remove later duplicates, keeping the first occurrence of each name.
pub fn dedup_preserving_order(wads: Vec<WadRef>) -> Vec<WadRef> {
    let mut seen = HashSet::new();
    wads.into_iter()
        .filter(|w| seen.insert(w.name.clone()))
        .collect()
}
