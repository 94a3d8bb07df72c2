//! Server configuration.
//!
//! Loaded once at startup from the JSON file named by `LAGOON_IRCD_CONFIG`.
//! `SERVER_NAME` and `LAGOON_IRC_BIND` override the file; without either
//! the name falls back to the system hostname.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::crule::{self, Rule};
use super::matching::{eq_ignore_case, matches};
use super::numeric;

/// Errors from loading or validating the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid server name {0:?}")]
    BadServerName(String),
    #[error("invalid server numeric {0:?}")]
    BadNumeric(String),
    #[error("link {link}: invalid numeric range {range:?}")]
    BadNumericRange { link: String, range: [String; 2] },
    #[error("link {0} declared twice")]
    DuplicateLink(String),
}

/// What a peer is allowed to be.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkRole {
    /// May not introduce servers behind itself.
    #[default]
    Server,
    /// May introduce servers, up to `max_hops` away if set.
    Hub,
    /// Must stay a leaf; with `max_hops` it may carry servers up to that
    /// many hops away.
    Leaf,
    /// A services server: its introductions are trusted like a hub's and
    /// nobody may take its name.
    Uworld,
}

/// Which connects a rule is checked on.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Every link, in either direction.
    #[default]
    All,
    /// Automatic outbound connects only.
    Auto,
}

/// One `links` entry as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    /// Inclusive range of numerics the peer may use, e.g. `["AB", "AZ"]`.
    #[serde(default)]
    pub numerics: Option<[String; 2]>,
    #[serde(default)]
    pub role: LinkRole,
    #[serde(default)]
    pub max_hops: Option<u32>,
    #[serde(default)]
    pub rule: Option<String>,
    #[serde(default)]
    pub rule_kind: RuleKind,
    #[serde(default)]
    pub autoconnect: bool,
    /// Seconds between automatic connect attempts.
    #[serde(default = "default_connect_freq")]
    pub connect_freq: u64,
}

fn default_port() -> u16 {
    4400
}

fn default_connect_freq() -> u64 {
    300
}

/// A configured operator account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperConfig {
    pub name: String,
    pub password: String,
    /// `user@host` mask the account may be used from.
    #[serde(default = "default_oper_host")]
    pub host: String,
}

fn default_oper_host() -> String {
    "*@*".into()
}

/// A server name that may never link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JupeConfig {
    pub name: String,
    pub reason: String,
}

/// The config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub numeric: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub hub: bool,
    #[serde(default)]
    pub bind: Vec<String>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub opers: Vec<OperConfig>,
    #[serde(default)]
    pub jupes: Vec<JupeConfig>,
    /// Seconds of silence before a connection is pinged, and again before
    /// it is dropped.
    #[serde(default)]
    pub ping_freq: Option<u64>,
}

/// Validated per-peer policy.
#[derive(Debug, Clone)]
pub struct LinkPolicy {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub numerics: Option<(u32, u32)>,
    pub role: LinkRole,
    pub max_hops: Option<u32>,
    pub rule: Option<(Rule, RuleKind)>,
    pub autoconnect: bool,
    pub connect_freq: u64,
}

impl LinkPolicy {
    pub fn from_config(link: &LinkConfig) -> Result<Self, ConfigError> {
        let numerics = match &link.numerics {
            None => None,
            Some(range) => {
                let low = numeric::decode(&range[0]);
                let high = numeric::decode(&range[1]);
                match (low, high) {
                    (Some(low), Some(high)) if low <= high => Some((low, high)),
                    _ => {
                        return Err(ConfigError::BadNumericRange {
                            link: link.name.clone(),
                            range: range.clone(),
                        })
                    }
                }
            }
        };

        let mut autoconnect = link.autoconnect;
        let rule = match link.rule.as_deref() {
            None => None,
            Some(text) => match crule::parse(text) {
                Ok(rule) => Some((rule, link.rule_kind)),
                Err(e) => {
                    warn!(link = %link.name, rule = text, "{e} in rule; rule dropped, autoconnect disabled");
                    autoconnect = false;
                    None
                }
            },
        };

        Ok(Self {
            name: link.name.clone(),
            host: link.host.clone(),
            port: link.port,
            password: link.password.clone(),
            numerics,
            role: link.role,
            max_hops: link.max_hops,
            rule,
            autoconnect,
            connect_freq: link.connect_freq,
        })
    }

    /// Whether `numeric` (canonical two-character form) is inside the range.
    pub fn allows_numeric(&self, numeric: &str) -> bool {
        match (self.numerics, numeric::decode(numeric)) {
            (None, _) => true,
            (Some((low, high)), Some(n)) => (low..=high).contains(&n),
            (Some(_), None) => false,
        }
    }

    /// Outbound address, if the policy names one.
    pub fn endpoint(&self) -> Option<String> {
        (!self.host.is_empty()).then(|| format!("{}:{}", self.host, self.port))
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub numeric: String,
    pub description: String,
    pub hub: bool,
    pub bind: Vec<SocketAddr>,
    pub links: Vec<LinkPolicy>,
    pub opers: Vec<OperConfig>,
    pub jupes: Vec<JupeConfig>,
    pub ping_freq: u64,
}

const DEFAULT_BIND: &str = "0.0.0.0:6667";
const DEFAULT_PING_FREQ: u64 = 120;

impl Config {
    /// Build a runtime config from a parsed file.
    pub fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        let name = file
            .name
            .unwrap_or_else(default_server_name);
        if !valid_server_name(&name) {
            return Err(ConfigError::BadServerName(name));
        }
        let numeric_text = file.numeric.unwrap_or_else(|| "A".into());
        let numeric = numeric::canonical_server(&numeric_text)
            .ok_or(ConfigError::BadNumeric(numeric_text))?;

        let mut links: Vec<LinkPolicy> = Vec::with_capacity(file.links.len());
        for link in &file.links {
            if links.iter().any(|l| eq_ignore_case(&l.name, &link.name)) {
                return Err(ConfigError::DuplicateLink(link.name.clone()));
            }
            links.push(LinkPolicy::from_config(link)?);
        }

        let mut bind = Vec::new();
        let addrs = if file.bind.is_empty() {
            vec![DEFAULT_BIND.to_owned()]
        } else {
            file.bind
        };
        for addr in addrs {
            match addr.parse() {
                Ok(a) => bind.push(a),
                Err(e) => warn!(addr, "ignoring bind address: {e}"),
            }
        }

        Ok(Self {
            name,
            numeric,
            description: file.description.unwrap_or_else(|| "Lagun's Lagoon".into()),
            hub: file.hub,
            bind,
            links,
            opers: file.opers,
            jupes: file.jupes,
            ping_freq: file.ping_freq.unwrap_or(DEFAULT_PING_FREQ),
        })
    }

    /// Parse a config from JSON text.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Self::from_file(serde_json::from_str(json)?)
    }

    /// Read the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        info!(path = %path.display(), links = config.links.len(), "loaded config");
        Ok(config)
    }

    /// Load from `LAGOON_IRCD_CONFIG` (or defaults) and apply environment
    /// overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("LAGOON_IRCD_CONFIG") {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => Self::from_file(ConfigFile::default())?,
        };
        if let Ok(name) = std::env::var("SERVER_NAME") {
            if !valid_server_name(&name) {
                return Err(ConfigError::BadServerName(name));
            }
            config.name = name;
        }
        if let Ok(bind) = std::env::var("LAGOON_IRC_BIND") {
            config.bind = bind
                .split(',')
                .filter_map(|a| match a.trim().parse() {
                    Ok(addr) => Some(addr),
                    Err(e) => {
                        warn!(addr = a, "ignoring bind address: {e}");
                        None
                    }
                })
                .collect();
        }
        Ok(config)
    }

    /// The policy configured for server `name`.
    pub fn policy_for(&self, name: &str) -> Option<&LinkPolicy> {
        self.links.iter().find(|l| eq_ignore_case(&l.name, name))
    }

    /// Active jupe for `name`, if any.
    pub fn jupe_for(&self, name: &str) -> Option<&JupeConfig> {
        self.jupes.iter().find(|j| matches(&j.name, name))
    }

    /// Whether `name` is a services server.
    pub fn is_uworld(&self, name: &str) -> bool {
        self.policy_for(name).is_some_and(|p| p.role == LinkRole::Uworld)
    }
}

/// Server names are printable ASCII without spaces and contain a dot.
pub fn valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= super::HOSTLEN
        && name.bytes().all(|b| (b'!'..=b'~').contains(&b))
        && name.contains('.')
}

/// System hostname if it looks like a server name, else a fixed default.
pub fn default_server_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| h.contains('.'))
        .unwrap_or_else(|| "lagoon.lagun.co".into())
}
