//! Per-device configuration trees and the crate-wide [`Settings`]
//!
//! A [`ConfigTree`] is a read-only view of one device's configuration. Keys may be dotted paths
//! (`"Fibers.Skip"`), register ids may be given as integers or as `"0x.."` strings, and missing
//! keys fall back to the defaults the caller supplies. Any value of the wrong shape is an
//! [`Error::Config`].
//!
//! [`Settings`] carries the tunables of the manager, the retry policy and the alignment procedures.
//! They are read from a TOML file and may be overridden from the environment, e.g.
//! `FECONFIG_MANAGER__IDLE_TIMEOUT=2s`.

use crate::{
    error::{
        Error,
        Result,
    },
    protocol::RetryPolicy,
};
use figment::{
    providers::{
        Env,
        Format,
        Serialized,
        Toml,
    },
    Figment,
};
use kstring::KString;
use serde::{
    de::DeserializeOwned,
    Deserialize,
    Serialize,
};
use serde_json::Value;
use std::{
    collections::BTreeSet,
    path::Path,
    time::Duration,
};

/// Prefix of the environment variables overriding [`Settings`]
pub const ENV_PREFIX: &str = "FECONFIG_";

/// Parse an integer given in decimal, `0x` hexadecimal or `0b` binary
#[must_use]
pub fn parse_u32(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = text.strip_prefix("0b") {
        u32::from_str_radix(bin, 2).ok()
    } else {
        text.parse().ok()
    }
}

/// The configuration of one device
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigTree {
    root: Value,
    /// Dotted path of this subtree, for error messages
    path: String,
}

impl ConfigTree {
    #[must_use]
    pub fn new(root: Value) -> Self {
        Self {
            root,
            path: String::new(),
        }
    }

    /// # Errors
    /// Returns an error on malformed JSON
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map(Self::new)
            .map_err(|e| Error::config("<document>", e))
    }

    /// # Errors
    /// Returns an error on malformed TOML
    pub fn from_toml(text: &str) -> Result<Self> {
        let value: toml::Value = toml::from_str(text).map_err(|e| Error::config("<document>", e))?;
        Self::from_serialize(&value)
    }

    /// # Errors
    /// Returns an error if `value` does not serialize to a JSON-like tree
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Self::new)
            .map_err(|e| Error::config("<document>", e))
    }

    fn full_key(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{key}", self.path)
        }
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.root, |node, part| node.get(part))
            .filter(|v| !v.is_null())
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Typed lookup of a required key
    /// # Errors
    /// Returns an error if the key is missing or has the wrong type
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .lookup(key)
            .ok_or_else(|| Error::config(self.full_key(key), "missing required key"))?;
        self.convert(key, value)
    }

    /// Typed lookup falling back to `default` when the key is missing
    /// # Errors
    /// Returns an error if the key is present with the wrong type
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        self.lookup(key)
            .map_or(Ok(default), |value| self.convert(key, value))
    }

    /// A register-sized value that may also be written as a `"0x.."` string
    /// # Errors
    /// Returns an error if the key is present but not a 32-bit integer
    pub fn get_u32_or(&self, key: &str, default: u32) -> Result<u32> {
        self.lookup(key)
            .map_or(Ok(default), |value| self.integer(key, value))
    }

    /// A set of integers, empty when the key is missing
    /// # Errors
    /// Returns an error if the key is not an array of 32-bit integers
    pub fn get_set(&self, key: &str) -> Result<BTreeSet<u32>> {
        match self.lookup(key) {
            None => Ok(BTreeSet::new()),
            Some(Value::Array(items)) => items.iter().map(|v| self.integer(key, v)).collect(),
            Some(_) => Err(Error::config(self.full_key(key), "expected an array")),
        }
    }

    /// A subtree
    /// # Errors
    /// Returns an error if the key is missing
    pub fn child(&self, key: &str) -> Result<Self> {
        let root = self
            .lookup(key)
            .cloned()
            .ok_or_else(|| Error::config(self.full_key(key), "missing subtree"))?;
        Ok(Self {
            root,
            path: self.full_key(key),
        })
    }

    /// The elements of an array as subtrees, empty when the key is missing
    /// # Errors
    /// Returns an error if the key is not an array
    pub fn array(&self, key: &str) -> Result<Vec<Self>> {
        match self.lookup(key) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items
                .iter()
                .enumerate()
                .map(|(i, root)| Self {
                    root: root.clone(),
                    path: format!("{}[{i}]", self.full_key(key)),
                })
                .collect()),
            Some(_) => Err(Error::config(self.full_key(key), "expected an array")),
        }
    }

    /// `ServerAddress` of the device
    /// # Errors
    /// Returns an error if the key is missing
    pub fn server_address(&self) -> Result<KString> {
        self.get::<String>("ServerAddress").map(KString::from_string)
    }

    /// `DeviceAddress` of the device
    /// # Errors
    /// Returns an error if the key is missing
    pub fn device_address(&self) -> Result<KString> {
        self.get::<String>("DeviceAddress").map(KString::from_string)
    }

    fn convert<T: DeserializeOwned>(&self, key: &str, value: &Value) -> Result<T> {
        T::deserialize(value).map_err(|e| Error::config(self.full_key(key), e))
    }

    fn integer(&self, key: &str, value: &Value) -> Result<u32> {
        let parsed = match value {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => parse_u32(s),
            Value::Bool(b) => Some(u32::from(*b)),
            _ => None,
        };
        parsed.ok_or_else(|| {
            Error::config(self.full_key(key), format!("expected a 32-bit integer, got {value}"))
        })
    }
}

/// Tunables of the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// How long a connection stays open after its last lease is dropped
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Period at which every open connection is checked for liveness, never when unset
    #[serde(with = "humantime_serde")]
    pub keep_alive: Option<Duration>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            keep_alive: None,
        }
    }
}

/// Tunables shared by the closed-loop procedures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentSettings {
    /// Time the hardware is given to settle before each round of samples
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
    /// Reads per round
    pub samples: usize,
    /// Reset rounds before giving up
    pub max_attempts: usize,
}

impl Default for AlignmentSettings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(3),
            samples: 100,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub manager: ManagerSettings,
    pub retry: RetryPolicy,
    pub alignment: AlignmentSettings,
}

impl Settings {
    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
    }

    /// Load settings from a TOML file, overridden by `FECONFIG_`-prefixed environment variables.
    /// A missing file leaves the defaults in place.
    /// # Errors
    /// Returns an error if a value has the wrong type
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::figment()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| Error::config("settings", e))
    }

    /// # Errors
    /// Returns an error on malformed TOML or a value of the wrong type
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Self::figment()
            .merge(Toml::string(text))
            .extract()
            .map_err(|e| Error::config("settings", e))
    }
}
