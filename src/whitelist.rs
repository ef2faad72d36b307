//! Address whitelist.
//!
//! A whitelist is a set of canonical address prefixes. When whitelist mode is
//! enabled only devices whose canonical address starts with one of the
//! prefixes are tracked; an empty whitelist then tracks nothing.

use crate::mac_address::MacAddress;
use crate::storage::{self, StorageError};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

/// Whether tracking is restricted to whitelisted address prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WhitelistMode {
    #[default]
    Enabled,
    Disabled,
}

impl From<bool> for WhitelistMode {
    fn from(enabled: bool) -> Self {
        if enabled {
            WhitelistMode::Enabled
        } else {
            WhitelistMode::Disabled
        }
    }
}

/// Degraded-but-valid whitelist states worth reporting.
#[derive(Error, Debug)]
pub enum ConfigurationWarning {
    #[error("whitelist unreadable: {0}")]
    Unreadable(#[source] StorageError),
    #[error("whitelist is empty, no devices will be tracked")]
    Empty,
}

/// A set of uppercase address prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    prefixes: BTreeSet<String>,
}

impl Whitelist {
    /// Build a whitelist from raw entries, normalising each to canonical form.
    /// Blank entries are ignored.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prefixes = entries
            .into_iter()
            .map(|e| e.as_ref().trim().to_uppercase())
            .filter(|e| !e.is_empty())
            .collect();
        Whitelist { prefixes }
    }

    /// Parse newline-separated whitelist text.
    pub fn parse(text: &str) -> Self {
        Self::from_entries(text.lines())
    }

    /// Add more prefixes, normalised the same way as file entries.
    pub fn extend<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.prefixes.extend(Self::from_entries(entries).prefixes);
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.prefixes.iter().map(String::as_str)
    }

    /// Entries that name a complete address rather than a prefix.
    pub fn full_addresses(&self) -> impl Iterator<Item = MacAddress> + '_ {
        self.prefixes.iter().filter_map(|p| p.parse().ok())
    }

    /// Returns `true` if `addr` starts with any whitelisted prefix.
    pub fn matches(&self, addr: &MacAddress) -> bool {
        self.prefixes.iter().any(|p| addr.starts_with(p))
    }
}

/// Load a whitelist file.
///
/// A missing or unreadable file yields an empty whitelist together with a
/// warning; it is never fatal. An empty file yields [`ConfigurationWarning::Empty`].
pub fn load(path: &Path) -> (Whitelist, Option<ConfigurationWarning>) {
    match storage::read_to_string(path) {
        Ok(text) => {
            let whitelist = Whitelist::parse(&text);
            let warning = whitelist.is_empty().then_some(ConfigurationWarning::Empty);
            (whitelist, warning)
        }
        Err(e) => (Whitelist::default(), Some(ConfigurationWarning::Unreadable(e))),
    }
}

/// Decide whether an advertisement from `addr` is eligible for tracking.
pub fn is_eligible(addr: &MacAddress, whitelist: &Whitelist, mode: WhitelistMode) -> bool {
    match mode {
        WhitelistMode::Disabled => true,
        WhitelistMode::Enabled => whitelist.matches(addr),
    }
}
