//! DNS-SD TXT record codec.
//!
//! # Wire format
//!
//! ```text
//! [1 byte: entry length][entry bytes: "key=value"] ... repeated
//! ```
//!
//! Each entry is at most 255 bytes. Lookups are keyed; the order of
//! entries is preserved for encoding but irrelevant for decoding.

use std::net::SocketAddrV4;

use crate::constants::{PRIORITY_KEY, SCOPE_KEY, TXT_VERSION, TXT_VERSION_KEY};
use crate::entry::MasterEntry;

/// Errors raised while encoding, decoding, or interpreting TXT data.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TxtError {
    #[error("TXT entry for '{key}' is {len} bytes, exceeding the 255 byte limit")]
    EntryTooLong { key: String, len: usize },

    #[error("TXT data is truncated")]
    Truncated,

    #[error("TXT entry is not valid UTF-8")]
    NotUtf8,

    #[error("TXT record is missing the '{0}' key")]
    MissingKey(String),

    #[error("TXT value '{value}' for '{key}' is malformed")]
    Malformed { key: String, value: String },

    #[error("unsupported TXT version {0}")]
    VersionMismatch(u8),
}

/// An ordered set of `key=value` TXT entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtRecord {
    entries: Vec<(String, String)>,
}

impl TxtRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry, replacing any existing entry with the same key.
    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(existing) = self.entries.iter_mut().find(|(k, _)| k == key) {
            existing.1 = value.to_string();
        } else {
            self.entries.push((key.to_string(), value.to_string()));
        }
    }

    /// Keyed lookup. Keys are case-sensitive ASCII.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the value for `key`, or [`TxtError::MissingKey`].
    pub fn get_str(&self, key: &str) -> Result<&str, TxtError> {
        self.get(key).ok_or_else(|| TxtError::MissingKey(key.into()))
    }

    /// Returns the value for `key` parsed as a decimal `u8`.
    pub fn get_u8(&self, key: &str) -> Result<u8, TxtError> {
        let value = self.get_str(key)?;
        value.parse().map_err(|_| TxtError::Malformed {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encodes to the length-prefixed wire form.
    pub fn encode(&self) -> Result<Vec<u8>, TxtError> {
        let mut data = Vec::new();
        for (key, value) in &self.entries {
            let entry = format!("{key}={value}");
            if entry.len() > u8::MAX as usize {
                return Err(TxtError::EntryTooLong {
                    key: key.clone(),
                    len: entry.len(),
                });
            }
            data.push(entry.len() as u8);
            data.extend_from_slice(entry.as_bytes());
        }
        Ok(data)
    }

    /// Decodes the length-prefixed wire form.
    ///
    /// An entry without `=` decodes as a key with an empty value, which
    /// some responders emit for boolean attributes.
    pub fn decode(data: &[u8]) -> Result<Self, TxtError> {
        let mut entries = Vec::new();
        let mut rest = data;
        while let Some((&len, tail)) = rest.split_first() {
            let len = len as usize;
            if tail.len() < len {
                return Err(TxtError::Truncated);
            }
            let (entry, tail) = tail.split_at(len);
            let entry = std::str::from_utf8(entry).map_err(|_| TxtError::NotUtf8)?;
            match entry.split_once('=') {
                Some((key, value)) => entries.push((key.to_string(), value.to_string())),
                None => entries.push((entry.to_string(), String::new())),
            }
            rest = tail;
        }
        Ok(Self { entries })
    }

    /// Iterates over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Builds the TXT record advertised for a local master.
pub fn master_txt(master: &MasterEntry) -> TxtRecord {
    let mut txt = TxtRecord::new();
    txt.set(TXT_VERSION_KEY, &TXT_VERSION.to_string());
    txt.set(PRIORITY_KEY, &master.priority.to_string());
    txt.set(SCOPE_KEY, &master.scope);
    txt
}

/// Interprets a resolved service's TXT record as a [`MasterEntry`].
///
/// Applies the version gate: any `txtvers` other than the supported one
/// rejects the record.
pub fn entry_from_txt(
    service_name: &str,
    address: SocketAddrV4,
    txt: &TxtRecord,
) -> Result<MasterEntry, TxtError> {
    let version = txt.get_u8(TXT_VERSION_KEY)?;
    if version != TXT_VERSION {
        return Err(TxtError::VersionMismatch(version));
    }

    let priority = txt.get_u8(PRIORITY_KEY)?;
    let scope = txt.get_str(SCOPE_KEY)?;

    Ok(MasterEntry {
        service_name: service_name.to_string(),
        address,
        priority,
        scope: scope.to_string(),
    })
}
