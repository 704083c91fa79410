//! Network settings owned by an external store.
//!
//! Durable storage lives outside the core; the `config` command only talks to
//! a [`ConfigStore`]. [`MemoryConfigStore`] keeps everything in RAM.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_SSID_LEN: usize = 32;
pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 63;
pub const MAX_HOSTNAME_LEN: usize = 32;
pub const DEFAULT_HOSTNAME: &str = "usbhub";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("ssid must be 1..=32 bytes")]
    InvalidSsid,
    #[error("password must be empty or 8..=63 bytes")]
    InvalidPassword,
    #[error("hostname must be 1..=32 chars of [a-z0-9-]")]
    InvalidHostname,
    #[error("store write failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

impl WifiCredentials {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.ssid.is_empty() || self.ssid.len() > MAX_SSID_LEN {
            return Err(StoreError::InvalidSsid);
        }
        let len = self.password.len();
        if len != 0 && !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&len) {
            return Err(StoreError::InvalidPassword);
        }
        Ok(())
    }
}

pub fn validate_hostname(name: &str) -> Result<(), StoreError> {
    let well_formed = !name.is_empty()
        && name.len() <= MAX_HOSTNAME_LEN
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');

    if well_formed {
        Ok(())
    } else {
        Err(StoreError::InvalidHostname)
    }
}

pub trait ConfigStore {
    fn wifi(&self) -> Option<WifiCredentials>;

    fn set_wifi(&mut self, credentials: WifiCredentials) -> Result<(), StoreError>;

    fn hostname(&self) -> String;

    fn set_hostname(&mut self, name: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct MemoryConfigStore {
    wifi: Option<WifiCredentials>,
    hostname: String,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self {
            wifi: None,
            hostname: DEFAULT_HOSTNAME.to_string(),
        }
    }
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn wifi(&self) -> Option<WifiCredentials> {
        self.wifi.clone()
    }

    fn set_wifi(&mut self, credentials: WifiCredentials) -> Result<(), StoreError> {
        credentials.validate()?;
        self.wifi = Some(credentials);
        Ok(())
    }

    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    fn set_hostname(&mut self, name: &str) -> Result<(), StoreError> {
        validate_hostname(name)?;
        self.hostname = name.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_rules() {
        assert!(validate_hostname("usbhub-2").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("-hub").is_err());
        assert!(validate_hostname("Hub").is_err());
        assert!(validate_hostname(&"a".repeat(33)).is_err());
    }

    #[test]
    fn test_wifi_rules() {
        let mut store = MemoryConfigStore::new();
        let short = WifiCredentials { ssid: "lab".into(), password: "123".into() };
        assert_eq!(store.set_wifi(short), Err(StoreError::InvalidPassword));

        let open = WifiCredentials { ssid: "lab".into(), password: String::new() };
        assert!(store.set_wifi(open.clone()).is_ok());
        assert_eq!(store.wifi(), Some(open));
    }
}
