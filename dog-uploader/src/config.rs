//! Uploader configuration.
//!
//! Plain struct with defaults and chained builders. Environment overrides use
//! `PREFIX__KEY` names:
//!
//! ```bash
//! export UPLOADER__MAX_ITEMS=4
//! export UPLOADER__AUTO_LINK=true
//! export UPLOADER__OWNER_ID=post-17
//! export UPLOADER__OWNER_TYPE=Post
//! ```

use std::collections::HashMap;
use std::str::FromStr;

use crate::{Checksum, Owner, UploaderError, UploaderResult};

/// Who owns the primary pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimarySource {
    /// The collection stores the pointer itself
    #[default]
    Internal,
    /// The host stores it; the collection only validates and requests changes
    External,
}

/// Configuration for a blob collection and its driver
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Maximum number of records in the collection
    pub max_items: usize,

    /// Request upload slots for new selections without being asked
    pub auto_upload: bool,

    /// Link registered blobs to the owner, and unlink on removal
    pub auto_link: bool,

    /// Automatic attempts granted to each new record
    pub max_retries: u32,

    /// Entity that uploaded blobs get linked to
    pub owner: Option<Owner>,

    /// Initial primary checksum
    pub primary: Option<Checksum>,

    pub primary_source: PrimarySource,

    /// Buffer size of the change-notification channel
    pub event_capacity: usize,

    /// Upper bound on passes for a single `run_until_idle`
    pub max_passes: usize,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_items: 10,
            auto_upload: true,
            auto_link: false,
            max_retries: 3,
            owner: None,
            primary: None,
            primary_source: PrimarySource::Internal,
            event_capacity: 256,
            max_passes: 32,
        }
    }
}

impl UploaderConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    pub fn with_auto_upload(mut self, enabled: bool) -> Self {
        self.auto_upload = enabled;
        self
    }

    pub fn with_auto_link(mut self, enabled: bool) -> Self {
        self.auto_link = enabled;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_primary(mut self, primary: Checksum) -> Self {
        self.primary = Some(primary);
        self
    }

    pub fn with_primary_source(mut self, source: PrimarySource) -> Self {
        self.primary_source = source;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_max_passes(mut self, passes: usize) -> Self {
        self.max_passes = passes.max(1);
        self
    }

    /// Load overrides from the process environment on top of the defaults
    pub fn from_env(prefix: &str) -> UploaderResult<Self> {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Load overrides from an explicit set of variables
    pub fn from_vars<I, K, V>(prefix: &str, vars: I) -> UploaderResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let head = format!("{}__", prefix);
        let values: HashMap<String, String> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                key.as_ref()
                    .strip_prefix(&head)
                    .map(|stripped| (stripped.to_uppercase(), value.into()))
            })
            .collect();

        let mut config = Self::default();

        if let Some(max_items) = parse::<usize>(&values, "MAX_ITEMS")? {
            if max_items == 0 {
                return Err(UploaderError::config("MAX_ITEMS", "must be at least 1"));
            }
            config.max_items = max_items;
        }
        if let Some(max_retries) = parse::<u32>(&values, "MAX_RETRIES")? {
            if max_retries == 0 {
                return Err(UploaderError::config("MAX_RETRIES", "must be at least 1"));
            }
            config.max_retries = max_retries;
        }
        if let Some(auto_upload) = parse_flag(&values, "AUTO_UPLOAD")? {
            config.auto_upload = auto_upload;
        }
        if let Some(auto_link) = parse_flag(&values, "AUTO_LINK")? {
            config.auto_link = auto_link;
        }

        match (values.get("OWNER_ID"), values.get("OWNER_TYPE")) {
            (Some(id), Some(kind)) => config.owner = Some(Owner::new(id.clone(), kind.clone())),
            (None, None) => {}
            (Some(_), None) => {
                return Err(UploaderError::config("OWNER_TYPE", "required when OWNER_ID is set"))
            }
            (None, Some(_)) => {
                return Err(UploaderError::config("OWNER_ID", "required when OWNER_TYPE is set"))
            }
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(values: &HashMap<String, String>, key: &str) -> UploaderResult<Option<T>> {
    match values.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| UploaderError::config(key, format!("cannot parse {:?}", raw))),
    }
}

fn parse_flag(values: &HashMap<String, String>, key: &str) -> UploaderResult<Option<bool>> {
    match values.get(key).map(|raw| raw.trim().to_lowercase()) {
        None => Ok(None),
        Some(raw) => match raw.as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(UploaderError::config(key, format!("cannot parse {:?} as a flag", raw))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = UploaderConfig::default();
        assert_eq!(config.max_items, 10);
        assert!(config.auto_upload);
        assert!(!config.auto_link);
        assert_eq!(config.max_retries, 3);
        assert!(config.owner.is_none());
        assert_eq!(config.primary_source, PrimarySource::Internal);
    }

    #[test]
    fn env_overrides_layer_over_defaults() {
        let config = UploaderConfig::from_vars(
            "UPLOADER",
            vec![
                ("UPLOADER__MAX_ITEMS", "4"),
                ("UPLOADER__AUTO_LINK", "yes"),
                ("UPLOADER__OWNER_ID", "post-17"),
                ("UPLOADER__OWNER_TYPE", "Post"),
                ("OTHER__MAX_ITEMS", "99"),
            ],
        )
        .unwrap();

        assert_eq!(config.max_items, 4);
        assert!(config.auto_link);
        assert!(config.auto_upload);
        assert_eq!(config.owner, Some(Owner::new("post-17", "Post")));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = UploaderConfig::from_vars("UP", vec![("UP__MAX_RETRIES", "0")]).unwrap_err();
        assert!(matches!(err, UploaderError::Config { ref key, .. } if key == "MAX_RETRIES"));

        let err = UploaderConfig::from_vars("UP", vec![("UP__MAX_ITEMS", "0")]).unwrap_err();
        assert!(matches!(err, UploaderError::Config { ref key, .. } if key == "MAX_ITEMS"));
    }

    #[test]
    fn garbage_values_are_rejected() {
        assert!(UploaderConfig::from_vars("UP", vec![("UP__AUTO_UPLOAD", "maybe")]).is_err());
        assert!(UploaderConfig::from_vars("UP", vec![("UP__MAX_ITEMS", "ten")]).is_err());
        assert!(UploaderConfig::from_vars("UP", vec![("UP__OWNER_ID", "p1")]).is_err());
    }
}
