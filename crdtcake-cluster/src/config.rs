//! Loading of partition groups from string keyed configuration.
//!
//! Groups are described by the keys:
//!
//! ```text
//! partitionGroup.<name>.ids = group|id|storage|control, group|id|storage|control
//! partitionGroup.<name>.replicas = 2        # default 1
//! partitionGroup.<name>.repartition = true  # default false
//! partitionGroup.<name>.active = false      # default true
//! ```
//!
//! Any malformed entry fails the whole load.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use thiserror::Error;

use crate::partition::PartitionParseError;
use crate::scheme::{PartitionGroup, PartitionScheme, StorageProvider};
use crate::PartitionId;

const GROUP_PREFIX: &str = "partitionGroup.";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration key: {0}")]
    MissingKey(String),

    #[error("Invalid value {value:?} for key {key}")]
    InvalidValue { key: String, value: String },

    #[error("Malformed partition in {key}: {source}")]
    MalformedPartition {
        key: String,
        source: PartitionParseError,
    },

    #[error("Invalid partition group: {0}")]
    InvalidGroup(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// A flat map of configuration keys and their values.
pub struct ConfigSource {
    values: BTreeMap<String, String>,
}

impl ConfigSource {
    /// Parses `key=value` property text.
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut values = BTreeMap::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) =
                line.split_once('=')
                    .ok_or_else(|| ConfigError::InvalidValue {
                        key: line.to_string(),
                        value: String::new(),
                    })?;
            values.insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(Self { values })
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Parses the value of a key, falling back to `default` if it is absent.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// The names of every configured partition group, in sorted order.
    pub fn group_names(&self) -> Vec<&str> {
        self.values
            .keys()
            .filter_map(|key| key.strip_prefix(GROUP_PREFIX))
            .filter_map(|rest| rest.rsplit_once('.').map(|(name, _)| name))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Parses every partition group described by the source.
pub fn parse_partition_groups(
    source: &ConfigSource,
) -> Result<Vec<PartitionGroup>, ConfigError> {
    let names = source.group_names();
    if names.is_empty() {
        return Err(ConfigError::MissingKey(format!("{}<name>.ids", GROUP_PREFIX)));
    }

    names
        .into_iter()
        .map(|name| parse_partition_group(source, name))
        .collect()
}

fn parse_partition_group(
    source: &ConfigSource,
    name: &str,
) -> Result<PartitionGroup, ConfigError> {
    let key = |suffix: &str| format!("{}{}.{}", GROUP_PREFIX, name, suffix);

    let ids_key = key("ids");
    let ids = source
        .get(&ids_key)
        .ok_or_else(|| ConfigError::MissingKey(ids_key.clone()))?;

    let partitions = ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| {
            id.parse::<PartitionId>()
                .map_err(|source| ConfigError::MalformedPartition {
                    key: ids_key.clone(),
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if partitions.is_empty() {
        return Err(ConfigError::InvalidGroup(format!(
            "Partition group {} has no partitions",
            name
        )));
    }

    let replicas = source.get_or(&key("replicas"), 1usize)?;
    if replicas == 0 {
        return Err(ConfigError::InvalidValue {
            key: key("replicas"),
            value: "0".to_string(),
        });
    }

    Ok(PartitionGroup::new(partitions)
        .with_replicas(replicas)
        .with_repartition(source.get_or(&key("repartition"), false)?)
        .with_active(source.get_or(&key("active"), true)?))
}

/// Loads a partition scheme from configuration.
pub fn load_scheme<K, S>(
    source: &ConfigSource,
    provider: impl StorageProvider<K, S>,
) -> Result<PartitionScheme<K, S>, ConfigError>
where
    K: 'static,
    S: 'static,
{
    let groups = parse_partition_groups(source)?;
    PartitionScheme::new(groups, provider)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crdtcake_storage::CrdtStorage;

    use super::*;

    const CONFIG: &str = "
        # The main write group.
        partitionGroup.main.ids = main|a|127.0.0.1:9000|, main|b|127.0.0.1:9001|127.0.0.1:9101
        partitionGroup.main.replicas = 2
        partitionGroup.main.repartition = true

        partitionGroup.old.ids = old|a
        partitionGroup.old.active = false
    ";

    #[test]
    fn test_parse_groups() {
        let source = ConfigSource::parse(CONFIG).unwrap();
        assert_eq!(source.group_names(), ["main", "old"]);

        let groups = parse_partition_groups(&source).unwrap();
        assert_eq!(groups.len(), 2);

        let main = &groups[0];
        assert_eq!(main.replicas(), 2);
        assert!(main.repartition());
        assert!(main.is_active());
        let b = main.partitions().iter().nth(1).unwrap();
        assert_eq!(b.id(), "b");
        assert_eq!(b.storage_addr(), Some("127.0.0.1:9001".parse().unwrap()));
        assert_eq!(b.control_addr(), Some("127.0.0.1:9101".parse().unwrap()));

        let old = &groups[1];
        assert_eq!(old.replicas(), 1);
        assert!(!old.repartition());
        assert!(!old.is_active());
        assert_eq!(old.partitions().len(), 1);
    }

    #[test]
    fn test_malformed_partition_fails_fast() {
        let source = ConfigSource::from_pairs([("partitionGroup.main.ids", "main|a|||extra")]);
        let err = parse_partition_groups(&source).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MalformedPartition {
                key: "partitionGroup.main.ids".to_string(),
                source: PartitionParseError::TooManySegments(5),
            }
        );

        let source = ConfigSource::from_pairs([("partitionGroup.main.ids", "main|a|not an address")]);
        assert!(matches!(
            parse_partition_groups(&source),
            Err(ConfigError::MalformedPartition { .. })
        ));
    }

    #[test]
    fn test_invalid_values() {
        let source = ConfigSource::from_pairs([
            ("partitionGroup.main.ids", "main|a"),
            ("partitionGroup.main.replicas", "many"),
        ]);
        assert_eq!(
            parse_partition_groups(&source).unwrap_err(),
            ConfigError::InvalidValue {
                key: "partitionGroup.main.replicas".to_string(),
                value: "many".to_string(),
            }
        );

        let source = ConfigSource::from_pairs([("partitionGroup.main.replicas", "2")]);
        assert_eq!(
            parse_partition_groups(&source).unwrap_err(),
            ConfigError::MissingKey("partitionGroup.main.ids".to_string()),
        );

        assert!(ConfigSource::parse("no separator here").is_err());
        assert!(matches!(
            parse_partition_groups(&ConfigSource::default()),
            Err(ConfigError::MissingKey(_))
        ));
    }

    #[test]
    fn test_load_scheme() {
        let source = ConfigSource::parse(CONFIG).unwrap();
        let provider =
            std::collections::BTreeMap::<PartitionId, Arc<dyn CrdtStorage<String, u64>>>::new();
        let scheme = load_scheme(&source, provider).unwrap();
        assert_eq!(scheme.partitions().len(), 3);
        assert_eq!(scheme.groups().len(), 2);
    }
}
