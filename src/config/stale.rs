//! Per-type stale-acquisition thresholds for the administrative sweep.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::eq_ignore_case;

/// One day.
pub const DEFAULT_STALE_SECS: u64 = 86_400;

/// How long an item may stay acquired before the sweep reclaims it.
///
/// ```toml
/// default_secs = 86400
///
/// [types]
/// email = 600
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleTimeouts {
    /// Threshold for any type not listed in `types`.
    #[serde(default = "default_secs")]
    pub default_secs: u64,
    #[serde(default)]
    pub types: BTreeMap<String, u64>,
}

fn default_secs() -> u64 {
    DEFAULT_STALE_SECS
}

impl Default for StaleTimeouts {
    fn default() -> Self {
        Self {
            default_secs: DEFAULT_STALE_SECS,
            types: BTreeMap::new(),
        }
    }
}

impl StaleTimeouts {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("invalid stale timeout table: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read stale timeout table {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Set the threshold for one type.
    pub fn with_type(mut self, item_type: impl Into<String>, secs: u64) -> Self {
        self.types.insert(item_type.into(), secs);
        self
    }

    pub fn default_threshold(&self) -> TimeDelta {
        secs_to_delta(self.default_secs)
    }

    /// Threshold for `item_type`, falling back to the default. Type names
    /// match case-insensitively; an exact entry wins over a folded one.
    pub fn threshold_for(&self, item_type: &str) -> TimeDelta {
        secs_to_delta(self.configured_secs(item_type).unwrap_or(self.default_secs))
    }

    /// Whether `item_type` has its own entry.
    pub fn lists(&self, item_type: &str) -> bool {
        self.configured_secs(item_type).is_some()
    }

    fn configured_secs(&self, item_type: &str) -> Option<u64> {
        self.types.get(item_type).copied().or_else(|| {
            self.types
                .iter()
                .find(|(listed, _)| eq_ignore_case(listed, item_type))
                .map(|(_, secs)| *secs)
        })
    }

    /// Explicitly configured types and their thresholds, in name order.
    pub fn listed(&self) -> impl Iterator<Item = (&str, TimeDelta)> + '_ {
        self.types
            .iter()
            .map(|(item_type, secs)| (item_type.as_str(), secs_to_delta(*secs)))
    }
}

fn secs_to_delta(secs: u64) -> TimeDelta {
    TimeDelta::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_one_day() {
        let table = StaleTimeouts::from_toml_str("").unwrap();
        assert_eq!(table, StaleTimeouts::default());
        assert_eq!(table.threshold_for("anything"), TimeDelta::days(1));
    }

    #[test]
    fn listed_types_override_default() {
        let table = StaleTimeouts::from_toml_str(
            "default_secs = 3600\n[types]\nemail = 600\nreport = 7200\n",
        )
        .unwrap();
        assert_eq!(table.threshold_for("email"), TimeDelta::minutes(10));
        assert_eq!(table.threshold_for("Email"), TimeDelta::minutes(10));
        assert_eq!(table.threshold_for("index"), TimeDelta::hours(1));
        assert!(table.lists("REPORT"));
        assert!(!table.lists("index"));
        let listed: Vec<_> = table.listed().map(|(t, _)| t).collect();
        assert_eq!(listed, vec!["email", "report"]);
    }

    #[test]
    fn malformed_table_is_a_config_error() {
        let err = StaleTimeouts::from_toml_str("default_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
