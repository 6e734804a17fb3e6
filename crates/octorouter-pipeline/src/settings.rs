//! Sender and receiver settings.
//!
//! Settings are read-only during pipeline execution. They come from a TOML file:
//!
//! ```toml
//! [[senders]]
//! name = "default"
//! organization = "lab"
//! topic = "full-elr"
//! format = "HL7"
//!
//! [[receivers]]
//! name = "elr"
//! organization = "ig-phd"
//! topic = "full-elr"
//! jurisdictional_filter = ["Bundle.entry.resource.ofType(Patient).address.state = 'IG'"]
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use octorouter_core::{MimeFormat, Topic};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerStatus {
    Inactive,
    Testing,
    #[default]
    Active,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    pub name: String,
    pub organization: String,
    pub topic: Topic,
    pub format: MimeFormat,
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub customer_status: CustomerStatus,
    /// Route the valid items of a submission even when some items failed.
    #[serde(default = "default_true")]
    pub route_invalid_items: bool,
}

impl Sender {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.organization, self.name)
    }
}

/// When a receiver wants its batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub batch_size: usize,
    pub max_wait_secs: u64,
}

/// How a receiver is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receiver {
    pub name: String,
    pub organization: String,
    pub topic: Topic,
    #[serde(default)]
    pub customer_status: CustomerStatus,
    #[serde(default)]
    pub jurisdictional_filter: Vec<String>,
    #[serde(default)]
    pub quality_filter: Vec<String>,
    #[serde(default)]
    pub routing_filter: Vec<String>,
    #[serde(default)]
    pub processing_mode_filter: Vec<String>,
    /// Invert the combined result of the quality filter.
    #[serde(default)]
    pub reverse_quality_filter: bool,
    /// Keep observations matching any of these expressions.
    #[serde(default)]
    pub condition_filter: Vec<String>,
    /// Keep observations stamped with any of these condition codes.
    #[serde(default)]
    pub mapped_condition_filter: Vec<String>,
    #[serde(default = "default_receiver_format")]
    pub format: MimeFormat,
    #[serde(default)]
    pub timing: Option<Timing>,
    #[serde(default)]
    pub transport: Option<TransportConfig>,
}

fn default_receiver_format() -> MimeFormat {
    MimeFormat::Fhir
}

impl Receiver {
    /// A receiver with no filters, for the given topic.
    pub fn new(organization: impl Into<String>, name: impl Into<String>, topic: Topic) -> Self {
        Self {
            name: name.into(),
            organization: organization.into(),
            topic,
            customer_status: CustomerStatus::Active,
            jurisdictional_filter: Vec::new(),
            quality_filter: Vec::new(),
            routing_filter: Vec::new(),
            processing_mode_filter: Vec::new(),
            reverse_quality_filter: false,
            condition_filter: Vec::new(),
            mapped_condition_filter: Vec::new(),
            format: MimeFormat::Fhir,
            timing: None,
            transport: None,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.organization, self.name)
    }

    /// Testing receivers still get data; only inactive ones are skipped.
    pub fn is_routable(&self) -> bool {
        self.customer_status != CustomerStatus::Inactive
    }
}

/// The full set of senders and receivers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    #[serde(default)]
    pub senders: Vec<Sender>,
    #[serde(default)]
    pub receivers: Vec<Receiver>,
}

impl SettingsSnapshot {
    /// Checks the snapshot for conflicting configuration.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Configuration` for duplicate full names or a
    /// receiver that sets both `condition_filter` and `mapped_condition_filter`.
    pub fn validate(&self) -> PipelineResult<()> {
        let mut seen = HashSet::new();
        for sender in &self.senders {
            if !seen.insert(sender.full_name()) {
                return Err(PipelineError::configuration(format!(
                    "duplicate sender '{}'",
                    sender.full_name()
                )));
            }
        }

        seen.clear();
        for receiver in &self.receivers {
            let full_name = receiver.full_name();
            if !seen.insert(full_name.clone()) {
                return Err(PipelineError::configuration(format!(
                    "duplicate receiver '{full_name}'"
                )));
            }
            if !receiver.condition_filter.is_empty() && !receiver.mapped_condition_filter.is_empty()
            {
                return Err(PipelineError::configuration(format!(
                    "receiver '{full_name}' sets both condition_filter and mapped_condition_filter"
                )));
            }
        }
        Ok(())
    }
}

/// Read access to the configured senders and receivers.
pub trait SettingsProvider: Send + Sync {
    fn senders(&self) -> Vec<Sender>;

    fn receivers(&self) -> Vec<Receiver>;

    fn find_sender(&self, full_name: &str) -> Option<Sender> {
        self.senders()
            .into_iter()
            .find(|s| s.full_name() == full_name)
    }

    fn find_receiver(&self, full_name: &str) -> Option<Receiver> {
        self.receivers()
            .into_iter()
            .find(|r| r.full_name() == full_name)
    }
}

/// Settings held in memory behind an atomically swappable snapshot.
#[derive(Debug)]
pub struct InMemorySettings {
    snapshot: ArcSwap<SettingsSnapshot>,
}

impl InMemorySettings {
    /// # Errors
    ///
    /// Returns `PipelineError::Configuration` if the snapshot does not validate.
    pub fn new(snapshot: SettingsSnapshot) -> PipelineResult<Self> {
        snapshot.validate()?;
        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        })
    }

    pub fn empty() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(SettingsSnapshot::default()),
        }
    }

    /// Parses settings from TOML text.
    pub fn from_toml_str(raw: &str) -> PipelineResult<Self> {
        let snapshot: SettingsSnapshot = toml::from_str(raw)
            .map_err(|e| PipelineError::configuration(format!("invalid settings: {e}")))?;
        Self::new(snapshot)
    }

    /// Loads settings from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::configuration(format!(
                "failed to read settings file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Swaps in a new snapshot. Readers holding the old one keep it.
    pub fn replace(&self, snapshot: SettingsSnapshot) -> PipelineResult<()> {
        snapshot.validate()?;
        self.snapshot.store(Arc::new(snapshot));
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<SettingsSnapshot> {
        self.snapshot.load_full()
    }
}

impl SettingsProvider for InMemorySettings {
    fn senders(&self) -> Vec<Sender> {
        self.snapshot.load().senders.clone()
    }

    fn receivers(&self) -> Vec<Receiver> {
        self.snapshot.load().receivers.clone()
    }

    fn find_sender(&self, full_name: &str) -> Option<Sender> {
        self.snapshot
            .load()
            .senders
            .iter()
            .find(|s| s.full_name() == full_name)
            .cloned()
    }

    fn find_receiver(&self, full_name: &str) -> Option<Receiver> {
        self.snapshot
            .load()
            .receivers
            .iter()
            .find(|r| r.full_name() == full_name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = r#"
[[senders]]
name = "default"
organization = "lab"
topic = "covid-19"
format = "FHIR"

[[receivers]]
name = "elr"
organization = "ig-phd"
topic = "covid-19"
jurisdictional_filter = ["%state = 'IG'"]
reverse_quality_filter = true

[[receivers]]
name = "old"
organization = "ig-phd"
topic = "covid-19"
customer_status = "inactive"
format = "HL7"
timing = { batch_size = 100, max_wait_secs = 60 }
transport = { type = "log" }
"#;

    #[test]
    fn test_parse_settings() {
        let settings = InMemorySettings::from_toml_str(SETTINGS).unwrap();
        let sender = settings.find_sender("lab.default").unwrap();
        assert!(sender.route_invalid_items);
        assert_eq!(sender.customer_status, CustomerStatus::Active);

        let receivers = settings.receivers();
        assert_eq!(receivers.len(), 2);
        assert!(receivers[0].is_routable());
        assert!(receivers[0].reverse_quality_filter);
        assert!(!receivers[1].is_routable());
        assert_eq!(receivers[1].format, MimeFormat::Hl7);
        assert_eq!(receivers[1].transport.as_ref().unwrap().kind, "log");
        assert!(settings.find_receiver("ig-phd.missing").is_none());
    }

    #[test]
    fn test_testing_receivers_are_routable() {
        let mut receiver = Receiver::new("org", "r", Topic::new("t"));
        receiver.customer_status = CustomerStatus::Testing;
        assert!(receiver.is_routable());
    }

    #[test]
    fn test_rejects_duplicate_receivers() {
        let receiver = Receiver::new("org", "r", Topic::new("t"));
        let snapshot = SettingsSnapshot {
            senders: vec![],
            receivers: vec![receiver.clone(), receiver],
        };
        assert!(matches!(
            InMemorySettings::new(snapshot),
            Err(PipelineError::Configuration { .. })
        ));
    }

    #[test]
    fn test_rejects_both_condition_filters() {
        let mut receiver = Receiver::new("org", "r", Topic::new("t"));
        receiver.condition_filter = vec!["true".into()];
        receiver.mapped_condition_filter = vec!["840539006".into()];
        let settings = InMemorySettings::empty();
        let err = settings
            .replace(SettingsSnapshot {
                senders: vec![],
                receivers: vec![receiver],
            })
            .unwrap_err();
        assert!(err.to_string().contains("both condition_filter"));
        assert!(settings.receivers().is_empty());
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, SETTINGS).unwrap();
        let settings = InMemorySettings::from_toml_file(&path).unwrap();
        assert_eq!(settings.snapshot().senders.len(), 1);

        assert!(InMemorySettings::from_toml_file(dir.path().join("absent.toml")).is_err());
    }
}
