//! Configuration resource types: what can be looked up, where it came from,
//! and how fresh the caller needs it to be.
//!
//! A [`ConfigKey`] knows how to address itself in every backing store:
//! a partition/sort key pair in the key/value store and a relative path
//! inside the object store prefix or the local library directory.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Sort key used for single-version records.
pub const CURRENT_VERSION: &str = "v1";

/// The kind of named resource being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigType {
    /// Agent instructions (system prompt text)
    Instruction,
    /// Agent card (metadata JSON)
    Card,
    /// Per-agent visualization map (JSON listing template ids)
    VisualizationMap,
    /// Per-agent visualization template (JSON with a `dataMapping`)
    VisualizationTemplate,
    /// Template shared by all agents; never stored in the key/value store
    GenericTemplate,
    /// Global service configuration (JSON with `agent_configs`)
    GlobalConfig,
}

impl ConfigType {
    pub const ALL: [ConfigType; 6] = [
        ConfigType::Instruction,
        ConfigType::Card,
        ConfigType::VisualizationMap,
        ConfigType::VisualizationTemplate,
        ConfigType::GenericTemplate,
        ConfigType::GlobalConfig,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instruction => "instruction",
            Self::Card => "card",
            Self::VisualizationMap => "visualization_map",
            Self::VisualizationTemplate => "visualization_template",
            Self::GenericTemplate => "generic_template",
            Self::GlobalConfig => "global_config",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Whether content of this type must parse as JSON.
    pub fn is_json(&self) -> bool {
        !matches!(self, Self::Instruction)
    }

    /// Partition key prefix in the key/value store, if the type lives there.
    fn partition_prefix(&self) -> Option<&'static str> {
        match self {
            Self::Instruction => Some("INSTRUCTION"),
            Self::Card => Some("CARD"),
            Self::VisualizationMap => Some("VIZ_MAP"),
            Self::VisualizationTemplate => Some("VIZ_TEMPLATE"),
            Self::GenericTemplate => None,
            Self::GlobalConfig => Some("GLOBAL_CONFIG"),
        }
    }
}

impl std::fmt::Display for ConfigType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a named resource: `(config_type, id)` plus an optional item
/// for resources that belong to an agent but have several instances
/// (visualization templates).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigKey {
    pub config_type: ConfigType,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
}

impl ConfigKey {
    pub fn new(config_type: ConfigType, id: impl Into<String>) -> Self {
        Self {
            config_type,
            id: id.into(),
            item: None,
        }
    }

    pub fn instruction(agent: &str) -> Self {
        Self::new(ConfigType::Instruction, agent)
    }

    pub fn card(agent: &str) -> Self {
        Self::new(ConfigType::Card, agent)
    }

    pub fn visualization_map(agent: &str) -> Self {
        Self::new(ConfigType::VisualizationMap, agent)
    }

    pub fn visualization_template(agent: &str, template_id: &str) -> Self {
        Self {
            config_type: ConfigType::VisualizationTemplate,
            id: agent.to_string(),
            item: Some(template_id.to_string()),
        }
    }

    pub fn generic_template(template_id: &str) -> Self {
        Self::new(ConfigType::GenericTemplate, template_id)
    }

    pub fn global() -> Self {
        Self::new(ConfigType::GlobalConfig, "global")
    }

    /// The agent this resource belongs to, if any.
    pub fn agent(&self) -> Option<&str> {
        match self.config_type {
            ConfigType::GlobalConfig | ConfigType::GenericTemplate => None,
            _ => Some(&self.id),
        }
    }

    /// Stable string form used as the in-process cache key.
    pub fn cache_key(&self) -> String {
        match (&self.config_type, &self.item) {
            (ConfigType::GlobalConfig, _) => ConfigType::GlobalConfig.as_str().to_string(),
            (t, Some(item)) => format!("{}:{}:{}", t, self.id, item),
            (t, None) => format!("{}:{}", t, self.id),
        }
    }

    /// Partition key in the key/value store (`INSTRUCTION#AgentX`), or `None`
    /// for resource types the key/value store never holds.
    pub fn partition_key(&self) -> Option<String> {
        let prefix = self.config_type.partition_prefix()?;
        Some(match self.config_type {
            ConfigType::GlobalConfig => prefix.to_string(),
            _ => format!("{prefix}#{}", self.id),
        })
    }

    /// Sort key in the key/value store.
    pub fn sort_key(&self) -> String {
        self.item
            .clone()
            .unwrap_or_else(|| CURRENT_VERSION.to_string())
    }

    /// Path relative to the object store prefix or local library root.
    pub fn library_path(&self) -> String {
        match self.config_type {
            ConfigType::Instruction => format!("agent-instructions-library/{}.txt", self.id),
            ConfigType::Card => format!("agent_cards/{}.agent.card.json", self.id),
            ConfigType::VisualizationMap => format!(
                "agent-visualizations-library/agent-visualization-maps/{}.json",
                self.id
            ),
            ConfigType::VisualizationTemplate => format!(
                "agent-visualizations-library/{}-{}.json",
                self.id,
                self.item.as_deref().unwrap_or_default()
            ),
            ConfigType::GenericTemplate => format!(
                "agent-visualizations-library/generic-visualization-templates/{}.json",
                self.id
            ),
            ConfigType::GlobalConfig => "global_configuration.json".to_string(),
        }
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.cache_key())
    }
}

/// Which backing store satisfied a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    KeyValue,
    ObjectStore,
    Filesystem,
}

impl std::fmt::Display for SourceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::KeyValue => "key_value",
            Self::ObjectStore => "object_store",
            Self::Filesystem => "filesystem",
        })
    }
}

/// How fresh a read must be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Serve from cache when possible (positive or negative entry).
    #[default]
    Relaxed,
    /// Bypass the cache and use the strongest read the primary store offers.
    Strict,
}

impl ConsistencyMode {
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Strict)
    }
}

/// A resolved resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: ConfigKey,

    /// Opaque text or JSON blob
    pub content: String,

    /// Which tier produced the content
    pub source: SourceTier,

    pub loaded_at: DateTime<Utc>,
}

impl ConfigEntry {
    pub fn new(key: ConfigKey, content: impl Into<String>, source: SourceTier) -> Self {
        Self {
            key,
            content: content.into(),
            source,
            loaded_at: Utc::now(),
        }
    }

    /// Parse the content as JSON into `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_key_layout() {
        let key = ConfigKey::instruction("AgentX");
        assert_eq!(key.cache_key(), "instruction:AgentX");
        assert_eq!(key.partition_key().as_deref(), Some("INSTRUCTION#AgentX"));
        assert_eq!(key.sort_key(), "v1");
        assert_eq!(key.library_path(), "agent-instructions-library/AgentX.txt");
        assert_eq!(key.agent(), Some("AgentX"));
    }

    #[test]
    fn template_key_uses_item_as_sort_key() {
        let key = ConfigKey::visualization_template("AgentX", "metrics");
        assert_eq!(key.partition_key().as_deref(), Some("VIZ_TEMPLATE#AgentX"));
        assert_eq!(key.sort_key(), "metrics");
        assert_eq!(key.cache_key(), "visualization_template:AgentX:metrics");
        assert_eq!(
            key.library_path(),
            "agent-visualizations-library/AgentX-metrics.json"
        );
    }

    #[test]
    fn global_key_has_no_agent() {
        let key = ConfigKey::global();
        assert_eq!(key.partition_key().as_deref(), Some("GLOBAL_CONFIG"));
        assert_eq!(key.cache_key(), "global_config");
        assert!(key.agent().is_none());
    }

    #[test]
    fn generic_templates_never_hit_key_value_store() {
        let key = ConfigKey::generic_template("adcp_get_products-visualization");
        assert!(key.partition_key().is_none());
        assert!(key.library_path().contains("generic-visualization-templates"));
    }

    #[test]
    fn config_type_parse_matches_as_str() {
        for t in ConfigType::ALL {
            assert_eq!(ConfigType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ConfigType::parse("nope"), None);
        assert!(!ConfigType::Instruction.is_json());
        assert!(ConfigType::Card.is_json());
    }

    #[test]
    fn consistency_defaults_to_relaxed() {
        assert_eq!(ConsistencyMode::default(), ConsistencyMode::Relaxed);
        assert!(ConsistencyMode::Strict.is_strict());
    }

    #[test]
    fn entry_parses_json_content() {
        let entry = ConfigEntry::new(
            ConfigKey::card("AgentX"),
            r#"{"name":"AgentX"}"#,
            SourceTier::KeyValue,
        );
        let value: serde_json::Value = entry.parse().unwrap();
        assert_eq!(value["name"], "AgentX");
    }
}
