//! Visualization maps and templates.
//!
//! An agent's visualization map lists the templates it may render and when
//! to use each. Each template document carries a `dataMapping` describing
//! the fields to fill; generic templates are shared across agents.

use adcp_core::config::{ConfigEntry, ConfigKey, ConsistencyMode};
use adcp_core::error::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::loader::ConfigLoader;

/// Cache key of the aggregate holding every template of one agent.
pub(crate) fn all_templates_key(agent: &str) -> String {
    format!("all_viz_templates:{agent}")
}

/// One template listed in a visualization map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRef {
    #[serde(rename = "templateId")]
    pub template_id: String,
    #[serde(default)]
    pub usage: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualizationMap {
    #[serde(default)]
    pub templates: Vec<TemplateRef>,
}

/// A template ready to offer to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSummary {
    pub usage: String,
    #[serde(rename = "dataMapping")]
    pub data_mapping: serde_json::Value,
}

/// The template's `dataMapping` when present, otherwise the whole document.
fn data_mapping_of(document: serde_json::Value) -> serde_json::Value {
    match document {
        serde_json::Value::Object(mut map) if map.contains_key("dataMapping") => {
            map.remove("dataMapping").unwrap_or_default()
        }
        other => other,
    }
}

fn malformed(entry: &ConfigEntry, e: serde_json::Error) -> StoreError {
    StoreError::Malformed {
        tier: entry.source,
        key: entry.key.cache_key(),
        reason: e.to_string(),
    }
}

impl ConfigLoader {
    pub async fn visualization_map(
        &self,
        agent: &str,
        mode: ConsistencyMode,
    ) -> Result<Option<VisualizationMap>, StoreError> {
        let Some(entry) = self.get(&ConfigKey::visualization_map(agent), mode).await? else {
            return Ok(None);
        };
        entry.parse().map(Some).map_err(|e| malformed(&entry, e))
    }

    /// A template's data mapping.
    pub async fn visualization_template(
        &self,
        agent: &str,
        template_id: &str,
        mode: ConsistencyMode,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let key = ConfigKey::visualization_template(agent, template_id);
        Ok(self.get_json(&key, mode).await?.map(data_mapping_of))
    }

    /// A generic (agent-independent) template, whole.
    pub async fn generic_template(
        &self,
        template_id: &str,
        mode: ConsistencyMode,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.get_json(&ConfigKey::generic_template(template_id), mode)
            .await
    }

    /// Every template in an agent's map that resolves, keyed by template id.
    /// An agent without a map has no templates.
    pub async fn visualization_templates(
        &self,
        agent: &str,
        mode: ConsistencyMode,
    ) -> Result<BTreeMap<String, TemplateSummary>, StoreError> {
        let cache_key = all_templates_key(agent);
        let map = self.visualization_map(agent, mode).await?.unwrap_or_default();

        let cached = if mode.is_strict() {
            None
        } else {
            self.cache().lookup_aggregate(&cache_key).await
        };
        let entries = match cached {
            Some(entries) => {
                debug!(agent = %agent, count = entries.len(), "Cache hit (templates)");
                entries.as_ref().clone()
            }
            None => {
                let generation = self.cache().generation();
                let mut entries = Vec::new();
                for template in &map.templates {
                    let key = ConfigKey::visualization_template(agent, &template.template_id);
                    if let Some(entry) = self.get(&key, mode).await? {
                        entries.push(entry);
                    }
                }
                info!(agent = %agent, count = entries.len(), "Loaded visualization templates");
                self.fill_aggregate_detached(cache_key, entries.clone(), generation)
                    .await;
                entries
            }
        };

        let mut result = BTreeMap::new();
        for entry in entries {
            let Some(template_id) = entry.key.item.clone() else {
                continue;
            };
            let usage = map
                .templates
                .iter()
                .find(|t| t.template_id == template_id)
                .map(|t| t.usage.clone())
                .unwrap_or_default();
            let document: serde_json::Value = entry.parse().map_err(|e| malformed(&entry, e))?;
            result.insert(
                template_id,
                TemplateSummary {
                    usage,
                    data_mapping: data_mapping_of(document),
                },
            );
        }
        Ok(result)
    }

    /// Prompt text telling an agent which visualizations it has and how to
    /// emit them.
    pub async fn visualization_prompt(
        &self,
        agent: &str,
        mode: ConsistencyMode,
    ) -> Result<String, StoreError> {
        let Some(map) = self.visualization_map(agent, mode).await? else {
            return Ok(format!("No visualizations configured for {agent}."));
        };
        if map.templates.is_empty() {
            return Ok(format!("No visualization templates available for {agent}."));
        }

        let mut lines = vec![
            format!("\n## Available Visualizations for {agent}\n"),
            "You have access to the following visualization templates:\n".to_string(),
        ];
        for template in &map.templates {
            let usage = if template.usage.is_empty() {
                "No description"
            } else {
                template.usage.as_str()
            };
            lines.push(format!("- **{}**: {usage}", template.template_id));
        }
        lines.push("\n## How to Use Visualizations\n".to_string());
        lines.push("1. Determine which template best fits your analysis".to_string());
        lines.push("2. Load the template data mapping programmatically".to_string());
        lines.push("3. Map your analysis results to the template fields".to_string());
        lines.push(
            "4. Wrap the result in XML: <visualization-data type='[template-id]'>[JSON_RESULT]</visualization-data>\n"
                .to_string(),
        );
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::ConfigCacheTier;
    use adcp_core::event::EventBus;
    use adcp_core::store::{KeyValueStore, StoreItem};
    use adcp_stores::{BackingStoreChain, InMemoryKvStore, LocalLibrary};
    use std::sync::Arc;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(200);

    async fn loader_with(items: &[(ConfigKey, &str)]) -> (Arc<InMemoryKvStore>, ConfigLoader) {
        let kv = Arc::new(InMemoryKvStore::new());
        for (key, content) in items {
            kv.put_item(StoreItem::for_key(key, *content).unwrap())
                .await
                .unwrap();
        }
        let chain = BackingStoreChain::new().with_key_value(kv.clone(), TIMEOUT);
        let loader = ConfigLoader::new(
            Arc::new(chain),
            ConfigCacheTier::default(),
            Arc::new(EventBus::default()),
        );
        (kv, loader)
    }

    const MAP: &str = r#"{"templates":[
        {"templateId":"metrics","usage":"Show KPIs"},
        {"templateId":"missing","usage":"Never stored"},
        {"templateId":"bare"}
    ]}"#;

    #[test]
    fn data_mapping_is_extracted_when_present() {
        let doc = serde_json::json!({"type": "bar", "dataMapping": {"x": "date"}});
        assert_eq!(data_mapping_of(doc), serde_json::json!({"x": "date"}));
        let doc = serde_json::json!({"x": "date"});
        assert_eq!(data_mapping_of(doc.clone()), doc);
    }

    #[tokio::test]
    async fn templates_combine_usage_with_mapping() {
        let (_kv, loader) = loader_with(&[
            (ConfigKey::visualization_map("A"), MAP),
            (
                ConfigKey::visualization_template("A", "metrics"),
                r#"{"dataMapping":{"value":"number"}}"#,
            ),
            (ConfigKey::visualization_template("A", "bare"), r#"{"rows":[]}"#),
        ])
        .await;

        let templates = loader
            .visualization_templates("A", ConsistencyMode::Relaxed)
            .await
            .unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates["metrics"].usage, "Show KPIs");
        assert_eq!(
            templates["metrics"].data_mapping,
            serde_json::json!({"value": "number"})
        );
        assert_eq!(templates["bare"].data_mapping, serde_json::json!({"rows": []}));
    }

    #[tokio::test]
    async fn templates_are_aggregate_cached() {
        let (kv, loader) = loader_with(&[
            (ConfigKey::visualization_map("A"), MAP),
            (ConfigKey::visualization_template("A", "metrics"), "{}"),
        ])
        .await;

        loader.visualization_templates("A", ConsistencyMode::Relaxed).await.unwrap();
        let calls = kv.calls();
        let again = loader
            .visualization_templates("A", ConsistencyMode::Relaxed)
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(kv.calls(), calls);
    }

    #[tokio::test]
    async fn agent_without_map_has_no_templates() {
        let (_kv, loader) = loader_with(&[]).await;
        let templates = loader
            .visualization_templates("Nobody", ConsistencyMode::Relaxed)
            .await
            .unwrap();
        assert!(templates.is_empty());
        let prompt = loader
            .visualization_prompt("Nobody", ConsistencyMode::Relaxed)
            .await
            .unwrap();
        assert_eq!(prompt, "No visualizations configured for Nobody.");
    }

    #[tokio::test]
    async fn prompt_lists_templates() {
        let (_kv, loader) = loader_with(&[(ConfigKey::visualization_map("A"), MAP)]).await;
        let prompt = loader
            .visualization_prompt("A", ConsistencyMode::Relaxed)
            .await
            .unwrap();
        assert!(prompt.contains("## Available Visualizations for A"));
        assert!(prompt.contains("- **metrics**: Show KPIs"));
        assert!(prompt.contains("- **bare**: No description"));
        assert!(prompt.contains("<visualization-data type='[template-id]'>"));
    }

    #[tokio::test]
    async fn generic_templates_come_from_the_library() {
        let dir = tempfile::tempdir().unwrap();
        let generic = dir
            .path()
            .join("agent-visualizations-library/generic-visualization-templates");
        tokio::fs::create_dir_all(&generic).await.unwrap();
        tokio::fs::write(generic.join("table.json"), r#"{"kind":"table"}"#)
            .await
            .unwrap();

        let chain = BackingStoreChain::new()
            .with_key_value(Arc::new(InMemoryKvStore::new()), TIMEOUT)
            .with_library(LocalLibrary::new(dir.path()), TIMEOUT);
        let loader = ConfigLoader::new(
            Arc::new(chain),
            ConfigCacheTier::default(),
            Arc::new(EventBus::default()),
        );

        let template = loader
            .generic_template("table", ConsistencyMode::Relaxed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(template["kind"], "table");
    }
}
