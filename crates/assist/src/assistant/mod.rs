//! Assistant catalogue.
//!
//! Assistants are declared in configuration and resolved into an immutable
//! [`AssistantRegistry`] at startup. Request handling only ever reads it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::store::{AssistantRecord, ConversationRepository};

/// One `[[assistants]]` entry as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub id: String,
    /// Short code used as the export folder name.
    pub code: String,
    pub display_name: String,
    pub enabled: bool,
    /// Prompt file name, relative to `prompts_dir` unless absolute.
    pub system_prompt_file: Option<String>,
    /// Comma-delimited vector store ids for the `file_search` tool.
    pub vector_store_id: Option<String>,
    pub api_key: String,
    pub first_reply_is_document: bool,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            code: String::new(),
            display_name: String::new(),
            enabled: true,
            system_prompt_file: None,
            vector_store_id: None,
            api_key: String::new(),
            first_reply_is_document: false,
        }
    }
}

/// A resolved assistant, ready for request assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assistant {
    pub id: String,
    pub code: String,
    pub display_name: String,
    pub enabled: bool,
    pub system_prompt: String,
    pub vector_store_ids: Vec<String>,
    pub api_key: String,
    pub first_reply_is_document: bool,
}

impl Assistant {
    /// Resolve a config entry, reading its prompt file from `prompts_dir`.
    pub fn from_config(config: &AssistantConfig, prompts_dir: &Path) -> Result<Self> {
        if config.id.trim().is_empty() {
            bail!("assistant entry without an id");
        }

        let system_prompt = match &config.system_prompt_file {
            Some(file) if !file.trim().is_empty() => {
                let path = prompts_dir.join(file);
                match std::fs::read_to_string(&path) {
                    Ok(text) => text,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tracing::warn!(
                            assistant = %config.id,
                            path = %path.display(),
                            "System prompt file not found, using empty prompt"
                        );
                        String::new()
                    }
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!("reading system prompt {}", path.display())
                        });
                    }
                }
            }
            _ => String::new(),
        };

        let code = if config.code.trim().is_empty() {
            config.id.clone()
        } else {
            config.code.clone()
        };
        let display_name = if config.display_name.trim().is_empty() {
            code.clone()
        } else {
            config.display_name.clone()
        };

        Ok(Self {
            id: config.id.clone(),
            code,
            display_name,
            enabled: config.enabled,
            system_prompt,
            vector_store_ids: split_vector_store_ids(config.vector_store_id.as_deref()),
            api_key: config.api_key.clone(),
            first_reply_is_document: config.first_reply_is_document,
        })
    }

    pub fn to_record(&self) -> AssistantRecord {
        AssistantRecord {
            id: self.id.clone(),
            code: self.code.clone(),
            display_name: self.display_name.clone(),
            enabled: self.enabled,
            first_reply_is_document: self.first_reply_is_document,
        }
    }
}

/// Split a comma-delimited id list, dropping blanks.
pub fn split_vector_store_ids(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read-only assistant lookup shared by the orchestrator and exporter.
#[derive(Debug, Clone, Default)]
pub struct AssistantRegistry {
    assistants: Arc<HashMap<String, Assistant>>,
}

impl AssistantRegistry {
    pub fn new(assistants: impl IntoIterator<Item = Assistant>) -> Self {
        let map = assistants
            .into_iter()
            .map(|assistant| (assistant.id.clone(), assistant))
            .collect();
        Self {
            assistants: Arc::new(map),
        }
    }

    /// Build from config entries. Duplicate ids are rejected.
    pub fn from_configs(configs: &[AssistantConfig], prompts_dir: &Path) -> Result<Self> {
        let mut map = HashMap::with_capacity(configs.len());
        for config in configs {
            let assistant = Assistant::from_config(config, prompts_dir)?;
            if map.contains_key(&assistant.id) {
                bail!("duplicate assistant id: {}", assistant.id);
            }
            map.insert(assistant.id.clone(), assistant);
        }
        Ok(Self {
            assistants: Arc::new(map),
        })
    }

    pub fn get(&self, id: &str) -> Option<&Assistant> {
        self.assistants.get(id)
    }

    pub fn len(&self) -> usize {
        self.assistants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assistants.is_empty()
    }

    /// All assistants ordered by code.
    pub fn all(&self) -> Vec<&Assistant> {
        let mut list: Vec<_> = self.assistants.values().collect();
        list.sort_by(|a, b| a.code.cmp(&b.code).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Mirror the catalogue into the store so exports can join against it.
    pub async fn sync_to_store(&self, repo: &ConversationRepository) -> Result<()> {
        for assistant in self.all() {
            repo.upsert_assistant(&assistant.to_record()).await?;
        }
        tracing::info!(count = self.len(), "Synced assistant catalogue");
        Ok(())
    }
}
