//! Analysis templates: python scripts for computational trackers and prompt
//! bodies for AI trackers. Built once at startup and shared read-only.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_PYTHON_TEMPLATE: &str = "basic_threshold";
pub const DEFAULT_PROMPT_TEMPLATE: &str = "default_persona";

const BUILTIN_PYTHON: [(&str, &str); 2] = [
    ("basic_threshold", include_str!("../templates/basic_threshold.py")),
    ("price_movement", include_str!("../templates/price_movement.py")),
];

const BUILTIN_PROMPTS: [(&str, &str); 2] = [
    ("default_persona", include_str!("../templates/default_persona.txt")),
    ("crypto_trader", include_str!("../templates/crypto_trader.txt")),
];

#[derive(Debug, Default, Deserialize)]
struct TemplatesFile {
    #[serde(default)]
    python_templates: BTreeMap<String, String>,
    #[serde(default)]
    prompt_templates: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    python: BTreeMap<String, String>,
    prompts: BTreeMap<String, String>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateRegistry {
    pub fn builtin() -> Self {
        let owned = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(id, body)| (id.to_string(), body.to_string()))
                .collect()
        };
        Self {
            python: owned(&BUILTIN_PYTHON),
            prompts: owned(&BUILTIN_PROMPTS),
        }
    }

    /// Built-ins overlaid with the templates in a YAML file. Entries in the
    /// file replace built-ins with the same id.
    pub fn from_overlay_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::builtin()
            .with_overlay_yaml(&text)
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub fn with_overlay_yaml(mut self, yaml: &str) -> Result<Self> {
        let file: TemplatesFile = serde_yaml::from_str(yaml)?;
        self.python.extend(file.python_templates);
        self.prompts.extend(file.prompt_templates);
        Ok(self)
    }

    /// Registry for `path` when set, else the built-ins.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_overlay_file(path),
            None => Ok(Self::builtin()),
        }
    }

    /// Script for `id`, falling back to `basic_threshold`.
    pub fn python(&self, id: Option<&str>) -> &str {
        id.and_then(|id| self.python.get(id))
            .or_else(|| self.python.get(DEFAULT_PYTHON_TEMPLATE))
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Prompt for `id`, falling back to `default_persona`.
    pub fn prompt(&self, id: Option<&str>) -> &str {
        id.and_then(|id| self.prompts.get(id))
            .or_else(|| self.prompts.get(DEFAULT_PROMPT_TEMPLATE))
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn python_ids(&self) -> impl Iterator<Item = &str> {
        self.python.keys().map(String::as_str)
    }

    pub fn prompt_ids(&self) -> impl Iterator<Item = &str> {
        self.prompts.keys().map(String::as_str)
    }
}
