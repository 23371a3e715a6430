//! Language configuration for snippet execution

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Languages with an executor implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Bash,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Bash => "bash",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    /// Canonical names only; aliases are resolved by [`LanguageTable`]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" => Ok(Language::Python),
            "bash" => Ok(Language::Bash),
            other => Err(other.to_string()),
        }
    }
}

/// How to run a snippet of one language
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageConfig {
    pub language: Language,
    /// Name of the snippet file (e.g., ".snippet.py")
    pub source_file: String,
    /// Run command template
    pub run_command: Vec<String>,
    /// Extra KEY=VALUE environment variables
    pub env: Vec<String>,
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    run_command: String,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Language table plus alias lookup
#[derive(Debug, Clone)]
pub struct LanguageTable {
    configs: HashMap<Language, LanguageConfig>,
    aliases: HashMap<String, Language>,
}

impl LanguageTable {
    /// The table compiled into the binary
    pub fn embedded() -> anyhow::Result<Self> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        Self::parse(content)
    }

    /// Load from `path` when given, otherwise the embedded table
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Self::parse(&content)
                    .with_context(|| format!("Invalid language table {}", path.display()))
            }
            None => Self::embedded(),
        }
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut configs = HashMap::new();
        let mut aliases = HashMap::new();

        for (name, raw) in raw_configs {
            let language = match name.parse::<Language>() {
                Ok(language) => language,
                Err(_) => {
                    warn!("Skipping language without an executor: {}", name);
                    continue;
                }
            };

            let run_command = into_command(&raw.run_command);
            if run_command.is_empty() {
                anyhow::bail!("Empty run_command for {}", name);
            }
            if raw.source_file.trim().is_empty() || raw.source_file.contains('/') {
                anyhow::bail!("Invalid source_file for {}: {:?}", name, raw.source_file);
            }

            configs.insert(
                language,
                LanguageConfig {
                    language,
                    source_file: raw.source_file,
                    run_command,
                    env: raw.env,
                },
            );

            aliases.insert(language.as_str().to_string(), language);
            for alias in raw.aliases {
                aliases.insert(alias.to_lowercase(), language);
            }
        }

        Ok(Self { configs, aliases })
    }

    /// Resolve a request token (canonical name or alias) to a language
    pub fn resolve(&self, token: &str) -> Option<Language> {
        self.aliases.get(&token.trim().to_lowercase()).copied()
    }

    pub fn get(&self, language: Language) -> Option<&LanguageConfig> {
        self.configs.get(&language)
    }

    /// Every token (canonical name included) that resolves to `language`
    pub fn aliases_of(&self, language: Language) -> impl Iterator<Item = String> + '_ {
        self.aliases
            .iter()
            .filter(move |(_, lang)| **lang == language)
            .map(|(alias, _)| alias.clone())
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
