use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use specgen_core::naming::DEFAULT_EXTENSION;
use specgen_core::selector::DEFAULT_THRESHOLD;

use crate::error::ConfigError;
use crate::llm::{AnthropicClient, LlmClient, OpenAiCompatibleClient, StubLlmClient};
use crate::pricing::{ModelPrice, PriceTable};
use crate::refine::{DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_TOKENS};

/// Answer of the `stub` provider; a well-formed test so dry runs succeed.
const STUB_TEST: &str = "test('stub', async ({ page }) => {\n  await expect(page).toHaveURL(/.*/);\n});";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub refinement: RefinementConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub generation: GenerationOptions,
    #[serde(default)]
    pub pricing: PricingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    /// Defaults per provider when unset.
    pub base_url: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_model() -> String {
    "claude-sonnet-4-5".into()
}
fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            base_url: None,
            model: default_model(),
            api_key: None,
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum LlmProvider {
    #[default]
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
    #[serde(rename = "stub")]
    Stub,
}

impl LlmProvider {
    fn default_base_url(self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "https://api.anthropic.com/v1",
            LlmProvider::OpenAiCompatible => "http://localhost:8000/v1",
            LlmProvider::Stub => "",
        }
    }

    fn key_env_var(self) -> Option<&'static str> {
        match self {
            LlmProvider::Anthropic => Some("ANTHROPIC_API_KEY"),
            LlmProvider::OpenAiCompatible => Some("OPENAI_API_KEY"),
            LlmProvider::Stub => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectionConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefinementConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Directory of existing `*.spec.ts` files shown to the model as exemplars.
    pub exemplar_dir: Option<PathBuf>,
    #[serde(default = "default_max_exemplars")]
    pub max_exemplars: usize,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_concurrency() -> usize {
    4
}
fn default_max_exemplars() -> usize {
    3
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            timeout_secs: default_timeout_secs(),
            max_concurrency: default_max_concurrency(),
            exemplar_dir: None,
            max_exemplars: default_max_exemplars(),
        }
    }
}

impl RefinementConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.into()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            extension: default_extension(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationOptions {
    /// Drop failed LLM cases instead of failing the whole document.
    #[serde(default)]
    pub partial_success: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PricingConfig {
    #[serde(default)]
    pub models: BTreeMap<String, ModelPrice>,
}

impl GenerationConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, else the user config file if it exists,
    /// else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "Loading user config");
                Self::from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// `$CONFIG_DIR/specgen/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("specgen").join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.selection.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "selection.threshold must be within [0, 1], got {threshold}"
            )));
        }
        if self.refinement.max_attempts == 0 {
            return Err(ConfigError::Invalid("refinement.max_attempts must be at least 1".into()));
        }
        if self.refinement.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "refinement.max_concurrency must be at least 1".into(),
            ));
        }
        if self.refinement.timeout_secs == 0 {
            return Err(ConfigError::Invalid("refinement.timeout_secs must be at least 1".into()));
        }
        if self.llm.max_tokens == 0 {
            return Err(ConfigError::Invalid("llm.max_tokens must be at least 1".into()));
        }
        if !self.output.extension.starts_with('.') || self.output.extension.len() < 2 {
            return Err(ConfigError::Invalid(format!(
                "output.extension must start with '.', got {:?}",
                self.output.extension
            )));
        }
        for (model, price) in &self.pricing.models {
            if price.input_per_mtok < 0.0 || price.output_per_mtok < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "pricing for model {model} must not be negative"
                )));
            }
        }
        Ok(())
    }

    pub fn base_url(&self) -> String {
        self.llm
            .base_url
            .clone()
            .unwrap_or_else(|| self.llm.provider.default_base_url().to_string())
    }

    /// `SPECGEN_LLM_API_KEY`, then the config file, then the provider's own
    /// environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var("SPECGEN_LLM_API_KEY")
            .ok()
            .or_else(|| self.llm.api_key.clone())
            .or_else(|| {
                self.llm
                    .provider
                    .key_env_var()
                    .and_then(|var| std::env::var(var).ok())
            })
            .filter(|key| !key.is_empty())
    }

    pub fn build_llm_client(&self) -> Arc<dyn LlmClient> {
        match self.llm.provider {
            LlmProvider::Anthropic => Arc::new(AnthropicClient::new(
                self.base_url(),
                self.llm.model.clone(),
                self.api_key(),
            )),
            LlmProvider::OpenAiCompatible => Arc::new(OpenAiCompatibleClient::new(
                self.base_url(),
                self.llm.model.clone(),
                self.api_key(),
            )),
            LlmProvider::Stub => Arc::new(StubLlmClient::constant(STUB_TEST)),
        }
    }

    pub fn price_table(&self) -> PriceTable {
        PriceTable::builtin().with_overrides(&self.pricing.models)
    }
}
