//! Configuration
//!
//! Budgets, sandbox settings and completion-service settings. Defaults can be
//! overridden through `CITYQUERY_*` / `OPENAI_*` environment variables.

use crate::error::{CityQueryError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Settings for the generate-execute-repair loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Repairs allowed after a crash (runtime failure, malformed artifact)
    pub max_hard_error_retries: u32,

    /// Repairs allowed after an empty or missing result. Kept lower than the
    /// hard-error budget because empty-result repairs use the larger prompt.
    pub max_empty_result_retries: u32,

    /// Wall-clock limit for one script execution
    pub attempt_timeout_secs: u64,

    /// Interpreter used to run generated scripts
    pub interpreter: String,

    /// Directory holding dataset copies, the script and the artifact
    pub workspace: PathBuf,

    /// Artifact file name, relative to the workspace
    pub artifact_name: String,

    /// Stop early when two consecutive attempts fail the same way
    pub abort_on_repeat_failure: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_hard_error_retries: 5,
            max_empty_result_retries: 3,
            attempt_timeout_secs: 120,
            interpreter: "python3".to_string(),
            workspace: PathBuf::from("./cityquery_work"),
            artifact_name: "results.csv".to_string(),
            abort_on_repeat_failure: false,
        }
    }
}

impl LoopConfig {
    /// Defaults overlaid with `CITYQUERY_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<u32>("CITYQUERY_MAX_HARD_ERROR_RETRIES")? {
            config.max_hard_error_retries = v;
        }
        if let Some(v) = env_parse::<u32>("CITYQUERY_MAX_EMPTY_RESULT_RETRIES")? {
            config.max_empty_result_retries = v;
        }
        if let Some(v) = env_parse::<u64>("CITYQUERY_ATTEMPT_TIMEOUT_SECS")? {
            config.attempt_timeout_secs = v;
        }
        if let Ok(v) = env::var("CITYQUERY_INTERPRETER") {
            config.interpreter = v;
        }
        if let Ok(v) = env::var("CITYQUERY_WORKSPACE") {
            config.workspace = PathBuf::from(v);
        }
        if let Ok(v) = env::var("CITYQUERY_ARTIFACT_NAME") {
            config.artifact_name = v;
        }
        if let Some(v) = env_parse::<bool>("CITYQUERY_ABORT_ON_REPEAT_FAILURE")? {
            config.abort_on_repeat_failure = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.attempt_timeout_secs == 0 {
            return Err(CityQueryError::Config(
                "attempt_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.interpreter.trim().is_empty() {
            return Err(CityQueryError::Config("interpreter must not be empty".to_string()));
        }
        if self.artifact_name.trim().is_empty() || self.artifact_name.contains(&['/', '\\'][..]) {
            return Err(CityQueryError::Config(format!(
                "artifact_name must be a plain file name, got '{}'",
                self.artifact_name
            )));
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Highest attempt ordinal the loop can reach on any path
    pub fn max_attempts(&self) -> u32 {
        self.max_hard_error_retries.max(self.max_empty_result_retries) + 1
    }
}

/// Settings for the OpenAI-compatible completion endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            temperature: 0.1,
            timeout_secs: 120,
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        config.api_key = env::var("OPENAI_API_KEY").map_err(|_| {
            CityQueryError::Config(
                "OPENAI_API_KEY not set. Add it to the environment or a .env file".to_string(),
            )
        })?;
        if let Ok(v) = env::var("OPENAI_MODEL") {
            config.model = v;
        }
        if let Ok(v) = env::var("OPENAI_BASE_URL") {
            config.base_url = v;
        }
        if let Some(v) = env_parse::<f32>("OPENAI_TEMPERATURE")? {
            config.temperature = v;
        }
        if let Some(v) = env_parse::<u64>("OPENAI_TIMEOUT_SECS")? {
            config.timeout_secs = v;
        }

        Ok(config)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| CityQueryError::Config(format!("invalid value for {}: '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}
