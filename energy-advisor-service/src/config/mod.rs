use crate::services::providers::GenerationParams;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

pub const DEFAULT_GROQ_API_BASE: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_MODEL: &str = "deepseek-r1-distill-qwen-32b";
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TOP_P: f32 = 1.0;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct AdvisorConfig {
    pub common: core_config::Config,
    pub groq: GroqConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone)]
pub struct GroqConfig {
    pub api_key: Secret<String>,
    pub api_base: String,
    pub model: String,
    pub request_timeout_secs: u64,
}

/// Sampling settings applied to every upstream call.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            top_p: DEFAULT_TOP_P,
        }
    }
}

impl GenerationConfig {
    /// Parameters for one call. No stop sequences are ever sent.
    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            temperature: Some(self.temperature),
            top_p: Some(self.top_p),
            max_tokens: Some(self.max_tokens),
            stop_sequences: Vec::new(),
        }
    }
}

impl AdvisorConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        Ok(AdvisorConfig {
            common: common_config,
            groq: GroqConfig {
                api_key: Secret::new(get_env("GROQ_API_KEY", None, is_prod)?),
                api_base: get_env("GROQ_API_BASE", Some(DEFAULT_GROQ_API_BASE), is_prod)?,
                model: get_env("GROQ_MODEL", Some(DEFAULT_MODEL), is_prod)?,
                request_timeout_secs: get_parsed(
                    "GROQ_REQUEST_TIMEOUT_SECS",
                    DEFAULT_REQUEST_TIMEOUT_SECS,
                    is_prod,
                )?,
            },
            generation: GenerationConfig {
                temperature: get_parsed("GROQ_TEMPERATURE", DEFAULT_TEMPERATURE, is_prod)?,
                max_tokens: get_parsed("GROQ_MAX_TOKENS", DEFAULT_MAX_TOKENS, is_prod)?,
                top_p: get_parsed("GROQ_TOP_P", DEFAULT_TOP_P, is_prod)?,
            },
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn get_parsed<T>(key: &str, default: T, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr + ToString,
    T::Err: std::fmt::Display,
{
    let raw = get_env(key, Some(&default.to_string()), is_prod)?;
    parse_value(key, &raw)
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_generation_matches_advisor_settings() {
        let params = GenerationConfig::default().params();
        assert_eq!(params.temperature, Some(0.7));
        assert_eq!(params.max_tokens, Some(1024));
        assert_eq!(params.top_p, Some(1.0));
        assert!(params.stop_sequences.is_empty());
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let groq = GroqConfig {
            api_key: Secret::new("gsk-live-secret".to_string()),
            api_base: DEFAULT_GROQ_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        let rendered = format!("{:?}", groq);
        assert!(!rendered.contains("gsk-live-secret"));
        assert!(rendered.contains(DEFAULT_MODEL));
    }

    #[test]
    fn parse_value_accepts_padded_numbers() {
        let value: u32 = parse_value("GROQ_MAX_TOKENS", " 2048 ").unwrap();
        assert_eq!(value, 2048);
    }

    #[test]
    fn parse_value_rejects_garbage() {
        let err = parse_value::<f32>("GROQ_TEMPERATURE", "warm").unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert!(err.to_string().contains("GROQ_TEMPERATURE"));
    }
}
