//! Carga y gestión de configuración de la aplicación (GitHub + proveedores LLM).

use anyhow::{anyhow, Result};
use std::env;

/// Proveedor de completions seleccionado por la credencial disponible.
/// Si hay credenciales de ambos, OpenAI tiene prioridad.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Anthropic,
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,

    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openai_chat_model: String,
    pub anthropic_chat_model: String,

    pub github_token: Option<String>,
    pub github_api_base: String,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    ///
    /// Tiene que haber al menos una credencial de proveedor LLM; sin ninguna,
    /// la aplicación no puede responder preguntas y falla ya en el arranque.
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let openai_api_key = env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
        let anthropic_api_key = env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty());

        if openai_api_key.is_none() && anthropic_api_key.is_none() {
            return Err(anyhow!(
                "No hay ninguna credencial LLM configurada. Define OPENAI_API_KEY o ANTHROPIC_API_KEY."
            ));
        }

        let openai_chat_model =
            env::var("OPENAI_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let anthropic_chat_model = env::var("ANTHROPIC_CHAT_MODEL")
            .unwrap_or_else(|_| "claude-3-5-sonnet-20241022".to_string());

        let github_token = env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
        let github_api_base =
            env::var("GITHUB_API_BASE").unwrap_or_else(|_| "https://api.github.com".to_string());

        Ok(Self {
            server_addr,
            openai_api_key,
            anthropic_api_key,
            openai_chat_model,
            anthropic_chat_model,
            github_token,
            github_api_base,
        })
    }

    /// Proveedor activo según las credenciales presentes.
    pub fn llm_provider(&self) -> Result<LlmProvider> {
        if self.openai_api_key.is_some() {
            Ok(LlmProvider::OpenAI)
        } else if self.anthropic_api_key.is_some() {
            Ok(LlmProvider::Anthropic)
        } else {
            Err(anyhow!(
                "No hay ninguna credencial LLM configurada. Define OPENAI_API_KEY o ANTHROPIC_API_KEY."
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_base() -> AppConfig {
        AppConfig {
            server_addr: "127.0.0.1:3322".to_string(),
            openai_api_key: None,
            anthropic_api_key: None,
            openai_chat_model: "gpt-4o-mini".to_string(),
            anthropic_chat_model: "claude-3-5-sonnet-20241022".to_string(),
            github_token: None,
            github_api_base: "https://api.github.com".to_string(),
        }
    }

    #[test]
    fn openai_tiene_prioridad_si_hay_ambas_credenciales() {
        let mut cfg = config_base();
        cfg.openai_api_key = Some("sk-test".to_string());
        cfg.anthropic_api_key = Some("ak-test".to_string());
        assert_eq!(cfg.llm_provider().unwrap(), LlmProvider::OpenAI);
    }

    #[test]
    fn anthropic_si_solo_hay_su_credencial() {
        let mut cfg = config_base();
        cfg.anthropic_api_key = Some("ak-test".to_string());
        assert_eq!(cfg.llm_provider().unwrap(), LlmProvider::Anthropic);
    }

    #[test]
    fn sin_credenciales_es_error() {
        assert!(config_base().llm_provider().is_err());
    }
}
