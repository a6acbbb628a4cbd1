//! Abstracción sobre Rig para trabajar con distintos proveedores de LLM.
//! De momento se implementa OpenAI; Gemini/Ollama quedan preparados para el futuro.

use crate::config::{AppConfig, LlmProvider};
use anyhow::{anyhow, Result};
use rig::completion::Prompt;

/// Modelo por defecto si no se ha configurado otro.
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

/// Para qué agente se pide la completion; cada uno puede usar un modelo distinto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Chat,
    Text,
    Diagram,
    Prototype,
}

/// Gestor de LLMs.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub chat_model: String,
    pub text_model: String,
    pub diagram_model: String,
    pub prototype_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Ok(Self {
            provider: cfg.llm_provider.clone(),
            chat_model: cfg.llm_chat_model.clone(),
            text_model: cfg.llm_text_model.clone(),
            diagram_model: cfg.llm_diagram_model.clone(),
            prototype_model: cfg.llm_prototype_model.clone(),
        })
    }

    pub fn model_for(&self, role: AgentRole) -> &str {
        let model = match role {
            AgentRole::Chat => &self.chat_model,
            AgentRole::Text => &self.text_model,
            AgentRole::Diagram => &self.diagram_model,
            AgentRole::Prototype => &self.prototype_model,
        };
        if model.is_empty() {
            DEFAULT_CHAT_MODEL
        } else {
            model.as_str()
        }
    }

    // ---------------------------------------------------------------------
    // CHAT / COMPLETION
    // ---------------------------------------------------------------------

    /// Envía un mensaje de sistema y el contenido del usuario y devuelve el
    /// texto de la respuesta.
    pub async fn complete(&self, role: AgentRole, system: &str, user: &str) -> Result<String> {
        match self.provider {
            LlmProvider::OpenAI => self.complete_with_openai(role, system, user).await,
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para chat",
                other
            )),
        }
    }

    async fn complete_with_openai(&self, role: AgentRole, system: &str, user: &str) -> Result<String> {
        use rig::providers::openai;
        // Trait para client.agent(...)
        use rig::client::CompletionClient as _;

        let client = openai::Client::from_env();

        let agent = client
            .agent(self.model_for(role))
            .preamble(system)
            .build();

        let answer = agent.prompt(user).await?;
        Ok(answer)
    }
}
