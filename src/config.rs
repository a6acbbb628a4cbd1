//! Carga y gestión de configuración de la aplicación (servidor, registro y LLM).

use std::env;
use std::path::PathBuf;
use anyhow::{anyhow, Context, Result};

#[derive(Clone, Debug)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub root_dir: PathBuf,
    pub registry_file: PathBuf,
    pub frontend_dir: PathBuf,

    /// Extensiones admitidas en `input` (hojas de cálculo).
    pub allowed_upload_extensions: Vec<String>,
    /// Extensiones admitidas en `processed` (fuentes ya procesadas).
    pub allowed_source_extensions: Vec<String>,

    pub llm_provider: LlmProvider,
    pub llm_chat_model: String,
    pub llm_text_model: String,
    pub llm_diagram_model: String,
    pub llm_prototype_model: String,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:5000".to_string());

        // Sin ROOT_DIR se usa la carpeta de datos local del usuario.
        let root_dir = match env::var("ROOT_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => match dirs::data_local_dir() {
                Some(dir) => dir.join("docgen_projects"),
                None => env::current_dir().context("No se pudo determinar el directorio actual")?,
            },
        };
        let registry_file = env::var("PROJECTS_REGISTRY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| root_dir.join("projects_registry.json"));
        let frontend_dir = env::var("FRONTEND_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("frontend"));

        let allowed_upload_extensions = parse_extensions(
            &env::var("ALLOWED_UPLOAD_EXTENSIONS").unwrap_or_else(|_| ".xlsx,.xls".to_string()),
        );
        let allowed_source_extensions = parse_extensions(
            &env::var("ALLOWED_SOURCE_EXTENSIONS")
                .unwrap_or_else(|_| ".txt,.csv,.png,.jpg,.jpeg".to_string()),
        );

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let llm_text_model =
            env::var("LLM_TEXT_MODEL").unwrap_or_else(|_| llm_chat_model.clone());
        let llm_diagram_model =
            env::var("LLM_DIAGRAM_MODEL").unwrap_or_else(|_| llm_chat_model.clone());
        let llm_prototype_model =
            env::var("LLM_PROTOTYPE_MODEL").unwrap_or_else(|_| llm_chat_model.clone());

        Ok(Self {
            server_addr,
            root_dir,
            registry_file,
            frontend_dir,
            allowed_upload_extensions,
            allowed_source_extensions,
            llm_provider,
            llm_chat_model,
            llm_text_model,
            llm_diagram_model,
            llm_prototype_model,
        })
    }
}

/// `".xlsx, XLS"` → `[".xlsx", ".xls"]`
pub fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|ext| ext.trim().to_lowercase())
        .filter(|ext| !ext.is_empty())
        .map(|ext| if ext.starts_with('.') { ext } else { format!(".{ext}") })
        .collect()
}

/// Comprueba la extensión de `file_name` contra una lista permitida.
pub fn is_allowed(file_name: &str, allowed: &[String]) -> bool {
    match file_name.rsplit_once('.') {
        Some((_, ext)) => allowed.contains(&format!(".{}", ext.to_lowercase())),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_lists_are_normalised() {
        assert_eq!(parse_extensions(".xlsx, XLS,,csv"), vec![".xlsx", ".xls", ".csv"]);
    }

    #[test]
    fn allowed_checks_last_extension() {
        let allowed = parse_extensions(".xlsx,.xls");
        assert!(is_allowed("Budget.XLSX", &allowed));
        assert!(!is_allowed("budget.xlsx.exe", &allowed));
        assert!(!is_allowed("noext", &allowed));
    }

    #[test]
    fn provider_names_are_case_insensitive() {
        assert!(matches!(LlmProvider::from_str("OpenAI"), Ok(LlmProvider::OpenAI)));
        assert!(LlmProvider::from_str("claude-local").is_err());
    }
}
