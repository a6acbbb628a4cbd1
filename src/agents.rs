//! Agentes de generación (Markdown, diagramas, prototipos HTML y chat).
//!
//! Los agentes no guardan estado del proyecto: reciben la `ContextView` en
//! cada llamada. La capacidad multimodal se compone mediante
//! `MultimodalContentBuilder`, y el estado "imágenes ya enviadas" vive en la
//! conversación (`ChatSession`), no en el agente compartido.
//!
//! Todos los fallos del LLM se registran y se convierten en `None`.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    context::ContextView,
    diagram::{self, DiagramType},
    llm::{AgentRole, LlmManager},
    models::sanitize_name,
};

/// Máximo de imágenes que se adjuntan a un mensaje.
const MAX_IMAGES: usize = 10;

/// Backend de completions. `LlmManager` es la implementación real; los
/// tests usan respuestas fijas.
pub trait CompletionBackend: Clone + Send + Sync {
    async fn complete(&self, role: AgentRole, system: &str, user: &str) -> Result<String>;
}

impl CompletionBackend for LlmManager {
    async fn complete(&self, role: AgentRole, system: &str, user: &str) -> Result<String> {
        LlmManager::complete(self, role, system, user).await
    }
}

/// Contrato común de los agentes que producen documentos.
pub trait GenerationAgent {
    async fn generate(&self, context: &ContextView, prompt: &str) -> Option<String>;

    async fn edit(&self, instructions: &str, current_content: &str, context: &ContextView) -> Option<String>;
}

// ---------------------------------------------------------------------
// CONTENIDO MULTIMODAL
// ---------------------------------------------------------------------

pub trait MultimodalContentBuilder {
    /// Compone el contenido del usuario a partir del prompt y, si procede,
    /// de las imágenes procesadas del proyecto.
    fn build_user_content(&self, prompt: &str, image_paths: &[String], include_images: bool) -> String;
}

/// Referencia las imágenes por nombre en el propio mensaje.
#[derive(Debug, Clone, Copy)]
pub struct ImageReferenceBuilder {
    pub max_images: usize,
}

impl Default for ImageReferenceBuilder {
    fn default() -> Self {
        Self {
            max_images: MAX_IMAGES,
        }
    }
}

impl MultimodalContentBuilder for ImageReferenceBuilder {
    fn build_user_content(&self, prompt: &str, image_paths: &[String], include_images: bool) -> String {
        if !include_images || image_paths.is_empty() {
            return prompt.to_string();
        }

        let names: Vec<String> = image_paths
            .iter()
            .take(self.max_images)
            .map(|p| {
                Path::new(p)
                    .file_name()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| p.clone())
            })
            .collect();
        info!("Añadiendo {} imágenes al mensaje", names.len());

        format!(
            "{prompt}\n\nNote: I'm also analyzing {} images from this project's processed directory:\n{}\n\nPlease consider these images when generating the response.",
            names.len(),
            names.join(", ")
        )
    }
}

// ---------------------------------------------------------------------
// AGENTES
// ---------------------------------------------------------------------

async fn ask<B: CompletionBackend>(backend: &B, role: AgentRole, system: &str, user: &str) -> Option<String> {
    match backend.complete(role, system, user).await {
        Ok(answer) => Some(answer),
        Err(e) => {
            warn!("Error en el agente {role:?}: {e}");
            None
        }
    }
}

/// Quita un bloque ```lang ... ``` que envuelva toda la respuesta.
fn strip_code_fence<'a>(content: &'a str, lang: &str) -> &'a str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return content;
    };
    let rest = rest.strip_prefix(lang).unwrap_or(rest);
    match rest.strip_suffix("```") {
        Some(inner) => inner.trim(),
        None => content,
    }
}

#[derive(Clone)]
pub struct TextDocumentAgent<B> {
    backend: B,
    content: ImageReferenceBuilder,
}

impl<B: CompletionBackend> TextDocumentAgent<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            content: ImageReferenceBuilder::default(),
        }
    }
}

impl<B: CompletionBackend> GenerationAgent for TextDocumentAgent<B> {
    async fn generate(&self, context: &ContextView, prompt: &str) -> Option<String> {
        let system = format!(
            "You are a technical documentation expert. Generate high-quality Markdown documents based on project data and requirements.\n\nProject Context:\n{}\n\nStart with a clear title using a # header and return only the document.",
            context.describe()
        );
        let user = self.content.build_user_content(
            &format!("Generate a document: {prompt}"),
            &context.ui_image,
            true,
        );
        let answer = ask(&self.backend, AgentRole::Text, &system, &user).await?;
        Some(strip_code_fence(&answer, "markdown").to_string())
    }

    async fn edit(&self, instructions: &str, current_content: &str, context: &ContextView) -> Option<String> {
        let system = format!(
            "You are a technical documentation editor. Edit Markdown documents following the instructions precisely and return the complete edited document.\n\nProject Context:\n{}",
            context.describe()
        );
        let user = format!(
            "Instructions: {instructions}\n\nCurrent Document Content:\n{current_content}\n\nPlease provide the complete edited document."
        );
        let answer = ask(&self.backend, AgentRole::Text, &system, &user).await?;
        Some(strip_code_fence(&answer, "markdown").to_string())
    }
}

#[derive(Clone)]
pub struct DiagramAgent<B> {
    backend: B,
    content: ImageReferenceBuilder,
}

impl<B: CompletionBackend> DiagramAgent<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            content: ImageReferenceBuilder::default(),
        }
    }

    fn change_format_hint(diagram_type: DiagramType) -> &'static str {
        match diagram_type {
            DiagramType::UseCase => {
                r#"{"changes": {"actors": {"add": [{"name": "", "description": ""}], "remove": ["Name"]}, "useCases": {"add": [{"name": "", "description": ""}], "remove": ["Name"]}, "relationships": {"add": [{"from": "Actor", "to": "UseCase", "type": "association"}], "remove": [{"from": "Actor", "to": "UseCase", "type": "association"}]}}}"#
            }
            _ => {
                r#"{"changes": {"classes": {"add": [{"name": "", "type": "class", "attributes": [], "methods": []}], "remove": ["Name"]}, "relationships": {"add": [{"fromClass": "A", "toClass": "B", "type": "association", "label": ""}], "remove": [{"from": "A", "to": "B", "type": "association"}]}}}"#
            }
        }
    }
}

impl<B: CompletionBackend> GenerationAgent for DiagramAgent<B> {
    async fn generate(&self, context: &ContextView, prompt: &str) -> Option<String> {
        let diagram_type = diagram::determine_diagram_type(prompt);
        let system = format!(
            "You are a UML diagram expert. Generate valid JSON representations of UML diagrams based on project data.\n\nProject Context:\n{}\n\nTarget Diagram Type: {}\nInclude the keys \"diagramType\" and \"diagramName\". Return ONLY valid JSON.",
            context.describe(),
            diagram_type.label()
        );
        let user = self.content.build_user_content(
            &format!("Generate a {} for this project: {prompt}", diagram_type.label()),
            &context.diagram_image,
            true,
        );
        let answer = ask(&self.backend, AgentRole::Diagram, &system, &user).await?;

        let Some(json) = diagram::extract_json(&answer) else {
            warn!("La respuesta del diagrama no contiene JSON; se devuelve tal cual.");
            return Some(answer);
        };
        let valid = serde_json::from_str::<Value>(&json)
            .map(|v| diagram::validate_diagram(&v, diagram_type))
            .unwrap_or(false);
        if !valid {
            warn!("El JSON generado no supera la validación de {}", diagram_type.label());
        }
        Some(json)
    }

    /// Pide al LLM sólo un conjunto de cambios y lo fusiona localmente.
    async fn edit(&self, instructions: &str, current_content: &str, context: &ContextView) -> Option<String> {
        let current: Value = match serde_json::from_str(current_content) {
            Ok(v) => v,
            Err(e) => {
                warn!("El diagrama actual no es JSON válido: {e}");
                return None;
            }
        };
        let diagram_type = current
            .get("diagramType")
            .and_then(Value::as_str)
            .and_then(DiagramType::from_label)
            .unwrap_or(DiagramType::Class);

        let system = format!(
            "You are a UML diagram expert. Analyze the user's instructions and return ONLY a JSON object describing the changes needed.\n\nProject Context:\n{}\n\nCurrent Diagram Type: {}\n\nReturn a JSON object with this structure:\n{}\n\nUse empty arrays for sections with no changes.",
            context.describe(),
            diagram_type.label(),
            Self::change_format_hint(diagram_type)
        );
        let pretty = serde_json::to_string_pretty(&current).unwrap_or_else(|_| current_content.to_string());
        let user = self.content.build_user_content(
            &format!("Current diagram structure:\n{pretty}\n\nInstructions: {instructions}\n\nReturn the JSON change object describing exactly what needs to be added or removed."),
            &context.diagram_image,
            true,
        );
        let answer = ask(&self.backend, AgentRole::Diagram, &system, &user).await?;

        let Some(changes_json) = diagram::extract_json(&answer) else {
            warn!("No se pudo extraer un JSON de cambios de la respuesta.");
            return None;
        };
        let changes: Value = serde_json::from_str(&changes_json).ok()?;
        let merged = diagram::apply_changes(&current, &changes);
        serde_json::to_string_pretty(&merged).ok()
    }
}

#[derive(Clone)]
pub struct PrototypeAgent<B> {
    backend: B,
    content: ImageReferenceBuilder,
}

impl<B: CompletionBackend> PrototypeAgent<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            content: ImageReferenceBuilder::default(),
        }
    }
}

/// Extrae un documento HTML completo de la respuesta del LLM.
pub fn extract_html(content: &str) -> Option<String> {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    static OPEN: OnceLock<Regex> = OnceLock::new();
    let fenced = FENCED.get_or_init(|| {
        RegexBuilder::new(r"```(?:html)?\s*(<!DOCTYPE html.*?</html>)\s*```")
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .expect("regex de bloque HTML válida")
    });
    if let Some(caps) = fenced.captures(content) {
        return Some(caps[1].to_string());
    }

    let open = OPEN.get_or_init(|| {
        RegexBuilder::new(r"<!DOCTYPE html|<html")
            .case_insensitive(true)
            .build()
            .expect("regex de inicio HTML válida")
    });
    let start = open.find(content)?.start();
    let tail = &content[start..];
    // Minúsculas ASCII: mismos desplazamientos en bytes que `tail`.
    let end = tail.to_ascii_lowercase().find("</html>")?;
    Some(tail[..end + "</html>".len()].to_string())
}

impl<B: CompletionBackend> GenerationAgent for PrototypeAgent<B> {
    async fn generate(&self, context: &ContextView, prompt: &str) -> Option<String> {
        let prompt = if prompt.trim().is_empty() {
            "Create an interactive prototype of the main screens of this application."
        } else {
            prompt
        };
        let system = format!(
            "You are a front-end developer. Build a single self-contained HTML file (inline CSS and JavaScript) that prototypes the application.\n\nProject Context:\n{}\n\nReturn only the HTML document starting with <!DOCTYPE html>.",
            context.describe()
        );
        let user = self.content.build_user_content(prompt, &context.ui_image, true);
        let answer = ask(&self.backend, AgentRole::Prototype, &system, &user).await?;
        Some(extract_html(&answer).unwrap_or(answer))
    }

    async fn edit(&self, instructions: &str, current_content: &str, context: &ContextView) -> Option<String> {
        let system = format!(
            "You are a front-end developer editing a single-file HTML prototype. Apply the instructions and return the complete updated HTML document.\n\nProject Context:\n{}",
            context.describe()
        );
        let user = format!("Instructions: {instructions}\n\nCurrent HTML:\n{current_content}");
        let answer = ask(&self.backend, AgentRole::Prototype, &system, &user).await?;
        extract_html(&answer)
    }
}

/// Estado de una conversación: las imágenes sólo se envían en el primer
/// mensaje.
#[derive(Debug, Clone, Default)]
pub struct ChatSession {
    pub images_sent: bool,
}

#[derive(Clone)]
pub struct ChatAgent<B> {
    backend: B,
    content: ImageReferenceBuilder,
}

impl<B: CompletionBackend> ChatAgent<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            content: ImageReferenceBuilder::default(),
        }
    }

    pub async fn respond(&self, session: &mut ChatSession, context: &ContextView, message: &str) -> Option<String> {
        let system = format!(
            "You are a helpful AI assistant working on a document generation project.\n\nProject Context:\n{}\n\nBe concise but informative.",
            context.describe()
        );
        let include_images = !session.images_sent && !context.ui_image.is_empty();
        let user = self
            .content
            .build_user_content(message, &context.ui_image, include_images);
        let answer = ask(&self.backend, AgentRole::Chat, &system, &user).await?;
        if include_images {
            session.images_sent = true;
        }
        Some(answer)
    }
}

/// Conjunto de agentes compartidos, creado al arrancar el proceso.
#[derive(Clone)]
pub struct Agents<B> {
    pub text: TextDocumentAgent<B>,
    pub diagram: DiagramAgent<B>,
    pub prototype: PrototypeAgent<B>,
    pub chat: ChatAgent<B>,
}

impl<B: CompletionBackend> Agents<B> {
    pub fn new(backend: B) -> Self {
        Self {
            text: TextDocumentAgent::new(backend.clone()),
            diagram: DiagramAgent::new(backend.clone()),
            prototype: PrototypeAgent::new(backend.clone()),
            chat: ChatAgent::new(backend),
        }
    }
}

/// Nombre de fichero para un Markdown generado: su primer título.
pub fn markdown_file_name(markdown: &str) -> String {
    let title = markdown
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .trim_start_matches('#')
        .trim();
    let title = if title.is_empty() { "document" } else { title };
    format!("{}.md", title.replace(' ', "_").replace(['/', '\\'], "-"))
}

fn file_stem(project_name: &str) -> String {
    sanitize_name(project_name).replace(['/', '\\'], "-")
}

/// `<proyecto>_<tipo>_diagram.json`
pub fn diagram_file_name(project_name: &str, diagram_type: DiagramType) -> String {
    format!("{}_{}_diagram.json", file_stem(project_name), diagram_type.slug())
}

/// `<proyecto>_prototype.html`
pub fn prototype_file_name(project_name: &str) -> String {
    format!("{}_prototype.html", file_stem(project_name))
}
