//! Vista de contexto derivada de un proyecto, consumida por los agentes de
//! generación. Se reconstruye en cada re-escaneo salvo requisitos y stack.

use std::collections::BTreeMap;
use std::fs;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Líneas de cada CSV que se incluyen en la descripción para los prompts.
const CSV_PREVIEW_LINES: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub input_description: String,
    #[serde(default)]
    pub output_description: String,
    #[serde(default)]
    pub features: BTreeMap<String, String>,
    #[serde(default)]
    pub further_requirements: String,
}

#[derive(Debug, Clone, Default)]
pub struct ContextView {
    pub project_name: String,
    pub tech_stack: String,
    pub requirements: Requirements,
    /// Contenido completo de cada CSV procesado.
    pub csv_description: Vec<String>,
    pub ui_image: Vec<String>,
    pub diagram_image: Vec<String>,

    // Cachés efímeras del ciclo de generación actual; no se persisten.
    pub generated_text_docs: BTreeMap<String, String>,
    pub generated_diagrams: BTreeMap<String, Value>,
    pub prototype_code: String,
}

impl ContextView {
    pub fn new(project_name: &str) -> Self {
        Self {
            project_name: project_name.to_string(),
            ..Self::default()
        }
    }

    /// Reconstruye los datos derivados de los ficheros procesados.
    /// No toca `requirements` ni `tech_stack`.
    pub fn update_from_project(
        &mut self,
        project_name: &str,
        csv_paths: &[String],
        image_paths: &[String],
    ) {
        self.project_name = project_name.to_string();

        self.csv_description = csv_paths
            .iter()
            .filter_map(|path| match fs::read_to_string(path) {
                Ok(content) => Some(content),
                Err(e) => {
                    warn!("No se pudo leer el CSV {path} para el contexto: {e}");
                    None
                }
            })
            .collect();

        // Aún no se distingue entre capturas de UI y diagramas.
        self.ui_image = image_paths.to_vec();
        self.diagram_image = image_paths.to_vec();
    }

    /// Sólo en memoria: el llamador debe guardar los metadatos del proyecto.
    pub fn update_requirements_and_stack(&mut self, requirements: Requirements, tech_stack: String) {
        self.requirements = requirements;
        self.tech_stack = tech_stack;
    }

    pub fn add_generated_text_doc(&mut self, name: &str, content: &str) {
        self.generated_text_docs
            .insert(name.to_string(), content.to_string());
    }

    pub fn add_generated_diagram(&mut self, name: &str, diagram: Value) {
        self.generated_diagrams.insert(name.to_string(), diagram);
    }

    pub fn set_prototype_code(&mut self, html: &str) {
        self.prototype_code = html.to_string();
    }

    /// Texto que los agentes incrustan en sus prompts.
    pub fn describe(&self) -> String {
        let tech_stack = if self.tech_stack.is_empty() {
            "Not specified"
        } else {
            self.tech_stack.as_str()
        };
        let mut parts = vec![
            format!("Project Name: {}", self.project_name),
            format!("Tech Stack: {tech_stack}"),
        ];

        let req = &self.requirements;
        if !req.input_description.is_empty() {
            parts.push(format!("Input Description: {}", req.input_description));
        }
        if !req.output_description.is_empty() {
            parts.push(format!("Output Description: {}", req.output_description));
        }
        if !req.features.is_empty() {
            let features: Vec<String> = req
                .features
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect();
            parts.push(format!("Features: {}", features.join(", ")));
        }
        if !req.further_requirements.is_empty() {
            parts.push(format!("Further Requirements: {}", req.further_requirements));
        }

        if !self.csv_description.is_empty() {
            parts.push(format!(
                "Available Data: {} CSV files",
                self.csv_description.len()
            ));
            for (i, csv) in self.csv_description.iter().enumerate() {
                if csv.is_empty() {
                    continue;
                }
                let preview: Vec<&str> = csv.lines().take(CSV_PREVIEW_LINES).collect();
                parts.push(format!("CSV Data Structure {}:\n{}", i + 1, preview.join("\n")));
            }
        }

        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unreadable_csv_is_skipped() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.csv");
        fs::write(&good, "a,b\n1,2\n").unwrap();
        let missing = dir.path().join("missing.csv");

        let mut ctx = ContextView::new("Demo");
        ctx.update_from_project(
            "Demo",
            &[
                missing.to_string_lossy().to_string(),
                good.to_string_lossy().to_string(),
            ],
            &["/x/ui.png".to_string()],
        );

        assert_eq!(ctx.csv_description, vec!["a,b\n1,2\n".to_string()]);
        assert_eq!(ctx.ui_image, ctx.diagram_image);
    }

    #[test]
    fn rescan_keeps_requirements_and_stack() {
        let mut ctx = ContextView::new("Demo");
        let mut features = BTreeMap::new();
        features.insert("auth".to_string(), "OAuth2".to_string());
        ctx.update_requirements_and_stack(
            Requirements {
                features,
                ..Requirements::default()
            },
            "Rust + axum".to_string(),
        );

        ctx.update_from_project("Demo renamed", &[], &[]);

        assert_eq!(ctx.tech_stack, "Rust + axum");
        assert_eq!(ctx.requirements.features["auth"], "OAuth2");
        assert_eq!(ctx.project_name, "Demo renamed");
    }

    #[test]
    fn describe_includes_csv_preview() {
        let mut ctx = ContextView::new("Demo");
        let csv: String = (0..20).map(|i| format!("row{i}\n")).collect();
        ctx.csv_description.push(csv);

        let text = ctx.describe();
        assert!(text.contains("Tech Stack: Not specified"));
        assert!(text.contains("row9"));
        assert!(!text.contains("row10"));
    }
}
