//! Conversión de hojas de cálculo a CSV / imagen.
//!
//! La conversión real depende de automatización de escritorio y queda fuera
//! del proceso; aquí sólo vive el contrato y la agregación de resultados.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ProjectError, ProjectResult};

/// Cómo exportar una hoja: como tabla (CSV) o como captura de interfaz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SheetKind {
    Table,
    Ui,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SheetStatus {
    Success,
    Error,
}

/// Resultado de convertir una hoja.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetResult {
    pub status: SheetStatus,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<SheetKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SheetResult {
    pub fn success(kind: SheetKind, output_path: impl Into<String>) -> Self {
        Self {
            status: SheetStatus::Success,
            kind: Some(kind),
            output_path: Some(output_path.into()),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: SheetStatus::Error,
            kind: None,
            output_path: None,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SheetStatus::Success
    }
}

/// Estado global de un lote de conversiones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Success,
    Partial,
    Error,
}

impl BatchStatus {
    /// `success` si todo fue bien, `error` si nada fue bien (o no hubo nada
    /// que procesar) y `partial` en cualquier otro caso.
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a SheetResult>) -> Self {
        let (mut ok, mut failed) = (0usize, 0usize);
        for r in results {
            if r.is_success() {
                ok += 1;
            } else {
                failed += 1;
            }
        }
        match (ok, failed) {
            (0, _) => Self::Error,
            (_, 0) => Self::Success,
            _ => Self::Partial,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

pub trait SheetConverter: Send + Sync {
    fn sheet_names(&self, file_path: &Path) -> ProjectResult<Vec<String>>;

    /// Un fallo en una hoja no aborta el resto del lote.
    fn process_sheets(
        &self,
        file_path: &Path,
        output_dir: &Path,
        sheets: &BTreeMap<String, SheetKind>,
    ) -> BTreeMap<String, SheetResult>;
}

/// Conversor por defecto cuando no hay automatización de hojas disponible.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredConverter;

impl SheetConverter for UnconfiguredConverter {
    fn sheet_names(&self, file_path: &Path) -> ProjectResult<Vec<String>> {
        Err(ProjectError::External(format!(
            "No hay conversor de hojas configurado para {}",
            file_path.display()
        )))
    }

    fn process_sheets(
        &self,
        file_path: &Path,
        _output_dir: &Path,
        sheets: &BTreeMap<String, SheetKind>,
    ) -> BTreeMap<String, SheetResult> {
        warn!(
            "Conversión de {} omitida: no hay conversor de hojas configurado",
            file_path.display()
        );
        sheets
            .keys()
            .map(|sheet| {
                (
                    sheet.clone(),
                    SheetResult::error("Spreadsheet conversion is not available on this host"),
                )
            })
            .collect()
    }
}
