//! Modelos de dominio: registros de ficheros, cubos del proyecto, historial de
//! procesamiento y entradas del registro global de proyectos.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ProjectError;

/// Nombre del fichero de metadatos dentro de cada carpeta de proyecto.
pub const METADATA_FILENAME: &str = "project_metadata.json";

/// Sufijo de los ficheros auxiliares de geometría; nunca se rastrean.
pub const GEOMETRY_SUFFIX: &str = ".geometry.json";

/// Uno de los tres cubos fijos de un proyecto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Input,
    Processed,
    Output,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::Input, Bucket::Processed, Bucket::Output];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Processed => "processed",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bucket {
    type Err = ProjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(Self::Input),
            "processed" => Ok(Self::Processed),
            "output" => Ok(Self::Output),
            other => Err(ProjectError::Validation(format!(
                "Cubo desconocido '{other}'. Debe ser 'input', 'processed' u 'output'"
            ))),
        }
    }
}

/// Tipo de fichero deducido de la extensión.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Text,
    Image,
    Excel,
    Pdf,
    Json,
    Html,
    File,
}

impl FileKind {
    pub fn from_file_name(name: &str) -> Self {
        let extension = Path::new(name)
            .extension()
            .and_then(std::ffi::OsStr::to_str)
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "txt" | "md" | "csv" => Self::Text,
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "svg" => Self::Image,
            "xlsx" | "xls" => Self::Excel,
            "pdf" => Self::Pdf,
            "json" => Self::Json,
            "html" | "htm" => Self::Html,
            _ => Self::File,
        }
    }
}

/// Un fichero rastreado. Sólo se sustituye entero durante un re-escaneo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub added_date: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub modified_date: DateTime<Utc>,
    pub size: u64,
}

impl FileRecord {
    pub fn has_extension(&self, extensions: &[&str]) -> bool {
        let lower = self.path.to_lowercase();
        extensions.iter().any(|ext| lower.ends_with(ext))
    }
}

/// Colecciones de registros por cubo, siempre ordenadas por nombre.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectFiles {
    #[serde(default)]
    pub input: Vec<FileRecord>,
    #[serde(default)]
    pub processed: Vec<FileRecord>,
    #[serde(default)]
    pub output: Vec<FileRecord>,
}

impl ProjectFiles {
    pub fn get(&self, bucket: Bucket) -> &[FileRecord] {
        match bucket {
            Bucket::Input => &self.input,
            Bucket::Processed => &self.processed,
            Bucket::Output => &self.output,
        }
    }

    pub fn set(&mut self, bucket: Bucket, records: Vec<FileRecord>) {
        match bucket {
            Bucket::Input => self.input = records,
            Bucket::Processed => self.processed = records,
            Bucket::Output => self.output = records,
        }
    }

    pub fn find(&self, bucket: Bucket, name: &str) -> Option<&FileRecord> {
        self.get(bucket).iter().find(|f| f.name == name)
    }

    pub fn total(&self) -> usize {
        self.input.len() + self.processed.len() + self.output.len()
    }
}

/// Referencia a un fichero producido por una operación.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFileRef {
    pub path: String,
    pub name: String,
}

impl OutputFileRef {
    pub fn from_path(path: &Path) -> Self {
        Self {
            path: path.to_string_lossy().to_string(),
            name: path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
        }
    }
}

/// Entrada inmutable del historial de procesamiento.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub input_files: Vec<String>,
    pub output_files: Vec<OutputFileRef>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Espejo desnormalizado de un proyecto en el registro global.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub base_dir: String,
    #[serde(default)]
    pub project_dir_name: String,
    pub created_date: String,
    pub modified_date: String,
}

impl RegistryEntry {
    /// Nombre de la carpeta del proyecto; los registros antiguos pueden no traerlo.
    pub fn dir_name(&self) -> String {
        if self.project_dir_name.is_empty() {
            project_dir_name(&self.name, &self.id)
        } else {
            self.project_dir_name.clone()
        }
    }

    pub fn metadata_path(&self) -> PathBuf {
        PathBuf::from(&self.base_dir)
            .join(self.dir_name())
            .join(METADATA_FILENAME)
    }
}

/// Fecha ISO-8601 con o sin zona horaria. Sin zona se toma como UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("fecha no válida: '{raw}'")))
}

pub fn sanitize_name(name: &str) -> String {
    name.replace(' ', "_")
}

/// `<nombre_saneado>_<id>`
pub fn project_dir_name(name: &str, id: &str) -> String {
    format!("{}_{}", sanitize_name(name), id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_parsing_rejects_unknown_names() {
        assert_eq!("processed".parse::<Bucket>().unwrap(), Bucket::Processed);
        let err = "archive".parse::<Bucket>().unwrap_err();
        assert!(matches!(err, ProjectError::Validation(_)));
    }

    #[test]
    fn file_kind_is_case_insensitive() {
        assert_eq!(FileKind::from_file_name("Sheet.XLSX"), FileKind::Excel);
        assert_eq!(FileKind::from_file_name("notes.md"), FileKind::Text);
        assert_eq!(FileKind::from_file_name("page.htm"), FileKind::Html);
        assert_eq!(FileKind::from_file_name("Makefile"), FileKind::File);
    }

    #[test]
    fn registry_entry_derives_missing_dir_name() {
        let entry = RegistryEntry {
            id: "abc12345".into(),
            name: "My Demo".into(),
            base_dir: "/data".into(),
            project_dir_name: String::new(),
            created_date: "2024-01-01T00:00:00".into(),
            modified_date: "2024-01-01T00:00:00".into(),
        };
        assert_eq!(entry.dir_name(), "My_Demo_abc12345");
        assert_eq!(
            entry.metadata_path(),
            PathBuf::from("/data/My_Demo_abc12345/project_metadata.json")
        );
    }

    #[test]
    fn timestamps_accept_naive_iso_dates() {
        let naive = parse_timestamp("2024-05-01T10:00:00.123456").unwrap();
        assert_eq!(naive.to_rfc3339(), "2024-05-01T10:00:00.123456+00:00");
        let offset = parse_timestamp("2024-05-01T12:00:00+02:00").unwrap();
        assert_eq!(offset, parse_timestamp("2024-05-01T10:00:00").unwrap());
        assert!(parse_timestamp("yesterday").is_none());

        let record: ProcessingRecord = serde_json::from_str(
            r#"{"timestamp": "2024-05-01 10:00:00", "operation": "x", "input_files": [], "output_files": []}"#,
        )
        .unwrap();
        assert_eq!(record.timestamp, parse_timestamp("2024-05-01T10:00:00").unwrap());
    }

    #[test]
    fn file_record_serializes_kind_as_type() {
        let record = FileRecord {
            path: "/p/input/a.csv".into(),
            name: "a.csv".into(),
            kind: FileKind::Text,
            added_date: Utc::now(),
            modified_date: Utc::now(),
            size: 3,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "text");
        assert!(record.has_extension(&[".csv"]));
    }
}
