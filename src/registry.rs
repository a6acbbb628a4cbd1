//! Registro global de proyectos: un único array JSON con una entrada por
//! proyecto. Sin bloqueos; la última escritura gana.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::{
    error::{ProjectError, ProjectResult},
    models::{project_dir_name, RegistryEntry},
    project::Project,
};

#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Crea el fichero con un array vacío si todavía no existe.
    pub fn ensure_exists(&self) -> ProjectResult<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ProjectError::io(parent, e))?;
        }
        info!("Creando el registro de proyectos en {}", self.path.display());
        self.save(&[])
    }

    /// Devuelve una lista vacía si el fichero falta, está vacío o no se puede
    /// parsear.
    pub fn load(&self) -> Vec<RegistryEntry> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                error!("Error leyendo el registro de proyectos: {e}");
                return Vec::new();
            }
        };
        if content.trim().is_empty() {
            return Vec::new();
        }
        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Error decodificando el JSON del registro de proyectos: {e}");
                Vec::new()
            }
        }
    }

    pub fn save(&self, entries: &[RegistryEntry]) -> ProjectResult<()> {
        let json =
            serde_json::to_string_pretty(entries).map_err(|e| ProjectError::json(&self.path, e))?;
        fs::write(&self.path, json).map_err(|e| {
            error!("Error escribiendo el registro de proyectos: {e}");
            ProjectError::io(&self.path, e)
        })
    }

    pub fn find(&self, id: &str) -> Option<RegistryEntry> {
        self.load().into_iter().find(|e| e.id == id)
    }

    pub fn register(&self, entry: RegistryEntry) -> ProjectResult<()> {
        let mut entries = self.load();
        entries.push(entry);
        self.save(&entries)
    }

    /// Actualiza la fecha de modificación de una entrada. Devuelve `false`
    /// si el id no está registrado.
    pub fn touch(&self, id: &str, modified: DateTime<Utc>) -> ProjectResult<bool> {
        let mut entries = self.load();
        let Some(entry) = entries.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };
        entry.modified_date = modified.to_rfc3339();
        self.save(&entries)?;
        Ok(true)
    }
}

impl From<&Project> for RegistryEntry {
    fn from(project: &Project) -> Self {
        Self {
            id: project.id.clone(),
            name: project.name.clone(),
            base_dir: project.base_dir.to_string_lossy().to_string(),
            project_dir_name: project_dir_name(&project.name, &project.id),
            created_date: project.created_date.to_rfc3339(),
            modified_date: project.modified_date.to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ProjectHub;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio_test::assert_ok;

    fn entry(id: &str) -> RegistryEntry {
        RegistryEntry {
            id: id.into(),
            name: "Demo".into(),
            base_dir: "/data".into(),
            project_dir_name: format!("Demo_{id}"),
            created_date: "2024-05-01T10:00:00+00:00".into(),
            modified_date: "2024-05-01T10:00:00+00:00".into(),
        }
    }

    #[test]
    fn missing_empty_or_corrupt_files_load_as_empty() {
        let tmp = tempdir().unwrap();
        let registry = Registry::new(tmp.path().join("projects_registry.json"));
        assert!(registry.load().is_empty());

        fs::write(registry.path(), "").unwrap();
        assert!(registry.load().is_empty());

        fs::write(registry.path(), "[{ broken").unwrap();
        assert!(registry.load().is_empty());
    }

    #[test]
    fn register_appends_and_touch_updates() {
        let tmp = tempdir().unwrap();
        let registry = Registry::new(tmp.path().join("nested").join("registry.json"));
        assert_ok!(registry.ensure_exists());
        assert_eq!(fs::read_to_string(registry.path()).unwrap().trim(), "[]");

        registry.register(entry("aaaa0001")).unwrap();
        registry.register(entry("aaaa0002")).unwrap();
        let now = Utc::now();

        assert!(registry.touch("aaaa0002", now).unwrap());
        assert!(!registry.touch("ffffffff", now).unwrap());

        let entries = registry.load();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "aaaa0001");
        assert_eq!(entries[1].modified_date, now.to_rfc3339());
        assert_eq!(registry.find("aaaa0001").unwrap().dir_name(), "Demo_aaaa0001");
    }

    #[test]
    fn entry_mirrors_project_fields() {
        let project = Project::with_id("Big Demo", "/data", "0badcafe", Arc::new(ProjectHub::new()));
        let entry = RegistryEntry::from(&project);
        assert_eq!(entry.project_dir_name, "Big_Demo_0badcafe");
        assert_eq!(entry.base_dir, "/data");
        assert_eq!(entry.metadata_path(), project.metadata_path());
    }
}
