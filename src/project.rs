//! Entidad `Project`: identidad, estructura de carpetas, registros de ficheros
//! por cubo, historial de procesamiento y persistencia de metadatos.
//!
//! El re-escaneo (`scan_and_update_files`) es la única fuente de verdad: toda
//! operación que cambia ficheros en disco termina llamándolo en lugar de
//! parchear las colecciones en memoria. El orden observable de cada mutación
//! es: disco → re-escaneo → contexto → difusión. La persistencia de metadatos
//! la hace después el llamador, así que la difusión puede preceder al guardado.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::{
    broadcast::ProjectNotifier,
    context::{ContextView, Requirements},
    error::{ProjectError, ProjectResult},
    models::{
        deserialize_timestamp, project_dir_name, Bucket, FileKind, FileRecord, OutputFileRef, ProcessingRecord,
        ProjectFiles, GEOMETRY_SUFFIX, METADATA_FILENAME,
    },
};

const IMAGE_EXTENSIONS: [&str; 3] = [".png", ".jpg", ".jpeg"];

/// Rutas absolutas de la estructura de carpetas, tal y como se serializan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directories {
    pub base: String,
    pub project: String,
    pub input: String,
    pub processed: String,
    pub output: String,
}

/// Documento JSON de `project_metadata.json` (y de las difusiones).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub name: String,
    pub id: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_date: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub modified_date: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub directories: Directories,
    #[serde(default)]
    pub files: ProjectFiles,
    #[serde(default)]
    pub processing_history: Vec<ProcessingRecord>,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub tech_stack: String,
}

pub struct Project {
    pub id: String,
    pub name: String,
    pub base_dir: PathBuf,
    pub created_date: DateTime<Utc>,
    pub modified_date: DateTime<Utc>,
    pub description: String,
    pub tags: Vec<String>,
    pub files: ProjectFiles,
    pub processing_history: Vec<ProcessingRecord>,
    pub context: ContextView,
    notifier: Arc<dyn ProjectNotifier>,
}

impl Project {
    pub fn new(name: &str, base_dir: impl AsRef<Path>, notifier: Arc<dyn ProjectNotifier>) -> Self {
        Self::with_id(name, base_dir, &generate_id(), notifier)
    }

    pub fn with_id(
        name: &str,
        base_dir: impl AsRef<Path>,
        id: &str,
        notifier: Arc<dyn ProjectNotifier>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            base_dir: absolute(base_dir.as_ref()),
            created_date: now,
            modified_date: now,
            description: String::new(),
            tags: Vec::new(),
            files: ProjectFiles::default(),
            processing_history: Vec::new(),
            context: ContextView::new(name),
            notifier,
        }
    }

    // ---------------------------------------------------------------------
    // ESTRUCTURA DE CARPETAS
    // ---------------------------------------------------------------------

    pub fn project_dir(&self) -> PathBuf {
        self.base_dir.join(project_dir_name(&self.name, &self.id))
    }

    pub fn bucket_dir(&self, bucket: Bucket) -> PathBuf {
        self.project_dir().join(bucket.as_str())
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.project_dir().join(METADATA_FILENAME)
    }

    /// Crea la carpeta del proyecto y sus tres cubos. Es idempotente y no
    /// deshace lo creado si falla a mitad.
    pub fn create_directory_structure(&self) -> ProjectResult<()> {
        let mut dirs = vec![self.project_dir()];
        dirs.extend(Bucket::ALL.iter().map(|b| self.bucket_dir(*b)));

        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|e| {
                error!("Error creando la estructura de carpetas de {}: {e}", self.name);
                ProjectError::io(&dir, e)
            })?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // RE-ESCANEO
    // ---------------------------------------------------------------------

    /// Reconstruye los registros de los tres cubos a partir del disco,
    /// refresca el contexto y difunde el estado resultante.
    pub fn scan_and_update_files(&mut self) {
        for bucket in Bucket::ALL {
            let records = scan_bucket(&self.bucket_dir(bucket));
            self.files.set(bucket, records);
        }

        self.touch();
        self.refresh_context();
        self.broadcast_update();
        info!(
            "Ficheros del proyecto {} escaneados. Total: {}",
            self.name,
            self.files.total()
        );
    }

    pub fn refresh_context(&mut self) {
        let csv_paths = self.csv_paths();
        let image_paths = self.image_paths();
        self.context
            .update_from_project(&self.name, &csv_paths, &image_paths);
    }

    // ---------------------------------------------------------------------
    // OPERACIONES SOBRE FICHEROS
    // ---------------------------------------------------------------------

    /// Escribe un fichero nuevo sin sobrescribir nunca: si el nombre existe se
    /// prueba `nombre_1.ext`, `nombre_2.ext`, ... Devuelve la ruta final.
    pub fn create_file(
        &mut self,
        name: &str,
        bucket: Bucket,
        content: impl AsRef<[u8]>,
    ) -> ProjectResult<PathBuf> {
        validate_file_name(name)?;
        let dest_dir = self.bucket_dir(bucket);
        let path = unique_path(&dest_dir, name);

        if let Err(e) = fs::write(&path, content) {
            error!("Error creando el fichero {}: {e}", path.display());
            return Err(ProjectError::io(&path, e));
        }

        let final_name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string());
        self.add_file(&path, bucket, final_name.as_deref())?;
        info!("Fichero creado: {}", path.display());
        Ok(path)
    }

    /// Registra un fichero ya presente en disco. Si ya está rastreado se
    /// considera éxito; en otro caso se re-escanea el proyecto completo, de
    /// modo que `path` sólo se usa para comprobar su existencia.
    pub fn add_file(&mut self, path: &Path, bucket: Bucket, name: Option<&str>) -> ProjectResult<()> {
        let display_name = name
            .map(str::to_string)
            .or_else(|| path.file_name().map(|s| s.to_string_lossy().to_string()))
            .unwrap_or_default();

        if !path.exists() {
            warn!(
                "El fichero {} no existe en disco; no se puede añadir al proyecto.",
                path.display()
            );
            return Err(ProjectError::NotFound(display_name));
        }

        let path_str = path.to_string_lossy();
        if self.files.get(bucket).iter().any(|f| f.path == path_str) {
            info!("El fichero {} ya está rastreado en '{bucket}'.", path.display());
            return Ok(());
        }

        self.scan_and_update_files();
        Ok(())
    }

    /// Borra del disco el primer registro con ese nombre y re-escanea. Si el
    /// borrado físico falla no se re-escanea; el llamador debería hacerlo.
    pub fn delete_file(&mut self, name: &str, bucket: Bucket) -> ProjectResult<()> {
        let Some(record) = self.files.find(bucket, name).cloned() else {
            warn!("Fichero '{name}' no encontrado en '{bucket}' para borrar.");
            return Err(ProjectError::NotFound(name.to_string()));
        };

        if let Err(e) = fs::remove_file(&record.path) {
            error!("Error borrando el fichero {name}: {e}");
            return Err(ProjectError::io(&record.path, e));
        }

        self.scan_and_update_files();
        Ok(())
    }

    /// Renombra un fichero dentro de su cubo. Nunca sobrescribe el destino.
    pub fn rename_file(&mut self, old_name: &str, new_name: &str, bucket: Bucket) -> ProjectResult<()> {
        validate_file_name(new_name)?;

        let Some(mut record) = self.files.find(bucket, old_name).cloned() else {
            warn!("Fichero '{old_name}' no encontrado en '{bucket}' para renombrar.");
            return Err(ProjectError::NotFound(old_name.to_string()));
        };

        if !Path::new(&record.path).exists() {
            warn!(
                "La ruta original {} ya no existe; se re-escanea antes de reintentar.",
                record.path
            );
            self.scan_and_update_files();
            match self.files.find(bucket, old_name) {
                Some(found) => record = found.clone(),
                None => {
                    warn!("'{old_name}' sigue sin aparecer tras el re-escaneo.");
                    return Err(ProjectError::NotFound(old_name.to_string()));
                }
            }
        }

        let new_path = self.bucket_dir(bucket).join(new_name);
        if new_path.exists() {
            warn!("El nombre '{new_name}' ya existe en {}.", new_path.display());
            return Err(ProjectError::AlreadyExists(new_path));
        }

        if let Err(e) = fs::rename(&record.path, &new_path) {
            error!("Error renombrando {old_name} a {new_name}: {e}");
            return Err(ProjectError::io(&record.path, e));
        }

        self.scan_and_update_files();
        Ok(())
    }

    pub fn read_file_text(&self, bucket: Bucket, name: &str) -> ProjectResult<String> {
        let record = self
            .files
            .find(bucket, name)
            .ok_or_else(|| ProjectError::NotFound(name.to_string()))?;
        fs::read_to_string(&record.path).map_err(|e| ProjectError::io(&record.path, e))
    }

    /// Sustituye el contenido de un fichero rastreado y re-escanea.
    pub fn write_file_text(&mut self, bucket: Bucket, name: &str, content: &str) -> ProjectResult<PathBuf> {
        let path = self
            .files
            .find(bucket, name)
            .map(|f| PathBuf::from(&f.path))
            .ok_or_else(|| ProjectError::NotFound(name.to_string()))?;

        fs::write(&path, content).map_err(|e| {
            error!("Error escribiendo {}: {e}", path.display());
            ProjectError::io(&path, e)
        })?;

        self.scan_and_update_files();
        Ok(path)
    }

    // ---------------------------------------------------------------------
    // HISTORIAL, CONTEXTO Y CICLO DE VIDA
    // ---------------------------------------------------------------------

    /// Añade una entrada inmutable al historial y difunde el estado.
    pub fn add_processing_record(
        &mut self,
        operation: &str,
        input_files: Vec<String>,
        output_files: Vec<OutputFileRef>,
        details: Map<String, Value>,
    ) {
        self.processing_history.push(ProcessingRecord {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            input_files,
            output_files,
            details,
        });
        self.touch();
        self.broadcast_update();
    }

    /// Sólo en memoria; el llamador persiste con `save_metadata`.
    pub fn update_requirements_and_stack(&mut self, requirements: Requirements, tech_stack: String) {
        self.context
            .update_requirements_and_stack(requirements, tech_stack);
        self.touch();
    }

    /// Secuencia de cierre: re-escaneo final y persistencia.
    pub fn close(&mut self) -> ProjectResult<()> {
        self.scan_and_update_files();
        self.save_metadata()
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        self.modified_date = now.max(self.created_date);
    }

    // ---------------------------------------------------------------------
    // CONSULTAS
    // ---------------------------------------------------------------------

    pub fn image_paths(&self) -> Vec<String> {
        self.files
            .processed
            .iter()
            .filter(|f| f.has_extension(&IMAGE_EXTENSIONS))
            .map(|f| f.path.clone())
            .collect()
    }

    pub fn csv_paths(&self) -> Vec<String> {
        self.files
            .processed
            .iter()
            .filter(|f| f.has_extension(&[".csv"]))
            .map(|f| f.path.clone())
            .collect()
    }

    /// Primer HTML en `output` y, si no hay, en `processed`.
    pub fn preview_html_path(&self) -> Option<String> {
        [Bucket::Output, Bucket::Processed]
            .into_iter()
            .flat_map(|b| self.files.get(b).iter())
            .find(|f| f.has_extension(&[".html"]))
            .map(|f| f.path.clone())
    }

    pub fn find_file(&self, bucket: Bucket, name: &str) -> Option<&FileRecord> {
        self.files.find(bucket, name)
    }

    pub fn total_files(&self) -> usize {
        self.files.total()
    }

    // ---------------------------------------------------------------------
    // PERSISTENCIA
    // ---------------------------------------------------------------------

    pub fn to_metadata(&self) -> ProjectMetadata {
        let dir = |p: PathBuf| p.to_string_lossy().to_string();
        ProjectMetadata {
            name: self.name.clone(),
            id: self.id.clone(),
            created_date: self.created_date,
            modified_date: self.modified_date,
            description: self.description.clone(),
            tags: self.tags.clone(),
            directories: Directories {
                base: dir(self.base_dir.clone()),
                project: dir(self.project_dir()),
                input: dir(self.bucket_dir(Bucket::Input)),
                processed: dir(self.bucket_dir(Bucket::Processed)),
                output: dir(self.bucket_dir(Bucket::Output)),
            },
            files: self.files.clone(),
            processing_history: self.processing_history.clone(),
            requirements: self.context.requirements.clone(),
            tech_stack: self.context.tech_stack.clone(),
        }
    }

    /// Instantánea JSON usada tanto para persistir como para difundir.
    pub fn to_snapshot(&self) -> Value {
        serde_json::to_value(self.to_metadata()).unwrap_or_default()
    }

    pub fn save_metadata(&self) -> ProjectResult<()> {
        let path = self.metadata_path();
        let json = serde_json::to_string_pretty(&self.to_metadata())
            .map_err(|e| ProjectError::json(&path, e))?;
        fs::write(&path, json).map_err(|e| {
            error!("Error guardando los metadatos de {}: {e}", self.name);
            ProjectError::io(&path, e)
        })
    }

    /// Reconstruye un proyecto desde su fichero de metadatos. Las rutas de
    /// las carpetas se derivan de `(base, nombre, id)`, no de las guardadas.
    pub fn load_from_metadata(path: &Path, notifier: Arc<dyn ProjectNotifier>) -> ProjectResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            error!("Error leyendo el proyecto desde {}: {e}", path.display());
            ProjectError::io(path, e)
        })?;
        let metadata: ProjectMetadata = serde_json::from_str(&raw).map_err(|e| {
            error!("Metadatos inválidos en {}: {e}", path.display());
            ProjectError::json(path, e)
        })?;

        let mut project = Self::with_id(
            &metadata.name,
            &metadata.directories.base,
            &metadata.id,
            notifier,
        );
        project.created_date = metadata.created_date;
        project.modified_date = metadata.modified_date;
        project.description = metadata.description;
        project.tags = metadata.tags;
        project.files = metadata.files;
        project.processing_history = metadata.processing_history;
        project
            .context
            .update_requirements_and_stack(metadata.requirements, metadata.tech_stack);
        project.refresh_context();

        Ok(project)
    }

    fn broadcast_update(&self) {
        self.notifier.notify(&self.id, self.to_snapshot());
    }
}

impl std::fmt::Display for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Project: {} (ID: {}, Created: {})",
            self.name,
            self.id,
            self.created_date.format("%Y-%m-%d")
        )
    }
}

/// Id derivado del reloj: últimos 8 dígitos hexadecimales de los milisegundos.
pub fn generate_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let hex = format!("{millis:x}");
    hex[hex.len().saturating_sub(8)..].to_string()
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Rechaza nombres que escaparían del cubo.
fn validate_file_name(name: &str) -> ProjectResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ProjectError::Validation(format!(
            "Nombre de fichero no válido: '{name}'"
        )));
    }
    Ok(())
}

/// Separa `nombre.ext` como lo haría un splitext: los puntos iniciales no
/// cuentan como extensión.
fn split_extension(name: &str) -> (&str, &str) {
    let leading = name.len() - name.trim_start_matches('.').len();
    match name[leading..].rfind('.') {
        Some(idx) => name.split_at(leading + idx),
        None => (name, ""),
    }
}

fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let (stem, ext) = split_extension(name);
    let mut candidate = dir.join(name);
    let mut counter = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}_{counter}{ext}"));
        counter += 1;
    }
    candidate
}

fn scan_bucket(dir: &Path) -> Vec<FileRecord> {
    let mut records: Vec<FileRecord> = Vec::new();
    if !dir.is_dir() {
        return records;
    }

    let entries = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| match e {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("Entrada ilegible en {}: {err}", dir.display());
                None
            }
        });

    for entry in entries {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.to_lowercase().ends_with(GEOMETRY_SUFFIX) {
            continue;
        }
        let path = entry.path().to_string_lossy().to_string();
        if records.iter().any(|r| r.path == path) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("No se pudieron leer los metadatos de {path}: {e}");
                continue;
            }
        };
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let added = metadata.created().unwrap_or(modified);

        records.push(FileRecord {
            kind: FileKind::from_file_name(&name),
            path,
            name,
            added_date: DateTime::<Utc>::from(added),
            modified_date: DateTime::<Utc>::from(modified),
            size: metadata.len(),
        });
    }

    records.sort_by(|a, b| a.name.cmp(&b.name));
    records
}
