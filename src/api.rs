use std::collections::{BTreeMap, BTreeSet};
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Json, Path, Query, State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use mime_guess::MimeGuess;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::{
    agents::{self, GenerationAgent},
    app_state::AppState,
    broadcast::{ProjectHub, ProjectNotifier},
    config::is_allowed,
    context::Requirements,
    converter::{BatchStatus, SheetKind, SheetResult},
    diagram::{self, DiagramType},
    error::{ErrorKind, ProjectError},
    models::{Bucket, OutputFileRef, RegistryEntry},
    project::Project,
};

type ApiError = (StatusCode, Json<Value>);

// --- Payloads de la API ---

#[derive(Deserialize)]
pub struct CreateProjectPayload {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
pub struct RequirementsPayload {
    #[serde(default)]
    requirements: Requirements,
    #[serde(default)]
    tech_stack: String,
}

#[derive(Deserialize)]
pub struct CreateOutputPayload {
    file_name: String,
    #[serde(default = "default_output_bucket")]
    file_type: String,
    document_type: String,
    diagram_type: Option<String>,
}

fn default_output_bucket() -> String {
    Bucket::Output.as_str().to_string()
}

#[derive(Deserialize)]
pub struct RemoveOutputPayload {
    file_name: String,
}

#[derive(Deserialize)]
pub struct RenameOutputPayload {
    old_file_name: String,
    new_file_name: String,
}

#[derive(Deserialize)]
pub struct UploadQuery {
    filename: String,
}

#[derive(Deserialize, serde::Serialize)]
pub struct FileProcessingInfo {
    path: String,
    name: String,
    sheets: BTreeMap<String, SheetKind>,
}

#[derive(Deserialize, serde::Serialize)]
pub struct ProcessExcelPayload {
    files: Vec<FileProcessingInfo>,
}

#[derive(Deserialize)]
pub struct GeneratePayload {
    #[serde(default)]
    prompt: String,
}

#[derive(Deserialize)]
pub struct EditPayload {
    file_name: String,
    instructions: String,
}

#[derive(Deserialize)]
pub struct ChatPayload {
    message: String,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Proyectos
        .route("/projects/list", get(list_projects_handler))
        .route("/projects/create", post(create_project_handler))
        .route("/projects/load/:project_id", post(load_project_handler))
        .route("/projects/close", post(close_project_handler))
        .route("/projects/details", get(project_details_handler))
        .route("/projects/requirements", post(requirements_handler))
        .route("/projects/create-output", post(create_output_handler))
        .route("/projects/remove-output", post(remove_output_handler))
        .route("/projects/rename-output", post(rename_output_handler))
        .route("/projects/ws/:project_id", get(project_ws_handler))
        // Ficheros
        .route("/files/upload/:bucket", post(upload_handler))
        .route("/files/list-all", get(list_files_handler))
        .route("/files/delete/:bucket/:name", delete(delete_file_handler))
        .route("/files/sheets", get(sheet_names_handler))
        .route("/files/process-excel", post(process_excel_handler))
        .route("/files/content/:bucket/:name", get(file_content_handler))
        .route("/files/raw/:bucket/:name", get(raw_file_handler))
        // Generación
        .route("/generate/:kind", post(generate_handler))
        .route("/edit", post(edit_handler))
        .route("/chat", post(chat_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Errores ---

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Traduce la categoría del fallo al código HTTP correspondiente.
fn error_response(err: ProjectError) -> ApiError {
    let status = match (&err, err.kind()) {
        (ProjectError::AlreadyExists(_), _) => StatusCode::CONFLICT,
        (_, ErrorKind::NotFound) => StatusCode::NOT_FOUND,
        (_, ErrorKind::Validation) => StatusCode::BAD_REQUEST,
        (_, ErrorKind::Io) => StatusCode::INTERNAL_SERVER_ERROR,
        (_, ErrorKind::External) => StatusCode::BAD_GATEWAY,
    };
    api_error(status, err.to_string())
}

fn no_project() -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "No hay ningún proyecto abierto.")
}

// --- Handlers: proyectos ---

#[axum::debug_handler]
async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[axum::debug_handler]
async fn list_projects_handler(State(state): State<AppState>) -> Json<Vec<RegistryEntry>> {
    Json(state.registry.load())
}

/// Cierra el proyecto abierto (si lo hay): re-escaneo, persistencia,
/// actualización del registro y aviso a los clientes. Devuelve su id.
fn close_project_internal(state: &AppState, slot: &mut Option<Project>) -> Option<String> {
    let mut project = slot.take()?;
    let id = project.id.clone();

    if let Err(e) = project.close() {
        error!("Error guardando el proyecto {} al cerrarlo: {e}", project.name);
    }
    match state.registry.touch(&id, project.modified_date) {
        Ok(true) => {}
        Ok(false) => warn!("El proyecto {id} no figura en el registro."),
        Err(e) => error!("Error actualizando el registro al cerrar {id}: {e}"),
    }
    state
        .chat_sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&id);

    state
        .hub
        .notify(&id, json!({ "type": "project_closed", "project_id": id }));
    info!("{project} cerrado.");
    Some(id)
}

fn notifier(hub: &ProjectHub) -> Arc<dyn ProjectNotifier> {
    Arc::new(hub.clone())
}

/// Deja `project` como proyecto abierto y avisa a sus clientes.
fn open_project(state: &AppState, slot: &mut Option<Project>, project: Project) -> Value {
    let snapshot = project.to_snapshot();
    state.hub.notify(
        &project.id,
        json!({ "type": "project_loaded", "project_data": snapshot.clone() }),
    );
    state
        .chat_sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .entry(project.id.clone())
        .or_default();
    *slot = Some(project);
    snapshot
}

#[axum::debug_handler]
async fn create_project_handler(
    State(state): State<AppState>,
    Json(payload): Json<CreateProjectPayload>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "El nombre del proyecto es obligatorio."));
    }

    let mut slot = state.current_project.lock().await;
    close_project_internal(&state, &mut slot);

    let mut project = Project::new(name, &state.config.root_dir, notifier(&state.hub));
    project.description = payload.description;
    project.tags = payload.tags;
    project.create_directory_structure().map_err(error_response)?;
    project.scan_and_update_files();
    project.save_metadata().map_err(error_response)?;
    state
        .registry
        .register(RegistryEntry::from(&project))
        .map_err(error_response)?;

    info!("Proyecto '{}' creado con id {}", project.name, project.id);
    let snapshot = open_project(&state, &mut slot, project);
    Ok((StatusCode::CREATED, Json(snapshot)))
}

#[axum::debug_handler]
async fn load_project_handler(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = state.registry.find(&project_id).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("Proyecto '{project_id}' no encontrado en el registro."),
        )
    })?;
    let metadata_path = entry.metadata_path();
    if !metadata_path.is_file() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("No existe el fichero de metadatos {}", metadata_path.display()),
        ));
    }

    let mut slot = state.current_project.lock().await;
    close_project_internal(&state, &mut slot);

    let mut project =
        Project::load_from_metadata(&metadata_path, notifier(&state.hub)).map_err(error_response)?;
    if project.id != project_id {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "El id de los metadatos no coincide con el del registro.",
        ));
    }
    project.create_directory_structure().map_err(error_response)?;
    project.scan_and_update_files();
    project.save_metadata().map_err(error_response)?;

    info!("{project} cargado.");
    Ok(Json(open_project(&state, &mut slot, project)))
}

#[axum::debug_handler]
async fn close_project_handler(State(state): State<AppState>) -> Json<Value> {
    let mut slot = state.current_project.lock().await;
    match close_project_internal(&state, &mut slot) {
        Some(id) => Json(json!({ "status": "success", "message": "Project closed successfully", "project_id": id })),
        None => Json(json!({ "status": "info", "message": "No active project to close." })),
    }
}

#[axum::debug_handler]
async fn project_details_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let slot = state.current_project.lock().await;
    let project = slot.as_ref().ok_or_else(no_project)?;
    Ok(Json(project.to_snapshot()))
}

#[axum::debug_handler]
async fn requirements_handler(
    State(state): State<AppState>,
    Json(payload): Json<RequirementsPayload>,
) -> Result<Json<Value>, ApiError> {
    let mut slot = state.current_project.lock().await;
    let project = slot.as_mut().ok_or_else(no_project)?;
    project.update_requirements_and_stack(payload.requirements, payload.tech_stack);
    project.save_metadata().map_err(error_response)?;
    Ok(Json(project.to_snapshot()))
}

/// Contenido inicial de un documento creado desde el frontend.
fn initial_output_content(
    document_type: &str,
    file_name: &str,
    diagram_type: Option<&str>,
) -> Result<String, ApiError> {
    match document_type {
        "markdown" => Ok("# New Document\n\n".to_string()),
        "html" => Ok("<html><body><h1>New Document</h1></body></html>".to_string()),
        "diagram" => {
            let kind = diagram_type
                .and_then(DiagramType::from_label)
                .unwrap_or(DiagramType::Class);
            let blank = diagram::blank_diagram(kind, file_name);
            serde_json::to_string_pretty(&blank)
                .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
        other => Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Tipo de documento '{other}' no soportado (markdown, diagram o html)."),
        )),
    }
}

#[axum::debug_handler]
async fn create_output_handler(
    State(state): State<AppState>,
    Json(payload): Json<CreateOutputPayload>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let bucket: Bucket = payload.file_type.parse().map_err(error_response)?;
    let content = initial_output_content(
        &payload.document_type,
        &payload.file_name,
        payload.diagram_type.as_deref(),
    )?;

    let mut slot = state.current_project.lock().await;
    let project = slot.as_mut().ok_or_else(no_project)?;
    let path = project
        .create_file(&payload.file_name, bucket, content)
        .map_err(error_response)?;
    project.save_metadata().map_err(error_response)?;

    let file_name = OutputFileRef::from_path(&path).name;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "project_id": project.id,
            "file_name": file_name,
            "file_type": bucket,
            "document_type": payload.document_type,
        })),
    ))
}

#[axum::debug_handler]
async fn remove_output_handler(
    State(state): State<AppState>,
    Json(payload): Json<RemoveOutputPayload>,
) -> Result<Json<Value>, ApiError> {
    let mut slot = state.current_project.lock().await;
    let project = slot.as_mut().ok_or_else(no_project)?;
    project
        .delete_file(&payload.file_name, Bucket::Output)
        .map_err(error_response)?;
    project.save_metadata().map_err(error_response)?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("Output file '{}' removed successfully.", payload.file_name),
    })))
}

#[axum::debug_handler]
async fn rename_output_handler(
    State(state): State<AppState>,
    Json(payload): Json<RenameOutputPayload>,
) -> Result<Json<Value>, ApiError> {
    let mut slot = state.current_project.lock().await;
    let project = slot.as_mut().ok_or_else(no_project)?;
    project
        .rename_file(&payload.old_file_name, &payload.new_file_name, Bucket::Output)
        .map_err(error_response)?;
    project.save_metadata().map_err(error_response)?;
    Ok(Json(json!({
        "status": "success",
        "message": format!(
            "Output file '{}' renamed to '{}' successfully.",
            payload.old_file_name, payload.new_file_name
        ),
    })))
}

// --- WebSocket de actualizaciones ---

#[axum::debug_handler]
async fn project_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| project_socket(socket, hub, project_id))
}

async fn project_socket(socket: WebSocket, hub: ProjectHub, project_id: String) {
    let (listener_id, mut updates) = hub.connect(&project_id);
    info!(
        "Cliente conectado a las actualizaciones de {project_id} ({} oyentes)",
        hub.listener_count(&project_id)
    );
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(payload) = update else { break };
                if sender.send(Message::Text(payload.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) if text == "__ping__" => {
                    if sender.send(Message::Text("__pong__".to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Error en el WebSocket del proyecto {project_id}: {e}");
                    break;
                }
            },
        }
    }

    hub.disconnect(&project_id, listener_id);
}

// --- Handlers: ficheros ---

/// Extensiones admitidas al subir a cada cubo. `output` sólo se escribe
/// desde la propia aplicación.
fn upload_extensions(state: &AppState, bucket: Bucket) -> Option<&[String]> {
    match bucket {
        Bucket::Input => Some(&state.config.allowed_upload_extensions),
        Bucket::Processed => Some(&state.config.allowed_source_extensions),
        Bucket::Output => None,
    }
}

#[axum::debug_handler]
async fn upload_handler(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let bucket: Bucket = bucket.parse().map_err(error_response)?;
    let allowed = upload_extensions(&state, bucket).ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            "Sólo se admiten subidas a 'input' o 'processed'.",
        )
    })?;
    if !is_allowed(&query.filename, allowed) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Tipo de fichero no permitido. Extensiones admitidas: {}", allowed.join(", ")),
        ));
    }

    let mut slot = state.current_project.lock().await;
    let project = slot.as_mut().ok_or_else(no_project)?;
    let path = project
        .create_file(&query.filename, bucket, &body)
        .map_err(error_response)?;
    project.save_metadata().map_err(error_response)?;

    let stored = OutputFileRef::from_path(&path);
    info!("Fichero '{}' subido a '{bucket}' ({} bytes)", stored.name, body.len());
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "file_name": stored.name,
            "path": stored.path,
            "file_type": bucket,
        })),
    ))
}

#[axum::debug_handler]
async fn list_files_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mut slot = state.current_project.lock().await;
    let project = slot.as_mut().ok_or_else(no_project)?;
    project.scan_and_update_files();
    Ok(Json(json!({
        "project_id": project.id,
        "files": project.files,
        "total": project.total_files(),
        "preview_html": project.preview_html_path(),
    })))
}

#[axum::debug_handler]
async fn delete_file_handler(
    State(state): State<AppState>,
    Path((bucket, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let bucket: Bucket = bucket.parse().map_err(error_response)?;
    let mut slot = state.current_project.lock().await;
    let project = slot.as_mut().ok_or_else(no_project)?;
    project.delete_file(&name, bucket).map_err(error_response)?;
    project.save_metadata().map_err(error_response)?;
    Ok(Json(json!({ "status": "success", "message": format!("'{name}' deleted from {bucket}") })))
}

#[axum::debug_handler]
async fn file_content_handler(
    State(state): State<AppState>,
    Path((bucket, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let bucket: Bucket = bucket.parse().map_err(error_response)?;
    let slot = state.current_project.lock().await;
    let project = slot.as_ref().ok_or_else(no_project)?;
    let content = project.read_file_text(bucket, &name).map_err(error_response)?;
    Ok(Json(json!({ "file_name": name, "content": content })))
}

/// Sirve el fichero tal cual (prototipos HTML, imágenes procesadas...).
#[axum::debug_handler]
async fn raw_file_handler(
    State(state): State<AppState>,
    Path((bucket, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let bucket: Bucket = bucket.parse().map_err(error_response)?;
    let path = {
        let slot = state.current_project.lock().await;
        let project = slot.as_ref().ok_or_else(no_project)?;
        project
            .find_file(bucket, &name)
            .map(|f| f.path.clone())
            .ok_or_else(|| error_response(ProjectError::NotFound(name.clone())))?
    };

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| error_response(ProjectError::io(&path, e)))?;
    let mime: MimeGuess = MimeGuess::from_path(&path);
    let content_type = mime.first_or_octet_stream().to_string();
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

#[axum::debug_handler]
async fn sheet_names_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mut slot = state.current_project.lock().await;
    let project = slot.as_mut().ok_or_else(no_project)?;
    project.scan_and_update_files();

    let workbooks: Vec<_> = project
        .files
        .input
        .iter()
        .filter(|f| is_allowed(&f.name, &state.config.allowed_upload_extensions))
        .cloned()
        .collect();
    if workbooks.is_empty() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "No hay hojas de cálculo en la carpeta input del proyecto.",
        ));
    }

    let mut sheets_per_file = BTreeMap::new();
    let mut errors = BTreeMap::new();
    for workbook in &workbooks {
        match state.converter.sheet_names(FsPath::new(&workbook.path)) {
            Ok(sheets) => {
                sheets_per_file.insert(workbook.name.clone(), sheets);
            }
            Err(e) => {
                errors.insert(workbook.name.clone(), e.to_string());
            }
        }
    }
    if sheets_per_file.is_empty() {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "No se pudo leer ninguna hoja de cálculo.", "errors": errors })),
        ));
    }

    let all_unique_sheets: BTreeSet<&String> = sheets_per_file.values().flatten().collect();
    Ok(Json(json!({
        "status": "success",
        "project_id": project.id,
        "sheets_per_file": sheets_per_file,
        "all_unique_sheets": all_unique_sheets,
        "errors": errors,
    })))
}

#[axum::debug_handler]
async fn process_excel_handler(
    State(state): State<AppState>,
    Json(payload): Json<ProcessExcelPayload>,
) -> Result<Json<Value>, ApiError> {
    if payload.files.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "No se indicó ningún fichero a procesar."));
    }

    let mut slot = state.current_project.lock().await;
    let project = slot.as_mut().ok_or_else(no_project)?;
    project.scan_and_update_files();
    let processed_dir = project.bucket_dir(Bucket::Processed);

    let mut results: BTreeMap<String, BTreeMap<String, SheetResult>> = BTreeMap::new();
    let mut output_files = Vec::new();

    // Todos los libros deben existir antes de convertir ninguno.
    let mut workbooks = Vec::with_capacity(payload.files.len());
    for info in &payload.files {
        let Some(workbook) = project
            .files
            .input
            .iter()
            .find(|f| f.path == info.path || f.name == info.name)
        else {
            return Err(api_error(
                StatusCode::NOT_FOUND,
                format!("Fichero '{}' no encontrado en la carpeta input.", info.name),
            ));
        };
        workbooks.push((info, workbook.path.clone()));
    }

    for (info, workbook_path) in workbooks {
        let sheet_results = state.converter.process_sheets(
            FsPath::new(&workbook_path),
            &processed_dir,
            &info.sheets,
        );
        for result in sheet_results.values().filter(|r| r.is_success()) {
            if let Some(output) = &result.output_path {
                output_files.push(OutputFileRef::from_path(FsPath::new(output)));
            }
        }
        results.entry(info.name.clone()).or_default().extend(sheet_results);
    }

    if !output_files.is_empty() {
        let mut details = Map::new();
        details.insert(
            "requested_processing".to_string(),
            serde_json::to_value(&payload).unwrap_or_default(),
        );
        project.add_processing_record(
            "excel_sheet_processing",
            payload.files.iter().map(|f| f.path.clone()).collect(),
            output_files,
            details,
        );
        project.scan_and_update_files();
    }
    project.save_metadata().map_err(error_response)?;

    let status = BatchStatus::from_results(results.values().flat_map(|r| r.values()));
    info!("Procesamiento de hojas terminado con estado {status}");
    Ok(Json(json!({ "status": status, "results": results })))
}

// --- Handlers: generación ---

/// Copia de lo que necesitan los agentes, para no retener el proyecto
/// bloqueado mientras responde el LLM.
async fn context_snapshot(state: &AppState) -> Result<(String, String, crate::context::ContextView), ApiError> {
    let slot = state.current_project.lock().await;
    let project = slot.as_ref().ok_or_else(no_project)?;
    Ok((project.id.clone(), project.name.clone(), project.context.clone()))
}

fn generation_failed(what: &str) -> ApiError {
    error_response(ProjectError::External(format!("El agente no generó {what}.")))
}

#[axum::debug_handler]
async fn generate_handler(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(payload): Json<GeneratePayload>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (project_id, project_name, context) = context_snapshot(&state).await?;

    let (file_name, content) = match kind.as_str() {
        "text" => {
            let markdown = state
                .agents
                .text
                .generate(&context, &payload.prompt)
                .await
                .ok_or_else(|| generation_failed("el documento"))?;
            (agents::markdown_file_name(&markdown), markdown)
        }
        "diagram" => {
            let diagram_type = diagram::determine_diagram_type(&payload.prompt);
            let json = state
                .agents
                .diagram
                .generate(&context, &payload.prompt)
                .await
                .ok_or_else(|| generation_failed("el diagrama"))?;
            (agents::diagram_file_name(&project_name, diagram_type), json)
        }
        "prototype" => {
            let html = state
                .agents
                .prototype
                .generate(&context, &payload.prompt)
                .await
                .ok_or_else(|| generation_failed("el prototipo"))?;
            (agents::prototype_file_name(&project_name), html)
        }
        other => {
            return Err(api_error(
                StatusCode::NOT_FOUND,
                format!("Generador '{other}' desconocido (text, diagram o prototype)."),
            ))
        }
    };

    let mut slot = state.current_project.lock().await;
    let project = slot
        .as_mut()
        .filter(|p| p.id == project_id)
        .ok_or_else(|| api_error(StatusCode::CONFLICT, "El proyecto se cerró durante la generación."))?;
    let path = project
        .create_file(&file_name, Bucket::Output, &content)
        .map_err(error_response)?;
    project.save_metadata().map_err(error_response)?;

    let stored = OutputFileRef::from_path(&path);
    match kind.as_str() {
        "text" => project.context.add_generated_text_doc(&stored.name, &content),
        "diagram" => {
            if let Ok(value) = serde_json::from_str(&content) {
                project.context.add_generated_diagram(&stored.name, value);
            }
        }
        _ => project.context.set_prototype_code(&content),
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "success", "file_name": stored.name, "path": stored.path, "content": content })),
    ))
}

#[axum::debug_handler]
async fn edit_handler(
    State(state): State<AppState>,
    Json(payload): Json<EditPayload>,
) -> Result<Json<Value>, ApiError> {
    let (project_id, current, context) = {
        let slot = state.current_project.lock().await;
        let project = slot.as_ref().ok_or_else(no_project)?;
        let current = project
            .read_file_text(Bucket::Output, &payload.file_name)
            .map_err(error_response)?;
        (project.id.clone(), current, project.context.clone())
    };

    let lower = payload.file_name.to_lowercase();
    let edited = if lower.ends_with(".md") {
        state.agents.text.edit(&payload.instructions, &current, &context).await
    } else if lower.ends_with(".json") {
        state.agents.diagram.edit(&payload.instructions, &current, &context).await
    } else if lower.ends_with(".html") {
        state.agents.prototype.edit(&payload.instructions, &current, &context).await
    } else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("No se admite editar '{}'.", payload.file_name),
        ));
    };
    let edited = edited.ok_or_else(|| generation_failed("la edición"))?;

    let mut slot = state.current_project.lock().await;
    let project = slot
        .as_mut()
        .filter(|p| p.id == project_id)
        .ok_or_else(|| api_error(StatusCode::CONFLICT, "El proyecto se cerró durante la edición."))?;
    project
        .write_file_text(Bucket::Output, &payload.file_name, &edited)
        .map_err(error_response)?;
    project.save_metadata().map_err(error_response)?;

    Ok(Json(json!({ "status": "success", "file_name": payload.file_name, "content": edited })))
}

#[axum::debug_handler]
async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatPayload>,
) -> Result<Json<Value>, ApiError> {
    let (project_id, _, context) = context_snapshot(&state).await?;

    // La sesión sale del mapa mientras dura la llamada.
    let mut session = state
        .chat_sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&project_id)
        .unwrap_or_default();
    let answer = state
        .agents
        .chat
        .respond(&mut session, &context, &payload.message)
        .await;
    state
        .chat_sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(project_id, session);

    let answer = answer.ok_or_else(|| generation_failed("respuesta"))?;
    Ok(Json(json!({ "response": answer })))
}

// --- Handler de apagado ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    {
        let mut slot = state.current_project.lock().await;
        close_project_internal(&state, &mut slot);
    }
    if let Some(sender) = state
        .shutdown_sender
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
    {
        let _ = sender.send(());
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agents::Agents,
        config::{parse_extensions, AppConfig, LlmProvider},
        converter::{SheetConverter, UnconfiguredConverter},
        error::ProjectResult,
        llm::LlmManager,
        registry::Registry,
    };
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    fn test_state() -> (TempDir, AppState) {
        let tmp = tempdir().unwrap();
        let config = AppConfig {
            server_addr: "127.0.0.1:0".into(),
            root_dir: tmp.path().to_path_buf(),
            registry_file: tmp.path().join("projects_registry.json"),
            frontend_dir: tmp.path().join("frontend"),
            allowed_upload_extensions: parse_extensions(".xlsx,.xls"),
            allowed_source_extensions: parse_extensions(".txt,.csv,.png"),
            llm_provider: LlmProvider::Ollama,
            llm_chat_model: String::new(),
            llm_text_model: String::new(),
            llm_diagram_model: String::new(),
            llm_prototype_model: String::new(),
        };
        let llm = LlmManager::from_config(&config).unwrap();
        let registry = Registry::new(&config.registry_file);
        registry.ensure_exists().unwrap();

        let state = AppState {
            config,
            agents: Agents::new(llm),
            hub: ProjectHub::new(),
            registry,
            current_project: Arc::new(tokio::sync::Mutex::new(None)),
            chat_sessions: Arc::new(Mutex::new(HashMap::new())),
            converter: Arc::new(UnconfiguredConverter),
            shutdown_sender: Arc::new(Mutex::new(None)),
        };
        (tmp, state)
    }

    async fn create(state: &AppState, name: &str) -> Value {
        let payload = CreateProjectPayload {
            name: name.into(),
            description: String::new(),
            tags: vec![],
        };
        let (status, Json(body)) = create_project_handler(State(state.clone()), Json(payload))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        body
    }

    #[test]
    fn errors_map_to_http_statuses() {
        let cases = [
            (ProjectError::NotFound("a.md".into()), StatusCode::NOT_FOUND),
            (ProjectError::AlreadyExists("/p/b.md".into()), StatusCode::CONFLICT),
            (ProjectError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (
                ProjectError::io("/p", std::io::Error::other("disk")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ProjectError::External("llm".into()), StatusCode::BAD_GATEWAY),
        ];
        for (err, expected) in cases {
            let (status, Json(body)) = error_response(err);
            assert_eq!(status, expected);
            assert!(body["error"].is_string());
        }
    }

    #[test]
    fn initial_content_per_document_type() {
        let diagram = initial_output_content("diagram", "flows.json", Some("Use Case Diagram")).unwrap();
        let diagram: Value = serde_json::from_str(&diagram).unwrap();
        assert_eq!(diagram["diagramName"], "flows.json");
        assert!(diagram["actors"].is_array());

        assert!(initial_output_content("markdown", "a.md", None).unwrap().starts_with("# "));
        assert!(initial_output_content("pdf", "a.pdf", None).is_err());
    }

    #[tokio::test]
    async fn create_registers_and_close_touches_registry() {
        let (_tmp, state) = test_state();
        let body = create(&state, "Web Shop").await;
        let id = body["id"].as_str().unwrap().to_string();

        let Json(list) = list_projects_handler(State(state.clone())).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id);
        assert!(list[0].metadata_path().is_file());

        let (_, mut rx) = state.hub.connect(&id);
        let Json(closed) = close_project_handler(State(state.clone())).await;
        assert_eq!(closed["status"], "success");

        let mut last = None;
        while let Ok(msg) = rx.try_recv() {
            last = Some(msg);
        }
        assert_eq!(last.unwrap()["type"], "project_closed");
        assert!(state.current_project.lock().await.is_none());

        let Json(again) = close_project_handler(State(state.clone())).await;
        assert_eq!(again["status"], "info");
    }

    #[tokio::test]
    async fn output_lifecycle_through_handlers() {
        let (_tmp, state) = test_state();
        create(&state, "Docs").await;

        for _ in 0..2 {
            let payload = CreateOutputPayload {
                file_name: "notes.md".into(),
                file_type: "output".into(),
                document_type: "markdown".into(),
                diagram_type: None,
            };
            create_output_handler(State(state.clone()), Json(payload)).await.unwrap();
        }

        let rename = RenameOutputPayload {
            old_file_name: "notes.md".into(),
            new_file_name: "notes_1.md".into(),
        };
        let (status, _) = rename_output_handler(State(state.clone()), Json(rename))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::CONFLICT);

        let remove = RemoveOutputPayload {
            file_name: "notes_1.md".into(),
        };
        remove_output_handler(State(state.clone()), Json(remove)).await.unwrap();

        let Json(content) = file_content_handler(
            State(state.clone()),
            Path(("output".to_string(), "notes.md".to_string())),
        )
        .await
        .unwrap();
        assert_eq!(content["content"], "# New Document\n\n");

        let (status, _) = file_content_handler(
            State(state.clone()),
            Path(("output".to_string(), "notes_1.md".to_string())),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn raw_files_carry_their_content_type() {
        let (_tmp, state) = test_state();
        create(&state, "Preview").await;
        let payload = CreateOutputPayload {
            file_name: "proto.html".into(),
            file_type: "output".into(),
            document_type: "html".into(),
            diagram_type: None,
        };
        create_output_handler(State(state.clone()), Json(payload)).await.unwrap();

        let response = raw_file_handler(
            State(state.clone()),
            Path(("output".to_string(), "proto.html".to_string())),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
    }

    #[tokio::test]
    async fn uploads_are_checked_against_bucket_extensions() {
        let (_tmp, state) = test_state();
        create(&state, "Sheets").await;

        let upload = |bucket: &str, name: &str| {
            upload_handler(
                State(state.clone()),
                Path(bucket.to_string()),
                Query(UploadQuery { filename: name.into() }),
                Bytes::from_static(b"data"),
            )
        };

        let (status, _) = upload("input", "budget.xlsx").await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = upload("input", "notes.txt").await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = upload("output", "x.txt").await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = upload("archive", "x.txt").await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let Json(files) = list_files_handler(State(state.clone())).await.unwrap();
        assert_eq!(files["total"], 1);
        assert_eq!(files["files"]["input"][0]["type"], "excel");
    }

    #[tokio::test]
    async fn process_excel_reports_error_with_unconfigured_converter() {
        let (_tmp, state) = test_state();
        create(&state, "Sheets").await;
        upload_handler(
            State(state.clone()),
            Path("input".to_string()),
            Query(UploadQuery { filename: "book.xlsx".into() }),
            Bytes::from_static(b"xlsx"),
        )
        .await
        .unwrap();

        let payload = ProcessExcelPayload {
            files: vec![FileProcessingInfo {
                path: String::new(),
                name: "book.xlsx".into(),
                sheets: BTreeMap::from([("Data".to_string(), SheetKind::Table)]),
            }],
        };
        let Json(body) = process_excel_handler(State(state.clone()), Json(payload)).await.unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["results"]["book.xlsx"]["Data"]["status"], "error");

        let slot = state.current_project.lock().await;
        assert!(slot.as_ref().unwrap().processing_history.is_empty());
    }

    /// Conversor que cuenta las llamadas y exporta cada hoja como CSV vacío.
    #[derive(Default)]
    struct CountingConverter {
        calls: AtomicUsize,
    }

    impl SheetConverter for CountingConverter {
        fn sheet_names(&self, _file_path: &FsPath) -> ProjectResult<Vec<String>> {
            Ok(vec!["Data".to_string()])
        }

        fn process_sheets(
            &self,
            _file_path: &FsPath,
            output_dir: &FsPath,
            sheets: &BTreeMap<String, SheetKind>,
        ) -> BTreeMap<String, SheetResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sheets
                .iter()
                .map(|(name, kind)| {
                    let out = output_dir.join(format!("{name}.csv"));
                    std::fs::write(&out, "a,b\n").unwrap();
                    (name.clone(), SheetResult::success(*kind, out.to_string_lossy()))
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn process_excel_checks_every_workbook_before_converting() {
        let (_tmp, mut state) = test_state();
        let converter = Arc::new(CountingConverter::default());
        state.converter = converter.clone();
        create(&state, "Sheets").await;
        upload_handler(
            State(state.clone()),
            Path("input".to_string()),
            Query(UploadQuery { filename: "book.xlsx".into() }),
            Bytes::from_static(b"xlsx"),
        )
        .await
        .unwrap();

        let sheets = BTreeMap::from([("Data".to_string(), SheetKind::Table)]);
        let payload = ProcessExcelPayload {
            files: vec![
                FileProcessingInfo {
                    path: String::new(),
                    name: "book.xlsx".into(),
                    sheets: sheets.clone(),
                },
                FileProcessingInfo {
                    path: String::new(),
                    name: "missing.xlsx".into(),
                    sheets,
                },
            ],
        };
        let (status, _) = process_excel_handler(State(state.clone()), Json(payload))
            .await
            .unwrap_err();

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(converter.calls.load(Ordering::SeqCst), 0);
        let slot = state.current_project.lock().await;
        let project = slot.as_ref().unwrap();
        assert!(project.processing_history.is_empty());
        assert!(project.files.processed.is_empty());
    }

    #[tokio::test]
    async fn handlers_without_project_are_rejected() {
        let (_tmp, state) = test_state();
        let (status, _) = project_details_handler(State(state.clone())).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = load_project_handler(State(state.clone()), Path("deadbeef".into()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn failed_generation_is_a_bad_gateway() {
        let (_tmp, state) = test_state();
        create(&state, "Gen").await;

        let payload = GeneratePayload { prompt: "overview".into() };
        let (status, _) = generate_handler(State(state.clone()), Path("text".into()), Json(payload))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let payload = GeneratePayload { prompt: String::new() };
        let (status, _) = generate_handler(State(state.clone()), Path("poem".into()), Json(payload))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
