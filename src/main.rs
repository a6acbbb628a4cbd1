// Módulos de la aplicación
mod agents;
mod api;
mod app_state;
mod broadcast;
mod config;
mod context;
mod converter;
mod diagram;
mod error;
mod llm;
mod models;
mod project;
mod registry;

use crate::{
    agents::Agents, app_state::AppState, broadcast::ProjectHub, converter::UnconfiguredConverter,
    registry::Registry,
};
use anyhow::{Context, Result};
use axum::Router;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().context("Error al cargar la configuración")?;
    std::fs::create_dir_all(&cfg.root_dir)
        .with_context(|| format!("No se pudo crear {}", cfg.root_dir.display()))?;

    // 3. Registro de proyectos
    let registry = Registry::new(&cfg.registry_file);
    registry
        .ensure_exists()
        .context("Error preparando el registro de proyectos")?;

    // 4. Inicializar gestor de LLMs y agentes
    let llm_manager = llm::LlmManager::from_config(&cfg).context("Error inicializando LLM Manager")?;

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        agents: Agents::new(llm_manager),
        hub: ProjectHub::new(),
        registry,
        current_project: Arc::new(tokio::sync::Mutex::new(None)),
        chat_sessions: Arc::new(Mutex::new(HashMap::new())),
        converter: Arc::new(UnconfiguredConverter),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 6. Configurar el router de la API y el servicio de ficheros estáticos
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .fallback_service(ServeDir::new(&cfg.frontend_dir))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 7. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {server_addr}"))?;
    let server_url = format!("http://{}", server_addr);
    info!("🚀 Servidor escuchando en {}", &server_url);

    // Abrir el frontend en el navegador por defecto
    if webbrowser::open(&server_url).is_err() {
        info!("No se pudo abrir el navegador. Por favor, accede a {} manualmente.", server_url);
    }

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .context("Error en el servidor HTTP")?;

    // Cierre por señal externa: el proyecto abierto se guarda igualmente.
    if let Some(mut project) = app_state.current_project.lock().await.take() {
        if let Err(e) = project.close() {
            warn!("No se pudo guardar el proyecto {} al salir: {e}", project.name);
        }
    }

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
