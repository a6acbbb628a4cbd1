use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::{
    agents::{Agents, ChatSession},
    broadcast::ProjectHub,
    config::AppConfig,
    converter::SheetConverter,
    llm::LlmManager,
    project::Project,
    registry::Registry,
};

/// Contexto explícito de la aplicación, compartido por todos los handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub agents: Agents<LlmManager>,
    pub hub: ProjectHub,
    pub registry: Registry,
    /// Proyecto abierto. El mutex serializa las mutaciones del proyecto.
    pub current_project: Arc<tokio::sync::Mutex<Option<Project>>>,
    /// Conversaciones de chat por id de proyecto.
    pub chat_sessions: Arc<Mutex<HashMap<String, ChatSession>>>,
    pub converter: Arc<dyn SheetConverter>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}
