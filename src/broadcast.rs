//! Difusión de actualizaciones de proyecto a los clientes WebSocket.
//!
//! La entrega es "best effort": un oyente caído se descarta sin afectar al
//! resto ni al llamador.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};
use uuid::Uuid;

/// Contrato del notificador: dispara y olvida.
pub trait ProjectNotifier: Send + Sync {
    fn notify(&self, project_id: &str, payload: Value);
}

struct Listener {
    id: Uuid,
    tx: UnboundedSender<Value>,
}

/// Gestor de conexiones agrupadas por id de proyecto.
#[derive(Clone, Default)]
pub struct ProjectHub {
    listeners: Arc<Mutex<HashMap<String, Vec<Listener>>>>,
}

impl ProjectHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra un oyente y devuelve su id junto al receptor de mensajes.
    pub fn connect(&self, project_id: &str) -> (Uuid, UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let entry = listeners.entry(project_id.to_string()).or_default();
        entry.push(Listener { id, tx });
        debug!("WebSocket conectado al proyecto {project_id}. Total: {}", entry.len());
        (id, rx)
    }

    pub fn disconnect(&self, project_id: &str, listener_id: Uuid) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = listeners.get_mut(project_id) {
            entry.retain(|l| l.id != listener_id);
            if entry.is_empty() {
                listeners.remove(project_id);
            }
        }
        debug!("WebSocket desconectado del proyecto {project_id}.");
    }

    pub fn listener_count(&self, project_id: &str) -> usize {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.get(project_id).map(Vec::len).unwrap_or(0)
    }
}

impl ProjectNotifier for ProjectHub {
    fn notify(&self, project_id: &str, payload: Value) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = listeners.get_mut(project_id) else {
            return;
        };

        entry.retain(|listener| match listener.tx.send(payload.clone()) {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "No se pudo entregar la actualización del proyecto {project_id}; se descarta el oyente {}.",
                    listener.id
                );
                false
            }
        });

        if entry.is_empty() {
            listeners.remove(project_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn closed_listener_does_not_block_the_others() {
        let hub = ProjectHub::new();
        let (_, dropped_rx) = hub.connect("p1");
        let (_, mut live_rx) = hub.connect("p1");
        drop(dropped_rx);

        hub.notify("p1", json!({"type": "ping"}));

        assert_eq!(live_rx.recv().await.unwrap()["type"], "ping");
        assert_eq!(hub.listener_count("p1"), 1);
    }

    #[tokio::test]
    async fn notifications_are_scoped_by_project() {
        let hub = ProjectHub::new();
        let (_, mut rx_a) = hub.connect("a");
        let (id_b, mut rx_b) = hub.connect("b");

        hub.notify("a", json!(1));
        assert_eq!(rx_a.recv().await.unwrap(), json!(1));
        assert!(rx_b.try_recv().is_err());

        hub.disconnect("b", id_b);
        assert_eq!(hub.listener_count("b"), 0);
        hub.notify("unknown", json!(2));
    }
}
