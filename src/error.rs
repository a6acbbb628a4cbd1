//! Errores del núcleo (proyecto, contexto, registro).
//!
//! Ninguna operación del núcleo lanza pánicos: los fallos de E/S y de búsqueda
//! se registran con `tracing` y se devuelven como `ProjectError`, de modo que
//! el llamador puede inspeccionar el motivo con `kind()`.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Categoría del fallo, usada por la capa HTTP para elegir el código de estado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Io,
    Validation,
    External,
}

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("No encontrado: {0}")]
    NotFound(String),

    #[error("Ya existe: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Error de E/S en {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Validación fallida: {0}")]
    Validation(String),

    #[error("JSON inválido en {}: {source}", path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Servicio externo sin resultado: {0}")]
    External(String),
}

impl ProjectError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn json(path: impl AsRef<Path>, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Io { .. } | Self::Serialization { .. } => ErrorKind::Io,
            Self::AlreadyExists(_) | Self::Validation(_) => ErrorKind::Validation,
            Self::External(_) => ErrorKind::External,
        }
    }
}

pub type ProjectResult<T> = Result<T, ProjectError>;
