use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::loader::GenerationId;

/// Failures raised while bringing code into the process or building objects from it.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("artifact '{}' not found", path.display())]
    ArtifactNotFound { path: PathBuf },
    #[error("artifact '{}' is corrupt: {reason}", path.display())]
    ArtifactCorrupt { path: PathBuf, reason: String },
    #[error("artifact '{}' does not export the entry point '{entry_point}'", path.display())]
    EntryPointMissing { path: PathBuf, entry_point: String },
    #[error("type '{name}' not found in generation {generation}")]
    TypeNotFound { name: String, generation: GenerationId },
    #[error("constructing '{name}' failed: {reason}")]
    ConstructionFailed { name: String, reason: String },
    #[error("no generation loaded")]
    NoGenerationLoaded,
    #[error("preparing artifact '{}'", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures of a single late-bound call into guest code.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("method '{method}{signature}' not found on '{target}'")]
    MethodNotFound { target: String, method: String, signature: String },
    #[error("'{target}.{method}' failed: {source:#}")]
    Failed {
        target: String,
        method: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("'{target}.{method}' panicked: {message}")]
    Panicked { target: String, method: String, message: String },
    #[error("'{target}' belongs to generation {owner}, active generation is {active}")]
    StaleGeneration { target: String, owner: GenerationId, active: GenerationId },
}

/// Errors surfaced by the orchestrator's host-facing API.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("entry point call failed")]
    EntryPoint(#[source] DispatchError),
    #[error("script runtime is not initialised")]
    NotInitialized,
    #[error("script runtime already initialised with generation {0}")]
    AlreadyInitialized(GenerationId),
}

impl RuntimeError {
    pub fn as_load_error(&self) -> Option<&LoadError> {
        match self {
            Self::Load(err) => Some(err),
            _ => None,
        }
    }
}

pub type LoadResult<T> = std::result::Result<T, LoadError>;
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
