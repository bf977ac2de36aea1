use crate::dispatch::DynamicDispatcher;
use crate::error::{DispatchResult, LoadError, LoadResult};
use crate::loader::{BoundScript, CodeLoaderManager, Generation, GenerationId};
use crate::script::{ScriptRegistry, ENTRY_POINT_TYPE};
use std::rc::Rc;
use tracing::debug;

/// The entry-point object of one generation.
pub struct RegistryHandle {
    // Declared first so the registry is dropped before its generation.
    registry: Box<dyn ScriptRegistry>,
    generation: Rc<Generation>,
}

impl RegistryHandle {
    pub fn generation(&self) -> &Rc<Generation> {
        &self.generation
    }

    pub fn generation_id(&self) -> GenerationId {
        self.generation.id()
    }
}

/// Finds the entry point inside a generation and talks to it.
#[derive(Debug, Clone)]
pub struct RegistryResolver {
    entry_point: String,
}

impl Default for RegistryResolver {
    fn default() -> Self {
        Self::new(ENTRY_POINT_TYPE)
    }
}

impl RegistryResolver {
    pub fn new(entry_point: impl Into<String>) -> Self {
        Self { entry_point: entry_point.into() }
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn resolve(&self, loader: &CodeLoaderManager, generation: Rc<Generation>) -> LoadResult<RegistryHandle> {
        let object = loader.instantiate(&generation, &self.entry_point, &[]).map_err(|err| match err {
            LoadError::TypeNotFound { .. } => LoadError::EntryPointMissing {
                path: generation.artifact_path().to_path_buf(),
                entry_point: self.entry_point.clone(),
            },
            other => other,
        })?;
        let kind = object.kind();
        let (registry, owner) = object.into_registry().ok_or_else(|| LoadError::ArtifactCorrupt {
            path: generation.artifact_path().to_path_buf(),
            reason: format!("entry point '{}' constructed a {kind}, not a registry", self.entry_point),
        })?;
        debug!(generation = %owner.id(), entry_point = %self.entry_point, "resolved script registry");
        Ok(RegistryHandle { registry, generation: owner })
    }

    pub fn instantiate_scripts(
        &self,
        dispatcher: &DynamicDispatcher,
        handle: &mut RegistryHandle,
        tag: &str,
    ) -> DispatchResult<Vec<BoundScript>> {
        let registry = &mut handle.registry;
        let scripts =
            dispatcher.call(&self.entry_point, "instantiateScripts", || registry.instantiate_scripts(tag))?;
        let generation = &handle.generation;
        Ok(scripts.into_iter().map(|script| BoundScript::new(script, generation.clone())).collect())
    }

    pub fn reload(&self, dispatcher: &DynamicDispatcher, handle: &mut RegistryHandle) -> DispatchResult<()> {
        let registry = &mut handle.registry;
        dispatcher.call(&self.entry_point, "reload", || registry.reload())
    }

    /// Tags the entry point reports.
    pub fn tags(&self, dispatcher: &DynamicDispatcher, handle: &RegistryHandle) -> DispatchResult<Vec<String>> {
        dispatcher.call(&self.entry_point, "tags", || Ok(handle.registry.tags()))
    }
}
