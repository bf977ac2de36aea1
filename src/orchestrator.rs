//! Tag-indexed lifecycle driver sitting on top of the loader, resolver and dispatcher.
//!
//! The orchestrator is single threaded: generations are shared through `Rc`, which keeps it
//! `!Send` and makes a reload racing a tick impossible to express.

use crate::config::RuntimeConfig;
use crate::dispatch::{DynamicDispatcher, DESTROY, LOAD, UPDATE};
use crate::error::{DispatchError, RuntimeError, RuntimeResult};
use crate::loader::{BoundScript, CodeLoaderManager, GenerationId};
use crate::resolver::{RegistryHandle, RegistryResolver};
use crate::script::{ScriptContext, ScriptValue, ValueKind};
use std::any::Any;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// A live script owned by the orchestrator.
pub struct ScriptInstance {
    script: BoundScript,
    name: String,
    tag: String,
}

impl ScriptInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn generation_id(&self) -> GenerationId {
        self.script.generation_id()
    }
}

/// Tag to instances, instances kept in load order.
#[derive(Default)]
pub struct ActiveSystemsIndex {
    systems: BTreeMap<String, Vec<ScriptInstance>>,
}

impl ActiveSystemsIndex {
    fn push(&mut self, instance: ScriptInstance) {
        self.systems.entry(instance.tag.clone()).or_default().push(instance);
    }

    fn remove(&mut self, tag: &str) -> Vec<ScriptInstance> {
        self.systems.remove(tag).unwrap_or_default()
    }

    fn drain(&mut self) -> Vec<(String, Vec<ScriptInstance>)> {
        std::mem::take(&mut self.systems).into_iter().collect()
    }

    pub fn count(&self, tag: &str) -> usize {
        self.systems.get(tag).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.systems.values().map(Vec::len).sum()
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.systems.keys().map(String::as_str)
    }

    pub fn instances(&self, tag: &str) -> &[ScriptInstance] {
        self.systems.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }
}

/// Counts for one update pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    pub failed: usize,
}

impl TickReport {
    fn absorb(&mut self, other: TickReport) {
        self.dispatched += other.dispatched;
        self.failed += other.failed;
    }
}

/// The most recent isolated guest failure.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchFailure {
    pub tag: String,
    pub script: String,
    pub call: String,
    pub generation: GenerationId,
    pub message: String,
}

pub struct ScriptLifecycleOrchestrator {
    // Field order is drop order: instances, then the registry, then the loader's generation.
    index: ActiveSystemsIndex,
    registry: Option<RegistryHandle>,
    loader: CodeLoaderManager,
    resolver: RegistryResolver,
    dispatcher: DynamicDispatcher,
    last_failure: Option<DispatchFailure>,
}

impl Default for ScriptLifecycleOrchestrator {
    fn default() -> Self {
        Self::new(CodeLoaderManager::default(), DynamicDispatcher::default())
    }
}

impl ScriptLifecycleOrchestrator {
    pub fn new(loader: CodeLoaderManager, dispatcher: DynamicDispatcher) -> Self {
        Self {
            index: ActiveSystemsIndex::default(),
            registry: None,
            loader,
            resolver: RegistryResolver::default(),
            dispatcher,
            last_failure: None,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            CodeLoaderManager::new(config.shadow_dir.clone()),
            DynamicDispatcher::new(config.slow_call_threshold()),
        )
    }

    pub fn loader(&self) -> &CodeLoaderManager {
        &self.loader
    }

    /// Access for registering built-in artifacts before `initialize`.
    pub fn loader_mut(&mut self) -> &mut CodeLoaderManager {
        &mut self.loader
    }

    pub fn index(&self) -> &ActiveSystemsIndex {
        &self.index
    }

    pub fn is_initialized(&self) -> bool {
        self.registry.is_some()
    }

    pub fn active_generation(&self) -> Option<GenerationId> {
        self.loader.current_generation().ok().map(|generation| generation.id())
    }

    pub fn last_failure(&self) -> Option<&DispatchFailure> {
        self.last_failure.as_ref()
    }

    /// Tags the entry point of the active generation reports. Empty when the entry point fails.
    pub fn registry_tags(&self) -> Vec<String> {
        let Some(handle) = &self.registry else {
            return Vec::new();
        };
        self.resolver.tags(&self.dispatcher, handle).unwrap_or_else(|err| {
            warn!(generation = %handle.generation_id(), "reading registry tags failed: {err}");
            Vec::new()
        })
    }

    pub fn initialize(&mut self, path: impl AsRef<Path>) -> RuntimeResult<GenerationId> {
        if let Some(handle) = &self.registry {
            return Err(RuntimeError::AlreadyInitialized(handle.generation_id()));
        }
        let generation = self.loader.load(path)?;
        let id = generation.id();
        match self.resolver.resolve(&self.loader, generation) {
            Ok(handle) => self.registry = Some(handle),
            Err(err) => {
                self.loader.unload();
                return Err(err.into());
            }
        }
        info!(generation = %id, "script runtime initialised");
        Ok(id)
    }

    /// Initialises from `config.artifact_path` and loads every autoload tag.
    pub fn bootstrap(&mut self, engine: &mut dyn Any, config: &RuntimeConfig) -> RuntimeResult<usize> {
        self.initialize(&config.artifact_path)?;
        let mut loaded = 0;
        for tag in &config.autoload_tags {
            loaded += self.load_systems_for_tag(engine, tag)?;
        }
        Ok(loaded)
    }

    /// Instantiates every script registered under `tag` and keeps the ones whose `load` succeeds.
    /// Repeated calls append further instances.
    pub fn load_systems_for_tag(&mut self, engine: &mut dyn Any, tag: &str) -> RuntimeResult<usize> {
        let handle = self.registry.as_mut().ok_or(RuntimeError::NotInitialized)?;
        let scripts =
            self.resolver.instantiate_scripts(&self.dispatcher, handle, tag).map_err(RuntimeError::EntryPoint)?;
        let generation = handle.generation_id();

        let mut loaded = 0;
        let mut discarded = 0;
        for mut script in scripts {
            let name = self.dispatcher.script_name(&*script);
            let mut ctx = ScriptContext::new(&mut *engine, tag);
            match self.dispatcher.load(&mut *script, &mut ctx) {
                Ok(()) => {
                    self.index.push(ScriptInstance { script, name, tag: tag.to_string() });
                    loaded += 1;
                }
                Err(err) => {
                    discarded += 1;
                    record_failure(&mut self.last_failure, tag, &name, LOAD, generation, &err);
                    if let Err(err) = self.dispatcher.release(&name, script) {
                        record_failure(&mut self.last_failure, tag, &name, "drop", generation, &err);
                    }
                }
            }
        }
        info!(tag, loaded, discarded, generation = %generation, "loaded script systems");
        Ok(loaded)
    }

    pub fn update_all_systems(&mut self, engine: &mut dyn Any, dt: f64) -> TickReport {
        let active = self.active_generation();
        let mut report = TickReport::default();
        for (tag, instances) in self.index.systems.iter_mut() {
            report.absorb(update_instances(
                &self.dispatcher,
                &mut self.last_failure,
                tag,
                instances,
                active,
                engine,
                dt,
            ));
        }
        report
    }

    /// Same as [`Self::update_all_systems`] restricted to one tag. Unknown tags are a no-op.
    pub fn update_systems_by_tag(&mut self, engine: &mut dyn Any, tag: &str, dt: f64) -> TickReport {
        let active = self.active_generation();
        match self.index.systems.get_mut(tag) {
            Some(instances) => {
                update_instances(&self.dispatcher, &mut self.last_failure, tag, instances, active, engine, dt)
            }
            None => TickReport::default(),
        }
    }

    /// Calls an arbitrary method on every instance under `tag`, in load order.
    pub fn invoke_on_tag(
        &mut self,
        engine: &mut dyn Any,
        tag: &str,
        method: &str,
        arg_types: &[ValueKind],
        args: &[ScriptValue],
    ) -> Vec<Result<ScriptValue, DispatchError>> {
        let active = self.active_generation();
        let Some(instances) = self.index.systems.get_mut(tag) else {
            return Vec::new();
        };
        instances
            .iter_mut()
            .map(|instance| {
                check_generation(instance, active)?;
                let mut ctx = ScriptContext::new(&mut *engine, tag);
                self.dispatcher.invoke(&mut *instance.script, &mut ctx, method, arg_types, args)
            })
            .collect()
    }

    /// Destroys and removes every instance under `tag`. Returns how many were removed.
    pub fn unload_systems_by_tag(&mut self, engine: &mut dyn Any, tag: &str) -> usize {
        let instances = self.index.remove(tag);
        self.destroy_instances(engine, tag, instances)
    }

    pub fn unload_all_systems(&mut self, engine: &mut dyn Any) -> usize {
        let mut removed = 0;
        for (tag, instances) in self.index.drain() {
            removed += self.destroy_instances(engine, &tag, instances);
        }
        if removed > 0 {
            debug!(removed, "unloaded all script systems");
        }
        removed
    }

    /// Replaces the loaded artifact.
    ///
    /// All systems are unloaded before the swap, so they stay unloaded even when the swap fails and
    /// the previous generation remains current. Use [`Self::reload_artifact_restoring`] to bring
    /// the same tags back afterwards.
    pub fn reload_artifact(&mut self, engine: &mut dyn Any, path: impl AsRef<Path>) -> RuntimeResult<GenerationId> {
        if !self.loader.is_loaded() {
            return Err(RuntimeError::NotInitialized);
        }
        self.unload_all_systems(engine);

        let previous = self.registry.take();
        let generation = match self.loader.swap(path) {
            Ok(generation) => generation,
            Err(err) => {
                self.registry = previous;
                return Err(err.into());
            }
        };
        if let Some(previous) = previous {
            if let Err(err) = self.dispatcher.release(self.resolver.entry_point(), previous) {
                warn!("dropping the previous script registry failed: {err}");
            }
        }
        let lingering = self.loader.lingering_generations();
        if !lingering.is_empty() {
            warn!(?lingering, "replaced script generations still referenced; release deferred");
        }

        let mut handle = self.resolver.resolve(&self.loader, generation.clone())?;
        self.resolver.reload(&self.dispatcher, &mut handle).map_err(RuntimeError::EntryPoint)?;
        self.registry = Some(handle);
        info!(
            generation = %generation.id(),
            artifact = %generation.artifact_path().display(),
            "reloaded script artifact"
        );
        Ok(generation.id())
    }

    /// Reloads, then loads the tags that were active before the call again, against whichever
    /// generation ends up current. The reload result is returned unchanged.
    pub fn reload_artifact_restoring(
        &mut self,
        engine: &mut dyn Any,
        path: impl AsRef<Path>,
    ) -> RuntimeResult<GenerationId> {
        let tags = self.get_active_tags();
        let result = self.reload_artifact(engine, path);
        if let Err(err) = &result {
            warn!("script reload failed, restoring {} tag(s) on the current generation: {err}", tags.len());
        }
        if self.registry.is_some() {
            for tag in &tags {
                if let Err(err) = self.load_systems_for_tag(engine, tag) {
                    warn!(tag = %tag, "restoring script systems failed: {err}");
                }
            }
        }
        result
    }

    pub fn get_system_count(&self, tag: &str) -> usize {
        self.index.count(tag)
    }

    pub fn get_total_system_count(&self) -> usize {
        self.index.total()
    }

    pub fn get_active_tags(&self) -> Vec<String> {
        self.index.tags().map(str::to_string).collect()
    }

    pub fn has_systems_for_tag(&self, tag: &str) -> bool {
        self.index.count(tag) > 0
    }

    fn destroy_instances(&mut self, engine: &mut dyn Any, tag: &str, instances: Vec<ScriptInstance>) -> usize {
        let removed = instances.len();
        let active = self.active_generation();
        for mut instance in instances {
            let generation = instance.generation_id();
            // A stale instance must not be called, only dropped.
            let destroyed = check_generation(&instance, active).and_then(|()| {
                let mut ctx = ScriptContext::new(&mut *engine, tag);
                self.dispatcher.destroy(&mut *instance.script, &mut ctx)
            });
            if let Err(err) = destroyed {
                record_failure(&mut self.last_failure, tag, &instance.name, DESTROY, generation, &err);
            }
            let name = instance.name.clone();
            if let Err(err) = self.dispatcher.release(&name, instance) {
                record_failure(&mut self.last_failure, tag, &name, "drop", generation, &err);
            }
        }
        removed
    }
}

fn update_instances(
    dispatcher: &DynamicDispatcher,
    last_failure: &mut Option<DispatchFailure>,
    tag: &str,
    instances: &mut [ScriptInstance],
    active: Option<GenerationId>,
    engine: &mut dyn Any,
    dt: f64,
) -> TickReport {
    let mut report = TickReport::default();
    for instance in instances.iter_mut() {
        report.dispatched += 1;
        let outcome = check_generation(instance, active).and_then(|()| {
            let mut ctx = ScriptContext::new(&mut *engine, tag);
            dispatcher.update(&mut *instance.script, &mut ctx, dt)
        });
        if let Err(err) = outcome {
            report.failed += 1;
            record_failure(last_failure, tag, &instance.name, UPDATE, instance.generation_id(), &err);
        }
    }
    report
}

/// An instance keeps its own generation mapped, so only a mismatch with the active one matters.
fn check_generation(instance: &ScriptInstance, active: Option<GenerationId>) -> Result<(), DispatchError> {
    match active {
        Some(active) if active != instance.generation_id() => Err(DispatchError::StaleGeneration {
            target: instance.name.clone(),
            owner: instance.generation_id(),
            active,
        }),
        _ => Ok(()),
    }
}

fn record_failure(
    slot: &mut Option<DispatchFailure>,
    tag: &str,
    script: &str,
    call: &str,
    generation: GenerationId,
    err: &DispatchError,
) {
    error!(tag, script, call, generation = %generation, "script call failed: {err}");
    *slot = Some(DispatchFailure {
        tag: tag.to_string(),
        script: script.to_string(),
        call: call.to_string(),
        generation,
        message: err.to_string(),
    });
}
