use crate::abi::{ArgsHandle, ConstructFn, TypeTable, TypeTableFn, TYPE_TABLE_SYMBOL};
use crate::error::{LoadError, LoadResult};
use crate::script::{Script, ScriptObject, ScriptRegistry, ScriptValue};
use libloading::Library;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::mem;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use tempfile::TempPath;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationId(u64);

impl GenerationId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// One loaded snapshot of script code together with every type it defines.
///
/// Objects built from a generation keep an `Rc<Generation>` alive, so the backing library cannot be
/// unmapped underneath them.
pub struct Generation {
    id: GenerationId,
    artifact: PathBuf,
    fingerprint: Option<blake3::Hash>,
    types: Vec<(String, ConstructFn)>,
    backing: GenerationBacking,
}

enum GenerationBacking {
    BuiltIn,
    Dynamic { library: Library, shadow: TempPath },
    Released,
}

impl Generation {
    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact
    }

    /// Content hash of the artifact file. Built-in generations have none.
    pub fn fingerprint(&self) -> Option<&blake3::Hash> {
        self.fingerprint.as_ref()
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.backing, GenerationBacking::Dynamic { .. })
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(|(name, _)| name.as_str())
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.constructor(name).is_some()
    }

    fn constructor(&self, name: &str) -> Option<ConstructFn> {
        self.types.iter().find(|(candidate, _)| candidate == name).map(|(_, construct)| *construct)
    }

    /// Unmaps the library and deletes its shadow copy. Safe to call more than once.
    fn release(&mut self) {
        self.types.clear();
        if let GenerationBacking::Dynamic { library, shadow } =
            mem::replace(&mut self.backing, GenerationBacking::Released)
        {
            if let Err(err) = library.close() {
                warn!(generation = %self.id, "closing script library failed: {err}");
            }
            let shadow_path = shadow.to_path_buf();
            match shadow.close() {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(shadow = %shadow_path.display(), "removing shadow copy failed: {err}"),
            }
        }
        debug!(generation = %self.id, "released script generation");
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("artifact", &self.artifact)
            .field("types", &self.types.len())
            .field("dynamic", &self.is_dynamic())
            .finish()
    }
}

/// An object constructed inside a generation. Holds the generation until the object is gone.
pub struct GenerationObject {
    // Must drop before `generation`.
    object: ScriptObject,
    generation: Rc<Generation>,
}

impl GenerationObject {
    pub fn kind(&self) -> &'static str {
        self.object.kind()
    }

    pub fn generation(&self) -> &Rc<Generation> {
        &self.generation
    }

    pub fn into_script(self) -> Option<BoundScript> {
        let Self { object, generation } = self;
        object.into_script().map(|script| BoundScript::new(script, generation))
    }

    pub(crate) fn into_registry(self) -> Option<(Box<dyn ScriptRegistry>, Rc<Generation>)> {
        let Self { object, generation } = self;
        object.into_registry().map(|registry| (registry, generation))
    }
}

/// A script together with the generation its code lives in.
///
/// Derefs to `dyn Script`; the box itself never leaves, so the code cannot outlive its library.
pub struct BoundScript {
    // Must drop before `generation`.
    script: Box<dyn Script>,
    generation: Rc<Generation>,
}

impl BoundScript {
    pub(crate) fn new(script: Box<dyn Script>, generation: Rc<Generation>) -> Self {
        Self { script, generation }
    }

    pub fn generation(&self) -> &Rc<Generation> {
        &self.generation
    }

    pub fn generation_id(&self) -> GenerationId {
        self.generation.id()
    }
}

impl Deref for BoundScript {
    type Target = dyn Script;

    fn deref(&self) -> &Self::Target {
        self.script.as_ref()
    }
}

impl DerefMut for BoundScript {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.script.as_mut()
    }
}

/// Owns the active [`Generation`] and knows how to build, instantiate from and replace it.
pub struct CodeLoaderManager {
    current: Option<Rc<Generation>>,
    retired: Vec<Weak<Generation>>,
    builtins: HashMap<String, TypeTable>,
    shadow_dir: PathBuf,
    next_id: u64,
}

impl Default for CodeLoaderManager {
    fn default() -> Self {
        Self::new(env::temp_dir().join("kestrel_scripts"))
    }
}

impl CodeLoaderManager {
    pub fn new(shadow_dir: impl Into<PathBuf>) -> Self {
        Self {
            current: None,
            retired: Vec::new(),
            builtins: HashMap::new(),
            shadow_dir: shadow_dir.into(),
            next_id: 1,
        }
    }

    pub fn shadow_dir(&self) -> &Path {
        &self.shadow_dir
    }

    /// Makes an in-process type table loadable under `name`. Built-ins shadow files of the same path.
    pub fn register_builtin(&mut self, name: impl Into<String>, table: TypeTable) {
        self.builtins.insert(name.into(), table);
    }

    pub fn is_loaded(&self) -> bool {
        self.current.is_some()
    }

    /// Number of generations built so far, including failed swaps that never became current.
    pub fn generation_count(&self) -> u64 {
        self.next_id - 1
    }

    pub fn current_generation(&self) -> LoadResult<Rc<Generation>> {
        self.current.clone().ok_or(LoadError::NoGenerationLoaded)
    }

    /// Replaced generations that something outside the manager still keeps mapped.
    pub fn lingering_generations(&self) -> Vec<GenerationId> {
        self.retired.iter().filter_map(Weak::upgrade).map(|generation| generation.id()).collect()
    }

    /// Builds a generation from `path` and makes it current.
    pub fn load(&mut self, path: impl AsRef<Path>) -> LoadResult<Rc<Generation>> {
        if self.current.is_some() {
            return self.swap(path);
        }
        let generation = Rc::new(self.build_generation(path.as_ref())?);
        info!(
            generation = %generation.id(),
            artifact = %generation.artifact_path().display(),
            types = generation.types.len(),
            "loaded script generation"
        );
        self.current = Some(generation.clone());
        Ok(generation)
    }

    /// Replaces the current generation. On failure the previous generation stays current.
    pub fn swap(&mut self, path: impl AsRef<Path>) -> LoadResult<Rc<Generation>> {
        let generation = Rc::new(self.build_generation(path.as_ref())?);
        match self.current.replace(generation.clone()) {
            Some(previous) => {
                info!(from = %previous.id(), to = %generation.id(), "swapped script generation");
                self.retire(previous);
            }
            None => info!(generation = %generation.id(), "loaded script generation"),
        }
        Ok(generation)
    }

    /// Drops the manager's reference to the current generation.
    pub fn unload(&mut self) -> Option<GenerationId> {
        let generation = self.current.take()?;
        let id = generation.id();
        self.retire(generation);
        Some(id)
    }

    fn retire(&mut self, generation: Rc<Generation>) {
        self.retired.retain(|weak| weak.strong_count() > 0);
        self.retired.push(Rc::downgrade(&generation));
    }

    /// Constructs `qualified_name` from inside `generation`. The result keeps `generation` alive.
    pub fn instantiate(
        &self,
        generation: &Rc<Generation>,
        qualified_name: &str,
        args: &[ScriptValue],
    ) -> LoadResult<GenerationObject> {
        let construct = generation.constructor(qualified_name).ok_or_else(|| LoadError::TypeNotFound {
            name: qualified_name.to_string(),
            generation: generation.id(),
        })?;
        let handle = unsafe { construct(ArgsHandle::from_slice(args)) };
        let object = unsafe { handle.into_object() }.ok_or_else(|| LoadError::ConstructionFailed {
            name: qualified_name.to_string(),
            reason: "constructor returned a null handle".to_string(),
        })?;
        Ok(GenerationObject { object, generation: generation.clone() })
    }

    fn build_generation(&mut self, path: &Path) -> LoadResult<Generation> {
        let id = GenerationId(self.next_id);
        self.next_id += 1;

        if let Some(table) = self.builtins.get(path.to_string_lossy().as_ref()) {
            let types = unsafe { table.read() }
                .map_err(|reason| LoadError::ArtifactCorrupt { path: path.to_path_buf(), reason })?;
            return Ok(Generation {
                id,
                artifact: path.to_path_buf(),
                fingerprint: None,
                types,
                backing: GenerationBacking::BuiltIn,
            });
        }

        if !path.is_file() {
            return Err(LoadError::ArtifactNotFound { path: path.to_path_buf() });
        }
        let bytes = fs::read(path).map_err(|source| io_error(path, source))?;
        let fingerprint = blake3::hash(&bytes);
        let shadow = self.write_shadow(path, id, &bytes)?;

        // A failed open drops `shadow`, which deletes the copy.
        let library = unsafe { Library::new(shadow.as_os_str()) }.map_err(|err| LoadError::ArtifactCorrupt {
            path: path.to_path_buf(),
            reason: format!("opening library: {err}"),
        })?;
        let types = match read_type_table(&library) {
            Ok(types) => types,
            Err(reason) => {
                drop(library);
                return Err(LoadError::ArtifactCorrupt { path: path.to_path_buf(), reason });
            }
        };
        debug!(
            generation = %id,
            shadow = %shadow.display(),
            fingerprint = %fingerprint.to_hex(),
            "opened script library"
        );
        Ok(Generation {
            id,
            artifact: path.to_path_buf(),
            fingerprint: Some(fingerprint),
            types,
            backing: GenerationBacking::Dynamic { library, shadow },
        })
    }

    /// Every generation is opened from its own freshly created copy, so the platform loader never
    /// hands back a cached mapping of an older build and no other loader sharing the directory can
    /// overwrite a mapped file.
    fn write_shadow(&self, path: &Path, id: GenerationId, bytes: &[u8]) -> LoadResult<TempPath> {
        fs::create_dir_all(&self.shadow_dir).map_err(|source| io_error(&self.shadow_dir, source))?;
        let (prefix, suffix) = shadow_affixes(path, id);
        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(&suffix)
            .tempfile_in(&self.shadow_dir)
            .map_err(|source| io_error(&self.shadow_dir, source))?;
        file.write_all(bytes).map_err(|source| io_error(file.path(), source))?;
        Ok(file.into_temp_path())
    }
}

/// `<stem>-<id>-` and `.<ext>`; the random part goes in between.
fn shadow_affixes(path: &Path, id: GenerationId) -> (String, String) {
    let stem = path.file_stem().map_or_else(|| "artifact".into(), |stem| stem.to_string_lossy().into_owned());
    let suffix = path.extension().map(|ext| format!(".{}", ext.to_string_lossy())).unwrap_or_default();
    (format!("{stem}-{id}-"), suffix)
}

fn read_type_table(library: &Library) -> Result<Vec<(String, ConstructFn)>, String> {
    let table_fn = unsafe {
        library.get::<TypeTableFn>(TYPE_TABLE_SYMBOL).map_err(|err| {
            let symbol = String::from_utf8_lossy(&TYPE_TABLE_SYMBOL[..TYPE_TABLE_SYMBOL.len() - 1]);
            format!("resolving '{symbol}': {err}")
        })?
    };
    let table = unsafe { table_fn() };
    drop(table_fn);
    unsafe { table.read() }
}

fn io_error(path: &Path, source: io::Error) -> LoadError {
    LoadError::Io { path: path.to_path_buf(), source }
}
