//! Hot-reloadable script runtime for the kestrel engine.
//!
//! Script code lives in an externally built `cdylib`. The host loads it as a [`loader::Generation`],
//! resolves the artifact's [`script::ScriptRegistry`], groups script instances by tag and drives
//! their lifecycle every tick through [`dispatch::DynamicDispatcher`]. Rebuilt artifacts replace the
//! running generation without restarting the host.

pub mod abi;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod loader;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod resolver;
pub mod script;
pub mod watch;

pub use abi::{ArgsHandle, ObjectHandle, TypeExport, TypeTable, SCRIPT_API_VERSION};
pub use config::{RuntimeConfig, RuntimeConfigOverrides, WatchConfig};
pub use dispatch::DynamicDispatcher;
pub use error::{DispatchError, LoadError, RuntimeError};
pub use loader::{BoundScript, CodeLoaderManager, Generation, GenerationId, GenerationObject};
pub use manifest::{ManifestRegistry, ScriptManifest};
pub use orchestrator::{
    ActiveSystemsIndex, DispatchFailure, ScriptInstance, ScriptLifecycleOrchestrator, TickReport,
};
pub use resolver::{RegistryHandle, RegistryResolver};
pub use script::{
    Script, ScriptContext, ScriptObject, ScriptRegistry, ScriptValue, ValueKind, ENTRY_POINT_TYPE,
};
pub use watch::ArtifactWatcher;

/// Exports `kestrel_script_types` from an artifact crate.
///
/// ```ignore
/// kestrel_scripts::export_script_types! {
///     "kestrel.scripts.ScriptRegistry" => make_registry,
///     "game.Player" => make_player,
/// }
/// ```
#[macro_export]
macro_rules! export_script_types {
    ($($name:literal => $construct:path),* $(,)?) => {
        static KESTREL_SCRIPT_TYPES: &[$crate::abi::TypeExport] = &[
            $($crate::abi::TypeExport::new(
                match ::std::ffi::CStr::from_bytes_with_nul(concat!($name, "\0").as_bytes()) {
                    Ok(name) => name,
                    Err(_) => panic!("type name contains a nul byte"),
                },
                $construct,
            )),*
        ];

        #[no_mangle]
        pub extern "C" fn kestrel_script_types() -> $crate::abi::TypeTable {
            $crate::abi::TypeTable::new(KESTREL_SCRIPT_TYPES)
        }
    };
}
