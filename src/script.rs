//! Contract between the host and the code living inside a loaded artifact.
//!
//! Artifacts hand out boxed trait objects; the host never learns their concrete types.

use anyhow::Result;
use std::any::Any;
use std::fmt;

/// Fully qualified name every artifact must export its registry under.
pub const ENTRY_POINT_TYPE: &str = "kestrel.scripts.ScriptRegistry";

/// Borrowed view of the host engine handed to a script for the duration of one call.
pub struct ScriptContext<'a> {
    engine: &'a mut dyn Any,
    tag: &'a str,
}

impl<'a> ScriptContext<'a> {
    pub fn new(engine: &'a mut dyn Any, tag: &'a str) -> Self {
        Self { engine, tag }
    }

    /// Tag the running script was loaded under.
    pub fn tag(&self) -> &str {
        self.tag
    }

    /// Downcasts the engine facade. Returns `None` when the host runs a different engine type.
    pub fn engine<T: Any>(&mut self) -> Option<&mut T> {
        self.engine.downcast_mut::<T>()
    }

    pub fn engine_ref<T: Any>(&self) -> Option<&T> {
        self.engine.downcast_ref::<T>()
    }
}

/// Lifecycle contract implemented by every script type.
pub trait Script {
    /// Display name used in logs; defaults to the Rust type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn load(&mut self, ctx: &mut ScriptContext<'_>) -> Result<()>;

    fn update(&mut self, ctx: &mut ScriptContext<'_>, dt: f64) -> Result<()>;

    fn destroy(&mut self, _ctx: &mut ScriptContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Extension hook for methods beyond the lifecycle. `None` means the method does not exist.
    fn invoke(
        &mut self,
        _ctx: &mut ScriptContext<'_>,
        _method: &str,
        _args: &[ScriptValue],
    ) -> Option<Result<ScriptValue>> {
        None
    }
}

/// The entry point of an artifact.
pub trait ScriptRegistry {
    /// All scripts registered under `tag`, in manifest order.
    fn instantiate_scripts(&mut self, tag: &str) -> Result<Vec<Box<dyn Script>>>;

    /// Recomputes the tag to type association.
    fn reload(&mut self) -> Result<()>;

    /// Tags this registry knows about. Informational only.
    fn tags(&self) -> Vec<String> {
        Vec::new()
    }
}

/// An object produced by a constructor exported from an artifact.
pub enum ScriptObject {
    Registry(Box<dyn ScriptRegistry>),
    Script(Box<dyn Script>),
}

impl ScriptObject {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registry(_) => "registry",
            Self::Script(_) => "script",
        }
    }

    pub fn into_registry(self) -> Option<Box<dyn ScriptRegistry>> {
        match self {
            Self::Registry(registry) => Some(registry),
            Self::Script(_) => None,
        }
    }

    pub fn into_script(self) -> Option<Box<dyn Script>> {
        match self {
            Self::Script(script) => Some(script),
            Self::Registry(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Unit,
    Bool,
    Int,
    Float,
    Str,
}

impl ValueKind {
    pub fn label(self) -> &'static str {
        match self {
            ValueKind::Unit => "unit",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Str => "str",
        }
    }

    /// Renders a signature such as `(float, str)`.
    pub fn signature(kinds: &[ValueKind]) -> String {
        let parts: Vec<&str> = kinds.iter().map(|kind| kind.label()).collect();
        format!("({})", parts.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScriptValue {
    #[default]
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ScriptValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ScriptValue::Unit => ValueKind::Unit,
            ScriptValue::Bool(_) => ValueKind::Bool,
            ScriptValue::Int(_) => ValueKind::Int,
            ScriptValue::Float(_) => ValueKind::Float,
            ScriptValue::Str(_) => ValueKind::Str,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ScriptValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::Str(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Unit => write!(f, "()"),
            ScriptValue::Bool(value) => write!(f, "{value}"),
            ScriptValue::Int(value) => write!(f, "{value}"),
            ScriptValue::Float(value) => write!(f, "{value}"),
            ScriptValue::Str(value) => write!(f, "{value:?}"),
        }
    }
}
