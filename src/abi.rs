//! C ABI exported by script artifacts.
//!
//! An artifact exports a single symbol, [`TYPE_TABLE_SYMBOL`], returning a [`TypeTable`] that maps
//! qualified type names to constructors. Objects cross the boundary as boxed [`ScriptObject`]s, so
//! the artifact has to be built by the same compiler against the same version of this crate.

use crate::script::{Script, ScriptObject, ScriptRegistry, ScriptValue};
use std::collections::HashSet;
use std::ffi::{c_char, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::slice;

pub const SCRIPT_API_VERSION: u32 = 1;
pub const TYPE_TABLE_SYMBOL: &[u8] = b"kestrel_script_types\0";

pub type TypeTableFn = unsafe extern "C" fn() -> TypeTable;
pub type ConstructFn = unsafe extern "C" fn(args: ArgsHandle) -> ObjectHandle;

/// Owning, type-erased pointer to a heap allocated [`ScriptObject`].
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ObjectHandle {
    data: *mut (),
}

impl ObjectHandle {
    pub const fn null() -> Self {
        Self { data: ptr::null_mut() }
    }

    pub fn is_null(&self) -> bool {
        self.data.is_null()
    }

    pub fn from_object(object: ScriptObject) -> Self {
        Self { data: Box::into_raw(Box::new(object)).cast() }
    }

    pub fn registry(registry: impl ScriptRegistry + 'static) -> Self {
        Self::from_object(ScriptObject::Registry(Box::new(registry)))
    }

    pub fn script(script: impl Script + 'static) -> Self {
        Self::from_object(ScriptObject::Script(Box::new(script)))
    }

    /// Runs `build` and converts a panic or `None` into a null handle, since unwinding out of an
    /// `extern "C"` constructor aborts the process.
    pub fn guarded<F>(build: F) -> Self
    where
        F: FnOnce() -> Option<ScriptObject>,
    {
        match panic::catch_unwind(AssertUnwindSafe(build)) {
            Ok(Some(object)) => Self::from_object(object),
            Ok(None) | Err(_) => Self::null(),
        }
    }

    /// # Safety
    /// The handle must come from [`ObjectHandle::from_object`] and must not be used again.
    pub unsafe fn into_object(self) -> Option<ScriptObject> {
        if self.is_null() {
            return None;
        }
        Some(*Box::from_raw(self.data.cast::<ScriptObject>()))
    }
}

/// Borrowed constructor arguments.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ArgsHandle {
    data: *const (),
    len: usize,
}

impl ArgsHandle {
    pub fn from_slice(args: &[ScriptValue]) -> Self {
        Self { data: args.as_ptr().cast(), len: args.len() }
    }

    /// # Safety
    /// Only valid for the duration of the constructor call the handle was passed to.
    pub unsafe fn as_slice<'a>(&self) -> &'a [ScriptValue] {
        if self.len == 0 || self.data.is_null() {
            return &[];
        }
        slice::from_raw_parts(self.data.cast::<ScriptValue>(), self.len)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TypeExport {
    pub name: *const c_char,
    pub construct: ConstructFn,
}

// Names point at 'static C strings and constructors are plain functions.
unsafe impl Send for TypeExport {}
unsafe impl Sync for TypeExport {}

impl TypeExport {
    pub const fn new(name: &'static CStr, construct: ConstructFn) -> Self {
        Self { name: name.as_ptr(), construct }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct TypeTable {
    pub api_version: u32,
    pub len: usize,
    pub entries: *const TypeExport,
}

unsafe impl Send for TypeTable {}
unsafe impl Sync for TypeTable {}

impl TypeTable {
    pub const fn new(entries: &'static [TypeExport]) -> Self {
        Self { api_version: SCRIPT_API_VERSION, len: entries.len(), entries: entries.as_ptr() }
    }

    /// Copies the table into owned form, rejecting anything malformed.
    ///
    /// # Safety
    /// `entries` must point at `len` valid exports whose names are nul-terminated.
    pub(crate) unsafe fn read(&self) -> Result<Vec<(String, ConstructFn)>, String> {
        if self.api_version != SCRIPT_API_VERSION {
            return Err(format!(
                "api mismatch: artifact targets v{}, host exports v{}",
                self.api_version, SCRIPT_API_VERSION
            ));
        }
        if self.len == 0 {
            return Ok(Vec::new());
        }
        if self.entries.is_null() {
            return Err(format!("type table declares {} entries but is null", self.len));
        }
        let mut seen = HashSet::new();
        let mut types = Vec::with_capacity(self.len);
        for export in slice::from_raw_parts(self.entries, self.len) {
            if export.name.is_null() {
                return Err("type table entry without a name".to_string());
            }
            let name = CStr::from_ptr(export.name)
                .to_str()
                .map_err(|err| format!("type name is not valid UTF-8: {err}"))?
                .to_string();
            if !seen.insert(name.clone()) {
                return Err(format!("type '{name}' exported twice"));
            }
            types.push((name, export.construct));
        }
        Ok(types)
    }
}
