//! Host function registration and call dispatch.
//!
//! Host modules are built as name → handler tables with declared
//! [`FnSignature`]s, validated at registration time, and installed into a
//! [`Linker`] in one pass. A failing handler never traps the guest: the
//! failure is logged and the call returns a zero-valued result.

use crate::error::AbiError;
use crate::memory::GuestMemory;
use crate::resource::Handle;
use crate::state::ExtensionState;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use vela_ext_abi::v1::{discriminant, resource_drop_name, FnSignature, SlotKind};
use wasmtime::{Caller, FuncType, Linker, Val, ValType};

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("module {module:?} already defines {function:?}")]
    DuplicateFunction { module: String, function: String },

    #[error("{function:?} takes a return pointer but its last parameter is {found}")]
    ReturnPointerSlot {
        function: String,
        found: &'static str,
    },

    #[error("{function:?} declares both a return pointer and a flat result")]
    ReturnPointerResult { function: String },
}

#[derive(Debug, Error)]
pub enum DefineError {
    #[error("failed to define {module}::{function}: {message}")]
    Linker {
        module: String,
        function: String,
        message: String,
    },
}

/// A cursor over the raw scalar slots of one host call, consumed left to
/// right by the typed accessors. Compound arguments read their payload
/// bytes through the caller's [`GuestMemory`]; the return pointer, when
/// present, occupies the trailing slot and is read in place.
pub struct Args<'a> {
    function: &'a str,
    slots: &'a [Val],
    cursor: usize,
}

impl<'a> Args<'a> {
    pub(crate) fn new(function: &'a str, slots: &'a [Val]) -> Self {
        Self {
            function,
            slots,
            cursor: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.slots.len() - self.cursor
    }

    fn take<T>(
        &mut self,
        expected: &'static str,
        extract: impl Fn(&Val) -> Option<T>,
    ) -> Result<T, AbiError> {
        let index = self.cursor;
        let slot = self.slots.get(index).ok_or_else(|| AbiError::MissingSlot {
            function: self.function.to_string(),
            index,
        })?;
        self.cursor += 1;
        extract(slot).ok_or_else(|| AbiError::SlotKindMismatch {
            function: self.function.to_string(),
            index,
            expected,
        })
    }

    pub fn i32(&mut self) -> Result<i32, AbiError> {
        self.take("i32", |slot| match slot {
            Val::I32(value) => Some(*value),
            _ => None,
        })
    }

    pub fn i64(&mut self) -> Result<i64, AbiError> {
        self.take("i64", |slot| match slot {
            Val::I64(value) => Some(*value),
            _ => None,
        })
    }

    pub fn f32(&mut self) -> Result<f32, AbiError> {
        self.take("f32", |slot| match slot {
            Val::F32(bits) => Some(f32::from_bits(*bits)),
            _ => None,
        })
    }

    pub fn f64(&mut self) -> Result<f64, AbiError> {
        self.take("f64", |slot| match slot {
            Val::F64(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        })
    }

    pub fn u32(&mut self) -> Result<u32, AbiError> {
        Ok(self.i32()? as u32)
    }

    pub fn u64(&mut self) -> Result<u64, AbiError> {
        Ok(self.i64()? as u64)
    }

    pub fn handle(&mut self) -> Result<Handle, AbiError> {
        Ok(Handle(self.u32()?))
    }

    /// The trailing return-pointer slot.
    ///
    /// Reads the last slot without advancing the cursor; handlers
    /// resolve it before decoding positional arguments and report
    /// decode failures through it.
    pub fn ret_ptr(&self) -> Result<u32, AbiError> {
        match self.slots.last() {
            Some(Val::I32(value)) => Ok(*value as u32),
            Some(_) => Err(AbiError::SlotKindMismatch {
                function: self.function.to_string(),
                index: self.slots.len() - 1,
                expected: "i32",
            }),
            None => Err(AbiError::MissingSlot {
                function: self.function.to_string(),
                index: 0,
            }),
        }
    }

    /// A string argument: two slots, (pointer, byte length).
    pub fn string(&mut self, memory: &GuestMemory<'_>) -> Result<String, AbiError> {
        let ptr = self.u32()?;
        let len = self.u32()?;
        memory.read_str(ptr, len)
    }

    /// An `option<string>` argument: three slots, discriminant then the
    /// (pointer, length) pair. Both payload slots are consumed on the
    /// `none` arm too.
    pub fn opt_string(&mut self, memory: &GuestMemory<'_>) -> Result<Option<String>, AbiError> {
        let disc = self.u32()?;
        let ptr = self.u32()?;
        let len = self.u32()?;
        match disc {
            discriminant::NONE => Ok(None),
            discriminant::SOME => Ok(Some(memory.read_str(ptr, len)?)),
            value => Err(AbiError::InvalidDiscriminant {
                shape: "option",
                value,
            }),
        }
    }
}

type HostFn = Box<
    dyn Fn(&mut GuestMemory<'_>, &mut Args<'_>) -> Result<Option<Val>, AbiError>
        + Send
        + Sync
        + 'static,
>;

struct HostFunction {
    signature: FnSignature,
    handler: HostFn,
}

/// A named table of host functions with their declared signatures.
///
/// Functions are validated as they are registered and installed into a
/// linker with [`HostModule::define`].
pub struct HostModule {
    name: String,
    functions: BTreeMap<String, HostFunction>,
}

impl HostModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn signature(&self, function: &str) -> Option<&FnSignature> {
        self.functions
            .get(function)
            .map(|function| &function.signature)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Registers one function under `name`.
    ///
    /// Rejects duplicate names, a return pointer without a trailing i32
    /// slot to carry it, and a return pointer combined with a flat
    /// result.
    pub fn function(
        &mut self,
        name: impl Into<String>,
        signature: FnSignature,
        handler: impl Fn(&mut GuestMemory<'_>, &mut Args<'_>) -> Result<Option<Val>, AbiError>
            + Send
            + Sync
            + 'static,
    ) -> Result<&mut Self, RegisterError> {
        let name = name.into();
        if signature.has_ret_ptr() {
            if signature.result.is_some() {
                return Err(RegisterError::ReturnPointerResult { function: name });
            }
            match signature.params.last() {
                Some(SlotKind::I32) => {}
                Some(other) => {
                    return Err(RegisterError::ReturnPointerSlot {
                        function: name,
                        found: other.name(),
                    })
                }
                None => {
                    return Err(RegisterError::ReturnPointerSlot {
                        function: name,
                        found: "missing",
                    })
                }
            }
        }
        match self.functions.entry(name) {
            Entry::Occupied(entry) => Err(RegisterError::DuplicateFunction {
                module: self.name.clone(),
                function: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(HostFunction {
                    signature,
                    handler: Box::new(handler),
                });
                Ok(self)
            }
        }
    }

    /// Registers the canonical `[resource-drop]name` destructor, which
    /// releases whatever handle the guest passes. Dropping an unknown
    /// handle is a no-op.
    pub fn resource_drop(&mut self, resource: &str) -> Result<&mut Self, RegisterError> {
        self.function(
            resource_drop_name(resource),
            FnSignature::new().handle(),
            |memory: &mut GuestMemory<'_>, args: &mut Args<'_>| {
                let handle = args.handle()?;
                memory.state().resources().drop_handle(handle);
                Ok(None)
            },
        )
    }

    /// Installs every registered function into `linker` under this
    /// module's name.
    pub fn define(self, linker: &mut Linker<ExtensionState>) -> Result<(), DefineError> {
        let Self {
            name: module_name,
            functions,
        } = self;
        let count = functions.len();

        for (fn_name, function) in functions {
            let HostFunction { signature, handler } = function;
            let ty = func_type(&signature);
            let declared_params = signature.param_count();
            let declared_result = signature.result;
            let module = module_name.clone();
            let function_name = fn_name.clone();

            linker
                .func_new(
                    &module_name,
                    &fn_name,
                    ty,
                    move |mut caller: Caller<'_, ExtensionState>,
                          params: &[Val],
                          results: &mut [Val]| {
                        let outcome = dispatch_call(
                            &mut caller,
                            &function_name,
                            declared_params,
                            &handler,
                            params,
                        );
                        match outcome {
                            Ok(Some(value)) => {
                                if let Some(slot) = results.first_mut() {
                                    *slot = value;
                                }
                            }
                            Ok(None) => {
                                if let (Some(kind), Some(slot)) =
                                    (declared_result, results.first_mut())
                                {
                                    *slot = zero_val(kind);
                                }
                            }
                            Err(error) => {
                                tracing::warn!(
                                    module = %module,
                                    function = %function_name,
                                    kind = %error.kind(),
                                    error = %error,
                                    "host call failed"
                                );
                                if let (Some(kind), Some(slot)) =
                                    (declared_result, results.first_mut())
                                {
                                    *slot = zero_val(kind);
                                }
                            }
                        }
                        Ok(())
                    },
                )
                .map_err(|source| DefineError::Linker {
                    module: module_name.clone(),
                    function: fn_name.clone(),
                    message: source.to_string(),
                })?;
        }

        tracing::debug!(module = %module_name, functions = count, "defined host module");
        Ok(())
    }
}

impl fmt::Debug for HostModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostModule")
            .field("name", &self.name)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn dispatch_call(
    caller: &mut Caller<'_, ExtensionState>,
    function: &str,
    declared_params: usize,
    handler: &HostFn,
    params: &[Val],
) -> Result<Option<Val>, AbiError> {
    check_arity(function, declared_params, params.len())?;
    let mut memory = GuestMemory::from_caller(caller)?;
    let mut args = Args::new(function, params);
    handler(&mut memory, &mut args)
}

fn check_arity(function: &str, declared: usize, actual: usize) -> Result<(), AbiError> {
    if declared != actual {
        return Err(AbiError::ArityMismatch {
            function: function.to_string(),
            declared,
            actual,
        });
    }
    Ok(())
}

fn val_type(kind: SlotKind) -> ValType {
    match kind {
        SlotKind::I32 => ValType::I32,
        SlotKind::I64 => ValType::I64,
        SlotKind::F32 => ValType::F32,
        SlotKind::F64 => ValType::F64,
    }
}

fn func_type(signature: &FnSignature) -> FuncType {
    let params = signature.params.iter().copied().map(val_type);
    let results = signature.result.iter().copied().map(val_type);
    FuncType::new(params.collect::<Vec<_>>(), results.collect::<Vec<_>>())
}

fn zero_val(kind: SlotKind) -> Val {
    match kind {
        SlotKind::I32 => Val::I32(0),
        SlotKind::I64 => Val::I64(0),
        SlotKind::F32 => Val::F32(0),
        SlotKind::F64 => Val::F64(0),
    }
}
