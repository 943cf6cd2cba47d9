//! The built-in `$root` host module.
//!
//! Exposes worktrees, projects, and settings to sandboxed extensions.
//! Handlers with a return pointer resolve it before decoding anything
//! else, and every later failure is encoded through it: on the error
//! arm when the result carries one, as the empty encoding when it does
//! not. A stale handle or an undecodable argument never traps the guest
//! and never leaves the return region unwritten.

use crate::abi::{ToAbi, WasmStr};
use crate::dispatch::{Args, HostModule, RegisterError};
use crate::error::AbiError;
use crate::memory::GuestMemory;
use crate::settings::SettingsLocation;
use crate::worktree::{make_file_executable, Project, Worktree};
use std::path::Path;
use std::sync::Arc;
use vela_ext_abi::v1::{discriminant, resource_method_name, FnSignature, SlotKind};
use wasmtime::Val;

pub const ROOT_MODULE: &str = "$root";

/// Decodes the leading handle slot and resolves it as a worktree,
/// logging either failure for the empty-encoding path.
fn worktree_or_log(
    memory: &GuestMemory<'_>,
    args: &mut Args<'_>,
    function: &'static str,
) -> Option<Arc<Worktree>> {
    let handle = match args.handle() {
        Ok(handle) => handle,
        Err(error) => {
            tracing::debug!(function, error = %error, "returning an empty encoding");
            return None;
        }
    };
    match memory.state().resources().worktree(handle) {
        Ok(worktree) => Some(worktree),
        Err(error) => {
            tracing::debug!(function, handle = handle.0, error = %error, "returning an empty encoding");
            None
        }
    }
}

fn project_or_log(
    memory: &GuestMemory<'_>,
    args: &mut Args<'_>,
    function: &'static str,
) -> Option<Arc<Project>> {
    let handle = match args.handle() {
        Ok(handle) => handle,
        Err(error) => {
            tracing::debug!(function, error = %error, "returning an empty encoding");
            return None;
        }
    };
    match memory.state().resources().project(handle) {
        Ok(project) => Some(project),
        Err(error) => {
            tracing::debug!(function, handle = handle.0, error = %error, "returning an empty encoding");
            None
        }
    }
}

fn read_text_file_outcome(
    memory: &GuestMemory<'_>,
    args: &mut Args<'_>,
) -> Result<String, String> {
    let handle = args.handle().map_err(|error| error.to_string())?;
    let path = args.string(memory).map_err(|error| error.to_string())?;
    let worktree = memory
        .state()
        .resources()
        .worktree(handle)
        .map_err(|error| error.to_string())?;
    worktree
        .read_text_file(&path)
        .map_err(|error| error.to_string())
}

fn make_file_executable_outcome(
    memory: &GuestMemory<'_>,
    args: &mut Args<'_>,
) -> Result<(), String> {
    let path = args.string(memory).map_err(|error| error.to_string())?;
    make_file_executable(Path::new(&path)).map_err(|error| error.to_string())
}

/// Decodes the flattened `option<(worktree-id, path)>` location slots.
fn decode_location(
    memory: &GuestMemory<'_>,
    args: &mut Args<'_>,
) -> Result<Option<SettingsLocation>, AbiError> {
    let disc = args.u32()?;
    let worktree_id = args.u64()?;
    let path_ptr = args.u32()?;
    let path_len = args.u32()?;
    match disc {
        discriminant::NONE => Ok(None),
        discriminant::SOME => Ok(Some(SettingsLocation {
            worktree_id,
            path: memory.read_str(path_ptr, path_len)?,
        })),
        value => Err(AbiError::InvalidDiscriminant {
            shape: "option",
            value,
        }),
    }
}

fn get_settings_outcome(memory: &GuestMemory<'_>, args: &mut Args<'_>) -> Result<String, String> {
    let location = decode_location(memory, args).map_err(|error| error.to_string())?;
    let category = args.string(memory).map_err(|error| error.to_string())?;
    let key = args.opt_string(memory).map_err(|error| error.to_string())?;
    memory
        .state()
        .settings()
        .lookup(location.as_ref(), &category, key.as_deref())
        .map_err(|error| error.to_string())
}

/// Builds the `$root` module with its full function table.
pub fn root_module() -> Result<HostModule, RegisterError> {
    let mut module = HostModule::new(ROOT_MODULE);

    module.function(
        resource_method_name("worktree", "id"),
        FnSignature::new().handle().returning(SlotKind::I64),
        |memory: &mut GuestMemory<'_>, args: &mut Args<'_>| {
            let handle = args.handle()?;
            let worktree = memory.state().resources().worktree(handle)?;
            Ok(Some(Val::I64(worktree.id() as i64)))
        },
    )?;

    module.function(
        resource_method_name("worktree", "root-path"),
        FnSignature::new().handle().ret_ptr(),
        |memory: &mut GuestMemory<'_>, args: &mut Args<'_>| {
            let ret = args.ret_ptr()?;
            let value = match worktree_or_log(memory, args, "worktree.root-path") {
                Some(worktree) => worktree.root_path().to_abi(memory)?,
                None => WasmStr::from_raw(0, 0),
            };
            memory.store_at(ret, &value)?;
            Ok(None)
        },
    )?;

    module.function(
        resource_method_name("worktree", "read-text-file"),
        FnSignature::new().handle().string().ret_ptr(),
        |memory: &mut GuestMemory<'_>, args: &mut Args<'_>| {
            let ret = args.ret_ptr()?;
            let outcome = read_text_file_outcome(memory, args);
            let value = outcome.to_abi(memory)?;
            memory.store_at(ret, &value)?;
            Ok(None)
        },
    )?;

    module.function(
        resource_method_name("worktree", "which"),
        FnSignature::new().handle().string().ret_ptr(),
        |memory: &mut GuestMemory<'_>, args: &mut Args<'_>| {
            let ret = args.ret_ptr()?;
            let found = match worktree_or_log(memory, args, "worktree.which") {
                Some(worktree) => match args.string(memory) {
                    Ok(command) => worktree.which(&command),
                    Err(error) => {
                        tracing::debug!(function = "worktree.which", error = %error, "returning an empty encoding");
                        None
                    }
                },
                None => None,
            };
            let value = found.to_abi(memory)?;
            memory.store_at(ret, &value)?;
            Ok(None)
        },
    )?;

    module.function(
        resource_method_name("worktree", "shell-env"),
        FnSignature::new().handle().ret_ptr(),
        |memory: &mut GuestMemory<'_>, args: &mut Args<'_>| {
            let ret = args.ret_ptr()?;
            let env = worktree_or_log(memory, args, "worktree.shell-env")
                .map(|worktree| worktree.shell_env())
                .unwrap_or_default();
            let value = env.to_abi(memory)?;
            memory.store_at(ret, &value)?;
            Ok(None)
        },
    )?;

    module.function(
        resource_method_name("project", "worktree-ids"),
        FnSignature::new().handle().ret_ptr(),
        |memory: &mut GuestMemory<'_>, args: &mut Args<'_>| {
            let ret = args.ret_ptr()?;
            let ids: Vec<u64> = project_or_log(memory, args, "project.worktree-ids")
                .map(|project| project.worktree_ids().to_vec())
                .unwrap_or_default();
            let value = ids.to_abi(memory)?;
            memory.store_at(ret, &value)?;
            Ok(None)
        },
    )?;

    module.function(
        "make-file-executable",
        FnSignature::new().string().ret_ptr(),
        |memory: &mut GuestMemory<'_>, args: &mut Args<'_>| {
            let ret = args.ret_ptr()?;
            let outcome = make_file_executable_outcome(memory, args);
            let value = outcome.to_abi(memory)?;
            memory.store_at(ret, &value)?;
            Ok(None)
        },
    )?;

    module.function(
        "get-settings",
        FnSignature::new()
            .option_slots(&[SlotKind::I64, SlotKind::I32, SlotKind::I32])
            .string()
            .option_string()
            .ret_ptr(),
        |memory: &mut GuestMemory<'_>, args: &mut Args<'_>| {
            let ret = args.ret_ptr()?;
            let outcome = get_settings_outcome(memory, args);
            let value = outcome.to_abi(memory)?;
            memory.store_at(ret, &value)?;
            Ok(None)
        },
    )?;

    module.resource_drop("worktree")?;
    module.resource_drop("project")?;

    Ok(module)
}
