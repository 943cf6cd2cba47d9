//! End-to-end tests driving the `$root` module through a real guest.
//!
//! The fixture imports every host function, re-exports a trampoline for
//! each, and owns its allocations through a bump `cabi_realloc`.

use std::sync::Arc;
use tempfile::TempDir;
use vela_ext_wasm::{
    root_module, ExtensionState, GuestMemory, Handle, Project, Resource, SettingsSnapshot, ToAbi,
    WasmList, WasmStr, Worktree,
};
use wasmtime::{AsContextMut, Engine, Instance, Linker, Module, Store};

const GUEST_WAT: &str = r#"
(module
  (import "$root" "[method]worktree.id"
    (func $worktree_id (param i32) (result i64)))
  (import "$root" "[method]worktree.root-path"
    (func $worktree_root_path (param i32 i32)))
  (import "$root" "[method]worktree.read-text-file"
    (func $read_text_file (param i32 i32 i32 i32)))
  (import "$root" "[method]worktree.which"
    (func $which (param i32 i32 i32 i32)))
  (import "$root" "[method]worktree.shell-env"
    (func $shell_env (param i32 i32)))
  (import "$root" "[method]project.worktree-ids"
    (func $worktree_ids (param i32 i32)))
  (import "$root" "[resource-drop]worktree"
    (func $drop_worktree (param i32)))
  (import "$root" "[resource-drop]project"
    (func $drop_project (param i32)))
  (import "$root" "make-file-executable"
    (func $make_file_executable (param i32 i32 i32)))
  (import "$root" "get-settings"
    (func $get_settings (param i32 i64 i32 i32 i32 i32 i32 i32 i32 i32)))

  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))

  (func (export "cabi_realloc") (param i32 i32 i32 i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get 3)))
    (local.get $ptr))

  (func (export "worktree-id") (param i32) (result i64)
    (call $worktree_id (local.get 0)))
  (func (export "worktree-root-path") (param i32 i32)
    (call $worktree_root_path (local.get 0) (local.get 1)))
  (func (export "worktree-read-text-file") (param i32 i32 i32 i32)
    (call $read_text_file (local.get 0) (local.get 1) (local.get 2) (local.get 3)))
  (func (export "worktree-which") (param i32 i32 i32 i32)
    (call $which (local.get 0) (local.get 1) (local.get 2) (local.get 3)))
  (func (export "worktree-shell-env") (param i32 i32)
    (call $shell_env (local.get 0) (local.get 1)))
  (func (export "project-worktree-ids") (param i32 i32)
    (call $worktree_ids (local.get 0) (local.get 1)))
  (func (export "drop-worktree") (param i32)
    (call $drop_worktree (local.get 0)))
  (func (export "drop-project") (param i32)
    (call $drop_project (local.get 0)))
  (func (export "make-file-executable") (param i32 i32 i32)
    (call $make_file_executable (local.get 0) (local.get 1) (local.get 2)))
  (func (export "get-settings") (param i32 i64 i32 i32 i32 i32 i32 i32 i32 i32)
    (call $get_settings
      (local.get 0) (local.get 1) (local.get 2) (local.get 3) (local.get 4)
      (local.get 5) (local.get 6) (local.get 7) (local.get 8) (local.get 9)))
)
"#;

// Low scratch offset for return pointers, clear of the bump heap.
const RET: u32 = 256;

fn instantiate(state: ExtensionState) -> (Store<ExtensionState>, Instance) {
    let engine = Engine::default();
    let module = Module::new(&engine, wat::parse_str(GUEST_WAT).unwrap()).unwrap();
    let mut linker = Linker::new(&engine);
    root_module().unwrap().define(&mut linker).unwrap();
    let mut store = Store::new(&engine, state);
    let instance = linker.instantiate(&mut store, &module).unwrap();
    (store, instance)
}

fn register_worktree(state: &ExtensionState, worktree: Worktree) -> Handle {
    state.resources().register(Resource::Worktree(Arc::new(worktree)))
}

/// Lowers a host string into guest memory ahead of a call.
fn lower_string(store: &mut Store<ExtensionState>, instance: &Instance, text: &str) -> (i32, i32) {
    let mut memory = GuestMemory::from_instance(store.as_context_mut(), instance).unwrap();
    let value = text.to_abi(&mut memory).unwrap();
    (value.ptr() as i32, value.len() as i32)
}

/// Lowers raw bytes into guest memory, for arguments that are not valid
/// UTF-8.
fn lower_bytes(store: &mut Store<ExtensionState>, instance: &Instance, bytes: &[u8]) -> (i32, i32) {
    let mut memory = GuestMemory::from_instance(store.as_context_mut(), instance).unwrap();
    let ptr = memory.allocate(bytes.len() as u32).unwrap();
    memory.write_bytes(ptr, bytes).unwrap();
    (ptr as i32, bytes.len() as i32)
}

/// Overwrites the return region with bytes no encoding starts with, so
/// a result the host skipped fails to decode.
fn dirty_return_region(store: &mut Store<ExtensionState>, instance: &Instance) {
    let mut memory = GuestMemory::from_instance(store.as_context_mut(), instance).unwrap();
    memory.write_bytes(RET, &[0xaa; 12]).unwrap();
}

fn read_result_string(
    store: &mut Store<ExtensionState>,
    instance: &Instance,
    ret: u32,
) -> Result<String, String> {
    let memory = GuestMemory::from_instance(store.as_context_mut(), instance).unwrap();
    let value: Result<WasmStr, WasmStr> = memory.load_at(ret).unwrap();
    match value {
        Ok(text) => Ok(text.read(&memory).unwrap()),
        Err(text) => Err(text.read(&memory).unwrap()),
    }
}

#[test]
fn worktree_methods_answer_through_the_abi() {
    let dir = TempDir::new().unwrap();
    let state = ExtensionState::new();
    let handle = register_worktree(&state, Worktree::new(42, dir.path()));
    let (mut store, instance) = instantiate(state);

    let id = instance
        .get_typed_func::<i32, i64>(&mut store, "worktree-id")
        .unwrap();
    assert_eq!(id.call(&mut store, handle.0 as i32).unwrap(), 42);

    let root_path = instance
        .get_typed_func::<(i32, i32), ()>(&mut store, "worktree-root-path")
        .unwrap();
    root_path
        .call(&mut store, (handle.0 as i32, RET as i32))
        .unwrap();

    let memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();
    let value: WasmStr = memory.load_at(RET).unwrap();
    assert_eq!(
        value.read(&memory).unwrap(),
        dir.path().to_string_lossy().into_owned()
    );
}

#[test]
fn read_text_file_round_trips_ok_and_err() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "guest visible\n").unwrap();

    let state = ExtensionState::new();
    let handle = register_worktree(&state, Worktree::new(1, dir.path()));
    let (mut store, instance) = instantiate(state);

    let read = instance
        .get_typed_func::<(i32, i32, i32, i32), ()>(&mut store, "worktree-read-text-file")
        .unwrap();

    let (ptr, len) = lower_string(&mut store, &instance, "notes.txt");
    read.call(&mut store, (handle.0 as i32, ptr, len, RET as i32))
        .unwrap();
    assert_eq!(
        read_result_string(&mut store, &instance, RET),
        Ok("guest visible\n".to_string())
    );

    let (ptr, len) = lower_string(&mut store, &instance, "missing.txt");
    read.call(&mut store, (handle.0 as i32, ptr, len, RET as i32))
        .unwrap();
    let error = read_result_string(&mut store, &instance, RET).unwrap_err();
    assert!(error.contains("missing.txt"));

    let (ptr, len) = lower_string(&mut store, &instance, "../escape");
    read.call(&mut store, (handle.0 as i32, ptr, len, RET as i32))
        .unwrap();
    let error = read_result_string(&mut store, &instance, RET).unwrap_err();
    assert!(error.contains("escapes"));
}

#[test]
fn malformed_string_arguments_surface_on_the_error_arm() {
    let dir = TempDir::new().unwrap();
    let state = ExtensionState::new();
    let handle = register_worktree(&state, Worktree::new(1, dir.path()));
    let (mut store, instance) = instantiate(state);

    let read = instance
        .get_typed_func::<(i32, i32, i32, i32), ()>(&mut store, "worktree-read-text-file")
        .unwrap();
    dirty_return_region(&mut store, &instance);
    let (ptr, len) = lower_bytes(&mut store, &instance, &[0xff, 0xfe]);
    read.call(&mut store, (handle.0 as i32, ptr, len, RET as i32))
        .unwrap();
    let error = read_result_string(&mut store, &instance, RET).unwrap_err();
    assert!(error.contains("not valid utf-8"));

    // Without an error channel the same failure decodes as `none`.
    let which = instance
        .get_typed_func::<(i32, i32, i32, i32), ()>(&mut store, "worktree-which")
        .unwrap();
    dirty_return_region(&mut store, &instance);
    let (ptr, len) = lower_bytes(&mut store, &instance, &[0xff, 0xfe]);
    which
        .call(&mut store, (handle.0 as i32, ptr, len, RET as i32))
        .unwrap();
    let memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();
    let value: Option<WasmStr> = memory.load_at(RET).unwrap();
    assert_eq!(value, None);
}

#[test]
fn stale_handles_degrade_without_trapping() {
    let (mut store, instance) = instantiate(ExtensionState::new());

    // A scalar-result method zero-fills.
    let id = instance
        .get_typed_func::<i32, i64>(&mut store, "worktree-id")
        .unwrap();
    assert_eq!(id.call(&mut store, 0x7777).unwrap(), 0);

    // A plain return-pointer method writes the empty encoding.
    let root_path = instance
        .get_typed_func::<(i32, i32), ()>(&mut store, "worktree-root-path")
        .unwrap();
    root_path.call(&mut store, (0x7777, RET as i32)).unwrap();
    {
        let memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();
        let value: WasmStr = memory.load_at(RET).unwrap();
        assert!(value.is_empty());
    }

    // A method with an error channel reports the failure there.
    let read = instance
        .get_typed_func::<(i32, i32, i32, i32), ()>(&mut store, "worktree-read-text-file")
        .unwrap();
    let (ptr, len) = lower_string(&mut store, &instance, "notes.txt");
    read.call(&mut store, (0x7777, ptr, len, RET as i32))
        .unwrap();
    let error = read_result_string(&mut store, &instance, RET).unwrap_err();
    assert!(error.contains("unknown resource handle"));
}

#[cfg(unix)]
#[test]
fn which_reports_an_optional_path() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let bin = dir.path().join("bin");
    std::fs::create_dir(&bin).unwrap();
    let tool = bin.join("ripgrep");
    std::fs::write(&tool, "#!/bin/sh\n").unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

    let state = ExtensionState::new();
    let handle = register_worktree(&state, Worktree::new(3, dir.path()).with_search_path(vec![bin]));
    let (mut store, instance) = instantiate(state);

    let which = instance
        .get_typed_func::<(i32, i32, i32, i32), ()>(&mut store, "worktree-which")
        .unwrap();

    let (ptr, len) = lower_string(&mut store, &instance, "ripgrep");
    which
        .call(&mut store, (handle.0 as i32, ptr, len, RET as i32))
        .unwrap();
    {
        let memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();
        let value: Option<WasmStr> = memory.load_at(RET).unwrap();
        let found = value.unwrap().read(&memory).unwrap();
        assert!(found.ends_with("ripgrep"));
    }

    let (ptr, len) = lower_string(&mut store, &instance, "absent-tool");
    which
        .call(&mut store, (handle.0 as i32, ptr, len, RET as i32))
        .unwrap();
    let memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();
    let value: Option<WasmStr> = memory.load_at(RET).unwrap();
    assert_eq!(value, None);
}

#[test]
fn shell_env_lowers_as_a_list_of_pairs() {
    let dir = TempDir::new().unwrap();
    let worktree = Worktree::new(5, dir.path()).with_env([
        ("EDITOR".to_string(), "vela".to_string()),
        ("LANG".to_string(), "en_US.UTF-8".to_string()),
    ]);
    let state = ExtensionState::new();
    let handle = register_worktree(&state, worktree);
    let (mut store, instance) = instantiate(state);

    let shell_env = instance
        .get_typed_func::<(i32, i32), ()>(&mut store, "worktree-shell-env")
        .unwrap();
    shell_env
        .call(&mut store, (handle.0 as i32, RET as i32))
        .unwrap();

    let memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();
    let list: WasmList<(WasmStr, WasmStr)> = memory.load_at(RET).unwrap();
    let mut env = Vec::new();
    for (name, value) in list.read(&memory).unwrap() {
        env.push((name.read(&memory).unwrap(), value.read(&memory).unwrap()));
    }
    assert_eq!(
        env,
        vec![
            ("EDITOR".to_string(), "vela".to_string()),
            ("LANG".to_string(), "en_US.UTF-8".to_string()),
        ]
    );
}

#[test]
fn resource_drop_is_idempotent_across_the_boundary() {
    let dir = TempDir::new().unwrap();
    let state = ExtensionState::new();
    let keep = register_worktree(&state, Worktree::new(1, dir.path()));
    let gone = register_worktree(&state, Worktree::new(2, dir.path()));
    let (mut store, instance) = instantiate(state);

    let drop_worktree = instance
        .get_typed_func::<i32, ()>(&mut store, "drop-worktree")
        .unwrap();
    drop_worktree.call(&mut store, gone.0 as i32).unwrap();
    drop_worktree.call(&mut store, gone.0 as i32).unwrap();
    drop_worktree.call(&mut store, 0x123).unwrap();

    assert_eq!(store.data().resources().len(), 1);

    let id = instance
        .get_typed_func::<i32, i64>(&mut store, "worktree-id")
        .unwrap();
    assert_eq!(id.call(&mut store, keep.0 as i32).unwrap(), 1);
    assert_eq!(id.call(&mut store, gone.0 as i32).unwrap(), 0);
}

#[test]
fn project_worktree_ids_lower_as_a_u64_list() {
    let state = ExtensionState::new();
    let handle = state
        .resources()
        .register(Resource::Project(Arc::new(Project::new(vec![11, 22, 33]))));
    let (mut store, instance) = instantiate(state);

    let ids = instance
        .get_typed_func::<(i32, i32), ()>(&mut store, "project-worktree-ids")
        .unwrap();
    ids.call(&mut store, (handle.0 as i32, RET as i32)).unwrap();
    {
        let memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();
        let list: WasmList<u64> = memory.load_at(RET).unwrap();
        assert_eq!(list.read(&memory).unwrap(), vec![11, 22, 33]);
    }

    // A worktree method refuses the project handle.
    let id = instance
        .get_typed_func::<i32, i64>(&mut store, "worktree-id")
        .unwrap();
    assert_eq!(id.call(&mut store, handle.0 as i32).unwrap(), 0);

    let drop_project = instance
        .get_typed_func::<i32, ()>(&mut store, "drop-project")
        .unwrap();
    drop_project.call(&mut store, handle.0 as i32).unwrap();
    assert!(store.data().resources().is_empty());
}

#[cfg(unix)]
#[test]
fn make_file_executable_round_trips_ok_and_err() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("server");
    std::fs::write(&target, "binary").unwrap();
    std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o644)).unwrap();

    let (mut store, instance) = instantiate(ExtensionState::new());
    let make_exec = instance
        .get_typed_func::<(i32, i32, i32), ()>(&mut store, "make-file-executable")
        .unwrap();

    let (ptr, len) = lower_string(&mut store, &instance, target.to_str().unwrap());
    make_exec.call(&mut store, (ptr, len, RET as i32)).unwrap();
    {
        let memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();
        let value: Result<(), WasmStr> = memory.load_at(RET).unwrap();
        assert!(value.is_ok());
    }
    let mode = target.metadata().unwrap().permissions().mode();
    assert_ne!(mode & 0o111, 0);

    let absent = dir.path().join("absent");
    let (ptr, len) = lower_string(&mut store, &instance, absent.to_str().unwrap());
    make_exec.call(&mut store, (ptr, len, RET as i32)).unwrap();
    let memory = GuestMemory::from_instance(store.as_context_mut(), &instance).unwrap();
    let value: Result<(), WasmStr> = memory.load_at(RET).unwrap();
    let message = value.unwrap_err().read(&memory).unwrap();
    assert!(message.contains("permissions"));
}

#[test]
fn get_settings_serializes_the_requested_scope() {
    let mut settings = SettingsSnapshot::new();
    settings.insert("editor", "tab_size", serde_json::json!(4));
    settings.insert_override(9, "editor", "tab_size", serde_json::json!(8));

    let (mut store, instance) = instantiate(ExtensionState::with_settings(settings));
    let get = instance
        .get_typed_func::<(i32, i64, i32, i32, i32, i32, i32, i32, i32, i32), ()>(
            &mut store,
            "get-settings",
        )
        .unwrap();

    // No location, keyed lookup.
    let (cat_ptr, cat_len) = lower_string(&mut store, &instance, "editor");
    let (key_ptr, key_len) = lower_string(&mut store, &instance, "tab_size");
    get.call(
        &mut store,
        (0, 0, 0, 0, cat_ptr, cat_len, 1, key_ptr, key_len, RET as i32),
    )
    .unwrap();
    assert_eq!(
        read_result_string(&mut store, &instance, RET),
        Ok("4".to_string())
    );

    // A location pins the worktree whose override applies.
    let (path_ptr, path_len) = lower_string(&mut store, &instance, "src/lib.rs");
    let (cat_ptr, cat_len) = lower_string(&mut store, &instance, "editor");
    let (key_ptr, key_len) = lower_string(&mut store, &instance, "tab_size");
    get.call(
        &mut store,
        (
            1,
            9,
            path_ptr,
            path_len,
            cat_ptr,
            cat_len,
            1,
            key_ptr,
            key_len,
            RET as i32,
        ),
    )
    .unwrap();
    assert_eq!(
        read_result_string(&mut store, &instance, RET),
        Ok("8".to_string())
    );

    // Unknown categories come back on the err arm.
    let (cat_ptr, cat_len) = lower_string(&mut store, &instance, "terminal");
    get.call(
        &mut store,
        (0, 0, 0, 0, cat_ptr, cat_len, 0, 0, 0, RET as i32),
    )
    .unwrap();
    let error = read_result_string(&mut store, &instance, RET).unwrap_err();
    assert!(error.contains("terminal"));
}

#[test]
fn unknown_location_discriminants_surface_on_the_error_arm() {
    let mut settings = SettingsSnapshot::new();
    settings.insert("editor", "tab_size", serde_json::json!(4));
    let (mut store, instance) = instantiate(ExtensionState::with_settings(settings));

    let get = instance
        .get_typed_func::<(i32, i64, i32, i32, i32, i32, i32, i32, i32, i32), ()>(
            &mut store,
            "get-settings",
        )
        .unwrap();
    dirty_return_region(&mut store, &instance);
    let (cat_ptr, cat_len) = lower_string(&mut store, &instance, "editor");
    get.call(
        &mut store,
        (7, 0, 0, 0, cat_ptr, cat_len, 0, 0, 0, RET as i32),
    )
    .unwrap();

    let error = read_result_string(&mut store, &instance, RET).unwrap_err();
    assert!(error.contains("discriminant must be 0 or 1"));
}

#[test]
fn teardown_releases_handles_before_reload() {
    let dir = TempDir::new().unwrap();
    let state = ExtensionState::new();
    let handle = register_worktree(&state, Worktree::new(6, dir.path()));
    register_worktree(&state, Worktree::new(7, dir.path()));
    let (mut store, instance) = instantiate(state);

    assert_eq!(store.data().resources().len(), 2);
    store.data_mut().teardown();
    assert!(store.data().resources().is_empty());

    // Calls after teardown see only dead handles.
    let id = instance
        .get_typed_func::<i32, i64>(&mut store, "worktree-id")
        .unwrap();
    assert_eq!(id.call(&mut store, handle.0 as i32).unwrap(), 0);
}
