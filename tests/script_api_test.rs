//! Integration tests for the scripting surface.
//!
//! These build a real runtime context (without an X display — window
//! operations degrade to logged no-ops) and drive the injected `neopult`
//! API from actual Lua scripts, including real child processes for the
//! process primitives.

use mlua::{Function, Lua, Table};
use neopult::{
    config::EnvConfig,
    events::Event,
    lua::primitives,
    lua::runtime::{drain_deferred, new_deferred_queue, RuntimeContext},
    registry::{Notification, Registry},
};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

struct TestHost {
    lua: Lua,
    ctx: Arc<RuntimeContext>,
    event_rx: mpsc::Receiver<Event>,
    io_runtime: tokio::runtime::Runtime,
    // Keeps the channel home alive and the exit-wait channel open.
    _channel_home: TempDir,
    _exit_wait_tx: Arc<mpsc::Sender<()>>,
}

fn test_host() -> TestHost {
    let channel_home = TempDir::new().expect("tempdir");
    let io_runtime = tokio::runtime::Runtime::new().expect("io runtime");
    let local_runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("local runtime");

    let (event_tx, event_rx) = mpsc::channel(64);
    let (notification_tx, _) = broadcast::channel(64);
    let (process_kill_tx, _) = broadcast::channel(1);
    let (exit_wait_tx, _exit_wait_rx) = mpsc::channel::<()>(1);
    let exit_wait_tx = Arc::new(exit_wait_tx);
    let (shutdown_tx, _) = broadcast::channel(1);

    let ctx = Arc::new(RuntimeContext {
        env_config: Arc::new(EnvConfig {
            channel: 9,
            neopult_home: channel_home.path().to_path_buf(),
            channel_home: channel_home.path().join("channel-9"),
        }),
        io_handle: io_runtime.handle().clone(),
        local_runtime,
        registry: Registry::new(),
        event_tx: Arc::new(event_tx),
        notification_tx,
        window_manager: RwLock::new(None),
        deferred: new_deferred_queue(),
        pid_dir: channel_home.path().join("pids"),
        process_kill_tx,
        process_exit_wait_tx: Arc::downgrade(&exit_wait_tx),
        shutdown_tx,
    });
    std::fs::create_dir_all(&ctx.pid_dir).expect("pid dir");

    let lua = Lua::new();
    primitives::inject(&lua, ctx.clone()).expect("inject should succeed");

    TestHost {
        lua,
        ctx,
        event_rx,
        io_runtime,
        _channel_home: channel_home,
        _exit_wait_tx: exit_wait_tx,
    }
}

fn lua_strings(lua: &Lua, expr: &str) -> Vec<String> {
    lua.load(format!("return {expr}"))
        .eval::<Table>()
        .expect("table")
        .sequence_values()
        .collect::<mlua::Result<_>>()
        .expect("strings")
}

#[test]
fn test_duplicate_plugin_instance_yields_nil() {
    let host = test_host();
    host.lua
        .load(
            r#"
            first = neopult.api.register_plugin_instance("vnc-10")
            second = neopult.api.register_plugin_instance("vnc-10")
        "#,
        )
        .exec()
        .expect("script");

    let first_is_nil: bool = host.lua.load("return first == nil").eval().expect("eval");
    let second_is_nil: bool = host.lua.load("return second == nil").eval().expect("eval");
    assert!(!first_is_nil);
    assert!(second_is_nil);
    assert_eq!(host.ctx.registry.snapshot().plugin_instances.len(), 1);
}

#[test]
fn test_module_state_flows_into_snapshot_and_notifications() {
    let host = test_host();
    let mut notification_rx = host.ctx.notification_tx.subscribe();

    host.lua
        .load(
            r#"
            local plugin = neopult.api.register_plugin_instance("vnc-10")
            module = plugin:register_module("vnc-10", { display_name = "VNC 10" })
            module:register_action("stop", function()
                module:set_status("inactive")
                module:set_message(nil)
            end, { display_name = "Stop" })
            module:set_status("waiting")
            module:set_status("active")
            module:set_active_actions({ "stop" })
        "#,
        )
        .exec()
        .expect("script");

    // Exactly the mutations above, in mutation order.
    let expected_statuses = ["waiting", "active"];
    for expected in expected_statuses {
        match notification_rx.try_recv().expect("notification") {
            Notification::ModuleStatusUpdate { new_status, .. } => {
                assert_eq!(new_status.as_deref(), Some(expected));
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }
    match notification_rx.try_recv().expect("notification") {
        Notification::ModuleActiveActionsUpdate {
            new_active_actions, ..
        } => assert_eq!(new_active_actions, vec!["stop".to_string()]),
        other => panic!("unexpected notification: {other:?}"),
    }

    let info = host.ctx.registry.snapshot();
    let module = &info.plugin_instances[0].modules[0];
    assert_eq!(module.display_name.as_deref(), Some("VNC 10"));
    assert_eq!(module.status.as_deref(), Some("active"));
    assert_eq!(module.actions.len(), 1);
    assert_eq!(module.actions[0].display_name.as_deref(), Some("Stop"));

    // Calling the registered action mutates state and notifies, like an
    // operator request would.
    let path = neopult::registry::ActionPath {
        plugin_instance: "vnc-10".to_string(),
        module: "vnc-10".to_string(),
        action: "stop".to_string(),
    };
    host.ctx
        .registry
        .call_action(&host.lua, &path)
        .expect("action call");

    match notification_rx.try_recv().expect("notification") {
        Notification::ModuleStatusUpdate { new_status, .. } => {
            assert_eq!(new_status.as_deref(), Some("inactive"));
        }
        other => panic!("unexpected notification: {other:?}"),
    }
    match notification_rx.try_recv().expect("notification") {
        Notification::ModuleMessageUpdate { new_message, .. } => assert_eq!(new_message, None),
        other => panic!("unexpected notification: {other:?}"),
    }
}

#[test]
fn test_duplicate_action_yields_nil_and_leaves_first() {
    let host = test_host();
    host.lua
        .load(
            r#"
            local plugin = neopult.api.register_plugin_instance("pdf")
            local module = plugin:register_module("viewer")
            first = module:register_action("next", function() end)
            second = module:register_action("next", function() end)
        "#,
        )
        .exec()
        .expect("script");

    let first: bool = host.lua.load("return first == true").eval().expect("eval");
    let second_is_nil: bool = host.lua.load("return second == nil").eval().expect("eval");
    assert!(first);
    assert!(second_is_nil);
}

#[test]
fn test_set_active_actions_filters_unknown_names() {
    let host = test_host();
    host.lua
        .load(
            r#"
            local plugin = neopult.api.register_plugin_instance("cam")
            local module = plugin:register_module("main")
            module:register_action("start", function() end)
            module:set_active_actions({ "start", "warp" })
        "#,
        )
        .exec()
        .expect("script");

    let info = host.ctx.registry.snapshot();
    assert_eq!(
        info.plugin_instances[0].modules[0].active_actions,
        vec!["start".to_string()]
    );
}

#[test]
fn test_channel_info_and_tokens() {
    let host = test_host();
    let channel: u8 = host
        .lua
        .load("return neopult.api.get_channel()")
        .eval()
        .expect("channel");
    assert_eq!(channel, 9);

    let home: String = host
        .lua
        .load("return neopult.api.get_channel_home()")
        .eval()
        .expect("home");
    assert!(home.ends_with("channel-9"));

    let token: String = host
        .lua
        .load("return neopult.api.generate_token(24)")
        .eval()
        .expect("token");
    assert_eq!(token.len(), 24);

    let escaped: String = host
        .lua
        .load(r#"return neopult.api.escape_html("<b>&</b>")"#)
        .eval()
        .expect("escape");
    assert_eq!(escaped, "&lt;b&gt;&amp;&lt;/b&gt;");
}

#[test]
fn test_run_later_tasks_drain_in_fifo_order() {
    let host = test_host();
    host.lua
        .load(
            r#"
            order = {}
            neopult.api.run_later(function()
                table.insert(order, "first")
                neopult.api.run_later(function() table.insert(order, "nested") end)
            end)
            neopult.api.run_later(function() table.insert(order, "second") end)
        "#,
        )
        .exec()
        .expect("script");

    // Nothing runs until the loop drains the queue.
    assert!(lua_strings(&host.lua, "order").is_empty());

    drain_deferred(&host.lua, &host.ctx.deferred);
    assert_eq!(
        lua_strings(&host.lua, "order"),
        vec!["first", "second", "nested"]
    );
}

#[test]
fn test_store_roundtrip_through_api() {
    let host = test_host();
    host.lua
        .load(
            r#"
            seen = {}
            local store = neopult.api.create_store("camera-token")
            store:subscribe(function(v) table.insert(seen, v) end)
            store:set("rotated-token")
            current = store:get()
        "#,
        )
        .exec()
        .expect("script");

    let current: String = host.lua.load("return current").eval().expect("current");
    assert_eq!(current, "rotated-token");
    assert_eq!(lua_strings(&host.lua, "seen"), vec!["rotated-token"]);
}

#[test]
fn test_spawned_process_lines_reach_the_callback_in_order() {
    let mut host = test_host();
    host.lua
        .load(
            r#"
            lines = {}
            local plugin = neopult.api.register_plugin_instance("echoer")
            proc = plugin:spawn_process("sh", {
                args = { "-c", "printf 'alpha\nbeta\ngamma\n'" },
                on_output = function(line) table.insert(lines, line) end,
            })
            assert(proc ~= nil)
        "#,
        )
        .exec()
        .expect("script");

    // Drive the event loop by hand: receive each line event and dispatch
    // it to the registered callback, exactly like the runtime does.
    for _ in 0..3 {
        let event = host
            .io_runtime
            .block_on(async { timeout(Duration::from_secs(5), host.event_rx.recv()).await })
            .expect("line should arrive")
            .expect("channel open");
        match event {
            Event::ProcessOutput {
                line, callback_key, ..
            } => {
                let callback: Function = host
                    .lua
                    .registry_value(&callback_key)
                    .expect("callback in registry");
                callback.call::<()>(line).expect("callback call");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    assert_eq!(
        lua_strings(&host.lua, "lines"),
        vec!["alpha", "beta", "gamma"]
    );
}

#[test]
fn test_writeln_reaches_child_stdin() {
    let mut host = test_host();
    host.lua
        .load(
            r#"
            echoed = nil
            local plugin = neopult.api.register_plugin_instance("catter")
            proc = plugin:spawn_process("cat", {
                on_output = function(line) echoed = line end,
            })
            assert(proc ~= nil)
            proc:writeln("ping across the pipe")
        "#,
        )
        .exec()
        .expect("script");

    let event = host
        .io_runtime
        .block_on(async { timeout(Duration::from_secs(5), host.event_rx.recv()).await })
        .expect("echo should arrive")
        .expect("channel open");
    match event {
        Event::ProcessOutput {
            line, callback_key, ..
        } => {
            assert_eq!(line, "ping across the pipe");
            let callback: Function = host
                .lua
                .registry_value(&callback_key)
                .expect("callback in registry");
            callback.call::<()>(line).expect("callback call");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let echoed: String = host.lua.load("return echoed").eval().expect("echoed");
    assert_eq!(echoed, "ping across the pipe");

    host.lua.load("proc:kill()").exec().expect("kill");
}

#[test]
fn test_spawn_failure_yields_nil() {
    let host = test_host();
    host.lua
        .load(
            r#"
            local plugin = neopult.api.register_plugin_instance("broken")
            proc = plugin:spawn_process("/definitely/not/a/binary")
        "#,
        )
        .exec()
        .expect("script");

    let is_nil: bool = host.lua.load("return proc == nil").eval().expect("eval");
    assert!(is_nil);
}

#[test]
fn test_window_operations_without_display_yield_nil() {
    let host = test_host();
    host.lua
        .load(
            r#"
            local plugin = neopult.api.register_plugin_instance("vnc")
            claimed = plugin:claim_window("ssvncviewer", { timeout_ms = 0 })
            virtual_win = plugin:create_virtual_window("cam", {
                set_geometry = function() end,
                map = function() end,
                unmap = function() end,
            })
        "#,
        )
        .exec()
        .expect("script");

    let claimed_nil: bool = host.lua.load("return claimed == nil").eval().expect("eval");
    let virtual_nil: bool = host
        .lua
        .load("return virtual_win == nil")
        .eval()
        .expect("eval");
    assert!(claimed_nil);
    assert!(virtual_nil);
}

#[test]
fn test_cleanup_callbacks_run_at_shutdown() {
    let host = test_host();
    host.lua
        .load(
            r#"
            cleaned = {}
            neopult.api.register_plugin_instance("one", {
                on_cleanup = function() table.insert(cleaned, "one") end,
            })
            neopult.api.register_plugin_instance("two", {
                on_cleanup = function() table.insert(cleaned, "two") end,
            })
            neopult.api.register_plugin_instance("three")
        "#,
        )
        .exec()
        .expect("script");

    host.ctx.registry.run_cleanups(&host.lua);
    assert_eq!(lua_strings(&host.lua, "cleaned"), vec!["one", "two"]);
}
