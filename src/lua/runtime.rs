//! Script runtime and host event loop.
//!
//! [`ScriptRuntime`] owns the Lua state, loads the channel script and then
//! runs the event loop that serializes every host mutation: process output
//! lines, X events, admin requests and CLI commands all dispatch from here,
//! one at a time, on this thread.
//!
//! # Deferred tasks
//!
//! The loop fully drains the deferred-task queue before it receives the
//! next external event. Scripts enqueue tasks with `neopult.api.run_later`;
//! the window manager enqueues virtual-window callbacks the same way. Tasks
//! run in FIFO order, and a task may enqueue further tasks, which drain in
//! the same pass. This is the mechanism that lets scripts perform window
//! manager operations from within window callbacks without reentering the
//! manager.

use crate::{
    config::{Config, EnvConfig, GLOBAL_DATA_DIR},
    events::Event,
    process,
    registry::{Notification, Registry, ScopedLog},
    wm::WindowManager,
    ShutdownChannels,
};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use mlua::{Function, Lua, RegistryKey, Table, Value};
use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock, Weak},
};
use tokio::sync::{broadcast, mpsc};

use super::primitives;

/// How many events pass between Lua registry garbage sweeps.
const REGISTRY_GC_INTERVAL: u32 = 10;

/// A unit of work on the deferred-task queue.
#[derive(Debug)]
pub enum DeferredTask {
    /// Nullary Lua function enqueued by `neopult.api.run_later`. The key is
    /// dropped from the registry after the call.
    ScriptFunction(RegistryKey),
    /// Host-enqueued script callback (virtual window placement), with an
    /// optional pre-packed argument. The function key is shared with the
    /// owning window; the argument key is dropped after the call.
    HostCallback {
        func: Arc<RegistryKey>,
        arg: Option<RegistryKey>,
    },
}

/// Queue drained by the event loop before each external event.
pub type DeferredQueue = Arc<Mutex<VecDeque<DeferredTask>>>;

#[must_use]
pub fn new_deferred_queue() -> DeferredQueue {
    Arc::new(Mutex::new(VecDeque::new()))
}

/// Host state shared with the Lua primitives.
///
/// Lives behind an `Arc` captured by every injected function. Mutations
/// only happen from script callbacks and the event loop, which both run on
/// the loop thread; the locks exist for the few read-only cross-thread
/// accessors (snapshot fetches hop through the event channel instead).
pub struct RuntimeContext {
    pub env_config: Arc<EnvConfig>,
    /// Handle of the multi-thread runtime carrying all I/O tasks.
    pub io_handle: tokio::runtime::Handle,
    /// Current-thread runtime owned by the loop thread, used to block on
    /// channel receives and child stdin writes from script context.
    pub local_runtime: tokio::runtime::Runtime,
    pub registry: Registry,
    pub event_tx: Arc<mpsc::Sender<Event>>,
    pub notification_tx: broadcast::Sender<Notification>,
    /// `None` only in tests that exercise the scripting surface without an
    /// X display.
    pub window_manager: RwLock<Option<WindowManager>>,
    pub deferred: DeferredQueue,
    pub pid_dir: PathBuf,
    /// Fired after the cleanup callbacks ran; process watchers then kill
    /// their children.
    pub process_kill_tx: broadcast::Sender<()>,
    /// Upgraded and cloned into each process watcher. Weak so the loop can
    /// drop the last strong reference at shutdown and wait for watchers.
    pub process_exit_wait_tx: Weak<mpsc::Sender<()>>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl RuntimeContext {
    /// Run `f` against the window manager, or log and return `None` when
    /// no manager is available.
    pub fn with_wm<R>(&self, f: impl FnOnce(&mut WindowManager) -> R) -> Option<R> {
        let mut guard = self.window_manager.write().unwrap();
        match guard.as_mut() {
            Some(wm) => Some(f(wm)),
            None => {
                error!("window manager is not available");
                None
            }
        }
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("env_config", &self.env_config)
            .field("pid_dir", &self.pid_dir)
            .field(
                "deferred_len",
                &self.deferred.lock().map(|q| q.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

/// The Lua state plus everything the event loop needs.
pub struct ScriptRuntime {
    lua: Lua,
    ctx: Arc<RuntimeContext>,
    event_rx: mpsc::Receiver<Event>,
    shutdown_wait_tx: mpsc::Sender<()>,
    process_exit_wait_tx: Arc<mpsc::Sender<()>>,
    process_exit_wait_rx: mpsc::Receiver<()>,
}

impl ScriptRuntime {
    /// Create the Lua state, inject the `neopult` API and load the channel
    /// script.
    ///
    /// # Errors
    ///
    /// Fails when the Lua state cannot be set up or when the channel
    /// script raises during load — a channel without its script is useless,
    /// so script load errors are fatal.
    pub fn init(
        io_handle: tokio::runtime::Handle,
        env_config: EnvConfig,
        shutdown: ShutdownChannels,
        event_tx: mpsc::Sender<Event>,
        event_rx: mpsc::Receiver<Event>,
        notification_tx: broadcast::Sender<Notification>,
        window_manager: WindowManager,
    ) -> Result<Self> {
        let lua = Lua::new();

        setup_package_path(&lua, &env_config)?;

        let pid_dir = env_config.pid_dir();
        process::sweep_stale_pids(&pid_dir);

        let local_runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .context("couldn't build the loop-local runtime")?;

        let (process_exit_wait_tx, process_exit_wait_rx) = mpsc::channel::<()>(1);
        let process_exit_wait_tx = Arc::new(process_exit_wait_tx);
        let (process_kill_tx, _) = broadcast::channel(1);

        let ctx = Arc::new(RuntimeContext {
            env_config: Arc::new(env_config),
            io_handle,
            local_runtime,
            registry: Registry::new(),
            event_tx: Arc::new(event_tx),
            notification_tx,
            window_manager: RwLock::new(Some(window_manager)),
            deferred: new_deferred_queue(),
            pid_dir,
            process_kill_tx,
            process_exit_wait_tx: Arc::downgrade(&process_exit_wait_tx),
            shutdown_tx: shutdown.shutdown_tx,
        });

        primitives::inject(&lua, ctx.clone()).context("couldn't inject the neopult api")?;

        info!("loading channel script");
        lua.load(r#"require("init")"#)
            .set_name("init.lua")
            .exec()
            .context("error while loading the channel script")?;
        info!("channel script loaded");

        Ok(Self {
            lua,
            ctx,
            event_rx,
            shutdown_wait_tx: shutdown.shutdown_wait_tx,
            process_exit_wait_tx,
            process_exit_wait_rx,
        })
    }

    /// Read the configuration the channel script left in `neopult.config`.
    pub fn config(&self) -> Result<Config> {
        let websocket_password = primitives::config::read_websocket_password(&self.lua)?;
        Ok(Config::new(&self.ctx.env_config, websocket_password))
    }

    /// Run the event loop until shutdown is requested or the X connection
    /// dies.
    ///
    /// On exit, plugin cleanup callbacks run first (children still alive,
    /// so scripts can send final commands), then all surviving children are
    /// killed and reaped.
    ///
    /// # Errors
    ///
    /// Returns an error after shutdown when the loop ended because of a
    /// fatal X error; the process should exit non-zero.
    pub fn event_loop(self) -> Result<()> {
        let ScriptRuntime {
            lua,
            ctx,
            mut event_rx,
            shutdown_wait_tx,
            process_exit_wait_tx,
            mut process_exit_wait_rx,
        } = self;

        let mut shutdown_rx = ctx.shutdown_tx.subscribe();

        info!("starting event loop");
        let mut fatal: Option<anyhow::Error> = None;
        let mut gc_counter = 0u32;

        loop {
            drain_deferred(&lua, &ctx.deferred);

            let event_option = ctx.local_runtime.block_on(async {
                tokio::select!(
                    event_option = event_rx.recv() => event_option,
                    _ = shutdown_rx.recv() => None,
                )
            });

            match event_option {
                Some(Event::XFatal { message }) => {
                    error!("fatal x error, shutting down: {message}");
                    fatal = Some(anyhow::anyhow!("lost the x connection: {message}"));
                    break;
                }
                Some(event) => handle_event(&lua, &ctx, event),
                None => break,
            }

            gc_counter += 1;
            if gc_counter >= REGISTRY_GC_INTERVAL {
                gc_counter = 0;
                lua.expire_registry_values();
            }
        }

        info!("event loop finished, running cleanup callbacks");
        ctx.registry.run_cleanups(&lua);
        // Cleanup scripts may have enqueued final work.
        drain_deferred(&lua, &ctx.deferred);

        debug!("killing surviving child processes");
        let _ = ctx.process_kill_tx.send(());
        ctx.local_runtime.block_on(async {
            // Drop the last strong sender so the channel closes once every
            // process watcher has finished.
            drop(process_exit_wait_tx);
            let _ = process_exit_wait_rx.recv().await;
        });
        debug!("all child processes reaped");

        drop(shutdown_wait_tx);

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Prepend the channel home and the global data directory to the Lua
/// module search path, so `require("init")` and `require` of plugin
/// modules resolve without plugins knowing where they live.
fn setup_package_path(lua: &Lua, env_config: &EnvConfig) -> Result<()> {
    let package: Table = lua
        .globals()
        .get("package")
        .context("no package table in the lua state")?;
    let stock_path: String = package.get("path").context("package.path is not a string")?;

    let mut path = String::new();
    let channel_home = env_config.channel_home.display().to_string();
    for base in [channel_home.as_str(), GLOBAL_DATA_DIR] {
        path.push_str(&format!(
            "{base}/?.lua;{base}/plugins/?.lua;{base}/plugins/?/init.lua;"
        ));
    }
    path.push_str(&stock_path);

    package
        .set("path", path)
        .context("couldn't set package.path")?;
    Ok(())
}

/// Run every queued deferred task, including tasks enqueued while
/// draining, in FIFO order.
///
/// The queue lock is released between pops so tasks can enqueue further
/// tasks.
pub fn drain_deferred(lua: &Lua, deferred: &DeferredQueue) {
    while let Some(task) = {
        let mut queue = deferred.lock().unwrap();
        queue.pop_front()
    } {
        match task {
            DeferredTask::ScriptFunction(key) => {
                match lua.registry_value::<Function>(&key) {
                    Ok(func) => {
                        if let Err(e) = func.call::<()>(()) {
                            error!("error in run_later task: {e:?}");
                        }
                    }
                    Err(e) => error!("run_later task disappeared from registry: {e:?}"),
                }
                let _ = lua.remove_registry_value(key);
            }
            DeferredTask::HostCallback { func, arg } => {
                let result = match lua.registry_value::<Function>(&func) {
                    Ok(callback) => match &arg {
                        Some(arg_key) => match lua.registry_value::<Value>(arg_key) {
                            Ok(value) => callback.call::<()>(value),
                            Err(e) => Err(e),
                        },
                        None => callback.call::<()>(()),
                    },
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    error!("error in window callback: {e:?}");
                }
                if let Some(arg_key) = arg {
                    let _ = lua.remove_registry_value(arg_key);
                }
            }
        }
    }
}

/// Dispatch one external event. Script errors are logged with their scope
/// and consumed; nothing a plugin does terminates the loop.
fn handle_event(lua: &Lua, ctx: &Arc<RuntimeContext>, event: Event) {
    match event {
        Event::ProcessOutput {
            line,
            stream: _,
            process_name,
            pid: _,
            plugin_instance,
            callback_key,
        } => match lua.registry_value::<Function>(&callback_key) {
            Ok(callback) => {
                if let Err(e) = callback.call::<()>(line) {
                    plugin_instance.error(format!(
                        "error in output callback of process {process_name}: {e:?}"
                    ));
                }
            }
            Err(e) => plugin_instance.error(format!(
                "output callback of process {process_name} disappeared from registry: {e:?}"
            )),
        },
        Event::Window(window_event) => {
            ctx.with_wm(|wm| {
                if let Err(e) = wm.handle_window_event(lua, &ctx.deferred, window_event) {
                    error!("error handling window event {window_event:?}: {e:?}");
                }
            });
        }
        Event::XFatal { message } => {
            // Handled in the loop itself; reaching this point means the
            // loop was refactored without moving the check.
            error!("unhandled fatal x error: {message}");
        }
        Event::FetchSystemInfo { reply_tx } => {
            if reply_tx.send(ctx.registry.snapshot()).is_err() {
                warn!("system info requester went away before the reply");
            }
        }
        Event::CallAction { path } => {
            if let Err(e) = ctx.registry.call_action(lua, &path) {
                warn!("couldn't call action {path}: {e:?}");
            }
        }
        Event::CliCommand { line, reply_tx } => {
            let reply = handle_cli_command(lua, ctx, &line);
            let _ = reply_tx.send(reply);
        }
    }
}

/// Debug terminal commands: `actions`, `statuses`, `call <action path>`.
fn handle_cli_command(lua: &Lua, ctx: &Arc<RuntimeContext>, line: &str) -> String {
    if line == "actions" {
        ctx.registry.action_paths().join("\n")
    } else if line == "statuses" {
        ctx.registry.status_lines().join("\n")
    } else if let Some(path) = line.strip_prefix("call ") {
        match parse_action_path(path) {
            Some(path) => match ctx.registry.call_action(lua, &path) {
                Ok(()) => "action called".to_string(),
                Err(e) => format!("error calling action: {e:?}"),
            },
            None => format!("malformed action path: {path:?}"),
        }
    } else {
        format!("unknown command: {line}")
    }
}

fn parse_action_path(s: &str) -> Option<crate::registry::ActionPath> {
    let parts: Vec<&str> = s.split(crate::registry::SCOPE_SEPARATOR).collect();
    match parts.as_slice() {
        [instance, module, action] => Some(crate::registry::ActionPath {
            plugin_instance: (*instance).to_string(),
            module: (*module).to_string(),
            action: (*action).to_string(),
        }),
        _ => None,
    }
}
