//! Plugin instance and module handles.
//!
//! A `PluginInstanceHandle` is what `neopult.api.register_plugin_instance`
//! returns: the script's capability to register modules, spawn processes
//! and claim or create windows under that instance's name. A
//! `ModuleHandle` carries the operator-visible state of one module.

use crate::lua::primitives::process::ProcessHandle;
use crate::lua::primitives::window::WindowHandle;
use crate::lua::runtime::RuntimeContext;
use crate::process::{self, SpawnContext};
use crate::registry::{Module, ModulePath, Notification, PluginInstance, ScopedLog};
use crate::wm::{geometry::AnchoredGeometry, ClaimOptions, PrimaryDemotionAction, VirtualCallbacks};
use mlua::prelude::*;
use mlua::Value;
use std::{collections::HashMap, sync::Arc};

pub struct PluginInstanceHandle {
    pub(crate) plugin_instance: Arc<PluginInstance>,
    pub(crate) ctx: Arc<RuntimeContext>,
}

impl PluginInstanceHandle {
    fn register_module(
        &self,
        _lua: &Lua,
        name: String,
        opts: Value,
    ) -> LuaResult<Option<ModuleHandle>> {
        let mut display_name = None;
        if let Value::Table(opts) = opts {
            if let Ok(value) = opts.get::<String>("display_name") {
                display_name = Some(value);
            }
        }

        let module = self
            .ctx
            .registry
            .register_module(&self.plugin_instance, name, display_name);
        Ok(module.map(|module| ModuleHandle {
            module,
            ctx: self.ctx.clone(),
        }))
    }

    fn spawn_process(
        &self,
        lua: &Lua,
        cmd: String,
        opts: Value,
    ) -> LuaResult<Option<ProcessHandle>> {
        let mut args = Vec::new();
        let mut envs = HashMap::new();
        let mut on_output = None;

        if let Value::Table(opts) = opts {
            if let Ok(callback) = opts.get::<LuaFunction>("on_output") {
                on_output = Some(Arc::new(lua.create_registry_value(callback)?));
            }
            if let Ok(args_table) = opts.get::<LuaTable>("args") {
                args = args_table
                    .sequence_values::<String>()
                    .collect::<LuaResult<_>>()?;
            }
            if let Ok(envs_table) = opts.get::<LuaTable>("envs") {
                envs = envs_table.pairs::<String, String>().flatten().collect();
            }
        }

        // Process watchers must hold the exit-wait sender; when it cannot
        // be upgraded anymore, shutdown is already past the point of
        // spawning children.
        let Some(exit_wait_tx) = self.ctx.process_exit_wait_tx.upgrade() else {
            self.plugin_instance
                .warn(format!("not spawning {cmd} during shutdown"));
            return Ok(None);
        };

        let spawn_ctx = SpawnContext {
            event_tx: self.ctx.event_tx.clone(),
            plugin_instance: self.plugin_instance.clone(),
            on_output,
            pid_dir: self.ctx.pid_dir.clone(),
            kill_all_rx: self.ctx.process_kill_tx.subscribe(),
            exit_wait_tx: (*exit_wait_tx).clone(),
        };

        // Reader and watcher tasks land on the I/O runtime.
        let _guard = self.ctx.io_handle.enter();
        match process::spawn(cmd, args, envs, spawn_ctx) {
            Ok(child) => Ok(Some(ProcessHandle::new(child, self.ctx.clone()))),
            Err(e) => {
                self.plugin_instance.error(format!("{e:#}"));
                Ok(None)
            }
        }
    }

    fn claim_window(&self, lua: &Lua, class: String, opts: Value) -> LuaResult<Option<WindowHandle>> {
        let mut claim_opts = ClaimOptions::default();
        if let Value::Table(opts) = opts {
            if let Ok(timeout_ms) = opts.get::<u64>("timeout_ms") {
                claim_opts.timeout_ms = timeout_ms;
            }
            if let Ok(descriptor) = opts.get::<String>("min_geometry") {
                match descriptor.parse::<AnchoredGeometry>() {
                    Ok(parsed) => claim_opts.min_geometry = parsed,
                    Err(e) => self.plugin_instance.warn(format!(
                        "invalid min geometry {descriptor:?}, using the default: {e}"
                    )),
                }
            }
            if let Ok(ignore_managed) = opts.get::<bool>("ignore_managed") {
                claim_opts.ignore_managed = ignore_managed;
            }
        }

        self.plugin_instance
            .debug(format!("claiming window with class {class:?}"));

        let claimed = self.ctx.with_wm(|wm| {
            wm.claim_window(
                lua,
                &self.ctx.deferred,
                &self.plugin_instance.name,
                &class,
                claim_opts,
            )
        });
        match claimed {
            Some(Ok(Some(id))) => Ok(Some(WindowHandle::new(
                id,
                self.ctx.clone(),
                self.plugin_instance.clone(),
            ))),
            Some(Ok(None)) => {
                self.plugin_instance
                    .warn(format!("no window with class {class:?} appeared in time"));
                Ok(None)
            }
            Some(Err(e)) => {
                self.plugin_instance
                    .error(format!("claiming window with class {class:?} failed: {e:#}"));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn create_virtual_window(
        &self,
        lua: &Lua,
        name: String,
        opts: LuaTable,
    ) -> LuaResult<Option<WindowHandle>> {
        let callback_key = |key: &str| -> LuaResult<Option<Arc<LuaRegistryKey>>> {
            match opts.get::<LuaFunction>(key) {
                Ok(callback) => Ok(Some(Arc::new(lua.create_registry_value(callback)?))),
                Err(_) => {
                    self.plugin_instance.error(format!(
                        "virtual window {name} needs a {key} callback"
                    ));
                    Ok(None)
                }
            }
        };
        let (Some(set_geometry_key), Some(map_key), Some(unmap_key)) = (
            callback_key("set_geometry")?,
            callback_key("map")?,
            callback_key("unmap")?,
        ) else {
            return Ok(None);
        };

        let mut min_geometry = AnchoredGeometry::default();
        if let Ok(descriptor) = opts.get::<String>("min_geometry") {
            match descriptor.parse() {
                Ok(parsed) => min_geometry = parsed,
                Err(e) => self.plugin_instance.warn(format!(
                    "invalid min geometry {descriptor:?} for virtual window {name}, \
                    using the default: {e}"
                )),
            }
        }

        let mut demotion = PrimaryDemotionAction::default();
        if let Ok(action) = opts.get::<String>("primary_demotion_action") {
            match action.parse() {
                Ok(parsed) => demotion = parsed,
                Err(e) => self.plugin_instance.warn(format!(
                    "invalid primary demotion action for virtual window {name}, \
                    using the default: {e}"
                )),
            }
        }

        self.plugin_instance
            .debug(format!("creating virtual window {name}"));

        let callbacks = VirtualCallbacks {
            set_geometry_key,
            map_key,
            unmap_key,
        };
        let created = self.ctx.with_wm(|wm| {
            wm.create_virtual_window(
                lua,
                &self.ctx.deferred,
                &self.plugin_instance.name,
                name.clone(),
                callbacks,
                min_geometry,
                demotion,
            )
        });
        match created {
            Some(Ok(id)) => Ok(Some(WindowHandle::new(
                id,
                self.ctx.clone(),
                self.plugin_instance.clone(),
            ))),
            Some(Err(e)) => {
                self.plugin_instance
                    .error(format!("couldn't create virtual window {name}: {e:#}"));
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

impl LuaUserData for PluginInstanceHandle {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("debug", |_, this, msg: String| {
            this.plugin_instance.debug(msg);
            Ok(())
        });
        methods.add_method("info", |_, this, msg: String| {
            this.plugin_instance.info(msg);
            Ok(())
        });
        methods.add_method("warn", |_, this, msg: String| {
            this.plugin_instance.warn(msg);
            Ok(())
        });
        methods.add_method("error", |_, this, msg: String| {
            this.plugin_instance.error(msg);
            Ok(())
        });

        methods.add_method("register_module", |lua, this, (name, opts): (String, Value)| {
            this.register_module(lua, name, opts)
        });

        methods.add_method("spawn_process", |lua, this, (cmd, opts): (String, Value)| {
            this.spawn_process(lua, cmd, opts)
        });

        methods.add_method("claim_window", |lua, this, (class, opts): (String, Value)| {
            this.claim_window(lua, class, opts)
        });

        methods.add_method(
            "create_virtual_window",
            |lua, this, (name, opts): (String, LuaTable)| {
                this.create_virtual_window(lua, name, opts)
            },
        );
    }
}

pub struct ModuleHandle {
    pub(crate) module: Arc<Module>,
    pub(crate) ctx: Arc<RuntimeContext>,
}

impl ModuleHandle {
    fn module_path(&self) -> ModulePath {
        ModulePath {
            plugin_instance: self.module.plugin_instance_name.clone(),
            module: self.module.name.clone(),
        }
    }

    fn register_action(
        &self,
        lua: &Lua,
        name: String,
        callback: LuaFunction,
        opts: Value,
    ) -> LuaResult<Value> {
        let mut display_name = None;
        if let Value::Table(opts) = opts {
            if let Ok(value) = opts.get::<String>("display_name") {
                display_name = Some(value);
            }
        }

        let callback_key = lua.create_registry_value(callback)?;
        if self
            .ctx
            .registry
            .register_action(&self.module, name, display_name, callback_key)
        {
            Ok(Value::Boolean(true))
        } else {
            Ok(Value::Nil)
        }
    }

    fn set_status(&self, status: Option<String>) {
        self.module
            .debug(format!("setting module status to {status:?}"));
        *self.module.status.write().unwrap() = status.clone();
        let _ = self
            .ctx
            .notification_tx
            .send(Notification::ModuleStatusUpdate {
                module: self.module_path(),
                new_status: status,
            });
    }

    fn set_message(&self, message: Option<String>) {
        self.module
            .debug(format!("setting module message to {message:?}"));
        *self.module.message.write().unwrap() = message.clone();
        let _ = self
            .ctx
            .notification_tx
            .send(Notification::ModuleMessageUpdate {
                module: self.module_path(),
                new_message: message,
            });
    }

    fn set_active_actions(&self, actions: Vec<String>) {
        self.module
            .debug(format!("setting active actions to {actions:?}"));
        let filtered = self.ctx.registry.set_active_actions(&self.module, actions);
        let _ = self
            .ctx
            .notification_tx
            .send(Notification::ModuleActiveActionsUpdate {
                module: self.module_path(),
                new_active_actions: filtered,
            });
    }
}

impl LuaUserData for ModuleHandle {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("debug", |_, this, msg: String| {
            this.module.debug(msg);
            Ok(())
        });
        methods.add_method("info", |_, this, msg: String| {
            this.module.info(msg);
            Ok(())
        });
        methods.add_method("warn", |_, this, msg: String| {
            this.module.warn(msg);
            Ok(())
        });
        methods.add_method("error", |_, this, msg: String| {
            this.module.error(msg);
            Ok(())
        });

        methods.add_method(
            "register_action",
            |lua, this, (name, callback, opts): (String, LuaFunction, Value)| {
                this.register_action(lua, name, callback, opts)
            },
        );

        methods.add_method("set_status", |_, this, status: Option<String>| {
            this.set_status(status);
            Ok(())
        });

        methods.add_method("get_status", |_, this, ()| {
            Ok(this.module.status.read().unwrap().clone())
        });

        methods.add_method("set_message", |_, this, message: Option<String>| {
            this.set_message(message);
            Ok(())
        });

        methods.add_method("set_active_actions", |_, this, actions: Vec<String>| {
            this.set_active_actions(actions);
            Ok(())
        });
    }
}
