//! In-memory model of operator-visible state.
//!
//! Plugin instances own modules, modules own actions. Everything here is
//! created from script callbacks on the event-loop thread; the WebSocket
//! server only ever sees immutable snapshots ([`SystemInfo`]) and change
//! notifications ([`Notification`]).
//!
//! Name uniqueness is enforced per scope: plugin instances among each other,
//! modules within their instance, actions within their module. A colliding
//! registration is rejected with no partial state; the script observes nil.

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use mlua::{Function, Lua, RegistryKey};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    sync::{Arc, RwLock},
};

/// Separator used in fully qualified module and action names.
pub const SCOPE_SEPARATOR: &str = "::";

/// Logging with a `[instance]` or `[instance::module]` prefix.
///
/// Everything that acts on behalf of a plugin logs through this trait so the
/// channel log reads uniformly no matter which subsystem emitted a message.
pub trait ScopedLog {
    fn log_scope(&self) -> String;

    fn debug(&self, msg: impl AsRef<str>) {
        debug!("[{}] {}", self.log_scope(), msg.as_ref());
    }

    fn info(&self, msg: impl AsRef<str>) {
        info!("[{}] {}", self.log_scope(), msg.as_ref());
    }

    fn warn(&self, msg: impl AsRef<str>) {
        warn!("[{}] {}", self.log_scope(), msg.as_ref());
    }

    fn error(&self, msg: impl AsRef<str>) {
        error!("[{}] {}", self.log_scope(), msg.as_ref());
    }
}

/// A named container of modules, child processes and windows.
///
/// Created by `neopult.api.register_plugin_instance` and destroyed only at
/// process shutdown, when its `on_cleanup` callback runs (before child
/// processes are torn down).
#[derive(Debug)]
pub struct PluginInstance {
    pub name: String,
    pub(crate) modules: RwLock<Vec<Arc<Module>>>,
    pub(crate) on_cleanup: Option<RegistryKey>,
}

impl PluginInstance {
    fn new(name: String, on_cleanup: Option<RegistryKey>) -> Self {
        Self {
            name,
            modules: RwLock::new(Vec::new()),
            on_cleanup,
        }
    }

    /// Run the cleanup callback, if one was registered.
    ///
    /// Script errors are logged and consumed; cleanup of the remaining
    /// instances must not be skipped because one of them misbehaved.
    pub fn run_cleanup(&self, lua: &Lua) {
        let Some(key) = &self.on_cleanup else {
            return;
        };
        match lua.registry_value::<Function>(key) {
            Ok(callback) => {
                if let Err(e) = callback.call::<()>(()) {
                    self.error(format!("error in cleanup callback: {e:?}"));
                }
            }
            Err(e) => self.error(format!("cleanup callback disappeared from registry: {e:?}")),
        }
    }
}

impl ScopedLog for PluginInstance {
    fn log_scope(&self) -> String {
        self.name.clone()
    }
}

pub type ModuleStatus = String;
pub type ModuleMessage = String;

/// A named unit of operator-visible state within a plugin instance.
///
/// The message field is rendered as HTML by the admin UI and passed through
/// verbatim by the core; escaping is the plugin author's contract (see
/// `neopult.api.escape_html`).
#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub display_name: Option<String>,
    pub plugin_instance_name: String,
    pub(crate) actions: RwLock<Vec<Action>>,
    pub(crate) active_actions: RwLock<Vec<String>>,
    pub(crate) status: RwLock<Option<ModuleStatus>>,
    pub(crate) message: RwLock<Option<ModuleMessage>>,
}

impl Module {
    fn new(name: String, plugin_instance_name: String, display_name: Option<String>) -> Self {
        Self {
            name,
            display_name,
            plugin_instance_name,
            actions: RwLock::new(Vec::new()),
            active_actions: RwLock::new(Vec::new()),
            status: RwLock::new(None),
            message: RwLock::new(None),
        }
    }
}

impl ScopedLog for Module {
    fn log_scope(&self) -> String {
        format!(
            "{}{}{}",
            self.plugin_instance_name, SCOPE_SEPARATOR, self.name
        )
    }
}

/// An operator-invokable callback. Immutable after registration.
#[derive(Debug)]
pub struct Action {
    pub name: String,
    pub display_name: Option<String>,
    pub(crate) callback_key: RegistryKey,
}

/// Fully qualified module reference as used on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulePath {
    pub plugin_instance: String,
    pub module: String,
}

impl Display for ModulePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.plugin_instance, SCOPE_SEPARATOR, self.module)
    }
}

/// Fully qualified action reference as used on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPath {
    pub plugin_instance: String,
    pub module: String,
    pub action: String,
}

impl Display for ActionPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}{}",
            self.plugin_instance, SCOPE_SEPARATOR, self.module, SCOPE_SEPARATOR, self.action
        )
    }
}

/// Registry change pushed to every connected admin client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notification {
    ModuleStatusUpdate {
        #[serde(flatten)]
        module: ModulePath,
        new_status: Option<ModuleStatus>,
    },
    ModuleMessageUpdate {
        #[serde(flatten)]
        module: ModulePath,
        new_message: Option<ModuleMessage>,
    },
    ModuleActiveActionsUpdate {
        #[serde(flatten)]
        module: ModulePath,
        new_active_actions: Vec<String>,
    },
}

/// Snapshot of the full registry, sent to a client right after auth.
#[derive(Debug, Serialize, Deserialize)]
pub struct SystemInfo {
    pub plugin_instances: Vec<PluginInstanceInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PluginInstanceInfo {
    pub name: String,
    pub modules: Vec<ModuleInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub display_name: Option<String>,
    pub actions: Vec<ActionInfo>,
    pub active_actions: Vec<String>,
    pub status: Option<ModuleStatus>,
    pub message: Option<ModuleMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionInfo {
    pub name: String,
    pub display_name: Option<String>,
}

/// All plugin instances of this process, in registration order.
#[derive(Debug, Default)]
pub struct Registry {
    instances: RwLock<Vec<Arc<PluginInstance>>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin instance. Returns `None` on a name collision.
    pub fn register_instance(
        &self,
        name: String,
        on_cleanup: Option<RegistryKey>,
    ) -> Option<Arc<PluginInstance>> {
        let mut instances = self.instances.write().unwrap();
        if instances.iter().any(|p| p.name == name) {
            error!("rejecting plugin instance with duplicate name {}", name);
            return None;
        }
        debug!("registering plugin instance {}", name);
        let instance = Arc::new(PluginInstance::new(name, on_cleanup));
        instances.push(instance.clone());
        Some(instance)
    }

    /// Register a module within `instance`. Returns `None` on a collision.
    pub fn register_module(
        &self,
        instance: &Arc<PluginInstance>,
        name: String,
        display_name: Option<String>,
    ) -> Option<Arc<Module>> {
        let mut modules = instance.modules.write().unwrap();
        if modules.iter().any(|m| m.name == name) {
            instance.error(format!("rejecting module with duplicate name {name}"));
            return None;
        }
        instance.debug(format!("registering module {name}"));
        let module = Arc::new(Module::new(name, instance.name.clone(), display_name));
        modules.push(module.clone());
        Some(module)
    }

    /// Register an action on `module`. Returns `false` on a collision.
    pub fn register_action(
        &self,
        module: &Arc<Module>,
        name: String,
        display_name: Option<String>,
        callback_key: RegistryKey,
    ) -> bool {
        let mut actions = module.actions.write().unwrap();
        if actions.iter().any(|a| a.name == name) {
            module.error(format!("rejecting action with duplicate name {name}"));
            return false;
        }
        module.debug(format!("registering action {name}"));
        actions.push(Action {
            name,
            display_name,
            callback_key,
        });
        true
    }

    /// Replace a module's active actions, dropping names that do not refer
    /// to a registered action so the active set stays a subset of the
    /// action set.
    pub fn set_active_actions(&self, module: &Arc<Module>, requested: Vec<String>) -> Vec<String> {
        let actions = module.actions.read().unwrap();
        let filtered: Vec<String> = requested
            .into_iter()
            .filter(|name| {
                let known = actions.iter().any(|a| &a.name == name);
                if !known {
                    module.warn(format!("ignoring unknown action {name} in active actions"));
                }
                known
            })
            .collect();
        drop(actions);
        *module.active_actions.write().unwrap() = filtered.clone();
        filtered
    }

    /// Resolve and invoke an action callback.
    ///
    /// # Errors
    ///
    /// Fails when any path segment does not resolve or when the script
    /// callback itself raises.
    pub fn call_action(&self, lua: &Lua, path: &ActionPath) -> Result<()> {
        let instances = self.instances.read().unwrap();
        let instance = match instances.iter().find(|p| p.name == path.plugin_instance) {
            Some(p) => p,
            None => bail!("no plugin instance named {}", path.plugin_instance),
        };

        let modules = instance.modules.read().unwrap();
        let module = match modules.iter().find(|m| m.name == path.module) {
            Some(m) => m,
            None => bail!("no module named {} in {}", path.module, path.plugin_instance),
        };

        let actions = module.actions.read().unwrap();
        let action = match actions.iter().find(|a| a.name == path.action) {
            Some(a) => a,
            None => bail!("no action named {} in {}", path.action, module.log_scope()),
        };

        let callback: Function = lua
            .registry_value(&action.callback_key)
            .context("action callback disappeared from registry")?;
        callback.call::<()>(()).context("action callback failed")?;
        Ok(())
    }

    /// Build the full state snapshot in registration order.
    #[must_use]
    pub fn snapshot(&self) -> SystemInfo {
        let plugin_instances = self
            .instances
            .read()
            .unwrap()
            .iter()
            .map(|instance| PluginInstanceInfo {
                name: instance.name.clone(),
                modules: instance
                    .modules
                    .read()
                    .unwrap()
                    .iter()
                    .map(|module| ModuleInfo {
                        name: module.name.clone(),
                        display_name: module.display_name.clone(),
                        actions: module
                            .actions
                            .read()
                            .unwrap()
                            .iter()
                            .map(|action| ActionInfo {
                                name: action.name.clone(),
                                display_name: action.display_name.clone(),
                            })
                            .collect(),
                        active_actions: module.active_actions.read().unwrap().clone(),
                        status: module.status.read().unwrap().clone(),
                        message: module.message.read().unwrap().clone(),
                    })
                    .collect(),
            })
            .collect();
        SystemInfo { plugin_instances }
    }

    /// Fully qualified names of every registered action, for the terminal
    /// client.
    #[must_use]
    pub fn action_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for instance in self.instances.read().unwrap().iter() {
            for module in instance.modules.read().unwrap().iter() {
                for action in module.actions.read().unwrap().iter() {
                    paths.push(format!(
                        "{}{}{}{}{}",
                        instance.name, SCOPE_SEPARATOR, module.name, SCOPE_SEPARATOR, action.name
                    ));
                }
            }
        }
        paths
    }

    /// One `instance::module -- status` line per module, for the terminal
    /// client.
    #[must_use]
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for instance in self.instances.read().unwrap().iter() {
            for module in instance.modules.read().unwrap().iter() {
                let status = module.status.read().unwrap();
                lines.push(format!(
                    "{} -- {}",
                    module.log_scope(),
                    status.as_deref().unwrap_or("unknown")
                ));
            }
        }
        lines
    }

    /// Run every instance's cleanup callback, in registration order.
    pub fn run_cleanups(&self, lua: &Lua) {
        for instance in self.instances.read().unwrap().iter() {
            instance.run_cleanup(lua);
        }
    }
}
