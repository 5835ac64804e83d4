//! The `neopult.api` table.
//!
//! Entry points that don't hang off a handle: plugin instance
//! registration, stores, deferred tasks, token generation, channel info,
//! HTML escaping and manual window repositioning.

use crate::lua::primitives::plugin::PluginInstanceHandle;
use crate::lua::primitives::store;
use crate::lua::runtime::{DeferredTask, RuntimeContext};
use anyhow::Result;
use log::error;
use mlua::prelude::*;
use mlua::{Table, Value};
use rand::distributions::{Alphanumeric, DistString};
use std::sync::Arc;

/// Add the `api` table to `neopult`.
///
/// # Errors
///
/// Returns an error if table or function creation fails.
pub fn inject(lua: &Lua, neopult: &Table, ctx: Arc<RuntimeContext>) -> Result<()> {
    let api = anyhow::Context::context(lua.create_table(), "couldn't create api table")?;

    let register_ctx = ctx.clone();
    api.set(
        "register_plugin_instance",
        lua.create_function(move |lua, (name, opts): (String, Value)| {
            register_plugin_instance(lua, &register_ctx, name, opts)
        })?,
    )?;

    api.set(
        "create_store",
        lua.create_function(|lua, initial: Value| store::create_store(lua, initial))?,
    )?;

    let run_later_ctx = ctx.clone();
    api.set(
        "run_later",
        lua.create_function(move |lua, task: LuaFunction| {
            let key = lua.create_registry_value(task)?;
            run_later_ctx
                .deferred
                .lock()
                .unwrap()
                .push_back(DeferredTask::ScriptFunction(key));
            Ok(())
        })?,
    )?;

    let channel_ctx = ctx.clone();
    api.set(
        "get_channel",
        lua.create_function(move |_, ()| Ok(channel_ctx.env_config.channel))?,
    )?;

    let home_ctx = ctx.clone();
    api.set(
        "get_channel_home",
        lua.create_function(move |_, ()| {
            Ok(home_ctx.env_config.channel_home.display().to_string())
        })?,
    )?;

    api.set(
        "generate_token",
        lua.create_function(|_, length: u8| {
            Ok(Alphanumeric.sample_string(&mut rand::thread_rng(), usize::from(length)))
        })?,
    )?;

    api.set(
        "escape_html",
        lua.create_function(|_, raw: String| Ok(escape_html(&raw)))?,
    )?;

    let reposition_ctx = ctx;
    api.set(
        "reposition_windows",
        lua.create_function(move |lua, ()| {
            reposition_ctx.with_wm(|wm| {
                if let Err(e) = wm.reposition_windows(lua, &reposition_ctx.deferred) {
                    error!("repositioning windows failed: {e:#}");
                }
            });
            Ok(())
        })?,
    )?;

    neopult.set("api", api)?;
    Ok(())
}

fn register_plugin_instance(
    lua: &Lua,
    ctx: &Arc<RuntimeContext>,
    name: String,
    opts: Value,
) -> LuaResult<Option<PluginInstanceHandle>> {
    let mut on_cleanup = None;
    if let Value::Table(opts) = opts {
        if let Ok(callback) = opts.get::<LuaFunction>("on_cleanup") {
            on_cleanup = Some(lua.create_registry_value(callback)?);
        }
    }

    let instance = ctx.registry.register_instance(name, on_cleanup);
    Ok(instance.map(|plugin_instance| PluginInstanceHandle {
        plugin_instance,
        ctx: ctx.clone(),
    }))
}

/// Minimal HTML escaping for module messages. The core passes messages
/// through verbatim; plugins that embed untrusted text call this.
fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#039;")
}
