//! Host API exposed to channel scripts.
//!
//! Everything scripts can reach lives under the global `neopult` table,
//! injected before the channel script loads:
//!
//! - `neopult.log` - scoped logging (debug, info, warn, error)
//! - `neopult.api` - plugin instances, stores, deferred tasks, tokens,
//!   channel info, window repositioning
//! - `neopult.config` - plain table the script fills in; read back by the
//!   host after load (`websocket_password`)
//!
//! Handles returned by the api (plugin instance, module, process, window,
//! store) are userdata whose methods mutate host state through the shared
//! [`RuntimeContext`]. All of them run on the event-loop thread.
//!
//! # Adding a primitive
//!
//! 1. Create a module with an `inject(lua, table, ctx)` function
//! 2. Add `pub mod foo;` here
//! 3. Call `foo::inject(...)` in [`inject`]

pub mod api;
pub mod config;
pub mod log;
pub mod plugin;
pub mod process;
pub mod store;
pub mod window;

use crate::lua::runtime::RuntimeContext;
use anyhow::{Context, Result};
use mlua::Lua;
use std::sync::Arc;

/// Build the `neopult` table and install it as a global.
///
/// # Errors
///
/// Returns an error if any table or function creation fails.
pub fn inject(lua: &Lua, ctx: Arc<RuntimeContext>) -> Result<()> {
    let neopult = lua.create_table().context("couldn't create neopult table")?;

    log::inject(lua, &neopult).context("couldn't inject log functions")?;
    api::inject(lua, &neopult, ctx).context("couldn't inject api functions")?;
    config::inject(lua, &neopult).context("couldn't inject config table")?;

    lua.globals()
        .set("neopult", neopult)
        .context("couldn't install the neopult global")?;
    Ok(())
}
