//! Logging functions for scripts.
//!
//! Messages go through the host's `log` facade under the `lua` target, so
//! they land in the same output as host messages and respect `RUST_LOG`
//! filters. Plugin and module handles additionally offer scoped variants
//! that prefix the plugin scope.

use anyhow::{Context, Result};
use mlua::{Lua, Table};

/// Add the `log` table to `neopult`.
///
/// # Errors
///
/// Returns an error if function creation fails.
pub fn inject(lua: &Lua, neopult: &Table) -> Result<()> {
    let log_table = lua.create_table().context("couldn't create log table")?;

    log_table.set(
        "debug",
        lua.create_function(|_, msg: String| {
            log::debug!(target: "lua", "{}", msg);
            Ok(())
        })?,
    )?;
    log_table.set(
        "info",
        lua.create_function(|_, msg: String| {
            log::info!(target: "lua", "{}", msg);
            Ok(())
        })?,
    )?;
    log_table.set(
        "warn",
        lua.create_function(|_, msg: String| {
            log::warn!(target: "lua", "{}", msg);
            Ok(())
        })?,
    )?;
    log_table.set(
        "error",
        lua.create_function(|_, msg: String| {
            log::error!(target: "lua", "{}", msg);
            Ok(())
        })?,
    )?;

    neopult.set("log", log_table)?;
    Ok(())
}
