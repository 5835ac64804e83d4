//! The `neopult.config` table.
//!
//! Injected empty before the channel script loads; the script fills in
//! values (`neopult.config.websocket_password = "..."`). The host reads the
//! table back exactly once, after load — later changes are not observed.

use anyhow::{Context, Result};
use log::{error, warn};
use mlua::{Lua, Table, Value};

pub fn inject(lua: &Lua, neopult: &Table) -> Result<()> {
    let config_table = lua
        .create_table()
        .context("couldn't create config table")?;
    neopult.set("config", config_table)?;
    Ok(())
}

/// Read `neopult.config.websocket_password` after script load.
///
/// Unknown keys and wrongly-typed values are logged and skipped; a missing
/// password means the admin server rejects every client.
pub fn read_websocket_password(lua: &Lua) -> Result<Option<String>> {
    let config_table: Table = lua
        .globals()
        .get::<Table>("neopult")
        .context("neopult global is gone")?
        .get("config")
        .context("neopult.config is gone")?;

    let mut websocket_password = None;
    for pair in config_table.pairs::<Value, Value>() {
        let (key, value) = pair.context("couldn't iterate config table")?;
        let Value::String(key) = key else {
            warn!("ignoring non-string config key");
            continue;
        };
        match key.to_string_lossy().as_ref() {
            "websocket_password" => match value {
                Value::String(password) => {
                    websocket_password = Some(password.to_string_lossy().to_string());
                }
                _ => error!("websocket_password must be a string"),
            },
            other => warn!("unknown config key: {other}"),
        }
    }
    Ok(websocket_password)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lua_with_config() -> Lua {
        let lua = Lua::new();
        let neopult = lua.create_table().expect("table");
        inject(&lua, &neopult).expect("inject");
        lua.globals().set("neopult", neopult).expect("global");
        lua
    }

    #[test]
    fn test_password_read_back() {
        let lua = lua_with_config();
        lua.load(r#"neopult.config.websocket_password = "hunter2""#)
            .exec()
            .expect("set password");
        assert_eq!(
            read_websocket_password(&lua).expect("read"),
            Some("hunter2".to_string())
        );
    }

    #[test]
    fn test_missing_password_is_none() {
        let lua = lua_with_config();
        assert_eq!(read_websocket_password(&lua).expect("read"), None);
    }

    #[test]
    fn test_non_string_password_is_ignored() {
        let lua = lua_with_config();
        lua.load("neopult.config.websocket_password = 42")
            .exec()
            .expect("set password");
        assert_eq!(read_websocket_password(&lua).expect("read"), None);
    }

    #[test]
    fn test_unknown_keys_are_tolerated() {
        let lua = lua_with_config();
        lua.load(
            r#"
            neopult.config.websocket_password = "pw"
            neopult.config.surprise = { nested = true }
        "#,
        )
        .exec()
        .expect("set config");
        assert_eq!(
            read_websocket_password(&lua).expect("read"),
            Some("pw".to_string())
        );
    }
}
