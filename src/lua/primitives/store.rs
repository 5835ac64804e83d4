//! Observable single-value stores.
//!
//! A store holds one value and an ordered list of subscriber callbacks.
//! `set` replaces the value and synchronously notifies every subscriber
//! with it, in subscription order, on the event-loop thread. Setting an
//! equal value notifies again — `set` *is* the notify operation.
//!
//! Values are conveyed by copy: tables are deep-copied (cycle-safe) on
//! `set`, on `get` and per subscriber notification, so no two parties ever
//! observe shared mutation through a store. Functions and userdata pass by
//! reference; stores are for data.
//!
//! # Usage in Lua
//!
//! ```lua
//! local store = neopult.api.create_store({ volume = 1.0 })
//! local sub = store:subscribe(function(value)
//!     neopult.log.info("volume is now " .. value.volume)
//! end)
//! store:set({ volume = 0.5 })
//! store:unsubscribe(sub)
//! ```

use log::error;
use mlua::prelude::*;
use mlua::{AnyUserData, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Single-value observable cell.
pub struct Store {
    value_key: Option<LuaRegistryKey>,
    /// Subscribers in subscription order, keyed by token.
    subscribers: Vec<(u64, Arc<LuaRegistryKey>)>,
    next_token: u64,
}

impl Store {
    fn new(value_key: Option<LuaRegistryKey>) -> Self {
        Self {
            value_key,
            subscribers: Vec::new(),
            next_token: 0,
        }
    }
}

/// Opaque token returned by `subscribe`, consumed by `unsubscribe`.
#[derive(Debug, Clone, Copy)]
pub struct StoreSubscription {
    token: u64,
}

impl LuaUserData for StoreSubscription {}

impl LuaUserData for Store {
    // Methods are registered as plain functions taking the userdata so the
    // store borrow can be scoped tightly: subscriber callbacks run without
    // any borrow held and may subscribe or unsubscribe themselves.
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("get", |lua, store: AnyUserData| {
            let value = {
                let store = store.borrow::<Store>()?;
                match &store.value_key {
                    Some(key) => lua.registry_value::<Value>(key)?,
                    None => Value::Nil,
                }
            };
            deep_copy_value(lua, value, &mut HashMap::new())
        });

        methods.add_function("set", |lua, (store, value): (AnyUserData, Value)| {
            let copied = deep_copy_value(lua, value, &mut HashMap::new())?;
            let new_key = lua.create_registry_value(copied.clone())?;

            let old_key = {
                let mut store = store.borrow_mut::<Store>()?;
                std::mem::replace(&mut store.value_key, Some(new_key))
            };
            if let Some(old_key) = old_key {
                let _ = lua.remove_registry_value(old_key);
            }

            let callbacks: Vec<LuaFunction> = {
                let store = store.borrow::<Store>()?;
                store
                    .subscribers
                    .iter()
                    .filter_map(|(_, key)| lua.registry_value::<LuaFunction>(key).ok())
                    .collect()
            };
            for callback in callbacks {
                let per_subscriber = deep_copy_value(lua, copied.clone(), &mut HashMap::new())?;
                if let Err(e) = callback.call::<()>(per_subscriber) {
                    error!("error in store subscriber callback: {e:?}");
                }
            }
            Ok(())
        });

        methods.add_function(
            "subscribe",
            |lua, (store, callback): (AnyUserData, LuaFunction)| {
                let key = Arc::new(lua.create_registry_value(callback)?);
                let mut store = store.borrow_mut::<Store>()?;
                let token = store.next_token;
                store.next_token += 1;
                store.subscribers.push((token, key));
                Ok(StoreSubscription { token })
            },
        );

        methods.add_function(
            "unsubscribe",
            |_lua, (store, subscription): (AnyUserData, LuaUserDataRef<StoreSubscription>)| {
                store
                    .borrow_mut::<Store>()?
                    .subscribers
                    .retain(|(token, _)| *token != subscription.token);
                Ok(())
            },
        );
    }
}

/// Create a store holding a copy of `initial`.
pub fn create_store(lua: &Lua, initial: Value) -> LuaResult<AnyUserData> {
    let value_key = match initial {
        Value::Nil => None,
        value => {
            let copied = deep_copy_value(lua, value, &mut HashMap::new())?;
            Some(lua.create_registry_value(copied)?)
        }
    };
    lua.create_userdata(Store::new(value_key))
}

/// Recursively copy a Lua value. Tables are duplicated; cycles are
/// preserved through the `seen` map. Everything else passes through.
fn deep_copy_value(
    lua: &Lua,
    value: Value,
    seen: &mut HashMap<usize, LuaTable>,
) -> LuaResult<Value> {
    match value {
        Value::Table(table) => {
            let ptr = table.to_pointer() as usize;
            if let Some(copy) = seen.get(&ptr) {
                return Ok(Value::Table(copy.clone()));
            }
            let copy = lua.create_table()?;
            seen.insert(ptr, copy.clone());
            for pair in table.pairs::<Value, Value>() {
                let (key, value) = pair?;
                let key = deep_copy_value(lua, key, seen)?;
                let value = deep_copy_value(lua, value, seen)?;
                copy.set(key, value)?;
            }
            Ok(Value::Table(copy))
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lua_with_store() -> Lua {
        let lua = Lua::new();
        let create = lua
            .create_function(|lua, initial: Value| create_store(lua, initial))
            .expect("create function");
        lua.globals().set("create_store", create).expect("global");
        lua
    }

    #[test]
    fn test_get_returns_initial_value() {
        let lua = lua_with_store();
        let value: i64 = lua
            .load("local s = create_store(7) return s:get()")
            .eval()
            .expect("get");
        assert_eq!(value, 7);
    }

    #[test]
    fn test_empty_store_reads_nil() {
        let lua = lua_with_store();
        let is_nil: bool = lua
            .load("local s = create_store() return s:get() == nil")
            .eval()
            .expect("get");
        assert!(is_nil);
    }

    #[test]
    fn test_subscribers_see_every_set_in_order() {
        let lua = lua_with_store();
        lua.load(
            r#"
            seen_a, seen_b = {}, {}
            local s = create_store("initial")
            s:subscribe(function(v) table.insert(seen_a, v) end)
            s:subscribe(function(v) table.insert(seen_b, v) end)
            s:set("one")
            s:set("two")
            s:set("two")
        "#,
        )
        .exec()
        .expect("script");

        for table_name in ["seen_a", "seen_b"] {
            let seen: Vec<String> = lua
                .load(format!("return {table_name}"))
                .eval::<LuaTable>()
                .expect("table")
                .sequence_values()
                .collect::<LuaResult<_>>()
                .expect("strings");
            // Subscribers start with the first value set after they
            // subscribed, and an equal value still notifies.
            assert_eq!(seen, vec!["one", "two", "two"], "{table_name}");
        }
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let lua = lua_with_store();
        lua.load(
            r#"
            count = 0
            local s = create_store()
            local sub = s:subscribe(function() count = count + 1 end)
            s:set(1)
            s:unsubscribe(sub)
            s:set(2)
        "#,
        )
        .exec()
        .expect("script");

        let count: i64 = lua.load("return count").eval().expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn test_unsubscribe_from_within_callback() {
        let lua = lua_with_store();
        lua.load(
            r#"
            count = 0
            local s = create_store()
            local sub
            sub = s:subscribe(function()
                count = count + 1
                s:unsubscribe(sub)
            end)
            s:set(1)
            s:set(2)
        "#,
        )
        .exec()
        .expect("script");

        let count: i64 = lua.load("return count").eval().expect("count");
        assert_eq!(count, 1, "callback unsubscribing itself must not deadlock");
    }

    #[test]
    fn test_values_are_conveyed_by_copy() {
        let lua = lua_with_store();
        lua.load(
            r#"
            local original = { volume = 1 }
            local s = create_store(original)
            -- Mutating the table that was set must not leak into the store.
            original.volume = 99
            stored_volume = s:get().volume

            -- Mutating what get() returned must not leak either.
            local read = s:get()
            read.volume = 42
            stored_volume_after_read = s:get().volume
        "#,
        )
        .exec()
        .expect("script");

        let stored: i64 = lua.load("return stored_volume").eval().expect("volume");
        assert_eq!(stored, 1);
        let stored_after: i64 = lua
            .load("return stored_volume_after_read")
            .eval()
            .expect("volume");
        assert_eq!(stored_after, 1);
    }

    #[test]
    fn test_cyclic_tables_survive_copying() {
        let lua = lua_with_store();
        lua.load(
            r#"
            local t = { name = "cycle" }
            t.this = t
            local s = create_store(t)
            local read = s:get()
            cycle_ok = read.this == read and read.name == "cycle"
        "#,
        )
        .exec()
        .expect("script");

        let ok: bool = lua.load("return cycle_ok").eval().expect("flag");
        assert!(ok);
    }
}
