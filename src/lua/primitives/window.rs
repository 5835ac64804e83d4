//! Window handle userdata.
//!
//! A window handle is the script's capability to drive one managed window
//! through the three modes. Handles can go stale (after `unclaim` or when
//! the underlying X window died); every operation on a stale handle is a
//! logged no-op, never an error that unwinds the script.

use crate::lua::runtime::RuntimeContext;
use crate::registry::{PluginInstance, ScopedLog};
use crate::wm::{geometry::Margin, WindowId};
use mlua::prelude::*;
use mlua::Value;
use std::sync::Arc;

pub struct WindowHandle {
    id: WindowId,
    ctx: Arc<RuntimeContext>,
    plugin_instance: Arc<PluginInstance>,
}

impl WindowHandle {
    #[must_use]
    pub fn new(id: WindowId, ctx: Arc<RuntimeContext>, plugin_instance: Arc<PluginInstance>) -> Self {
        Self {
            id,
            ctx,
            plugin_instance,
        }
    }

    fn max(&self, lua: &Lua, size: LuaTable, opts: Value) -> LuaResult<()> {
        let width: u16 = match size.get(1) {
            Ok(width) => width,
            Err(e) => {
                self.plugin_instance
                    .error(format!("max needs a width as first size entry: {e}"));
                return Ok(());
            }
        };
        let height: u16 = match size.get(2) {
            Ok(height) => height,
            Err(e) => {
                self.plugin_instance
                    .error(format!("max needs a height as second size entry: {e}"));
                return Ok(());
            }
        };

        let mut margin = Margin::default();
        if let Value::Table(opts) = opts {
            if let Ok(margin_table) = opts.get::<LuaTable>("margin") {
                if let Ok(top) = margin_table.get::<u16>("top") {
                    margin.top = top;
                }
                if let Ok(right) = margin_table.get::<u16>("right") {
                    margin.right = right;
                }
                if let Ok(bottom) = margin_table.get::<u16>("bottom") {
                    margin.bottom = bottom;
                }
                if let Ok(left) = margin_table.get::<u16>("left") {
                    margin.left = left;
                }
            }
        }

        self.plugin_instance
            .debug(format!("maxing window {} at {width}x{height}", self.id));
        self.ctx.with_wm(|wm| {
            if let Err(e) = wm.max_window(lua, &self.ctx.deferred, self.id, (width, height), margin)
            {
                self.plugin_instance
                    .error(format!("maxing window {} failed: {e:#}", self.id));
            }
        });
        Ok(())
    }
}

impl LuaUserData for WindowHandle {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("max", |lua, this, (size, opts): (LuaTable, Value)| {
            this.max(lua, size, opts)
        });

        methods.add_method("min", |lua, this, ()| {
            this.plugin_instance
                .debug(format!("minning window {}", this.id));
            this.ctx.with_wm(|wm| {
                if let Err(e) = wm.min_window(lua, &this.ctx.deferred, this.id) {
                    this.plugin_instance
                        .error(format!("minning window {} failed: {e:#}", this.id));
                }
            });
            Ok(())
        });

        methods.add_method("hide", |lua, this, ()| {
            this.plugin_instance
                .debug(format!("hiding window {}", this.id));
            this.ctx.with_wm(|wm| {
                if let Err(e) = wm.hide_window(lua, &this.ctx.deferred, this.id) {
                    this.plugin_instance
                        .error(format!("hiding window {} failed: {e:#}", this.id));
                }
            });
            Ok(())
        });

        methods.add_method("unclaim", |lua, this, ()| {
            this.plugin_instance
                .debug(format!("unclaiming window {}", this.id));
            this.ctx.with_wm(|wm| {
                if let Err(e) = wm.release_window(lua, &this.ctx.deferred, this.id) {
                    this.plugin_instance
                        .error(format!("unclaiming window {} failed: {e:#}", this.id));
                }
            });
            Ok(())
        });

        methods.add_method("is_primary_window", |_, this, ()| {
            Ok(this
                .ctx
                .with_wm(|wm| wm.is_primary_window(this.id))
                .unwrap_or(false))
        });
    }
}
