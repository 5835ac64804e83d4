//! Process handle userdata.
//!
//! Wraps a [`SpawnedChild`]; scripts talk to the child over stdin and can
//! kill it. Writes block the script until the OS pipe accepted the bytes,
//! which keeps the line protocol ordering trivial for plugin authors.

use crate::lua::runtime::RuntimeContext;
use crate::process::SpawnedChild;
use mlua::prelude::*;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

pub struct ProcessHandle {
    child: SpawnedChild,
    ctx: Arc<RuntimeContext>,
}

impl ProcessHandle {
    #[must_use]
    pub fn new(child: SpawnedChild, ctx: Arc<RuntimeContext>) -> Self {
        Self { child, ctx }
    }

    fn write(&mut self, data: &str) -> LuaResult<()> {
        // Fails when the child has exited and the pipe is closed.
        self.ctx
            .local_runtime
            .block_on(self.child.stdin.write_all(data.as_bytes()))?;
        Ok(())
    }
}

impl LuaUserData for ProcessHandle {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_method_mut("write", |_, this, data: String| this.write(&data));

        methods.add_method_mut("writeln", |_, this, line: String| {
            this.write(&(line + "\n"))
        });

        methods.add_method_mut("kill", |_, this, ()| {
            this.child.kill();
            Ok(())
        });

        methods.add_method("pid", |_, this, ()| Ok(this.child.pid));
    }
}
