//! Embedded Lua scripting runtime.
//!
//! The channel script (`init.lua` in the channel home) and the plugins it
//! requires run inside one Lua state owned by [`runtime::ScriptRuntime`].
//! The host API is injected as the global `neopult` table before the script
//! loads; see [`primitives`] for the surface.
//!
//! Script callbacks only ever run on the event-loop thread, which is also
//! the only thread that mutates host state — scripts never need to worry
//! about concurrent mutation, and the host never needs a Send Lua state.

pub mod primitives;
pub mod runtime;
