//! Unified event channel for the host event loop.
//!
//! All background producers (child process line readers, the X event pump,
//! WebSocket client tasks, the stdin terminal client) send events through a
//! single `mpsc::Sender<Event>`. The event loop receives on the corresponding
//! receiver and dispatches each variant on its own thread, which is the only
//! place host state is ever mutated.

use crate::registry::{ActionPath, PluginInstance, SystemInfo};
use crate::wm::WindowEvent;
use mlua::RegistryKey;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Which output stream of a child process a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Event from a background producer delivered to the host event loop.
#[derive(Debug)]
pub enum Event {
    /// A complete line read from a child process, terminator stripped.
    ///
    /// Sent by the per-stream reader tasks in [`crate::process`]. Lines of
    /// one process arrive in emission order per stream.
    ProcessOutput {
        line: String,
        stream: OutputStream,
        process_name: String,
        pid: u32,
        plugin_instance: Arc<PluginInstance>,
        /// Registry key of the script's `on_output` callback.
        callback_key: Arc<RegistryKey>,
    },

    /// An X event concerning a managed window, forwarded by the event pump.
    ///
    /// Pass-through work for unmanaged windows (mapping, honoring configure
    /// requests) happens on the pump thread and never reaches the loop.
    Window(WindowEvent),

    /// The X connection is gone or the pump hit an unrecoverable error.
    ///
    /// Terminates the event loop with an error; the process exits non-zero
    /// after shutdown.
    XFatal { message: String },

    /// A WebSocket client finished authentication and wants the snapshot.
    FetchSystemInfo {
        reply_tx: oneshot::Sender<SystemInfo>,
    },

    /// An operator requested an action call over the admin socket.
    ///
    /// No reply is sent; unknown targets are logged at warn and effects are
    /// observed through subsequent notifications.
    CallAction { path: ActionPath },

    /// A line typed on the host process stdin (debug terminal client).
    CliCommand {
        line: String,
        reply_tx: oneshot::Sender<String>,
    },
}
