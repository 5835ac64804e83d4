//! Neopult core library.
//!
//! One neopult process owns one channel: a virtual X11 display, a set of Lua
//! plugins that spawn and arrange GUI processes on that display, and an
//! authenticated WebSocket endpoint through which an operator UI observes and
//! drives the plugins.
//!
//! # Architecture
//!
//! All host state (plugin registry, window manager tables, process handles)
//! is owned by a single event-loop thread inside [`lua::runtime`]. Background
//! producers — child process line readers, the X event pump, WebSocket client
//! tasks, the stdin terminal client — post typed [`events::Event`]s over one
//! mpsc channel and never touch host state themselves. Registry changes fan
//! out to connected admin clients as [`registry::Notification`]s over a
//! broadcast channel.

pub mod config;
pub mod events;
pub mod lua;
pub mod process;
pub mod registry;
pub mod server;
pub mod wm;

use tokio::sync::{broadcast, mpsc};

/// Channels used to coordinate a graceful shutdown.
///
/// `shutdown_tx` is broadcast to every long-lived task when the process
/// should exit. `shutdown_wait_tx` is cloned into tasks that must finish
/// before the process exits; `main` waits for all clones to drop.
#[derive(Debug, Clone)]
pub struct ShutdownChannels {
    pub shutdown_tx: broadcast::Sender<()>,
    pub shutdown_wait_tx: mpsc::Sender<()>,
}
