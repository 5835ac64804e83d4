//! X11 window manager.
//!
//! The manager owns every window a plugin has claimed (real X windows) or
//! created (virtual windows) and arranges them through three modes:
//!
//! - **max**: the window is a candidate for *primary*. The most recently
//!   maxed window is the primary; it drives the root geometry (its size plus
//!   its margins) and sits at the bottom of the stack.
//! - **min**: the window renders at its corner-anchored min geometry,
//!   layered above the primary.
//! - **hidden**: the window is unmapped.
//!
//! # Structure
//!
//! [`WindowTable`] holds the pure state — modes, the max-recency stack that
//! decides primary election, insertion order — and computes a [`Layout`]
//! without touching X. [`WindowManager`] applies layouts through the
//! [`x11::XBackend`] for real windows and through deferred script callbacks
//! for virtual ones.
//!
//! # Callback discipline
//!
//! Virtual-window callbacks are never invoked synchronously. The manager
//! enqueues them on the deferred-task queue, which the event loop drains
//! after the current script call returns. Those callbacks still must not
//! call back into the manager directly; scripts use `neopult.api.run_later`.

pub mod geometry;
pub mod x11;

use crate::lua::runtime::{DeferredQueue, DeferredTask};
use anyhow::{bail, Result};
use geometry::{AnchoredGeometry, Corner, Geometry, Margin};
use log::{debug, warn};
use mlua::{Lua, RegistryKey};
use std::{
    collections::BTreeMap,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use xcb::x;

const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_CLAIM_TIMEOUT_MS: u64 = 250;

/// Identifier of a managed window. Monotonically increasing and never
/// reused, so a stale handle misses the table instead of hitting an
/// unrelated window.
pub type WindowId = usize;

/// X event concerning a managed window, forwarded by the event pump.
#[derive(Debug, Clone, Copy)]
pub enum WindowEvent {
    /// A managed window asked to be mapped; the layout decides.
    MapRequest { window: x::Window },
    /// A managed window tried to reconfigure itself; the managed geometry
    /// is re-asserted.
    ConfigureRequest { window: x::Window },
    /// A managed window was destroyed. Treated like an unclaim, including
    /// primary re-election.
    Destroyed { window: x::Window },
}

/// What happens to a primary window when another window takes primacy.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub enum PrimaryDemotionAction {
    /// Stay in max mode (next in line for re-election).
    #[default]
    DoNothing,
    /// Drop to min mode.
    MakeMin,
    /// Unmap.
    Hide,
}

impl FromStr for PrimaryDemotionAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "do_nothing" => Ok(PrimaryDemotionAction::DoNothing),
            "make_min" => Ok(PrimaryDemotionAction::MakeMin),
            "hide" => Ok(PrimaryDemotionAction::Hide),
            _ => bail!("unknown primary demotion action: {s}"),
        }
    }
}

/// Script callbacks through which a virtual window is driven.
#[derive(Debug)]
pub struct VirtualCallbacks {
    pub set_geometry_key: Arc<RegistryKey>,
    pub map_key: Arc<RegistryKey>,
    pub unmap_key: Arc<RegistryKey>,
}

/// Current mode of a managed window. Max carries the declared size and
/// margins since they only exist while the window is maxed.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum WindowMode {
    Max { size: (u16, u16), margin: Margin },
    Min,
    Hidden,
}

#[derive(Debug)]
enum WindowKind {
    X { window: x::Window },
    Virtual {
        name: String,
        callbacks: VirtualCallbacks,
    },
}

/// Mode discriminant, used to detect mode changes across layout passes.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum ModeKind {
    Max,
    Min,
    Hidden,
}

impl From<&WindowMode> for ModeKind {
    fn from(mode: &WindowMode) -> Self {
        match mode {
            WindowMode::Max { .. } => ModeKind::Max,
            WindowMode::Min => ModeKind::Min,
            WindowMode::Hidden => ModeKind::Hidden,
        }
    }
}

#[derive(Debug)]
struct ManagedWindow {
    kind: WindowKind,
    owner: String,
    mode: WindowMode,
    min_geometry: AnchoredGeometry,
    demotion: PrimaryDemotionAction,
    /// Whether the window is currently visible (mapped / map callback sent).
    mapped: bool,
    /// Last placement conveyed to a virtual window, to skip no-op callbacks.
    last_virtual_placement: Option<(AnchoredGeometry, usize)>,
    /// Mode the window was last laid out in while visible. Virtual windows
    /// get a fresh `map` callback when this changes: a demotion from max to
    /// min is a (re)mapping from the script's point of view.
    last_visible_mode: Option<ModeKind>,
}

/// One window's slot in a computed [`Layout`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Placement {
    pub id: WindowId,
    /// Corner-anchored form, as conveyed to virtual windows.
    pub anchored: AnchoredGeometry,
    /// Absolute form, as applied to X windows.
    pub geometry: Geometry,
    /// Stacking index, bottom-up. The primary is always 0.
    pub z: usize,
    pub mapped: bool,
}

/// Full arrangement for the current table state.
#[derive(Debug)]
pub struct Layout {
    /// Required root size: primary size plus margins, or the display
    /// default when no primary exists.
    pub root: (u16, u16),
    /// Mapped placements bottom-to-top, then unmapped windows.
    pub placements: Vec<Placement>,
}

/// Pure window state: modes, primary election, stacking.
///
/// Knows nothing about X or Lua; [`WindowManager`] applies its decisions.
#[derive(Debug, Default)]
pub struct WindowTable {
    windows: BTreeMap<WindowId, ManagedWindow>,
    next_id: WindowId,
    /// Windows currently in max mode, in promotion recency order. The last
    /// entry is the primary.
    max_stack: Vec<WindowId>,
}

impl WindowTable {
    fn insert(
        &mut self,
        kind: WindowKind,
        owner: String,
        min_geometry: AnchoredGeometry,
        demotion: PrimaryDemotionAction,
    ) -> WindowId {
        let id = self.next_id;
        self.next_id += 1;
        self.windows.insert(
            id,
            ManagedWindow {
                kind,
                owner,
                mode: WindowMode::Min,
                min_geometry,
                demotion,
                mapped: false,
                last_virtual_placement: None,
                last_visible_mode: None,
            },
        );
        id
    }

    fn contains(&self, id: WindowId) -> bool {
        self.windows.contains_key(&id)
    }

    /// The current primary: the most recently maxed window still in max.
    #[must_use]
    pub fn primary(&self) -> Option<WindowId> {
        self.max_stack.last().copied()
    }

    /// Promote `id` to max mode and primacy, applying the displaced
    /// primary's demotion policy.
    fn promote(&mut self, id: WindowId, size: (u16, u16), margin: Margin) {
        let displaced = self.primary().filter(|&p| p != id);

        if let Some(window) = self.windows.get_mut(&id) {
            window.mode = WindowMode::Max { size, margin };
        }
        self.max_stack.retain(|&w| w != id);
        self.max_stack.push(id);

        // The policy fires only when a *different* window takes primacy
        // while the old primary is still in max.
        if let Some(prev) = displaced {
            let action = self.windows.get(&prev).map(|w| w.demotion);
            match action {
                Some(PrimaryDemotionAction::DoNothing) | None => {}
                Some(PrimaryDemotionAction::MakeMin) => self.set_mode(prev, WindowMode::Min),
                Some(PrimaryDemotionAction::Hide) => self.set_mode(prev, WindowMode::Hidden),
            }
        }
    }

    /// Put `id` into min or hidden mode. Leaving max re-elects implicitly:
    /// the next most recent entry of the stack becomes primary.
    fn set_mode(&mut self, id: WindowId, mode: WindowMode) {
        debug_assert!(!matches!(mode, WindowMode::Max { .. }), "use promote for max");
        if let Some(window) = self.windows.get_mut(&id) {
            window.mode = mode;
        }
        self.max_stack.retain(|&w| w != id);
    }

    fn remove(&mut self, id: WindowId) -> Option<ManagedWindow> {
        self.max_stack.retain(|&w| w != id);
        self.windows.remove(&id)
    }

    fn find_by_x_window(&self, window: x::Window) -> Option<WindowId> {
        self.windows
            .iter()
            .find(|(_, w)| matches!(w.kind, WindowKind::X { window: xw } if xw == window))
            .map(|(&id, _)| id)
    }

    /// Compute the arrangement for the current state.
    ///
    /// Bottom-to-top: primary at (left, top), then non-primary max windows
    /// in promotion order, then min windows in management insertion order,
    /// each anchored to the computed root. Hidden windows trail with
    /// `mapped: false`.
    #[must_use]
    pub fn compute_layout(&self, default_root: (u16, u16)) -> Layout {
        let root = match self.primary().and_then(|id| self.windows.get(&id)) {
            Some(window) => match window.mode {
                WindowMode::Max { size, margin } => margin.outer_size(size.0, size.1),
                _ => default_root,
            },
            None => default_root,
        };

        let mut placements = Vec::with_capacity(self.windows.len());
        let mut z = 0;

        // Primary first, then older max windows, bottom to top.
        let primary = self.primary();
        let mut max_order: Vec<WindowId> = Vec::with_capacity(self.max_stack.len());
        max_order.extend(primary);
        max_order.extend(self.max_stack.iter().rev().skip(1));

        for id in max_order {
            let window = &self.windows[&id];
            let WindowMode::Max { size, margin } = window.mode else {
                continue;
            };
            let anchored = AnchoredGeometry {
                width: size.0,
                height: size.1,
                x_offset: margin.left,
                y_offset: margin.top,
                corner: Corner::TopLeft,
            };
            placements.push(Placement {
                id,
                anchored,
                geometry: anchored.resolve(root.0, root.1),
                z,
                mapped: true,
            });
            z += 1;
        }

        for (&id, window) in &self.windows {
            match window.mode {
                WindowMode::Max { .. } => {}
                WindowMode::Min => {
                    placements.push(Placement {
                        id,
                        anchored: window.min_geometry,
                        geometry: window.min_geometry.resolve(root.0, root.1),
                        z,
                        mapped: true,
                    });
                    z += 1;
                }
                WindowMode::Hidden => {}
            }
        }

        for (&id, window) in &self.windows {
            if window.mode == WindowMode::Hidden {
                placements.push(Placement {
                    id,
                    anchored: window.min_geometry,
                    geometry: window.min_geometry.resolve(root.0, root.1),
                    z: 0,
                    mapped: false,
                });
            }
        }

        Layout { root, placements }
    }
}

/// Options for [`WindowManager::claim_window`].
#[derive(Debug)]
pub struct ClaimOptions {
    pub timeout_ms: u64,
    pub min_geometry: AnchoredGeometry,
    /// Also consider windows that are already managed.
    pub ignore_managed: bool,
}

impl Default for ClaimOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_CLAIM_TIMEOUT_MS,
            min_geometry: AnchoredGeometry::default(),
            ignore_managed: false,
        }
    }
}

/// The window manager proper: pure table plus X backend.
#[derive(Debug)]
pub struct WindowManager {
    backend: x11::XBackend,
    table: WindowTable,
}

impl WindowManager {
    /// Connect to the X display, become the redirecting window manager and
    /// record the default root geometry.
    ///
    /// # Errors
    ///
    /// Fails when the display cannot be reached or another window manager
    /// holds the substructure redirect on the root.
    pub fn init() -> Result<Self> {
        let backend = x11::XBackend::init()?;
        Ok(Self {
            backend,
            table: WindowTable::default(),
        })
    }

    /// Start the X event pump thread. Events for managed windows arrive on
    /// `event_tx`; pass-through work for unmanaged windows stays on the
    /// pump thread.
    pub fn start_event_pump(&self, event_tx: mpsc::Sender<crate::events::Event>) {
        self.backend.spawn_event_pump(event_tx);
    }

    /// Claim the most recently mapped top-level window whose `WM_CLASS`
    /// contains `class` as a substring.
    ///
    /// Polls the X server every 50 ms until a candidate appears or
    /// `timeout_ms` elapses; the claimed window is installed in min mode.
    /// Returns `Ok(None)` on timeout.
    pub fn claim_window(
        &mut self,
        lua: &Lua,
        deferred: &DeferredQueue,
        owner: &str,
        class: &str,
        opts: ClaimOptions,
    ) -> Result<Option<WindowId>> {
        let deadline = Instant::now() + Duration::from_millis(opts.timeout_ms);
        loop {
            if let Some(window) = self.backend.find_window_by_class(class, opts.ignore_managed)? {
                let id = self.table.insert(
                    WindowKind::X { window },
                    owner.to_string(),
                    opts.min_geometry,
                    PrimaryDemotionAction::DoNothing,
                );
                self.backend.add_managed(window);
                debug!(
                    "[{owner}] managing window {window:?} with class {class:?} as {id}"
                );
                self.apply_layout(lua, deferred)?;
                return Ok(Some(id));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(CLAIM_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Create a virtual window. It starts in min mode like a claimed
    /// window; its placement callbacks are enqueued on the deferred queue.
    pub fn create_virtual_window(
        &mut self,
        lua: &Lua,
        deferred: &DeferredQueue,
        owner: &str,
        name: String,
        callbacks: VirtualCallbacks,
        min_geometry: AnchoredGeometry,
        demotion: PrimaryDemotionAction,
    ) -> Result<WindowId> {
        let id = self.table.insert(
            WindowKind::Virtual { name, callbacks },
            owner.to_string(),
            min_geometry,
            demotion,
        );
        self.apply_layout(lua, deferred)?;
        Ok(id)
    }

    /// Put `id` into max mode at `size` with `margin`, making it primary.
    pub fn max_window(
        &mut self,
        lua: &Lua,
        deferred: &DeferredQueue,
        id: WindowId,
        size: (u16, u16),
        margin: Margin,
    ) -> Result<()> {
        if !self.table.contains(id) {
            warn!("max on unmanaged window {id}");
            return Ok(());
        }
        self.table.promote(id, size, margin);
        self.apply_layout(lua, deferred)
    }

    /// Put `id` into min mode. If it was primary, the next most recently
    /// maxed window takes over.
    pub fn min_window(&mut self, lua: &Lua, deferred: &DeferredQueue, id: WindowId) -> Result<()> {
        if !self.table.contains(id) {
            warn!("min on unmanaged window {id}");
            return Ok(());
        }
        self.table.set_mode(id, WindowMode::Min);
        self.apply_layout(lua, deferred)
    }

    /// Unmap `id`. If it was primary, re-elect.
    pub fn hide_window(&mut self, lua: &Lua, deferred: &DeferredQueue, id: WindowId) -> Result<()> {
        if !self.table.contains(id) {
            warn!("hide on unmanaged window {id}");
            return Ok(());
        }
        self.table.set_mode(id, WindowMode::Hidden);
        self.apply_layout(lua, deferred)
    }

    /// Release `id` from management. Real windows are left to the X server;
    /// virtual windows simply drop from the table.
    pub fn release_window(
        &mut self,
        lua: &Lua,
        deferred: &DeferredQueue,
        id: WindowId,
    ) -> Result<()> {
        let Some(window) = self.table.remove(id) else {
            warn!("unclaim on unmanaged window {id}");
            return Ok(());
        };
        if let WindowKind::X { window } = window.kind {
            self.backend.remove_managed(window);
        }
        self.apply_layout(lua, deferred)
    }

    #[must_use]
    pub fn is_primary_window(&self, id: WindowId) -> bool {
        self.table.primary() == Some(id)
    }

    /// Recompute and re-apply the full arrangement.
    pub fn reposition_windows(&mut self, lua: &Lua, deferred: &DeferredQueue) -> Result<()> {
        self.apply_layout(lua, deferred)
    }

    /// React to an X event the pump forwarded for a managed window.
    pub fn handle_window_event(
        &mut self,
        lua: &Lua,
        deferred: &DeferredQueue,
        event: WindowEvent,
    ) -> Result<()> {
        match event {
            // Managed windows may try to map or reconfigure themselves;
            // the computed layout wins.
            WindowEvent::MapRequest { .. } | WindowEvent::ConfigureRequest { .. } => {
                self.apply_layout(lua, deferred)
            }
            WindowEvent::Destroyed { window } => {
                if let Some(id) = self.table.find_by_x_window(window) {
                    let owner = &self.table.windows[&id].owner;
                    debug!("managed window {id} of {owner} was destroyed, releasing it");
                    self.table.remove(id);
                    self.backend.remove_managed(window);
                    self.apply_layout(lua, deferred)?;
                }
                Ok(())
            }
        }
    }

    /// Apply the computed layout: resize the root if needed, then position,
    /// stack and map/unmap every window.
    fn apply_layout(&mut self, lua: &Lua, deferred: &DeferredQueue) -> Result<()> {
        let layout = self.table.compute_layout(self.backend.default_root_size());

        if layout.root != self.backend.current_root_size() {
            self.backend.set_root_size(layout.root)?;
        }

        let mut below: Option<x::Window> = None;
        for placement in &layout.placements {
            let window = self
                .table
                .windows
                .get_mut(&placement.id)
                .expect("placement references a managed window");
            match &window.kind {
                WindowKind::X { window: x_window } => {
                    let x_window = *x_window;
                    if placement.mapped {
                        self.backend.configure(x_window, placement.geometry, below)?;
                        if !window.mapped {
                            self.backend.map(x_window)?;
                        }
                        below = Some(x_window);
                    } else if window.mapped {
                        self.backend.unmap(x_window)?;
                    }
                }
                WindowKind::Virtual { name, callbacks } => {
                    if placement.mapped {
                        let placement_key = (placement.anchored, placement.z);
                        if window.last_virtual_placement != Some(placement_key) {
                            debug!(
                                "virtual window {name}: geometry {} z {}",
                                placement.anchored, placement.z
                            );
                            enqueue_set_geometry(lua, deferred, callbacks, placement)?;
                            window.last_virtual_placement = Some(placement_key);
                        }
                        let mode_kind = ModeKind::from(&window.mode);
                        if !window.mapped || window.last_visible_mode != Some(mode_kind) {
                            enqueue_nullary(deferred, &callbacks.map_key);
                        }
                        window.last_visible_mode = Some(mode_kind);
                    } else if window.mapped {
                        debug!("virtual window {name}: unmap");
                        enqueue_nullary(deferred, &callbacks.unmap_key);
                        window.last_virtual_placement = None;
                        window.last_visible_mode = None;
                    }
                }
            }
            window.mapped = placement.mapped;
        }
        self.backend.flush()?;
        Ok(())
    }
}

/// Enqueue a virtual window's `set_geometry` callback with the computed
/// placement.
fn enqueue_set_geometry(
    lua: &Lua,
    deferred: &DeferredQueue,
    callbacks: &VirtualCallbacks,
    placement: &Placement,
) -> Result<()> {
    let arg = lua.create_table()?;
    arg.set("x", placement.geometry.x)?;
    arg.set("y", placement.geometry.y)?;
    arg.set("width", placement.anchored.width)?;
    arg.set("height", placement.anchored.height)?;
    arg.set("x_offset", placement.anchored.x_offset)?;
    arg.set("y_offset", placement.anchored.y_offset)?;
    arg.set("alignment", placement.anchored.corner.label())?;
    arg.set("z", placement.z)?;
    let arg_key = lua.create_registry_value(arg)?;
    deferred
        .lock()
        .unwrap()
        .push_back(DeferredTask::HostCallback {
            func: callbacks.set_geometry_key.clone(),
            arg: Some(arg_key),
        });
    Ok(())
}

/// Enqueue a virtual window's `map` or `unmap` callback.
fn enqueue_nullary(deferred: &DeferredQueue, key: &Arc<RegistryKey>) {
    deferred
        .lock()
        .unwrap()
        .push_back(DeferredTask::HostCallback {
            func: key.clone(),
            arg: None,
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Function;

    const ROOT: (u16, u16) = (1280, 720);

    fn callbacks(lua: &Lua) -> VirtualCallbacks {
        let key = || {
            let f: Function = lua.load("function() end").eval().expect("chunk");
            Arc::new(lua.create_registry_value(f).expect("registry value"))
        };
        VirtualCallbacks {
            set_geometry_key: key(),
            map_key: key(),
            unmap_key: key(),
        }
    }

    fn virtual_window(
        lua: &Lua,
        table: &mut WindowTable,
        demotion: PrimaryDemotionAction,
    ) -> WindowId {
        table.insert(
            WindowKind::Virtual {
                name: "test".to_string(),
                callbacks: callbacks(lua),
            },
            "tester".to_string(),
            AnchoredGeometry::default(),
            demotion,
        )
    }

    fn placement(layout: &Layout, id: WindowId) -> Placement {
        *layout
            .placements
            .iter()
            .find(|p| p.id == id)
            .expect("window has a placement")
    }

    #[test]
    fn test_new_window_starts_min_without_primary() {
        let lua = Lua::new();
        let mut table = WindowTable::default();
        let a = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);

        assert_eq!(table.primary(), None);
        let layout = table.compute_layout(ROOT);
        assert_eq!(layout.root, ROOT);
        let p = placement(&layout, a);
        assert!(p.mapped);
        assert_eq!(p.anchored, AnchoredGeometry::default());
    }

    #[test]
    fn test_most_recent_max_is_primary() {
        let lua = Lua::new();
        let mut table = WindowTable::default();
        let a = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);
        let b = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);

        table.promote(a, (1920, 1080), Margin::default());
        table.promote(b, (1920, 1080), Margin::default());

        assert_eq!(table.primary(), Some(b));

        // B leaves max; A is primary again.
        table.set_mode(b, WindowMode::Min);
        assert_eq!(table.primary(), Some(a));

        let layout = table.compute_layout(ROOT);
        let pa = placement(&layout, a);
        let pb = placement(&layout, b);
        assert_eq!(pa.z, 0, "primary sits at the bottom");
        assert!(pb.z > pa.z, "min window is layered above the primary");
    }

    #[test]
    fn test_root_geometry_follows_primary_and_margins() {
        let lua = Lua::new();
        let mut table = WindowTable::default();
        let a = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);

        let margin = Margin {
            top: 10,
            right: 320,
            bottom: 30,
            left: 40,
        };
        table.promote(a, (1600, 900), margin);

        let layout = table.compute_layout(ROOT);
        assert_eq!(layout.root, (1600 + 40 + 320, 900 + 10 + 30));
        let p = placement(&layout, a);
        assert_eq!(p.geometry.x, 40);
        assert_eq!(p.geometry.y, 10);

        // No primary: back to the default root.
        table.set_mode(a, WindowMode::Hidden);
        assert_eq!(table.compute_layout(ROOT).root, ROOT);
    }

    #[test]
    fn test_demotion_policy_do_nothing_keeps_max() {
        let lua = Lua::new();
        let mut table = WindowTable::default();
        let a = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);
        let b = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);

        table.promote(a, (1920, 1080), Margin::default());
        table.promote(b, (1920, 1080), Margin::default());

        assert!(matches!(
            table.windows[&a].mode,
            WindowMode::Max { .. }
        ));
        assert_eq!(table.primary(), Some(b));
    }

    #[test]
    fn test_demotion_policy_make_min() {
        let lua = Lua::new();
        let mut table = WindowTable::default();
        let cam = virtual_window(&lua, &mut table, PrimaryDemotionAction::MakeMin);
        let slides = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);

        table.promote(cam, (1280, 720), Margin::default());
        table.promote(slides, (1920, 1080), Margin::default());

        assert_eq!(table.windows[&cam].mode, WindowMode::Min);
        assert_eq!(table.primary(), Some(slides));
    }

    #[test]
    fn test_demotion_policy_hide() {
        let lua = Lua::new();
        let mut table = WindowTable::default();
        let cam = virtual_window(&lua, &mut table, PrimaryDemotionAction::Hide);
        let slides = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);

        table.promote(cam, (1280, 720), Margin::default());
        table.promote(slides, (1920, 1080), Margin::default());

        assert_eq!(table.windows[&cam].mode, WindowMode::Hidden);
        let layout = table.compute_layout(ROOT);
        assert!(!placement(&layout, cam).mapped);
    }

    #[test]
    fn test_demotion_policy_does_not_fire_on_voluntary_min() {
        let lua = Lua::new();
        let mut table = WindowTable::default();
        let cam = virtual_window(&lua, &mut table, PrimaryDemotionAction::Hide);

        table.promote(cam, (1280, 720), Margin::default());
        table.set_mode(cam, WindowMode::Min);

        // Voluntarily leaving max must not apply the hide policy.
        assert_eq!(table.windows[&cam].mode, WindowMode::Min);
    }

    #[test]
    fn test_remax_updates_size_and_keeps_primacy() {
        let lua = Lua::new();
        let mut table = WindowTable::default();
        let a = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);

        table.promote(a, (1280, 720), Margin::default());
        table.promote(a, (1920, 1080), Margin::default());

        assert_eq!(table.primary(), Some(a));
        assert_eq!(table.compute_layout(ROOT).root, (1920, 1080));
        assert_eq!(table.max_stack.len(), 1);
    }

    #[test]
    fn test_unclaim_primary_reelects() {
        let lua = Lua::new();
        let mut table = WindowTable::default();
        let a = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);
        let b = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);

        table.promote(a, (1280, 720), Margin::default());
        table.promote(b, (1920, 1080), Margin::default());
        table.remove(b);

        assert_eq!(table.primary(), Some(a));
        assert_eq!(table.compute_layout(ROOT).root, (1280, 720));
    }

    #[test]
    fn test_unclaim_last_max_leaves_no_primary() {
        let lua = Lua::new();
        let mut table = WindowTable::default();
        let a = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);
        table.promote(a, (1920, 1080), Margin::default());
        table.remove(a);

        assert_eq!(table.primary(), None);
        let layout = table.compute_layout(ROOT);
        assert_eq!(layout.root, ROOT);
        assert!(layout.placements.is_empty());
    }

    #[test]
    fn test_claim_unclaim_is_observationally_idempotent() {
        let lua = Lua::new();
        let mut table = WindowTable::default();
        let a = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);
        table.promote(a, (1920, 1080), Margin::default());

        let before = table.compute_layout(ROOT);
        let b = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);
        table.remove(b);
        let after = table.compute_layout(ROOT);

        assert_eq!(before.root, after.root);
        assert_eq!(before.placements, after.placements);
        assert_eq!(table.primary(), Some(a));
    }

    #[test]
    fn test_min_windows_stack_in_insertion_order() {
        let lua = Lua::new();
        let mut table = WindowTable::default();
        let first = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);
        let second = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);
        let primary = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);
        table.promote(primary, (1920, 1080), Margin::default());

        let layout = table.compute_layout(ROOT);
        assert_eq!(placement(&layout, primary).z, 0);
        assert_eq!(placement(&layout, first).z, 1);
        assert_eq!(placement(&layout, second).z, 2);
    }

    #[test]
    fn test_hidden_to_min_remaps() {
        let lua = Lua::new();
        let mut table = WindowTable::default();
        let a = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);

        table.set_mode(a, WindowMode::Hidden);
        assert!(!placement(&table.compute_layout(ROOT), a).mapped);

        table.set_mode(a, WindowMode::Min);
        let p = placement(&table.compute_layout(ROOT), a);
        assert!(p.mapped);
        assert_eq!(p.anchored, AnchoredGeometry::default());
    }

    #[test]
    fn test_every_mode_transition_is_defined() {
        // Drive one window through every (mode, requested op) pair of the
        // transition table; none may panic and the mode afterwards must be
        // the requested one (or gone, for unclaim).
        let lua = Lua::new();
        let ops: [&dyn Fn(&mut WindowTable, WindowId); 4] = [
            &|t, id| t.promote(id, (800, 600), Margin::default()),
            &|t, id| t.set_mode(id, WindowMode::Min),
            &|t, id| t.set_mode(id, WindowMode::Hidden),
            &|t, id| {
                t.remove(id);
            },
        ];
        let modes: [&dyn Fn(&mut WindowTable, WindowId); 3] = [
            &|t, id| t.promote(id, (640, 480), Margin::default()),
            &|t, id| t.set_mode(id, WindowMode::Min),
            &|t, id| t.set_mode(id, WindowMode::Hidden),
        ];

        for (mode_idx, enter_mode) in modes.iter().enumerate() {
            for (op_idx, op) in ops.iter().enumerate() {
                let mut table = WindowTable::default();
                let id = virtual_window(&lua, &mut table, PrimaryDemotionAction::DoNothing);
                enter_mode(&mut table, id);
                op(&mut table, id);

                let expected = match op_idx {
                    0 => Some(WindowMode::Max {
                        size: (800, 600),
                        margin: Margin::default(),
                    }),
                    1 => Some(WindowMode::Min),
                    2 => Some(WindowMode::Hidden),
                    _ => None,
                };
                match expected {
                    Some(mode) => assert_eq!(
                        table.windows[&id].mode, mode,
                        "mode {mode_idx} op {op_idx}"
                    ),
                    None => assert!(!table.contains(id), "mode {mode_idx} op {op_idx}"),
                }
                // The layout must stay computable in every resulting state.
                let _ = table.compute_layout(ROOT);
            }
        }
    }

    #[test]
    fn test_parse_demotion_action() {
        assert_eq!(
            "do_nothing".parse::<PrimaryDemotionAction>().expect("parse"),
            PrimaryDemotionAction::DoNothing
        );
        assert_eq!(
            "make_min".parse::<PrimaryDemotionAction>().expect("parse"),
            PrimaryDemotionAction::MakeMin
        );
        assert_eq!(
            "hide".parse::<PrimaryDemotionAction>().expect("parse"),
            PrimaryDemotionAction::Hide
        );
        assert!("maximize".parse::<PrimaryDemotionAction>().is_err());
    }
}
