//! X connection backend.
//!
//! Owns the one connection to the channel's display. On init it selects
//! substructure redirect + notify on the root window, which makes this
//! process the window manager; if another client already holds that, init
//! fails and the process must exit.
//!
//! A dedicated pump thread receives X events. Work that only concerns the X
//! protocol — mapping unmanaged windows that ask to be mapped, honoring
//! their configure requests, tracking map order for claim recency — happens
//! right on the pump thread. Events about *managed* windows are forwarded to
//! the host event loop as [`WindowEvent`]s, because reacting to them mutates
//! manager state.

use crate::events::Event;
use crate::wm::geometry::Geometry;
use crate::wm::WindowEvent;
use anyhow::{Context, Result};
use log::{debug, error, warn};
use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex},
    thread,
};
use tokio::sync::mpsc;
use xcb::{randr, x, Xid};

/// Assumed DPI when computing the physical size randr wants alongside a
/// pixel size (96 dpi, in millimeters).
const MM_PER_PIXEL: f64 = 25.4 / 96.0;

/// State shared between the backend and the pump thread.
#[derive(Debug, Default)]
struct SharedWindowState {
    /// X windows currently in the management table.
    managed: HashSet<x::Window>,
    /// Top-level windows in the order the pump mapped them; later is more
    /// recent. Claim picks the most recent matching candidate.
    map_order: Vec<x::Window>,
}

pub struct XBackend {
    conn: Arc<xcb::Connection>,
    root: x::Window,
    default_root_size: (u16, u16),
    current_root_size: (u16, u16),
    shared: Arc<Mutex<SharedWindowState>>,
}

// xcb::Connection has no Debug implementation.
impl fmt::Debug for XBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XBackend")
            .field("root", &self.root)
            .field("default_root_size", &self.default_root_size)
            .field("current_root_size", &self.current_root_size)
            .finish_non_exhaustive()
    }
}

impl XBackend {
    /// Connect to `DISPLAY`, become the window manager and record the
    /// default root geometry.
    ///
    /// # Errors
    ///
    /// Fails when the display is unreachable or when another client
    /// already holds substructure redirect on the root window.
    pub fn init() -> Result<Self> {
        match std::env::var("DISPLAY") {
            Ok(display) => debug!("DISPLAY environment variable is {}", display),
            Err(_) => debug!("DISPLAY environment variable is not set"),
        }

        let (conn, screen_num) = xcb::Connection::connect(None).context(
            "couldn't connect to the x server, setting the DISPLAY \
            environment variable may solve the problem",
        )?;

        let setup = conn.get_setup();
        let screen = setup
            .roots()
            .nth(screen_num as usize)
            .context("x server reported no screen")?;
        let root = screen.root();
        let default_root_size = (screen.width_in_pixels(), screen.height_in_pixels());

        conn.send_and_check_request(&x::ChangeWindowAttributes {
            window: root,
            value_list: &[x::Cw::EventMask(
                x::EventMask::SUBSTRUCTURE_REDIRECT | x::EventMask::SUBSTRUCTURE_NOTIFY,
            )],
        })
        .context("couldn't select substructure redirect on the root window, \
            another window manager is probably running")?;

        debug!(
            "became window manager on root {:?} with default geometry {}x{}",
            root, default_root_size.0, default_root_size.1
        );

        Ok(Self {
            conn: Arc::new(conn),
            root,
            default_root_size,
            current_root_size: default_root_size,
            shared: Arc::new(Mutex::new(SharedWindowState::default())),
        })
    }

    #[must_use]
    pub fn default_root_size(&self) -> (u16, u16) {
        self.default_root_size
    }

    #[must_use]
    pub fn current_root_size(&self) -> (u16, u16) {
        self.current_root_size
    }

    pub fn add_managed(&self, window: x::Window) {
        self.shared.lock().unwrap().managed.insert(window);
    }

    pub fn remove_managed(&self, window: x::Window) {
        self.shared.lock().unwrap().managed.remove(&window);
    }

    /// Spawn the pump thread that receives X events for the lifetime of the
    /// connection. Errors from the connection surface as
    /// [`Event::XFatal`].
    pub fn spawn_event_pump(&self, event_tx: mpsc::Sender<Event>) {
        let conn = Arc::clone(&self.conn);
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("x-event-pump".to_string())
            .spawn(move || pump_events(&conn, &shared, &event_tx))
            .expect("spawning the x event pump thread failed");
    }

    /// Find a top-level window whose `WM_CLASS` contains `class` as a
    /// substring, preferring the most recently mapped candidate. Managed
    /// windows are skipped unless `include_managed`.
    pub fn find_window_by_class(
        &self,
        class: &str,
        include_managed: bool,
    ) -> Result<Option<x::Window>> {
        let tree_cookie = self.conn.send_request(&x::QueryTree { window: self.root });
        let tree = self
            .conn
            .wait_for_reply(tree_cookie)
            .context("QueryTree on the root window failed")?;
        let children = tree.children();

        let class_cookies: Vec<_> = children
            .iter()
            .map(|&child| {
                self.conn.send_request(&x::GetProperty {
                    delete: false,
                    window: child,
                    property: x::ATOM_WM_CLASS,
                    r#type: x::ATOM_STRING,
                    long_offset: 0,
                    long_length: 64,
                })
            })
            .collect();

        // Snapshot the shared state so the lock is not held across replies.
        let (managed, map_order) = {
            let shared = self.shared.lock().unwrap();
            (shared.managed.clone(), shared.map_order.clone())
        };

        let mut candidates = Vec::new();
        for (cookie, &window) in class_cookies.into_iter().zip(children) {
            let reply = match self.conn.wait_for_reply(cookie) {
                Ok(reply) => reply,
                Err(e) => {
                    // The window may have vanished between the query and
                    // the property read.
                    debug!("WM_CLASS read failed for {window:?}: {e}");
                    continue;
                }
            };
            if !include_managed && managed.contains(&window) {
                continue;
            }
            // WM_CLASS holds the instance and class names as consecutive
            // NUL-terminated strings; a substring match over the whole
            // property covers both.
            let wm_class = String::from_utf8_lossy(reply.value::<u8>());
            if wm_class.contains(class) {
                candidates.push(window);
            }
        }

        // The most recently mapped candidate wins. Windows the pump never
        // saw map (mapped before we started) rank oldest, in tree order.
        let best = candidates.iter().copied().max_by_key(|w| {
            map_order
                .iter()
                .position(|m| m == w)
                .map(|pos| pos as i64)
                .unwrap_or(-1)
        });
        Ok(best)
    }

    /// Move, resize and stack a window. With `above` the window is stacked
    /// directly above that sibling; without, it is pushed to the bottom.
    pub fn configure(
        &self,
        window: x::Window,
        geometry: Geometry,
        above: Option<x::Window>,
    ) -> Result<()> {
        let mut values = vec![
            x::ConfigWindow::X(i32::from(geometry.x)),
            x::ConfigWindow::Y(i32::from(geometry.y)),
            x::ConfigWindow::Width(u32::from(geometry.width)),
            x::ConfigWindow::Height(u32::from(geometry.height)),
        ];
        match above {
            Some(sibling) => {
                values.push(x::ConfigWindow::Sibling(sibling));
                values.push(x::ConfigWindow::StackMode(x::StackMode::Above));
            }
            None => values.push(x::ConfigWindow::StackMode(x::StackMode::Below)),
        }
        self.conn
            .send_and_check_request(&x::ConfigureWindow {
                window,
                value_list: &values,
            })
            .with_context(|| format!("configuring window {window:?} failed"))?;
        Ok(())
    }

    pub fn map(&self, window: x::Window) -> Result<()> {
        self.conn
            .send_and_check_request(&x::MapWindow { window })
            .with_context(|| format!("mapping window {window:?} failed"))?;
        Ok(())
    }

    pub fn unmap(&self, window: x::Window) -> Result<()> {
        self.conn
            .send_and_check_request(&x::UnmapWindow { window })
            .with_context(|| format!("unmapping window {window:?} failed"))?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.conn.flush().context("flushing the x connection failed")?;
        Ok(())
    }

    /// Resize the root window via randr.
    ///
    /// The crtc is disabled first so the screen size change is never
    /// constrained by the currently active mode, then re-enabled with a
    /// mode of the target size (created on the fly when the server doesn't
    /// have one).
    pub fn set_root_size(&mut self, (width, height): (u16, u16)) -> Result<()> {
        if (width, height) == self.current_root_size {
            return Ok(());
        }
        debug!("resizing root window to {width}x{height}");

        let res_cookie = self.conn.send_request(&randr::GetScreenResources {
            window: self.root,
        });
        let resources = self
            .conn
            .wait_for_reply(res_cookie)
            .context("GetScreenResources failed")?;
        let crtc = *resources
            .crtcs()
            .first()
            .context("x server reported no crtc")?;
        let output = *resources
            .outputs()
            .first()
            .context("x server reported no output")?;

        let crtc_cookie = self.conn.send_request(&randr::GetCrtcInfo {
            crtc,
            config_timestamp: x::CURRENT_TIME,
        });
        let crtc_info = self
            .conn
            .wait_for_reply(crtc_cookie)
            .context("GetCrtcInfo failed")?;

        let mode = self.find_or_create_mode(&resources, output, width, height)?;

        // Disable the crtc while the screen is resized.
        let disable_cookie = self.conn.send_request(&randr::SetCrtcConfig {
            crtc,
            timestamp: x::CURRENT_TIME,
            config_timestamp: x::CURRENT_TIME,
            x: 0,
            y: 0,
            mode: randr::Mode::none(),
            rotation: crtc_info.rotation(),
            outputs: &[],
        });
        self.conn
            .wait_for_reply(disable_cookie)
            .context("disabling the crtc failed")?;

        let mm_width = (f64::from(width) * MM_PER_PIXEL).round() as u32;
        let mm_height = (f64::from(height) * MM_PER_PIXEL).round() as u32;
        self.conn
            .send_and_check_request(&randr::SetScreenSize {
                window: self.root,
                width,
                height,
                mm_width,
                mm_height,
            })
            .context("SetScreenSize failed")?;

        let enable_cookie = self.conn.send_request(&randr::SetCrtcConfig {
            crtc,
            timestamp: x::CURRENT_TIME,
            config_timestamp: x::CURRENT_TIME,
            x: 0,
            y: 0,
            mode,
            rotation: crtc_info.rotation(),
            outputs: &[output],
        });
        self.conn
            .wait_for_reply(enable_cookie)
            .context("re-enabling the crtc failed")?;

        self.current_root_size = (width, height);
        Ok(())
    }

    /// Find a randr mode of the exact target size on the server, or create
    /// one and attach it to the output.
    fn find_or_create_mode(
        &self,
        resources: &randr::GetScreenResourcesReply,
        output: randr::Output,
        width: u16,
        height: u16,
    ) -> Result<randr::Mode> {
        if let Some(mode) = resources
            .modes()
            .iter()
            .find(|m| m.width == width && m.height == height)
        {
            let mode_id = mode.id;
            let output_cookie = self.conn.send_request(&randr::GetOutputInfo {
                output,
                config_timestamp: x::CURRENT_TIME,
            });
            let output_info = self
                .conn
                .wait_for_reply(output_cookie)
                .context("GetOutputInfo failed")?;
            if let Some(mode) = output_info
                .modes()
                .iter()
                .find(|m| m.resource_id() == mode_id)
            {
                return Ok(*mode);
            }
            // The server knows the mode but the output doesn't carry it
            // yet; fall through and attach it below.
        }

        let name = format!("{width}x{height}");
        let id = self.conn.generate_id::<randr::Mode>().resource_id();
        let create_cookie = self.conn.send_request(&randr::CreateMode {
            window: self.root,
            mode_info: randr::ModeInfo {
                id,
                width,
                height,
                name_len: name.len() as u16,
                // 60 fps; the remaining timings don't matter for a virtual
                // display.
                dot_clock: 60 * u32::from(width) * u32::from(height),
                hsync_start: 0,
                hsync_end: 0,
                htotal: width,
                hskew: 0,
                vsync_start: 0,
                vsync_end: 0,
                vtotal: height,
                mode_flags: randr::ModeFlag::empty(),
            },
            name: name.as_bytes(),
        });
        let created = self
            .conn
            .wait_for_reply(create_cookie)
            .context("CreateMode failed")?;
        let mode = created.mode();

        self.conn
            .send_and_check_request(&randr::AddOutputMode { output, mode })
            .context("AddOutputMode failed")?;
        Ok(mode)
    }
}

/// Pump thread body: receive X events until the connection dies.
fn pump_events(
    conn: &xcb::Connection,
    shared: &Mutex<SharedWindowState>,
    event_tx: &mpsc::Sender<Event>,
) {
    loop {
        let event = match conn.wait_for_event() {
            Ok(event) => event,
            Err(e) => {
                error!("x connection failed: {e}");
                let _ = event_tx.blocking_send(Event::XFatal {
                    message: e.to_string(),
                });
                return;
            }
        };

        let forward = match event {
            xcb::Event::X(x::Event::MapRequest(ev)) => {
                let window = ev.window();
                let is_managed = shared.lock().unwrap().managed.contains(&window);
                if is_managed {
                    Some(WindowEvent::MapRequest { window })
                } else {
                    // Unmanaged windows are mapped as requested; the claim
                    // logic uses the order they appeared in.
                    if let Err(e) = conn.send_and_check_request(&x::MapWindow { window }) {
                        warn!("mapping unmanaged window {window:?} failed: {e}");
                    }
                    let mut shared = shared.lock().unwrap();
                    shared.map_order.retain(|&w| w != window);
                    shared.map_order.push(window);
                    None
                }
            }
            xcb::Event::X(x::Event::ConfigureRequest(ev)) => {
                let window = ev.window();
                let is_managed = shared.lock().unwrap().managed.contains(&window);
                if is_managed {
                    Some(WindowEvent::ConfigureRequest { window })
                } else {
                    honor_configure_request(conn, &ev);
                    None
                }
            }
            xcb::Event::X(x::Event::DestroyNotify(ev)) => {
                let window = ev.window();
                let mut guard = shared.lock().unwrap();
                guard.map_order.retain(|&w| w != window);
                let is_managed = guard.managed.contains(&window);
                drop(guard);
                is_managed.then_some(WindowEvent::Destroyed { window })
            }
            _ => None,
        };

        if let Some(window_event) = forward {
            if event_tx
                .blocking_send(Event::Window(window_event))
                .is_err()
            {
                // The event loop is gone; shutdown is in progress.
                return;
            }
        }
    }
}

/// Apply an unmanaged window's configure request verbatim.
fn honor_configure_request(conn: &xcb::Connection, ev: &x::ConfigureRequestEvent) {
    let mask = ev.value_mask();
    let mut values = Vec::new();
    if mask.contains(x::ConfigWindowMask::X) {
        values.push(x::ConfigWindow::X(i32::from(ev.x())));
    }
    if mask.contains(x::ConfigWindowMask::Y) {
        values.push(x::ConfigWindow::Y(i32::from(ev.y())));
    }
    if mask.contains(x::ConfigWindowMask::WIDTH) {
        values.push(x::ConfigWindow::Width(u32::from(ev.width())));
    }
    if mask.contains(x::ConfigWindowMask::HEIGHT) {
        values.push(x::ConfigWindow::Height(u32::from(ev.height())));
    }
    if mask.contains(x::ConfigWindowMask::BORDER_WIDTH) {
        values.push(x::ConfigWindow::BorderWidth(u32::from(ev.border_width())));
    }
    if mask.contains(x::ConfigWindowMask::SIBLING) {
        values.push(x::ConfigWindow::Sibling(ev.sibling()));
    }
    if mask.contains(x::ConfigWindowMask::STACK_MODE) {
        values.push(x::ConfigWindow::StackMode(ev.stack_mode()));
    }
    if values.is_empty() {
        return;
    }
    if let Err(e) = conn.send_and_check_request(&x::ConfigureWindow {
        window: ev.window(),
        value_list: &values,
    }) {
        warn!(
            "honoring configure request for window {:?} failed: {e}",
            ev.window()
        );
    }
}
