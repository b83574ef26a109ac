// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Window-shell collaborators of the renderer: winit, compositor timing,
//! the live-resize hook and the display colour probe.
pub use winit;

pub mod clock;
pub mod color;
#[cfg(windows)]
mod win32;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use lumen_render::{CompositorClock, NullCompositorClock};
use tracing::info;
use winit::event_loop::EventLoopProxy;
use winit::window::Window;

pub use color::{ColorProbe, ColorWatcher};
#[cfg(windows)]
pub use win32::DwmCompositorClock;

/// Events the shell posts to the winit loop from outside winit's own
/// event stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShellEvent {
    /// The user grabbed a window edge or the title bar.
    ResizeStarted,
    ResizeEnded,
    /// Monitors were added, removed or rearranged.
    DisplayChanged,
    /// Something was queued on the renderer's notification queue.
    Notified,
}

/// Whether a live-resize gesture is in progress, as the window procedure
/// sees it. Set before the gesture's first size change is delivered, while
/// [`ShellEvent::ResizeStarted`] still waits in the event queue.
#[derive(Clone, Debug, Default)]
pub struct ResizeGesture(Arc<AtomicBool>);

impl ResizeGesture {
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn set_active(&self, active: bool) {
        self.0.store(active, Ordering::Release);
    }
}

/// The platform's compositor clock, or one that never waits when
/// `compositor_sync` is off or the platform has none.
pub fn default_clock(compositor_sync: bool) -> Box<dyn CompositorClock> {
    if !compositor_sync {
        info!("compositor sync disabled");
        return Box::new(NullCompositorClock);
    }
    #[cfg(windows)]
    {
        Box::new(win32::DwmCompositorClock::new())
    }
    #[cfg(not(windows))]
    {
        info!("no compositor clock on this platform");
        Box::new(NullCompositorClock)
    }
}

/// Reports live-resize gestures and display changes through `proxy`, and
/// tracks the gesture synchronously in `gesture`. Returns `false` where the
/// platform has no such notifications.
pub fn install_shell_hook(
    window: &Window,
    proxy: EventLoopProxy<ShellEvent>,
    gesture: ResizeGesture,
) -> Result<bool> {
    #[cfg(windows)]
    {
        win32::install_shell_hook(window, proxy, gesture)?;
        Ok(true)
    }
    #[cfg(not(windows))]
    {
        let _ = (window, proxy, gesture);
        Ok(false)
    }
}
