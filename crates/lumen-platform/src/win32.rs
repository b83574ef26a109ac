// SPDX-License-Identifier: CEPL-1.0
use std::ffi::c_void;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use lumen_render::compositor::MAX_COMPOSITION_WAIT;
use lumen_render::CompositorClock;
use tracing::{debug, info, trace, warn};
use windows::core::{s, w};
use windows::Win32::Foundation::{HANDLE, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::Graphics::Dwm::{DwmGetCompositionTimingInfo, DWM_TIMING_INFO};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};
use windows::Win32::System::Performance::{QueryPerformanceCounter, QueryPerformanceFrequency};
use windows::Win32::UI::Shell::{DefSubclassProc, RemoveWindowSubclass, SetWindowSubclass};
use windows::Win32::UI::WindowsAndMessaging::{
    WM_DISPLAYCHANGE, WM_ENTERSIZEMOVE, WM_EXITSIZEMOVE, WM_NCDESTROY,
};
use winit::event_loop::EventLoopProxy;
use winit::raw_window_handle::{HasWindowHandle, RawWindowHandle};
use winit::window::Window;

use crate::clock::counter_to_instant;
use crate::{ResizeGesture, ShellEvent};

/// `DCompositionWaitForCompositorClock` (dcomp.dll, Windows 11).
type WaitForCompositorClock =
    unsafe extern "system" fn(count: u32, handles: *const HANDLE, timeout_ms: u32) -> u32;

const WAIT_FAILED: u32 = 0xFFFF_FFFF;

/// Compositor timing from DirectComposition where available, DWM timing
/// info otherwise.
pub struct DwmCompositorClock {
    wait_fn: Option<WaitForCompositorClock>,
    frequency: u64,
}

impl DwmCompositorClock {
    pub fn new() -> Self {
        let wait_fn = resolve_wait_for_compositor_clock();
        let mut frequency = 0i64;
        if let Err(e) = unsafe { QueryPerformanceFrequency(&mut frequency) } {
            warn!("QueryPerformanceFrequency: {e}");
        }
        info!(
            compositor_clock = wait_fn.is_some(),
            qpc_frequency = frequency,
            "compositor timing source"
        );
        Self {
            wait_fn,
            frequency: frequency.max(0) as u64,
        }
    }
}

impl Default for DwmCompositorClock {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_wait_for_compositor_clock() -> Option<WaitForCompositorClock> {
    let module = unsafe { LoadLibraryW(w!("dcomp.dll")) }.ok()?;
    let proc = unsafe { GetProcAddress(module, s!("DCompositionWaitForCompositorClock")) }?;
    // SAFETY: the export has exactly this signature.
    Some(unsafe { std::mem::transmute::<_, WaitForCompositorClock>(proc) })
}

impl CompositorClock for DwmCompositorClock {
    fn wait_for_compositor_clock(&self) -> bool {
        let Some(wait) = self.wait_fn else {
            return false;
        };
        let timeout_ms = MAX_COMPOSITION_WAIT.as_millis() as u32;
        let result = unsafe { wait(0, std::ptr::null(), timeout_ms) };
        result != WAIT_FAILED
    }

    fn next_composition(&self) -> Option<Instant> {
        let mut info = DWM_TIMING_INFO {
            cbSize: std::mem::size_of::<DWM_TIMING_INFO>() as u32,
            ..Default::default()
        };
        if let Err(e) = unsafe { DwmGetCompositionTimingInfo(HWND::default(), &mut info) } {
            trace!("DwmGetCompositionTimingInfo: {e}");
            return None;
        }

        let mut now = 0i64;
        unsafe { QueryPerformanceCounter(&mut now) }.ok()?;
        Some(counter_to_instant(
            Instant::now(),
            now.max(0) as u64,
            info.qpcCompose,
            self.frequency,
        ))
    }

    fn sleep(&self, duration: Duration) {
        // std uses a high-resolution waitable timer on Windows 10 1803+.
        std::thread::sleep(duration);
    }
}

/// Subclass id; any constant unique to this crate will do.
const SUBCLASS_ID: usize = 0x4c55_4d45;

struct HookState {
    proxy: EventLoopProxy<ShellEvent>,
    gesture: ResizeGesture,
}

pub(crate) fn install_shell_hook(
    window: &Window,
    proxy: EventLoopProxy<ShellEvent>,
    gesture: ResizeGesture,
) -> Result<()> {
    let handle = window.window_handle().map_err(|e| anyhow!("{e}"))?;
    let RawWindowHandle::Win32(raw) = handle.as_raw() else {
        bail!("not a Win32 window");
    };
    let hwnd = HWND(raw.hwnd.get() as *mut c_void);

    let state = Box::into_raw(Box::new(HookState { proxy, gesture }));
    let installed =
        unsafe { SetWindowSubclass(hwnd, Some(shell_subclass_proc), SUBCLASS_ID, state as usize) };
    if !installed.as_bool() {
        // SAFETY: never handed to the window.
        drop(unsafe { Box::from_raw(state) });
        bail!("SetWindowSubclass failed");
    }
    debug!("shell hook installed");
    Ok(())
}

unsafe extern "system" fn shell_subclass_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
    _id: usize,
    data: usize,
) -> LRESULT {
    let state = data as *mut HookState;
    let event = match msg {
        WM_ENTERSIZEMOVE => Some(ShellEvent::ResizeStarted),
        WM_EXITSIZEMOVE => Some(ShellEvent::ResizeEnded),
        WM_DISPLAYCHANGE => Some(ShellEvent::DisplayChanged),
        WM_NCDESTROY => {
            unsafe {
                let _ = RemoveWindowSubclass(hwnd, Some(shell_subclass_proc), SUBCLASS_ID);
                drop(Box::from_raw(state));
            }
            return unsafe { DefSubclassProc(hwnd, msg, wparam, lparam) };
        }
        _ => None,
    };

    if let Some(event) = event {
        // SAFETY: `state` lives until WM_NCDESTROY.
        let state = unsafe { &*state };
        // The proxy event is queued; WM_SIZE of the same gesture is not.
        match event {
            ShellEvent::ResizeStarted => state.gesture.set_active(true),
            ShellEvent::ResizeEnded => state.gesture.set_active(false),
            _ => {}
        }
        if state.proxy.send_event(event).is_err() {
            trace!(?event, "event loop already closed");
        }
    }
    unsafe { DefSubclassProc(hwnd, msg, wparam, lparam) }
}
