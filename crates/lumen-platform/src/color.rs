// SPDX-License-Identifier: CEPL-1.0
//! Display colour probe.
//!
//! There is no portable way to sample a monitor's advanced-colour state, so
//! the probe publishes whatever its sampler reports (configuration plus the
//! `LUMEN_*` environment overrides in the binary) and only when it changes.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use lumen_core::env_override;
use lumen_render::{ColorInfo, ColorKind, Notification, Notifier};
use tracing::{debug, info, warn};

pub const COLOR_KIND_VAR: &str = "LUMEN_COLOR_KIND";
pub const MAX_LUMINANCE_VAR: &str = "LUMEN_MAX_LUMINANCE";
pub const SDR_WHITE_LEVEL_VAR: &str = "LUMEN_SDR_WHITE_LEVEL";

/// `base` with the `LUMEN_*` environment overrides applied.
pub fn with_env_overrides(base: ColorInfo) -> ColorInfo {
    apply_overrides(
        base,
        env_override::<ColorKind>(COLOR_KIND_VAR),
        env_override::<f32>(MAX_LUMINANCE_VAR),
        env_override::<f32>(SDR_WHITE_LEVEL_VAR),
    )
}

fn apply_overrides(
    base: ColorInfo,
    kind: Option<ColorKind>,
    max_luminance: Option<f32>,
    sdr_white_level: Option<f32>,
) -> ColorInfo {
    sanitize(ColorInfo {
        kind: kind.unwrap_or(base.kind),
        max_luminance: max_luminance.unwrap_or(base.max_luminance),
        sdr_white_level: sdr_white_level.unwrap_or(base.sdr_white_level),
    })
}

/// Normalizes a reported colour descriptor. SDR and WCG displays carry
/// unit luminance scales; HDR scales below 1.0 (or not finite) become 1.0.
pub fn sanitize(color: ColorInfo) -> ColorInfo {
    let scale = |v: f32, name: &str| {
        if v.is_finite() && v >= 1.0 {
            v
        } else {
            warn!("{name} {v} is not a scale of at least 1.0; using 1.0");
            1.0
        }
    };
    match color.kind {
        ColorKind::StandardDynamicRange => ColorInfo::sdr(),
        ColorKind::WideColorGamut => ColorInfo::wide_color_gamut(),
        ColorKind::HighDynamicRange => ColorInfo::hdr(
            scale(color.max_luminance, "max_luminance"),
            scale(color.sdr_white_level, "sdr_white_level"),
        ),
    }
}

/// Forwards colour changes to the renderer's notification queue.
pub struct ColorProbe {
    last: ColorInfo,
    notifier: Notifier,
}

impl ColorProbe {
    /// `initial` is what the renderer was initialized with.
    pub fn new(initial: ColorInfo, notifier: Notifier) -> Self {
        Self {
            last: initial,
            notifier,
        }
    }

    pub fn current(&self) -> ColorInfo {
        self.last
    }

    /// Queues `sample` if it differs from the last published value.
    /// Returns whether something was sent.
    pub fn publish(&mut self, sample: ColorInfo) -> bool {
        if sample == self.last {
            return false;
        }
        debug!(kind = %sample.kind, "display colour sample changed");
        self.last = sample;
        self.notifier.notify(Notification::ColorInfoChanged(sample))
    }

    /// Re-samples every `interval` on a background thread until the
    /// returned watcher is dropped or the renderer's queue goes away.
    pub fn spawn(
        mut self,
        interval: Duration,
        mut sample: impl FnMut() -> ColorInfo + Send + 'static,
    ) -> std::io::Result<ColorWatcher> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name("lumen-color-probe".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    let next = sample();
                    if next != self.last && !self.publish(next) {
                        info!("renderer gone; colour probe stopping");
                        break;
                    }
                    thread::park_timeout(interval);
                }
            })?;
        Ok(ColorWatcher {
            stop,
            thread: Some(thread),
        })
    }
}

/// Stops and joins the probe thread on drop.
pub struct ColorWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for ColorWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                warn!("colour probe thread panicked");
            }
        }
    }
}
