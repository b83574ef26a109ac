// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use lumen_core::init_tracing;
use lumen_platform::color::with_env_overrides;
use lumen_platform::{
    default_clock, install_shell_hook, ColorProbe, ColorWatcher, ResizeGesture, ShellEvent,
};
use lumen_render::{RenderError, RenderSize, Renderer};
use lumen_render_vk::{ClearScene, VkBackend, VkInstance};
use tracing::{debug, error, info, warn};

use lumen_platform::winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop, EventLoopProxy},
    window::{Window, WindowId},
};

mod config;

use config::{load_cfg, parse_cfg, AppCfg, ColorCfg};

/// How often the colour probe re-reads the configuration.
const COLOR_PROBE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, default_value = "lumen.toml")]
    config: PathBuf,
    /// Frames the CPU may record ahead of the GPU (overrides the config)
    #[arg(long)]
    max_in_flight: Option<u32>,
    /// Never wait for the compositor after the swap chain is recreated
    #[arg(long)]
    no_compositor_sync: bool,
}

type VkRenderer = Renderer<VkBackend, ClearScene>;

struct App {
    args: Args,
    cfg: AppCfg,
    proxy: EventLoopProxy<ShellEvent>,
    gesture: ResizeGesture,

    // Dropped in this order: the renderer's surface belongs to the window.
    probe: Option<ColorWatcher>,
    renderer: Option<VkRenderer>,
    window: Option<Window>,

    failure: Option<anyhow::Error>,
    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn new(args: Args, cfg: AppCfg, proxy: EventLoopProxy<ShellEvent>) -> Self {
        Self {
            args,
            cfg,
            proxy,
            gesture: ResizeGesture::default(),
            probe: None,
            renderer: None,
            window: None,
            failure: None,
            frames: 0,
            last_fps_instant: Instant::now(),
        }
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = event_loop
            .create_window(Window::default_attributes().with_title("lumen"))
            .context("create_window")?;

        match install_shell_hook(&window, self.proxy.clone(), self.gesture.clone()) {
            Ok(true) => debug!("resize gestures reported by the shell hook"),
            Ok(false) => debug!("no shell hook on this platform"),
            Err(e) => warn!("shell hook unavailable: {e:#}"),
        }

        let instance = VkInstance::new(&window, &window).context("vulkan instance")?;

        let mut options = self.cfg.render.renderer_options();
        if let Some(n) = self.args.max_in_flight {
            options.max_in_flight_frames = n;
        }
        let clock = default_clock(self.cfg.render.compositor_sync && !self.args.no_compositor_sync);
        let scene = ClearScene::new(self.cfg.render.clear_color);
        let mut renderer = Renderer::new(instance, scene, clock, options);

        let color = with_env_overrides(self.cfg.color.color_info());
        let scale = window.scale_factor() as f32;
        renderer
            .initialize(render_size(window.inner_size()), scale, color)
            .context("renderer initialization")?;

        info!(
            in_flight = options.max_in_flight_frames,
            kind = %color.kind,
            "renderer ready"
        );

        let proxy = Mutex::new(self.proxy.clone());
        let notifier = renderer.notifier().with_waker(move || {
            if let Ok(proxy) = proxy.lock() {
                let _ = proxy.send_event(ShellEvent::Notified);
            }
        });
        let path = self.args.config.clone();
        let startup = self.cfg.color;
        let sampler = move || with_env_overrides(sample_color(&path, startup).color_info());
        match ColorProbe::new(color, notifier).spawn(COLOR_PROBE_INTERVAL, sampler) {
            Ok(watcher) => self.probe = Some(watcher),
            Err(e) => warn!("colour probe not started: {e}"),
        }

        window.request_redraw();
        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    /// Stops the loop on a terminal renderer error.
    fn check(&mut self, event_loop: &ActiveEventLoop, result: Result<(), RenderError>) {
        if let Err(e) = result {
            error!("{e}");
            self.fail(event_loop, anyhow::Error::new(e));
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        if self.failure.is_none() {
            self.failure = Some(e);
        }
        self.shutdown(event_loop);
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.probe = None;
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }
}

impl ApplicationHandler<ShellEvent> for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.failure.is_some() {
            return;
        }
        if let Err(e) = self.start(event_loop) {
            error!("startup failed: {e:#}");
            self.fail(event_loop, e);
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        match &self.window {
            Some(window) if window.id() == window_id => {}
            _ => return,
        }
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        let result = match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
                return;
            }
            WindowEvent::Resized(size) => {
                // The gesture's first size change can overtake ResizeStarted.
                if self.gesture.is_active() && !renderer.is_resizing() {
                    renderer.on_resize_started();
                }
                let scale = renderer.scale();
                renderer.on_size_changed(render_size(size), scale)
            }
            WindowEvent::ScaleFactorChanged { scale_factor, .. } => {
                let size = renderer.size();
                renderer.on_size_changed(size, scale_factor as f32)
            }
            WindowEvent::Moved(_) => renderer.on_window_position_changed(),
            WindowEvent::RedrawRequested => {
                let result = renderer.render();
                if result.is_ok() && !renderer.is_paused() {
                    self.frames = self.frames.saturating_add(1);
                }
                result
            }
            _ => Ok(()),
        };
        self.check(event_loop, result);
    }

    fn user_event(&mut self, event_loop: &ActiveEventLoop, event: ShellEvent) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        let result = match event {
            ShellEvent::ResizeStarted => {
                renderer.on_resize_started();
                Ok(())
            }
            ShellEvent::ResizeEnded => renderer.on_resize_ended(),
            ShellEvent::DisplayChanged => renderer.on_display_topology_changed(),
            ShellEvent::Notified => renderer.process_notifications().map(|n| {
                debug!(handled = n, "notifications applied");
            }),
        };
        self.check(event_loop, result);
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(renderer), Some(window)) = (&self.renderer, &self.window) else {
            return;
        };

        // Vsync paces the loop; a paused renderer sleeps until the next event.
        event_loop.set_control_flow(ControlFlow::Wait);
        if !renderer.is_paused() {
            window.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            debug!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn render_size(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize::new(size.width, size.height)
}

/// The `[color]` section as it is on disk now; `fallback` while the file is
/// missing or mid-edit.
fn sample_color(path: &Path, fallback: ColorCfg) -> ColorCfg {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| parse_cfg(&s).ok())
        .map_or(fallback, |cfg| cfg.color)
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = load_cfg(&args.config);
    info!(config = %args.config.display(), "starting");

    let event_loop = EventLoop::<ShellEvent>::with_user_event().build()?;
    event_loop.set_control_flow(ControlFlow::Wait);

    let mut app = App::new(args, cfg, event_loop.create_proxy());
    event_loop.run_app(&mut app)?;

    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_render::ColorInfo;

    #[test]
    fn flags_override_nothing_by_default() {
        let args = Args::try_parse_from(["lumen-app"]).unwrap();
        assert_eq!(args.config, PathBuf::from("lumen.toml"));
        assert_eq!(args.max_in_flight, None);
        assert!(!args.no_compositor_sync);
    }

    #[test]
    fn flags_parse() {
        let args = Args::try_parse_from([
            "lumen-app",
            "--config",
            "other.toml",
            "--max-in-flight",
            "3",
            "--no-compositor-sync",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("other.toml"));
        assert_eq!(args.max_in_flight, Some(3));
        assert!(args.no_compositor_sync);
    }

    #[test]
    fn colour_sample_falls_back_without_a_file() {
        let fallback = ColorCfg::default();
        let sampled = sample_color(Path::new("no/such/lumen.toml"), fallback);
        assert_eq!(sampled, fallback);
        assert_eq!(sampled.color_info(), ColorInfo::sdr());
    }
}
