// SPDX-License-Identifier: CEPL-1.0
//! The frame loop and the event handling around it.
use tracing::{debug, error, info, trace, warn};

use crate::backend::Backend;
use crate::color::ColorInfo;
use crate::compositor::CompositorClock;
use crate::context::GraphicsContext;
use crate::error::{GpuError, GpuResult, RenderError};
use crate::notify::{Notification, NotificationQueue, Notifier};
use crate::swap_chain::{FrameTarget, PresentOptions, SwapChain};
use crate::RenderSize;

/// Content drawn every frame. The core hands over an open command list and
/// the frame's target; the scene records into the list and leaves it open.
pub trait Scene<B: Backend> {
    fn on_device_created(&mut self, _device: &B::Device) -> GpuResult<()> {
        Ok(())
    }

    fn on_size_changed(&mut self, _size: RenderSize, _scale: f32) {}

    /// `format_changed` means the target format differs from the last call
    /// and format-dependent state has to be rebuilt.
    fn on_color_info_changed(&mut self, _color: &ColorInfo, _format_changed: bool) {}

    fn initial_pipeline_state(&self) -> Option<&B::PipelineState> {
        None
    }

    fn record(&mut self, list: &mut B::CommandList, frame: &FrameTarget<'_, B>) -> GpuResult<()>;

    /// Called before the device is torn down, for loss or adapter change.
    fn on_device_released(&mut self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorState {
    NoError,
    /// Recovery in progress.
    DeviceLost,
    /// Terminal for this session.
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RendererOptions {
    pub max_in_flight_frames: u32,
    pub present: PresentOptions,
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self {
            max_in_flight_frames: 2,
            present: PresentOptions::default(),
        }
    }
}

struct Presentation<B: Backend> {
    swap_chain: SwapChain<B>,
    context: GraphicsContext<B>,
}

impl<B: Backend> Drop for Presentation<B> {
    fn drop(&mut self) {
        // The swap chain is dropped first; nothing may still reference it.
        if let Err(e) = self.context.wait_for_idle() {
            debug!("idle wait before teardown failed: {e}");
        }
    }
}

/// Drives [`GraphicsContext`] and [`SwapChain`] from window, display and
/// device events. Single-threaded; other threads talk to it through
/// [`Renderer::notifier`].
pub struct Renderer<B: Backend, S: Scene<B>> {
    presentation: Option<Presentation<B>>,
    scene: S,
    instance: B::Instance,
    clock: Box<dyn CompositorClock>,
    notifications: NotificationQueue,
    options: RendererOptions,

    error_state: ErrorState,
    device_recoveries: u32,
    size: RenderSize,
    scale: f32,
    color: ColorInfo,
    resizing: bool,
}

impl<B: Backend, S: Scene<B>> Renderer<B, S> {
    /// Creates an empty renderer; nothing touches the GPU until
    /// [`initialize`](Self::initialize).
    pub fn new(
        instance: B::Instance,
        scene: S,
        clock: Box<dyn CompositorClock>,
        options: RendererOptions,
    ) -> Self {
        Self {
            presentation: None,
            scene,
            instance,
            clock,
            notifications: NotificationQueue::new(),
            options,
            error_state: ErrorState::NoError,
            device_recoveries: 0,
            size: RenderSize::default(),
            scale: 1.0,
            color: ColorInfo::default(),
            resizing: false,
        }
    }

    pub fn initialize(
        &mut self,
        size: RenderSize,
        scale: f32,
        color: ColorInfo,
    ) -> Result<(), RenderError> {
        self.size = size;
        self.scale = scale;
        self.color = color;

        if size.is_empty() {
            info!("window has no area; device creation deferred");
            return Ok(());
        }
        self.build_or_fail()
    }

    pub fn notifier(&self) -> Notifier {
        self.notifications.notifier()
    }

    pub fn error_state(&self) -> ErrorState {
        self.error_state
    }

    /// How many times the device was rebuilt after a loss.
    pub fn device_recoveries(&self) -> u32 {
        self.device_recoveries
    }

    pub fn size(&self) -> RenderSize {
        self.size
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn color_info(&self) -> &ColorInfo {
        &self.color
    }

    pub fn is_paused(&self) -> bool {
        self.size.is_empty()
    }

    /// Between [`on_resize_started`](Self::on_resize_started) and
    /// [`on_resize_ended`](Self::on_resize_ended).
    pub fn is_resizing(&self) -> bool {
        self.resizing
    }

    pub fn scene(&self) -> &S {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut S {
        &mut self.scene
    }

    pub fn instance(&self) -> &B::Instance {
        &self.instance
    }

    pub fn swap_chain(&self) -> Option<&SwapChain<B>> {
        self.presentation.as_ref().map(|p| &p.swap_chain)
    }

    pub fn context(&self) -> Option<&GraphicsContext<B>> {
        self.presentation.as_ref().map(|p| &p.context)
    }

    /// Renders and presents one frame. A device loss anywhere in the frame
    /// triggers one rebuild and a re-render.
    pub fn render(&mut self) -> Result<(), RenderError> {
        self.ensure_running()?;
        if self.is_paused() {
            return Ok(());
        }
        if self.presentation.is_none() {
            self.build_or_fail()?;
        }

        let result = self.render_frame();
        self.settle(result)
    }

    /// No-op when nothing changed; otherwise resizes and renders.
    pub fn on_size_changed(&mut self, size: RenderSize, scale: f32) -> Result<(), RenderError> {
        self.ensure_running()?;
        if size == self.size && scale == self.scale {
            trace!("size unchanged");
            return Ok(());
        }

        let resized = size != self.size;
        self.size = size;
        self.scale = scale;

        if size.is_empty() {
            info!("window has no area; rendering paused");
            return Ok(());
        }

        let resize = match self.presentation.as_mut() {
            Some(p) if resized => p.swap_chain.resize(&mut p.context, size),
            _ => Ok(()),
        };
        if resize.is_err() {
            return self.settle(resize);
        }
        if self.presentation.is_some() {
            self.scene.on_size_changed(size, scale);
        }

        self.render()
    }

    /// Idempotent; a gesture may be reported more than once.
    pub fn on_resize_started(&mut self) {
        self.resizing = true;
        if let Some(p) = self.presentation.as_mut() {
            p.swap_chain.on_resize_started();
        }
    }

    pub fn on_resize_ended(&mut self) -> Result<(), RenderError> {
        self.ensure_running()?;
        self.resizing = false;

        let ended = match self.presentation.as_mut() {
            Some(p) => p.swap_chain.on_resize_ended(&mut p.context),
            None => Ok(false),
        };
        match ended {
            Ok(true) => self.render(),
            Ok(false) => Ok(()),
            Err(e) => self.settle(Err(e)),
        }
    }

    /// The window may now sit on a display driven by another adapter.
    pub fn on_window_position_changed(&mut self) -> Result<(), RenderError> {
        self.rebuild_on_better_adapter().map(|_| ())
    }

    pub fn on_display_topology_changed(&mut self) -> Result<(), RenderError> {
        debug!("display topology changed");
        self.rebuild_on_better_adapter().map(|_| ())
    }

    pub fn on_color_info_changed(&mut self, color: ColorInfo) -> Result<(), RenderError> {
        self.ensure_running()?;
        if color == self.color {
            return Ok(());
        }

        info!(
            kind = %color.kind,
            max_luminance = color.max_luminance,
            sdr_white_level = color.sdr_white_level,
            "display colour changed"
        );
        self.color = color;

        let changed = match self.presentation.as_mut() {
            Some(p) => p.swap_chain.on_color_info_changed(&mut p.context, &color),
            None => return Ok(()),
        };
        match changed {
            Ok(format_changed) => {
                self.scene.on_color_info_changed(&color, format_changed);
                self.render()
            }
            Err(e) => self.settle(Err(e)),
        }
    }

    /// Applies every queued notification. Returns how many were handled.
    pub fn process_notifications(&mut self) -> Result<usize, RenderError> {
        let pending: Vec<Notification> = self.notifications.drain().collect();
        for notification in &pending {
            match *notification {
                Notification::ColorInfoChanged(color) => self.on_color_info_changed(color)?,
                Notification::DisplayTopologyChanged => self.on_display_topology_changed()?,
            }
        }
        Ok(pending.len())
    }

    fn ensure_running(&self) -> Result<(), RenderError> {
        match self.error_state {
            ErrorState::Error => Err(RenderError::Terminated),
            _ => Ok(()),
        }
    }

    fn render_frame(&mut self) -> GpuResult<()> {
        let Some(p) = self.presentation.as_mut() else {
            return Ok(());
        };
        let Presentation {
            swap_chain,
            context,
        } = p;

        let frame = swap_chain.begin_frame(context)?;
        context.begin_frame(self.scene.initial_pipeline_state())?;
        self.scene.record(context.command_list_mut(), &frame)?;
        context.submit()?;

        swap_chain.end_frame(context, self.clock.as_ref())?;
        context.end_frame()
    }

    fn build_presentation(&mut self) -> GpuResult<()> {
        let mut context =
            GraphicsContext::initialize(&mut self.instance, self.options.max_in_flight_frames)?;
        self.scene.on_device_created(context.device())?;

        let mut swap_chain =
            SwapChain::initialize(&mut context, self.size, &self.color, self.options.present)?;
        if self.resizing {
            swap_chain.on_resize_started();
        }

        self.scene.on_size_changed(self.size, self.scale);
        self.scene.on_color_info_changed(&self.color, true);
        self.presentation = Some(Presentation {
            swap_chain,
            context,
        });
        Ok(())
    }

    fn build_or_fail(&mut self) -> Result<(), RenderError> {
        self.build_presentation().map_err(|e| {
            error!("renderer initialization failed: {e}");
            self.error_state = ErrorState::Error;
            RenderError::Initialization(e)
        })
    }

    fn teardown(&mut self) {
        self.scene.on_device_released();
        self.presentation = None;
    }

    /// Turns a frame-level result into the orchestrator's verdict.
    fn settle(&mut self, result: GpuResult<()>) -> Result<(), RenderError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_device_lost() => self.recover_from_device_loss(),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn recover_from_device_loss(&mut self) -> Result<(), RenderError> {
        self.error_state = ErrorState::DeviceLost;
        warn!(
            width = self.size.width,
            height = self.size.height,
            "device lost; rebuilding"
        );

        self.teardown();
        self.device_recoveries += 1;

        if self.is_paused() {
            // Rebuilt by the next render at a non-empty size.
            self.error_state = ErrorState::NoError;
            info!("window has no area; rebuild deferred");
            return Ok(());
        }

        match self.build_presentation().and_then(|()| self.render_frame()) {
            Ok(()) => {
                self.error_state = ErrorState::NoError;
                info!(recoveries = self.device_recoveries, "device recovered");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn rebuild_on_better_adapter(&mut self) -> Result<bool, RenderError> {
        self.ensure_running()?;

        let better = match &self.presentation {
            Some(p) => p.context.check_for_better_adapter(&mut self.instance),
            None => false,
        };
        if !better {
            return Ok(false);
        }

        info!("moving to a hardware adapter");
        self.teardown();
        if self.is_paused() {
            debug!("window has no area; rebuild deferred");
            return Ok(true);
        }
        self.build_or_fail()?;
        self.render()?;
        Ok(true)
    }

    fn fail(&mut self, e: GpuError) -> RenderError {
        error!("fatal render error: {e}");
        self.error_state = ErrorState::Error;
        RenderError::Fatal(e)
    }
}
