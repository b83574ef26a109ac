// SPDX-License-Identifier: CEPL-1.0
//! The presentable-surface ring: buffer count, formats, and present timing.
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{Backend, Device, LatencyWait, Queue, Swapchain, SwapchainDesc};
use crate::color::{ColorInfo, ColorSpace, PixelFormat, SurfaceFormat};
use crate::compositor::{wait_for_next_composition, CompositorClock};
use crate::context::{wait_for_value, GraphicsContext};
use crate::error::{GpuError, GpuResult};
use crate::RenderSize;

/// Ring size while a live resize gesture is in progress.
pub const RESIZING_BUFFER_COUNT: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentOptions {
    /// Upper bound on the frame-latency wait; reaching it is not an error.
    pub frame_latency_timeout: Duration,
    /// Track per-buffer completion with a second fence.
    pub per_buffer_fence: bool,
}

impl Default for PresentOptions {
    fn default() -> Self {
        Self {
            frame_latency_timeout: Duration::from_millis(1000),
            per_buffer_fence: true,
        }
    }
}

/// How the next present is issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentPath {
    /// Vsynced present.
    Steady,
    /// First present after the ring was recreated: drain the GPU, line up
    /// with the compositor, then present without vsync.
    AfterRecreate,
}

impl PresentPath {
    pub fn sync_interval(self) -> u32 {
        match self {
            PresentPath::Steady => 1,
            PresentPath::AfterRecreate => 0,
        }
    }
}

/// What a scene renders into for one frame. Borrowed from the swap chain, so
/// it cannot outlive [`SwapChain::end_frame`].
pub struct FrameTarget<'a, B: Backend> {
    pub index: u32,
    pub target: &'a B::RenderTarget,
    pub view: &'a B::RenderTargetView,
    pub size: RenderSize,
    pub format: PixelFormat,
    pub color_space: ColorSpace,
    pub brightness_boost: Option<f32>,
}

struct RenderTargetSlot<B: Backend> {
    target: B::RenderTarget,
    view: B::RenderTargetView,
}

/// Owns the presentable ring and its view table. Never holds on to the
/// [`GraphicsContext`]; operations that need the GPU borrow it.
pub struct SwapChain<B: Backend> {
    // Views and buffer references must go before the swapchain itself.
    render_targets: Box<[Option<RenderTargetSlot<B>>]>,
    buffer_fence: Option<B::Fence>,
    buffer_fence_values: Box<[u64]>,
    buffer_fence_value: u64,
    swapchain: B::Swapchain,

    options: PresentOptions,
    in_flight_frames: u32,
    /// Requested ring size.
    buffer_count: u32,
    /// Ring size the swapchain actually has.
    image_count: u32,
    size: RenderSize,
    color: ColorInfo,
    format: SurfaceFormat,

    current_index: Option<u32>,
    latency_waited: bool,
    is_resizing: bool,
    is_recreated: bool,
}

impl<B: Backend> SwapChain<B> {
    pub fn initialize(
        ctx: &mut GraphicsContext<B>,
        size: RenderSize,
        color: &ColorInfo,
        options: PresentOptions,
    ) -> GpuResult<Self> {
        if size.is_empty() {
            return Err(GpuError::InvalidArgument(format!(
                "swap chain size {}x{}",
                size.width, size.height
            )));
        }

        let in_flight_frames = ctx.max_in_flight_frames();
        let buffer_count = in_flight_frames + 1;
        let format = color.surface_format();

        let desc = SwapchainDesc {
            buffer_count,
            width: size.width,
            height: size.height,
            format: format.buffer,
            color_space: format.color_space,
        };
        let mut swapchain = ctx.device().create_swapchain(ctx.queue(), &desc)?;
        swapchain.set_maximum_frame_latency(buffer_count - 1)?;
        swapchain.set_color_space(format.color_space)?;

        let buffer_fence = if options.per_buffer_fence {
            Some(ctx.device().create_fence(0)?)
        } else {
            None
        };

        let image_count = swapchain.buffer_count();
        let capacity = image_count.max(buffer_count).max(RESIZING_BUFFER_COUNT) as usize;

        let mut this = Self {
            render_targets: (0..capacity).map(|_| None).collect(),
            buffer_fence,
            buffer_fence_values: vec![0; capacity].into_boxed_slice(),
            buffer_fence_value: 0,
            swapchain,
            options,
            in_flight_frames,
            buffer_count,
            image_count,
            size,
            color: *color,
            format,
            current_index: None,
            latency_waited: false,
            is_resizing: false,
            is_recreated: false,
        };
        this.load_render_targets(ctx.device())?;

        info!(
            width = size.width,
            height = size.height,
            buffers = image_count,
            format = ?format.buffer,
            "swap chain created"
        );
        Ok(this)
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    pub fn image_count(&self) -> u32 {
        self.image_count
    }

    pub fn size(&self) -> RenderSize {
        self.size
    }

    pub fn color_info(&self) -> &ColorInfo {
        &self.color
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format.buffer
    }

    pub fn view_format(&self) -> PixelFormat {
        self.format.view
    }

    pub fn color_space(&self) -> ColorSpace {
        self.format.color_space
    }

    pub fn is_resizing(&self) -> bool {
        self.is_resizing
    }

    pub fn is_recreated(&self) -> bool {
        self.is_recreated
    }

    /// Waits for the frame-latency gate, picks the buffer the swapchain
    /// reports as current and waits until the GPU is done with it.
    pub fn begin_frame(&mut self, ctx: &mut GraphicsContext<B>) -> GpuResult<FrameTarget<'_, B>> {
        self.wait_frame_latency()?;

        let index = match self.swapchain.current_buffer_index() {
            Ok(index) => index,
            Err(GpuError::SurfaceOutdated) => {
                warn!("surface out of date; recreating buffers");
                let (size, color) = (self.size, self.color);
                self.recreate_buffers(ctx, size, &color)?;
                self.swapchain.current_buffer_index()?
            }
            Err(e) => return Err(e),
        };
        if index >= self.image_count {
            return Err(GpuError::call(
                "current_buffer_index",
                format!("index {index} outside a ring of {}", self.image_count),
            ));
        }

        if let Some(fence) = &self.buffer_fence {
            wait_for_value(fence, self.buffer_fence_values[index as usize])?;
        }
        self.current_index = Some(index);

        let slot = self.render_targets[index as usize]
            .as_ref()
            .ok_or_else(|| GpuError::call("begin_frame", "render target table not loaded"))?;

        Ok(FrameTarget {
            index,
            target: &slot.target,
            view: &slot.view,
            size: self.size,
            format: self.format.view,
            color_space: self.format.color_space,
            brightness_boost: self.color.brightness_boost(),
        })
    }

    /// Presents the frame started by [`begin_frame`](Self::begin_frame) and
    /// signals the per-buffer fence after the present is queued.
    pub fn end_frame(
        &mut self,
        ctx: &mut GraphicsContext<B>,
        clock: &dyn CompositorClock,
    ) -> GpuResult<PresentPath> {
        let index = self
            .current_index
            .take()
            .ok_or_else(|| GpuError::call("end_frame", "no frame in progress"))?;

        let path = if self.is_recreated {
            PresentPath::AfterRecreate
        } else {
            PresentPath::Steady
        };

        if path == PresentPath::AfterRecreate {
            // The old frame stays on screen until the compositor picks up the
            // new one; presenting right at a composition hides the seam.
            ctx.wait_for_idle()?;
            let waited = wait_for_next_composition(clock);
            debug!(?waited, "first present after recreation");
            self.is_recreated = false;
        }

        self.swapchain.present(ctx.queue(), path.sync_interval())?;
        self.latency_waited = false;

        if let Some(fence) = &self.buffer_fence {
            let value = self.buffer_fence_value + 1;
            ctx.queue().signal(fence, value)?;
            self.buffer_fence_value = value;
            self.buffer_fence_values[index as usize] = value;
        }
        Ok(path)
    }

    /// Applies a new size with the buffer count the resize state calls for.
    pub fn resize(&mut self, ctx: &mut GraphicsContext<B>, size: RenderSize) -> GpuResult<()> {
        if size.is_empty() {
            return Err(GpuError::InvalidArgument(format!(
                "swap chain size {}x{}",
                size.width, size.height
            )));
        }

        self.wait_frame_latency()?;
        self.buffer_count = self.target_buffer_count();
        let color = self.color;
        self.recreate_buffers(ctx, size, &color)
    }

    /// Drains the GPU, releases every buffer reference, resizes the ring and
    /// reloads the view table. The next present takes the
    /// [`PresentPath::AfterRecreate`] path.
    pub fn recreate_buffers(
        &mut self,
        ctx: &mut GraphicsContext<B>,
        size: RenderSize,
        color: &ColorInfo,
    ) -> GpuResult<()> {
        ctx.wait_for_idle()?;

        self.release_render_targets();
        self.current_index = None;

        let format = color.surface_format();
        self.swapchain.resize_buffers(&SwapchainDesc {
            buffer_count: self.buffer_count,
            width: size.width,
            height: size.height,
            format: format.buffer,
            color_space: format.color_space,
        })?;
        if format.color_space != self.format.color_space {
            self.swapchain.set_color_space(format.color_space)?;
        }

        self.size = size;
        self.color = *color;
        self.format = format;
        self.image_count = self.swapchain.buffer_count();
        // Everything retired during the idle wait.
        self.buffer_fence_values.fill(0);
        self.is_recreated = true;

        self.load_render_targets(ctx.device())?;

        info!(
            width = size.width,
            height = size.height,
            buffers = self.image_count,
            format = ?format.buffer,
            "swap chain buffers recreated"
        );
        Ok(())
    }

    pub fn on_resize_started(&mut self) {
        if !self.is_resizing {
            debug!("resize gesture started");
            self.is_resizing = true;
        }
    }

    /// Restores the full ring. Returns whether buffers were recreated.
    pub fn on_resize_ended(&mut self, ctx: &mut GraphicsContext<B>) -> GpuResult<bool> {
        self.is_resizing = false;

        let count = self.target_buffer_count();
        if count == self.buffer_count {
            debug!("resize gesture ended; ring unchanged");
            return Ok(false);
        }

        self.buffer_count = count;
        let (size, color) = (self.size, self.color);
        self.recreate_buffers(ctx, size, &color)?;
        Ok(true)
    }

    /// Recreates buffers only when the SDR / non-SDR split flips. Returns
    /// whether the pixel format changed.
    pub fn on_color_info_changed(
        &mut self,
        ctx: &mut GraphicsContext<B>,
        color: &ColorInfo,
    ) -> GpuResult<bool> {
        if color.uses_scrgb() == self.color.uses_scrgb() {
            self.color = *color;
            return Ok(false);
        }

        let size = self.size;
        self.recreate_buffers(ctx, size, color)?;
        Ok(true)
    }

    fn target_buffer_count(&self) -> u32 {
        if self.is_resizing {
            RESIZING_BUFFER_COUNT
        } else {
            self.in_flight_frames + 1
        }
    }

    fn wait_frame_latency(&mut self) -> GpuResult<()> {
        if self.latency_waited {
            return Ok(());
        }

        let timeout = self.options.frame_latency_timeout;
        if self.swapchain.wait_frame_latency(timeout)? == LatencyWait::TimedOut {
            warn!(timeout_ms = timeout.as_millis() as u64, "frame latency wait timed out");
        }
        self.latency_waited = true;
        Ok(())
    }

    fn release_render_targets(&mut self) {
        for slot in self.render_targets.iter_mut() {
            *slot = None;
        }
    }

    fn load_render_targets(&mut self, device: &B::Device) -> GpuResult<()> {
        let count = self.image_count as usize;
        if self.render_targets.len() < count {
            self.render_targets = (0..count).map(|_| None).collect();
            self.buffer_fence_values = vec![0; count].into_boxed_slice();
        }

        for index in 0..self.image_count {
            let target = self.swapchain.buffer(index)?;
            let view = device.create_render_target_view(&target, self.format.view)?;
            self.render_targets[index as usize] = Some(RenderTargetSlot { target, view });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorInfo;
    use crate::sim::{ManualCompositorClock, Sim, SimFault, SimInstance};

    fn setup(in_flight: u32) -> (SimInstance, GraphicsContext<Sim>, SwapChain<Sim>) {
        let mut instance = SimInstance::new();
        let mut ctx = GraphicsContext::<Sim>::initialize(&mut instance, in_flight).unwrap();
        let sc = SwapChain::initialize(
            &mut ctx,
            RenderSize::new(640, 480),
            &ColorInfo::sdr(),
            PresentOptions::default(),
        )
        .unwrap();
        (instance, ctx, sc)
    }

    fn frame(ctx: &mut GraphicsContext<Sim>, sc: &mut SwapChain<Sim>) -> PresentPath {
        let clock = ManualCompositorClock::new();
        {
            let target = sc.begin_frame(ctx).unwrap();
            let view = target.view.clone();
            ctx.begin_frame(None).unwrap();
            ctx.command_list_mut().clear(&view, [0.0, 0.0, 0.0, 1.0]);
        }
        ctx.submit().unwrap();
        let path = sc.end_frame(ctx, &clock).unwrap();
        ctx.end_frame().unwrap();
        path
    }

    #[test]
    fn ring_is_in_flight_plus_one() {
        let (instance, _ctx, sc) = setup(3);
        assert_eq!(sc.buffer_count(), 4);
        let max_latency = instance.controller().max_frame_latency();
        assert_eq!(max_latency, Some(3));
    }

    #[test]
    fn rejects_empty_size() {
        let mut instance = SimInstance::new();
        let mut ctx = GraphicsContext::<Sim>::initialize(&mut instance, 2).unwrap();
        let err = SwapChain::initialize(
            &mut ctx,
            RenderSize::new(0, 480),
            &ColorInfo::sdr(),
            PresentOptions::default(),
        )
        .err();
        assert!(matches!(err, Some(GpuError::InvalidArgument(_))));
    }

    #[test]
    fn steady_frames_present_with_vsync() {
        let (instance, mut ctx, mut sc) = setup(2);
        for _ in 0..5 {
            assert_eq!(frame(&mut ctx, &mut sc), PresentPath::Steady);
        }
        let presents = instance.controller().presents();
        assert_eq!(presents.len(), 5);
        assert!(presents.iter().all(|p| p.sync_interval == 1 && p.rendered));
        assert!(instance.controller().violations().is_empty());
    }

    #[test]
    fn first_present_after_resize_skips_vsync_once() {
        let (instance, mut ctx, mut sc) = setup(2);
        frame(&mut ctx, &mut sc);
        sc.resize(&mut ctx, RenderSize::new(800, 600)).unwrap();

        assert_eq!(frame(&mut ctx, &mut sc), PresentPath::AfterRecreate);
        assert_eq!(frame(&mut ctx, &mut sc), PresentPath::Steady);

        let intervals: Vec<u32> = instance
            .controller()
            .presents()
            .iter()
            .map(|p| p.sync_interval)
            .collect();
        assert_eq!(intervals, vec![1, 0, 1]);
    }

    #[test]
    fn latency_timeout_is_not_an_error() {
        let (instance, mut ctx, mut sc) = setup(2);
        instance.controller().inject(SimFault::LatencyTimeout);
        assert_eq!(frame(&mut ctx, &mut sc), PresentPath::Steady);
        assert_eq!(instance.controller().presents().len(), 1);
    }

    #[test]
    fn outdated_surface_is_recreated_in_place() {
        let (instance, mut ctx, mut sc) = setup(2);
        instance.controller().inject(SimFault::SurfaceOutdatedOnIndexQuery);

        assert_eq!(frame(&mut ctx, &mut sc), PresentPath::AfterRecreate);
        assert_eq!(instance.controller().resizes().len(), 1);
        assert!(instance.controller().violations().is_empty());
    }

    #[test]
    fn scalar_colour_change_keeps_buffers() {
        let (instance, mut ctx, mut sc) = setup(2);
        sc.on_color_info_changed(&mut ctx, &ColorInfo::hdr(4.0, 1.5))
            .unwrap();
        let changed = sc
            .on_color_info_changed(&mut ctx, &ColorInfo::hdr(8.0, 2.0))
            .unwrap();

        assert!(!changed);
        assert_eq!(instance.controller().resizes().len(), 1);
        assert_eq!(sc.color_info().brightness_boost(), Some(3.0));
    }

    #[test]
    fn without_buffer_fence_nothing_extra_is_signalled() {
        let mut instance = SimInstance::new();
        let mut ctx = GraphicsContext::<Sim>::initialize(&mut instance, 2).unwrap();
        let mut sc = SwapChain::initialize(
            &mut ctx,
            RenderSize::new(320, 200),
            &ColorInfo::sdr(),
            PresentOptions {
                per_buffer_fence: false,
                ..PresentOptions::default()
            },
        )
        .unwrap();

        frame(&mut ctx, &mut sc);
        frame(&mut ctx, &mut sc);
        assert_eq!(instance.controller().fence_count(), 1);
        assert!(instance.controller().violations().is_empty());
    }
}
