// SPDX-License-Identifier: CEPL-1.0
//! Frame presentation and synchronization core.
//!
//! The crate is generic over a [`Backend`]: [`GraphicsContext`] owns the
//! device timeline, [`SwapChain`] owns the presentable ring, and [`Renderer`]
//! drives both every frame and handles resize, colour and device-loss events.
//! [`sim`] is a deterministic in-process backend used by the test suites.

pub mod backend;
pub mod color;
pub mod compositor;
pub mod context;
pub mod error;
pub mod notify;
pub mod renderer;
pub mod sim;
pub mod swap_chain;

pub use backend::{
    AdapterInfo, AdapterKind, Backend, CommandAllocator, CommandList, Device, Fence, Instance,
    LatencyWait, Queue, Swapchain, SwapchainDesc,
};
pub use color::{ColorInfo, ColorKind, ColorSpace, PixelFormat, SurfaceFormat};
pub use compositor::{
    wait_for_next_composition, CompositionWait, CompositorClock, NullCompositorClock,
};
pub use context::GraphicsContext;
pub use error::{GpuError, GpuResult, RenderError};
pub use notify::{Notification, NotificationQueue, Notifier};
pub use renderer::{ErrorState, Renderer, RendererOptions, Scene};
pub use swap_chain::{FrameTarget, PresentOptions, PresentPath, SwapChain};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A window with no client area (minimized, or collapsed mid-drag).
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}
