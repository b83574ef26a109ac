// SPDX-License-Identifier: CEPL-1.0
//! Deterministic in-process backend.
//!
//! Every object shares one [`SimState`] that models the GPU queue as a FIFO
//! of pending operations. Nothing retires on its own: work completes only
//! when something waits on a fence, which makes every missing wait show up
//! as a [`SimViolation`]. Faults are injected through [`SimController`].
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::backend::{
    AdapterInfo, AdapterKind, Backend, CommandAllocator, CommandList, Device, Fence, Instance,
    LatencyWait, Queue, Swapchain, SwapchainDesc,
};
use crate::color::{ColorInfo, ColorSpace, PixelFormat};
use crate::compositor::CompositorClock;
use crate::error::{GpuError, GpuResult};
use crate::renderer::Scene;
use crate::swap_chain::FrameTarget;
use crate::RenderSize;

const MAX_BUFFERS: u32 = 16;

pub struct Sim;

impl Backend for Sim {
    type Instance = SimInstance;
    type Device = SimDevice;
    type Queue = SimQueue;
    type Fence = SimFence;
    type CommandAllocator = SimCommandAllocator;
    type CommandList = SimCommandList;
    type Swapchain = SimSwapchain;
    type RenderTarget = SimRenderTarget;
    type RenderTargetView = SimRenderTargetView;
    type PipelineState = SimPipelineState;
}

/// Failures the simulation can be told to produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimFault {
    /// Hardware adapters refuse device creation until the fault is cleared.
    RejectHardwareAdapters,
    /// The next device creation fails.
    FailDeviceCreation,
    /// The next present reports device removal.
    DeviceLostOnPresent,
    /// The next queue signal reports device removal.
    DeviceLostOnSignal,
    /// The next swapchain creation fails.
    FailSwapchainCreation,
    /// The next buffer resize fails with a generic error.
    FailResizeBuffers,
    /// The next buffer-index query reports an out-of-date surface.
    SurfaceOutdatedOnIndexQuery,
    /// The next frame-latency wait times out.
    LatencyTimeout,
}

impl SimFault {
    fn is_persistent(self) -> bool {
        matches!(self, SimFault::RejectHardwareAdapters)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimPresent {
    pub index: u32,
    pub buffer_count: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub color_space: ColorSpace,
    pub sync_interval: u32,
    /// Whether a submission wrote this buffer since it was last presented.
    pub rendered: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimResize {
    pub buffer_count: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// GPU operations still queued when the resize happened.
    pub pending_ops: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SimEvent {
    DeviceCreated { adapter: u32, generation: u32 },
    DeviceLost { generation: u32 },
    SwapchainCreated { buffer_count: u32, width: u32, height: u32, format: PixelFormat },
    MaxFrameLatency(u32),
    ColorSpaceSet(ColorSpace),
    LatencyWait(LatencyWait),
    FenceWait { value: u64 },
    AllocatorReset { allocator: usize },
    ResizeBuffers(SimResize),
    Present(SimPresent),
}

/// Protocol breaches caught by the simulation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimViolation {
    AllocatorResetInFlight { allocator: usize },
    ResizeWithPendingWork { pending_ops: usize },
    ResizeWithLiveBuffers { live: usize },
    StaleRenderTarget { index: u32 },
    RecordingIntoClosedList,
    ExecuteOpenList,
    WaitNeverSignaled { value: u64 },
}

enum GpuOp {
    Execute { allocator: Option<usize> },
    Signal { fence: usize, value: u64 },
    Present,
}

#[derive(Default)]
struct SimState {
    adapters: Vec<AdapterInfo>,
    adapters_epoch: u64,
    faults: Vec<SimFault>,

    generation: u32,
    lost: Vec<u32>,

    fences: Vec<u64>,
    allocators: usize,
    swapchain_epochs: Vec<u64>,

    pending: VecDeque<GpuOp>,
    /// Buffers written by a submission and not yet presented.
    rendered: Vec<(usize, u32)>,

    events: Vec<SimEvent>,
    violations: Vec<SimViolation>,
}

impl SimState {
    fn check(&self, generation: u32) -> GpuResult<()> {
        if self.lost.contains(&generation) {
            Err(GpuError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn has_fault(&self, fault: SimFault) -> bool {
        self.faults.contains(&fault)
    }

    fn take_fault(&mut self, fault: SimFault) -> bool {
        match self.faults.iter().position(|&f| f == fault) {
            Some(i) if !fault.is_persistent() => {
                self.faults.remove(i);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    fn lose_device(&mut self, generation: u32) {
        self.lost.push(generation);
        self.pending.clear();
        self.rendered.clear();
        self.events.push(SimEvent::DeviceLost { generation });
    }

    fn retire_one(&mut self) -> bool {
        let Some(op) = self.pending.pop_front() else {
            return false;
        };
        if let GpuOp::Signal { fence, value } = op {
            let completed = &mut self.fences[fence];
            *completed = (*completed).max(value);
        }
        true
    }

    fn retire_all(&mut self) {
        while self.retire_one() {}
    }
}

type Shared = Rc<RefCell<SimState>>;

/// Test-side handle onto the simulation.
#[derive(Clone)]
pub struct SimController {
    state: Shared,
}

impl SimController {
    pub fn inject(&self, fault: SimFault) {
        self.state.borrow_mut().faults.push(fault);
    }

    pub fn clear_fault(&self, fault: SimFault) {
        self.state.borrow_mut().faults.retain(|&f| f != fault);
    }

    /// Replaces the adapter list, as after a GPU hot-plug.
    pub fn set_adapters(&self, adapters: Vec<AdapterInfo>) {
        let mut state = self.state.borrow_mut();
        state.adapters = adapters;
        state.adapters_epoch += 1;
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }

    pub fn violations(&self) -> Vec<SimViolation> {
        self.state.borrow().violations.clone()
    }

    pub fn presents(&self) -> Vec<SimPresent> {
        self.filter_events(|e| match e {
            SimEvent::Present(p) => Some(*p),
            _ => None,
        })
    }

    pub fn resizes(&self) -> Vec<SimResize> {
        self.filter_events(|e| match e {
            SimEvent::ResizeBuffers(r) => Some(*r),
            _ => None,
        })
    }

    pub fn devices_created(&self) -> usize {
        self.filter_events(|e| match e {
            SimEvent::DeviceCreated { generation, .. } => Some(*generation),
            _ => None,
        })
        .len()
    }

    pub fn max_frame_latency(&self) -> Option<u32> {
        self.filter_events(|e| match e {
            SimEvent::MaxFrameLatency(frames) => Some(*frames),
            _ => None,
        })
        .last()
        .copied()
    }

    pub fn pending_ops(&self) -> usize {
        self.state.borrow().pending.len()
    }

    pub fn fence_count(&self) -> usize {
        self.state.borrow().fences.len()
    }

    /// Lets the GPU finish everything queued so far.
    pub fn retire_all(&self) {
        self.state.borrow_mut().retire_all();
    }

    fn filter_events<T>(&self, f: impl Fn(&SimEvent) -> Option<T>) -> Vec<T> {
        self.state.borrow().events.iter().filter_map(f).collect()
    }
}

pub struct SimInstance {
    state: Shared,
    seen_epoch: u64,
}

impl Default for SimInstance {
    fn default() -> Self {
        Self::new()
    }
}

impl SimInstance {
    /// One hardware adapter followed by the software fallback.
    pub fn new() -> Self {
        Self::with_adapters(vec![Self::hardware_adapter(0), Self::software_adapter(1)])
    }

    pub fn with_adapters(adapters: Vec<AdapterInfo>) -> Self {
        let state = SimState {
            adapters,
            ..SimState::default()
        };
        Self {
            state: Rc::new(RefCell::new(state)),
            seen_epoch: 0,
        }
    }

    pub fn hardware_adapter(ordinal: u32) -> AdapterInfo {
        AdapterInfo {
            ordinal,
            name: format!("Simulated GPU {ordinal}"),
            vendor_id: 0x10de,
            device_id: 0x2684,
            kind: AdapterKind::Hardware,
        }
    }

    /// Identifies itself the way WARP does.
    pub fn software_adapter(ordinal: u32) -> AdapterInfo {
        AdapterInfo {
            ordinal,
            name: "Simulated Basic Render Driver".into(),
            vendor_id: 0x1414,
            device_id: 0x8c,
            kind: AdapterKind::Software,
        }
    }

    pub fn controller(&self) -> SimController {
        SimController {
            state: self.state.clone(),
        }
    }
}

impl Instance<Sim> for SimInstance {
    fn enumerate_adapters(&mut self) -> GpuResult<Vec<AdapterInfo>> {
        let state = self.state.borrow();
        self.seen_epoch = state.adapters_epoch;
        Ok(state.adapters.clone())
    }

    fn create_device(&mut self, adapter: &AdapterInfo) -> GpuResult<SimDevice> {
        if !self.supports_device(adapter) {
            return Err(GpuError::call("create_device", "feature level not supported"));
        }

        let mut state = self.state.borrow_mut();
        if state.take_fault(SimFault::FailDeviceCreation) {
            return Err(GpuError::call("create_device", "E_OUTOFMEMORY"));
        }
        state.generation += 1;
        let generation = state.generation;
        state.events.push(SimEvent::DeviceCreated {
            adapter: adapter.ordinal,
            generation,
        });

        Ok(SimDevice {
            state: self.state.clone(),
            generation,
        })
    }

    fn supports_device(&mut self, adapter: &AdapterInfo) -> bool {
        let state = self.state.borrow();
        let known = state.adapters.iter().any(|a| a == adapter);
        let rejected = adapter.kind == AdapterKind::Hardware
            && state.has_fault(SimFault::RejectHardwareAdapters);
        known && !rejected
    }

    fn adapters_changed(&mut self) -> bool {
        self.state.borrow().adapters_epoch != self.seen_epoch
    }
}

pub struct SimDevice {
    state: Shared,
    generation: u32,
}

impl SimDevice {
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Device<Sim> for SimDevice {
    fn create_queue(&self) -> GpuResult<SimQueue> {
        self.state.borrow().check(self.generation)?;
        Ok(SimQueue {
            state: self.state.clone(),
            generation: self.generation,
        })
    }

    fn create_fence(&self, initial_value: u64) -> GpuResult<SimFence> {
        let mut state = self.state.borrow_mut();
        state.check(self.generation)?;
        state.fences.push(initial_value);
        Ok(SimFence {
            state: self.state.clone(),
            id: state.fences.len() - 1,
            generation: self.generation,
        })
    }

    fn create_command_allocator(&self) -> GpuResult<SimCommandAllocator> {
        let mut state = self.state.borrow_mut();
        state.check(self.generation)?;
        state.allocators += 1;
        Ok(SimCommandAllocator {
            state: self.state.clone(),
            id: state.allocators - 1,
            generation: self.generation,
        })
    }

    fn create_command_list(&self, _allocator: &SimCommandAllocator) -> GpuResult<SimCommandList> {
        self.state.borrow().check(self.generation)?;
        Ok(SimCommandList {
            state: self.state.clone(),
            generation: self.generation,
            open: false,
            allocator: None,
            initial_state: None,
            touched: Vec::new(),
            clears: Vec::new(),
        })
    }

    fn create_swapchain(&self, _queue: &SimQueue, desc: &SwapchainDesc) -> GpuResult<SimSwapchain> {
        let mut state = self.state.borrow_mut();
        state.check(self.generation)?;
        if state.take_fault(SimFault::FailSwapchainCreation) {
            return Err(GpuError::call("create_swapchain", "DXGI_ERROR_INVALID_CALL"));
        }
        validate_desc(desc)?;

        state.swapchain_epochs.push(0);
        state.events.push(SimEvent::SwapchainCreated {
            buffer_count: desc.buffer_count,
            width: desc.width,
            height: desc.height,
            format: desc.format,
        });

        Ok(SimSwapchain {
            state: self.state.clone(),
            id: state.swapchain_epochs.len() - 1,
            generation: self.generation,
            desc: *desc,
            current: 0,
            color_space: desc.color_space,
            buffers_alive: Rc::new(()),
        })
    }

    fn create_render_target_view(
        &self,
        target: &SimRenderTarget,
        format: PixelFormat,
    ) -> GpuResult<SimRenderTargetView> {
        self.state.borrow().check(self.generation)?;
        let compatible = match target.format {
            PixelFormat::Rgba8Unorm | PixelFormat::Rgba8UnormSrgb => {
                matches!(format, PixelFormat::Rgba8Unorm | PixelFormat::Rgba8UnormSrgb)
            }
            PixelFormat::Rgba16Float => format == PixelFormat::Rgba16Float,
        };
        if !compatible {
            return Err(GpuError::InvalidArgument(format!(
                "view format {format:?} on a {:?} buffer",
                target.format
            )));
        }
        Ok(SimRenderTargetView {
            target: target.clone(),
            format,
        })
    }
}

fn validate_desc(desc: &SwapchainDesc) -> GpuResult<()> {
    if desc.buffer_count < 2 || desc.buffer_count > MAX_BUFFERS {
        return Err(GpuError::InvalidArgument(format!(
            "buffer count {}",
            desc.buffer_count
        )));
    }
    if desc.width == 0 || desc.height == 0 {
        return Err(GpuError::InvalidArgument(format!(
            "size {}x{}",
            desc.width, desc.height
        )));
    }
    Ok(())
}

pub struct SimQueue {
    state: Shared,
    generation: u32,
}

impl Queue<Sim> for SimQueue {
    fn execute(&self, list: &SimCommandList) -> GpuResult<()> {
        let mut state = self.state.borrow_mut();
        state.check(self.generation)?;
        if list.open {
            state.violations.push(SimViolation::ExecuteOpenList);
        }
        state.rendered.extend(list.touched.iter().copied());
        state.pending.push_back(GpuOp::Execute {
            allocator: list.allocator,
        });
        Ok(())
    }

    fn signal(&self, fence: &SimFence, value: u64) -> GpuResult<()> {
        let mut state = self.state.borrow_mut();
        state.check(self.generation)?;
        if state.take_fault(SimFault::DeviceLostOnSignal) {
            state.lose_device(self.generation);
            return Err(GpuError::DeviceLost);
        }
        state.pending.push_back(GpuOp::Signal {
            fence: fence.id,
            value,
        });
        Ok(())
    }
}

pub struct SimFence {
    state: Shared,
    id: usize,
    generation: u32,
}

impl Fence for SimFence {
    fn completed_value(&self) -> GpuResult<u64> {
        let state = self.state.borrow();
        state.check(self.generation)?;
        Ok(state.fences[self.id])
    }

    /// Retires queued work in order until the value is reached.
    fn wait(&self, value: u64) -> GpuResult<()> {
        let mut state = self.state.borrow_mut();
        state.check(self.generation)?;
        state.events.push(SimEvent::FenceWait { value });

        while state.fences[self.id] < value {
            if !state.retire_one() {
                state.violations.push(SimViolation::WaitNeverSignaled { value });
                return Err(GpuError::call("wait", format!("fence value {value} never signalled")));
            }
        }
        Ok(())
    }
}

pub struct SimCommandAllocator {
    state: Shared,
    id: usize,
    generation: u32,
}

impl SimCommandAllocator {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl CommandAllocator for SimCommandAllocator {
    fn reset(&mut self) -> GpuResult<()> {
        let mut state = self.state.borrow_mut();
        state.check(self.generation)?;

        let in_flight = state.pending.iter().any(|op| {
            matches!(op, GpuOp::Execute { allocator: Some(a), .. } if *a == self.id)
        });
        if in_flight {
            state
                .violations
                .push(SimViolation::AllocatorResetInFlight { allocator: self.id });
        }
        state.events.push(SimEvent::AllocatorReset { allocator: self.id });
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimPipelineState {
    pub id: u32,
}

pub struct SimCommandList {
    state: Shared,
    generation: u32,
    open: bool,
    allocator: Option<usize>,
    initial_state: Option<SimPipelineState>,
    touched: Vec<(usize, u32)>,
    clears: Vec<[f32; 4]>,
}

impl SimCommandList {
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn initial_state(&self) -> Option<SimPipelineState> {
        self.initial_state
    }

    pub fn clears(&self) -> &[[f32; 4]] {
        &self.clears
    }

    /// Records a full-target clear.
    pub fn clear(&mut self, view: &SimRenderTargetView, color: [f32; 4]) {
        let mut state = self.state.borrow_mut();
        if !self.open {
            state.violations.push(SimViolation::RecordingIntoClosedList);
        }
        let target = &view.target;
        if state.swapchain_epochs[target.swapchain] != target.epoch {
            state
                .violations
                .push(SimViolation::StaleRenderTarget { index: target.index });
        }
        self.touched.push((target.swapchain, target.index));
        self.clears.push(color);
    }
}

impl CommandList<Sim> for SimCommandList {
    fn reset(
        &mut self,
        allocator: &SimCommandAllocator,
        initial_state: Option<&SimPipelineState>,
    ) -> GpuResult<()> {
        self.state.borrow().check(self.generation)?;
        self.open = true;
        self.allocator = Some(allocator.id);
        self.initial_state = initial_state.copied();
        self.touched.clear();
        self.clears.clear();
        Ok(())
    }

    fn close(&mut self) -> GpuResult<()> {
        self.state.borrow().check(self.generation)?;
        if !self.open {
            return Err(GpuError::call("close", "command list is not recording"));
        }
        self.open = false;
        Ok(())
    }
}

/// A swapchain buffer. Holding one keeps the ring from being resized.
#[derive(Clone, Debug)]
pub struct SimRenderTarget {
    pub swapchain: usize,
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    epoch: u64,
    _alive: Rc<()>,
}

#[derive(Clone, Debug)]
pub struct SimRenderTargetView {
    pub target: SimRenderTarget,
    pub format: PixelFormat,
}

pub struct SimSwapchain {
    state: Shared,
    id: usize,
    generation: u32,
    desc: SwapchainDesc,
    current: u32,
    color_space: ColorSpace,
    buffers_alive: Rc<()>,
}

impl Swapchain<Sim> for SimSwapchain {
    fn set_maximum_frame_latency(&mut self, frames: u32) -> GpuResult<()> {
        let mut state = self.state.borrow_mut();
        state.check(self.generation)?;
        if frames == 0 || frames > MAX_BUFFERS {
            return Err(GpuError::InvalidArgument(format!("frame latency {frames}")));
        }
        state.events.push(SimEvent::MaxFrameLatency(frames));
        Ok(())
    }

    fn wait_frame_latency(&mut self, _timeout: Duration) -> GpuResult<LatencyWait> {
        let mut state = self.state.borrow_mut();
        state.check(self.generation)?;
        let result = if state.take_fault(SimFault::LatencyTimeout) {
            LatencyWait::TimedOut
        } else {
            LatencyWait::Ready
        };
        state.events.push(SimEvent::LatencyWait(result));
        Ok(result)
    }

    fn current_buffer_index(&mut self) -> GpuResult<u32> {
        let mut state = self.state.borrow_mut();
        state.check(self.generation)?;
        if state.take_fault(SimFault::SurfaceOutdatedOnIndexQuery) {
            return Err(GpuError::SurfaceOutdated);
        }
        Ok(self.current)
    }

    fn buffer_count(&self) -> u32 {
        self.desc.buffer_count
    }

    fn buffer(&self, index: u32) -> GpuResult<SimRenderTarget> {
        let state = self.state.borrow();
        state.check(self.generation)?;
        if index >= self.desc.buffer_count {
            return Err(GpuError::InvalidArgument(format!("buffer {index}")));
        }
        Ok(SimRenderTarget {
            swapchain: self.id,
            index,
            width: self.desc.width,
            height: self.desc.height,
            format: self.desc.format,
            epoch: state.swapchain_epochs[self.id],
            _alive: self.buffers_alive.clone(),
        })
    }

    fn present(&mut self, _queue: &SimQueue, sync_interval: u32) -> GpuResult<()> {
        let mut state = self.state.borrow_mut();
        state.check(self.generation)?;
        if state.take_fault(SimFault::DeviceLostOnPresent) {
            state.lose_device(self.generation);
            return Err(GpuError::DeviceLost);
        }

        let key = (self.id, self.current);
        let rendered = state.rendered.contains(&key);
        state.rendered.retain(|&k| k != key);

        state.events.push(SimEvent::Present(SimPresent {
            index: self.current,
            buffer_count: self.desc.buffer_count,
            width: self.desc.width,
            height: self.desc.height,
            format: self.desc.format,
            color_space: self.color_space,
            sync_interval,
            rendered,
        }));
        state.pending.push_back(GpuOp::Present);

        self.current = (self.current + 1) % self.desc.buffer_count;
        Ok(())
    }

    fn resize_buffers(&mut self, desc: &SwapchainDesc) -> GpuResult<()> {
        let mut state = self.state.borrow_mut();
        state.check(self.generation)?;

        // DXGI refuses to resize while buffer references are alive.
        let live = Rc::strong_count(&self.buffers_alive) - 1;
        if live > 0 {
            state.violations.push(SimViolation::ResizeWithLiveBuffers { live });
            return Err(GpuError::call("resize_buffers", "outstanding buffer references"));
        }
        if state.take_fault(SimFault::FailResizeBuffers) {
            return Err(GpuError::call("resize_buffers", "E_FAIL"));
        }
        validate_desc(desc)?;

        let pending_ops = state.pending.len();
        if pending_ops > 0 {
            state
                .violations
                .push(SimViolation::ResizeWithPendingWork { pending_ops });
        }

        self.desc = *desc;
        self.current = 0;
        state.swapchain_epochs[self.id] += 1;
        let id = self.id;
        state.rendered.retain(|&(sc, _)| sc != id);
        state.events.push(SimEvent::ResizeBuffers(SimResize {
            buffer_count: desc.buffer_count,
            width: desc.width,
            height: desc.height,
            format: desc.format,
            pending_ops,
        }));
        Ok(())
    }

    fn set_color_space(&mut self, color_space: ColorSpace) -> GpuResult<()> {
        let mut state = self.state.borrow_mut();
        state.check(self.generation)?;
        self.color_space = color_space;
        state.events.push(SimEvent::ColorSpaceSet(color_space));
        Ok(())
    }
}

/// Compositor clock driven by hand. Time only moves when the code under
/// test sleeps or polls, or when a test calls [`advance`](Self::advance).
pub struct ManualCompositorClock {
    origin: Instant,
    offset: Cell<Duration>,
    next_composition: Cell<Option<Duration>>,
    has_compositor_clock: Cell<bool>,
    poll_step: Duration,
    sleeps: RefCell<Vec<Duration>>,
    relaxes: Cell<u32>,
    waits: Cell<u32>,
}

impl Default for ManualCompositorClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualCompositorClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Cell::new(Duration::ZERO),
            next_composition: Cell::new(None),
            has_compositor_clock: Cell::new(false),
            poll_step: Duration::from_micros(100),
            sleeps: RefCell::new(Vec::new()),
            relaxes: Cell::new(0),
            waits: Cell::new(0),
        }
    }

    pub fn set_compositor_clock(&self, available: bool) {
        self.has_compositor_clock.set(available);
    }

    /// Schedules the next composition `after` the current manual time.
    pub fn schedule_in(&self, after: Duration) {
        self.next_composition.set(Some(self.offset.get() + after));
    }

    pub fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }

    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }

    pub fn relax_count(&self) -> u32 {
        self.relaxes.get()
    }

    /// How many composition waits were started.
    pub fn waits(&self) -> u32 {
        self.waits.get()
    }
}

impl CompositorClock for ManualCompositorClock {
    fn wait_for_compositor_clock(&self) -> bool {
        self.waits.set(self.waits.get() + 1);
        self.has_compositor_clock.get()
    }

    fn next_composition(&self) -> Option<Instant> {
        self.next_composition.get().map(|at| self.origin + at)
    }

    fn now(&self) -> Instant {
        self.origin + self.offset.get()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
        self.advance(duration);
    }

    fn relax(&self) {
        self.relaxes.set(self.relaxes.get() + 1);
        self.advance(self.poll_step);
    }
}

impl CompositorClock for Rc<ManualCompositorClock> {
    fn wait_for_compositor_clock(&self) -> bool {
        self.as_ref().wait_for_compositor_clock()
    }

    fn next_composition(&self) -> Option<Instant> {
        self.as_ref().next_composition()
    }

    fn now(&self) -> Instant {
        self.as_ref().now()
    }

    fn sleep(&self, duration: Duration) {
        self.as_ref().sleep(duration)
    }

    fn relax(&self) {
        self.as_ref().relax()
    }
}

/// What [`SimScene`] saw for one recorded frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneFrame {
    pub index: u32,
    pub size: RenderSize,
    pub format: PixelFormat,
    pub brightness_boost: Option<f32>,
}

/// Clears the target, scaled by the brightness boost, and remembers every
/// callback it received.
pub struct SimScene {
    pub clear_color: [f32; 4],
    pipeline: Option<SimPipelineState>,
    frames: Vec<SceneFrame>,
    devices_created: u32,
    devices_released: u32,
    size_changes: Vec<(RenderSize, f32)>,
    color_changes: Vec<(ColorInfo, bool)>,
}

impl Default for SimScene {
    fn default() -> Self {
        Self::new([0.8, 0.8, 0.6, 1.0])
    }
}

impl SimScene {
    pub fn new(clear_color: [f32; 4]) -> Self {
        Self {
            clear_color,
            pipeline: None,
            frames: Vec::new(),
            devices_created: 0,
            devices_released: 0,
            size_changes: Vec::new(),
            color_changes: Vec::new(),
        }
    }

    pub fn frames(&self) -> &[SceneFrame] {
        &self.frames
    }

    pub fn last_frame(&self) -> Option<&SceneFrame> {
        self.frames.last()
    }

    pub fn devices_created(&self) -> u32 {
        self.devices_created
    }

    pub fn devices_released(&self) -> u32 {
        self.devices_released
    }

    pub fn size_changes(&self) -> &[(RenderSize, f32)] {
        &self.size_changes
    }

    pub fn color_changes(&self) -> &[(ColorInfo, bool)] {
        &self.color_changes
    }
}

impl Scene<Sim> for SimScene {
    fn on_device_created(&mut self, device: &SimDevice) -> GpuResult<()> {
        self.devices_created += 1;
        self.pipeline = Some(SimPipelineState {
            id: device.generation(),
        });
        Ok(())
    }

    fn on_size_changed(&mut self, size: RenderSize, scale: f32) {
        self.size_changes.push((size, scale));
    }

    fn on_color_info_changed(&mut self, color: &ColorInfo, format_changed: bool) {
        self.color_changes.push((*color, format_changed));
    }

    fn initial_pipeline_state(&self) -> Option<&SimPipelineState> {
        self.pipeline.as_ref()
    }

    fn record(&mut self, list: &mut SimCommandList, frame: &FrameTarget<'_, Sim>) -> GpuResult<()> {
        let boost = frame.brightness_boost.unwrap_or(1.0);
        let [r, g, b, a] = self.clear_color;
        list.clear(frame.view, [r * boost, g * boost, b * boost, a]);

        self.frames.push(SceneFrame {
            index: frame.index,
            size: frame.size,
            format: frame.format,
            brightness_boost: frame.brightness_boost,
        });
        Ok(())
    }

    fn on_device_released(&mut self) {
        self.devices_released += 1;
        self.pipeline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> (SimController, SimDevice) {
        let mut instance = SimInstance::new();
        let adapters = instance.enumerate_adapters().unwrap();
        let device = instance.create_device(&adapters[0]).unwrap();
        (instance.controller(), device)
    }

    fn desc(buffer_count: u32) -> SwapchainDesc {
        SwapchainDesc {
            buffer_count,
            width: 64,
            height: 64,
            format: PixelFormat::Rgba8Unorm,
            color_space: ColorSpace::SrgbNonLinear,
        }
    }

    #[test]
    fn work_retires_only_when_waited_on() {
        let (sim, device) = device();
        let queue = device.create_queue().unwrap();
        let fence = device.create_fence(0).unwrap();

        queue.signal(&fence, 1).unwrap();
        queue.signal(&fence, 2).unwrap();
        assert_eq!(fence.completed_value().unwrap(), 0);

        fence.wait(1).unwrap();
        assert_eq!(fence.completed_value().unwrap(), 1);
        assert_eq!(sim.pending_ops(), 1);
    }

    #[test]
    fn waiting_for_an_unsignalled_value_is_caught() {
        let (sim, device) = device();
        let fence = device.create_fence(0).unwrap();
        assert!(fence.wait(5).is_err());
        assert_eq!(sim.violations(), vec![SimViolation::WaitNeverSignaled { value: 5 }]);
    }

    #[test]
    fn resetting_a_busy_allocator_is_caught() {
        let (sim, device) = device();
        let queue = device.create_queue().unwrap();
        let mut allocator = device.create_command_allocator().unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();

        list.reset(&allocator, None).unwrap();
        list.close().unwrap();
        queue.execute(&list).unwrap();
        allocator.reset().unwrap();

        assert_eq!(
            sim.violations(),
            vec![SimViolation::AllocatorResetInFlight { allocator: 0 }]
        );
    }

    #[test]
    fn resize_refuses_live_buffers_and_flags_pending_work() {
        let (sim, device) = device();
        let queue = device.create_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        let mut swapchain = device.create_swapchain(&queue, &desc(3)).unwrap();

        let held = swapchain.buffer(0).unwrap();
        assert!(swapchain.resize_buffers(&desc(2)).is_err());
        drop(held);

        queue.signal(&fence, 1).unwrap();
        swapchain.resize_buffers(&desc(2)).unwrap();
        assert_eq!(
            sim.violations(),
            vec![
                SimViolation::ResizeWithLiveBuffers { live: 1 },
                SimViolation::ResizeWithPendingWork { pending_ops: 1 },
            ]
        );
    }

    #[test]
    fn stale_views_are_caught_after_resize() {
        let (sim, device) = device();
        let queue = device.create_queue().unwrap();
        let allocator = device.create_command_allocator().unwrap();
        let mut list = device.create_command_list(&allocator).unwrap();
        let mut swapchain = device.create_swapchain(&queue, &desc(3)).unwrap();

        let target = swapchain.buffer(1).unwrap();
        let view = device
            .create_render_target_view(&target, PixelFormat::Rgba8UnormSrgb)
            .unwrap();
        let stale = view.target.epoch;
        drop((target, view));
        swapchain.resize_buffers(&desc(3)).unwrap();

        let target = swapchain.buffer(1).unwrap();
        let mut view = device
            .create_render_target_view(&target, PixelFormat::Rgba8UnormSrgb)
            .unwrap();
        view.target.epoch = stale;

        list.reset(&allocator, None).unwrap();
        list.clear(&view, [0.0; 4]);
        assert_eq!(sim.violations(), vec![SimViolation::StaleRenderTarget { index: 1 }]);
    }

    #[test]
    fn lost_devices_fail_every_call() {
        let (sim, device) = device();
        let queue = device.create_queue().unwrap();
        let fence = device.create_fence(0).unwrap();

        sim.inject(SimFault::DeviceLostOnSignal);
        assert_eq!(queue.signal(&fence, 1), Err(GpuError::DeviceLost));
        assert_eq!(fence.completed_value(), Err(GpuError::DeviceLost));
        assert!(matches!(device.create_queue(), Err(GpuError::DeviceLost)));
    }

    #[test]
    fn hardware_rejection_persists() {
        let mut instance = SimInstance::new();
        instance.controller().inject(SimFault::RejectHardwareAdapters);
        let hardware = SimInstance::hardware_adapter(0);

        assert!(instance.create_device(&hardware).is_err());
        assert!(instance.create_device(&hardware).is_err());
        assert!(instance.supports_device(&SimInstance::software_adapter(1)));
    }

    #[test]
    fn presents_rotate_through_the_ring() {
        let (sim, device) = device();
        let queue = device.create_queue().unwrap();
        let mut swapchain = device.create_swapchain(&queue, &desc(3)).unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(swapchain.current_buffer_index().unwrap());
            assert_eq!(swapchain.current_buffer_index().unwrap(), *seen.last().unwrap());
            swapchain.present(&queue, 1).unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2, 0]);
        assert!(sim.presents().iter().all(|p| !p.rendered));
    }
}
