// SPDX-License-Identifier: CEPL-1.0
//! Device, queue, and the fence timeline every other component waits on.
use tracing::{debug, info, trace, warn};

use crate::backend::{
    AdapterInfo, AdapterKind, Backend, CommandAllocator, CommandList, Device, Fence, Instance,
    Queue,
};
use crate::error::{GpuError, GpuResult};

/// Owns the GPU device, one direct queue, one command allocator per
/// in-flight frame and the shared command list.
///
/// Fields are declared in teardown order: recording objects go before the
/// queue, and the device goes last.
pub struct GraphicsContext<B: Backend> {
    command_list: B::CommandList,
    allocators: Box<[B::CommandAllocator]>,
    frame_fence_values: Box<[u64]>,
    frame_index: usize,
    fence: B::Fence,
    fence_value: u64,
    queue: B::Queue,
    device: B::Device,
    adapter: AdapterInfo,
}

impl<B: Backend> GraphicsContext<B> {
    /// Creates the device on the first usable hardware adapter, falling back
    /// to a software adapter, then the queue, fence and recording objects.
    pub fn initialize(instance: &mut B::Instance, max_in_flight_frames: u32) -> GpuResult<Self> {
        if max_in_flight_frames == 0 {
            return Err(GpuError::InvalidArgument(
                "max_in_flight_frames must be at least 1".into(),
            ));
        }

        let (adapter, device) = create_device_with_fallback::<B>(instance)?;

        let queue = device.create_queue()?;
        let fence = device.create_fence(0)?;

        let allocators = (0..max_in_flight_frames)
            .map(|_| device.create_command_allocator())
            .collect::<GpuResult<Vec<_>>>()?
            .into_boxed_slice();
        let command_list = device.create_command_list(&allocators[0])?;

        info!(
            adapter = %adapter.name,
            software = adapter.is_software(),
            in_flight = max_in_flight_frames,
            "graphics context ready"
        );

        Ok(Self {
            command_list,
            allocators,
            frame_fence_values: vec![0; max_in_flight_frames as usize].into_boxed_slice(),
            frame_index: 0,
            fence,
            fence_value: 0,
            queue,
            device,
            adapter,
        })
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn queue(&self) -> &B::Queue {
        &self.queue
    }

    pub fn command_list_mut(&mut self) -> &mut B::CommandList {
        &mut self.command_list
    }

    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub fn is_software_adapter(&self) -> bool {
        self.adapter.is_software()
    }

    pub fn max_in_flight_frames(&self) -> u32 {
        self.allocators.len() as u32
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index as u32
    }

    pub fn last_signaled_value(&self) -> u64 {
        self.fence_value
    }

    pub fn completed_value(&self) -> GpuResult<u64> {
        self.fence.completed_value()
    }

    /// Enqueues a signal of the next fence value and returns that value.
    pub fn signal(&mut self) -> GpuResult<u64> {
        let value = self.fence_value + 1;
        self.queue.signal(&self.fence, value)?;
        self.fence_value = value;
        Ok(value)
    }

    pub fn wait_for_fence_value(&self, value: u64) -> GpuResult<()> {
        wait_for_value(&self.fence, value)
    }

    /// Drains the queue. Required before anything destructive.
    pub fn wait_for_idle(&mut self) -> GpuResult<()> {
        let value = self.signal()?;
        self.wait_for_fence_value(value)?;
        debug!(fence = value, "gpu idle");
        Ok(())
    }

    /// Waits for the slot being reused, then resets its allocator and the
    /// shared command list. Returns the slot index; the slot advances in
    /// [`end_frame`](Self::end_frame).
    pub fn begin_frame(&mut self, initial_state: Option<&B::PipelineState>) -> GpuResult<u32> {
        let slot = self.frame_index;
        self.wait_for_fence_value(self.frame_fence_values[slot])?;

        let allocator = &mut self.allocators[slot];
        allocator.reset()?;
        self.command_list.reset(allocator, initial_state)?;
        Ok(slot as u32)
    }

    /// Closes the command list and hands it to the queue.
    pub fn submit(&mut self) -> GpuResult<()> {
        self.command_list.close()?;
        self.queue.execute(&self.command_list)
    }

    pub fn end_frame(&mut self) -> GpuResult<()> {
        let value = self.signal()?;
        self.frame_fence_values[self.frame_index] = value;
        self.frame_index = (self.frame_index + 1) % self.allocators.len();
        trace!(fence = value, next_slot = self.frame_index, "frame retired to queue");
        Ok(())
    }

    /// True when running on a software adapter and a hardware adapter that
    /// can host a device has appeared. The caller then rebuilds everything.
    pub fn check_for_better_adapter(&self, instance: &mut B::Instance) -> bool {
        if !self.adapter.is_software() || !instance.adapters_changed() {
            return false;
        }

        let adapters = match instance.enumerate_adapters() {
            Ok(adapters) => adapters,
            Err(e) => {
                warn!("adapter enumeration failed: {e}");
                return false;
            }
        };

        let better = adapters
            .iter()
            .filter(|a| a.kind == AdapterKind::Hardware)
            .find(|a| instance.supports_device(a));
        if let Some(adapter) = better {
            info!(adapter = %adapter.name, "hardware adapter available");
            return true;
        }
        false
    }
}

impl<B: Backend> Drop for GraphicsContext<B> {
    fn drop(&mut self) {
        if let Err(e) = self.wait_for_idle() {
            debug!("idle wait on teardown failed: {e}");
        }
    }
}

/// Fast path when `value` already retired, otherwise blocks on the fence.
pub(crate) fn wait_for_value<F: Fence>(fence: &F, value: u64) -> GpuResult<()> {
    if fence.completed_value()? >= value {
        return Ok(());
    }
    trace!(fence = value, "blocking on fence");
    fence.wait(value)
}

fn create_device_with_fallback<B: Backend>(
    instance: &mut B::Instance,
) -> GpuResult<(AdapterInfo, B::Device)> {
    let adapters = instance.enumerate_adapters()?;

    let hardware = adapters.iter().filter(|a| a.kind == AdapterKind::Hardware);
    let software = adapters.iter().filter(|a| a.kind == AdapterKind::Software);

    for adapter in hardware.chain(software) {
        match instance.create_device(adapter) {
            Ok(device) => return Ok((adapter.clone(), device)),
            Err(e) => debug!(adapter = %adapter.name, "device creation failed: {e}"),
        }
    }
    Err(GpuError::NoAdapter)
}
