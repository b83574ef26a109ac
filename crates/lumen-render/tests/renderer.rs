// SPDX-License-Identifier: CEPL-1.0
use std::rc::Rc;
use std::thread;

use lumen_render::sim::{
    ManualCompositorClock, Sim, SimController, SimFault, SimInstance, SimScene,
};
use lumen_render::{
    ColorInfo, ColorSpace, ErrorState, GpuError, Notification, PixelFormat, RenderError,
    RenderSize, Renderer, RendererOptions,
};

type SimRenderer = Renderer<Sim, SimScene>;

fn start_with(
    instance: SimInstance,
    size: RenderSize,
) -> (SimController, Rc<ManualCompositorClock>, SimRenderer) {
    let controller = instance.controller();
    let clock = Rc::new(ManualCompositorClock::new());
    let mut renderer = Renderer::new(
        instance,
        SimScene::default(),
        Box::new(clock.clone()),
        RendererOptions::default(),
    );
    renderer.initialize(size, 1.0, ColorInfo::sdr()).unwrap();
    (controller, clock, renderer)
}

fn start() -> (SimController, Rc<ManualCompositorClock>, SimRenderer) {
    start_with(SimInstance::new(), RenderSize::new(800, 600))
}

#[test]
fn resize_drains_the_gpu_and_presents_once_without_vsync() {
    let (sim, clock, mut r) = start();
    r.render().unwrap();
    r.on_size_changed(RenderSize::new(1200, 900), 1.0).unwrap();

    let resizes = sim.resizes();
    assert_eq!(resizes.len(), 1);
    assert_eq!((resizes[0].width, resizes[0].height), (1200, 900));
    assert_eq!(resizes[0].buffer_count, 3);
    assert_eq!(resizes[0].pending_ops, 0);

    let presents = sim.presents();
    assert_eq!(presents.len(), 2);
    assert_eq!((presents[0].width, presents[0].sync_interval), (800, 1));
    assert_eq!((presents[1].width, presents[1].sync_interval), (1200, 0));
    assert!(presents[1].rendered);
    assert_eq!(clock.waits(), 1);

    let last = r.scene().last_frame().unwrap();
    assert_eq!(last.size, RenderSize::new(1200, 900));
    assert_eq!(r.scene().size_changes().last(), Some(&(RenderSize::new(1200, 900), 1.0)));

    r.render().unwrap();
    assert_eq!(sim.presents().last().unwrap().sync_interval, 1);
    assert!(sim.violations().is_empty());
}

#[test]
fn identical_size_is_a_no_op() {
    let (sim, _clock, mut r) = start();
    r.on_size_changed(RenderSize::new(1024, 768), 1.0).unwrap();
    let presents = sim.presents().len();

    r.on_size_changed(RenderSize::new(1024, 768), 1.0).unwrap();
    assert_eq!(sim.resizes().len(), 1);
    assert_eq!(sim.presents().len(), presents);
}

#[test]
fn scale_change_alone_renders_without_recreating() {
    let (sim, _clock, mut r) = start();
    r.on_size_changed(RenderSize::new(800, 600), 1.5).unwrap();

    assert!(sim.resizes().is_empty());
    assert_eq!(sim.presents().len(), 1);
    assert_eq!(r.scale(), 1.5);
    assert_eq!(r.scene().size_changes().last(), Some(&(RenderSize::new(800, 600), 1.5)));
}

#[test]
fn live_resize_shrinks_the_ring_to_two() {
    let (sim, _clock, mut r) = start();
    r.on_resize_started();
    r.on_size_changed(RenderSize::new(900, 700), 1.0).unwrap();
    r.on_size_changed(RenderSize::new(950, 720), 1.0).unwrap();

    assert!(sim.resizes().iter().all(|rs| rs.buffer_count == 2));
    assert!(sim.presents().iter().all(|p| p.buffer_count == 2));

    r.on_resize_ended().unwrap();
    let last_resize = *sim.resizes().last().unwrap();
    assert_eq!(last_resize.buffer_count, 3);
    assert_eq!((last_resize.width, last_resize.height), (950, 720));

    let last_present = *sim.presents().last().unwrap();
    assert_eq!(last_present.buffer_count, 3);
    assert_eq!(last_present.sync_interval, 0);
    assert!(sim.violations().is_empty());
}

#[test]
fn gesture_without_size_change_keeps_the_ring() {
    let (sim, _clock, mut r) = start();
    r.on_resize_started();
    r.on_resize_ended().unwrap();

    assert!(sim.resizes().is_empty());
    assert!(sim.presents().is_empty());
}

#[test]
fn repeated_gesture_start_keeps_the_live_ring() {
    let (sim, _clock, mut r) = start();
    r.on_resize_started();
    r.on_size_changed(RenderSize::new(900, 700), 1.0).unwrap();
    assert!(r.is_resizing());

    // A late second report of the same gesture changes nothing.
    r.on_resize_started();
    r.on_size_changed(RenderSize::new(950, 720), 1.0).unwrap();
    assert!(sim.resizes().iter().all(|rs| rs.buffer_count == 2));

    r.on_resize_ended().unwrap();
    assert!(!r.is_resizing());
    assert_eq!(sim.resizes().last().unwrap().buffer_count, 3);
}

#[test]
fn zero_size_pauses_until_restored() {
    let (sim, _clock, mut r) = start();
    r.render().unwrap();

    r.on_size_changed(RenderSize::new(0, 0), 1.0).unwrap();
    assert!(r.is_paused());
    r.render().unwrap();
    assert_eq!(sim.presents().len(), 1);

    r.on_size_changed(RenderSize::new(800, 600), 1.0).unwrap();
    assert!(!r.is_paused());
    assert_eq!(sim.presents().len(), 2);
    assert!(sim.violations().is_empty());
}

#[test]
fn empty_initial_size_defers_device_creation() {
    let (sim, _clock, mut r) = start_with(SimInstance::new(), RenderSize::new(0, 0));
    assert!(r.context().is_none());
    assert_eq!(sim.devices_created(), 0);

    r.on_size_changed(RenderSize::new(640, 480), 1.0).unwrap();
    assert_eq!(sim.devices_created(), 1);
    assert_eq!(r.swap_chain().unwrap().size(), RenderSize::new(640, 480));
    assert_eq!(sim.presents().len(), 1);
}

#[test]
fn colour_changes_follow_the_display() {
    let (sim, _clock, mut r) = start();
    r.render().unwrap();

    r.on_color_info_changed(ColorInfo::hdr(4.0, 1.5)).unwrap();
    assert_eq!(sim.resizes().len(), 1);
    assert_eq!(sim.resizes()[0].format, PixelFormat::Rgba16Float);
    assert_eq!(sim.presents().last().unwrap().color_space, ColorSpace::ScRgbLinear);
    assert_eq!(r.scene().last_frame().unwrap().brightness_boost, Some(2.5));
    assert_eq!(r.scene().last_frame().unwrap().format, PixelFormat::Rgba16Float);
    assert_eq!(r.scene().color_changes().last(), Some(&(ColorInfo::hdr(4.0, 1.5), true)));

    // Same format, new boost: no recreation.
    r.on_color_info_changed(ColorInfo::hdr(4.0, 2.0)).unwrap();
    assert_eq!(sim.resizes().len(), 1);
    assert_eq!(r.scene().last_frame().unwrap().brightness_boost, Some(3.0));
    assert_eq!(r.scene().color_changes().last(), Some(&(ColorInfo::hdr(4.0, 2.0), false)));

    r.on_color_info_changed(ColorInfo::sdr()).unwrap();
    assert_eq!(sim.resizes().len(), 2);
    assert_eq!(r.scene().last_frame().unwrap().brightness_boost, None);
    assert_eq!(r.scene().last_frame().unwrap().format, PixelFormat::Rgba8UnormSrgb);
    assert_eq!(sim.presents().last().unwrap().color_space, ColorSpace::SrgbNonLinear);
    assert!(sim.violations().is_empty());
}

#[test]
fn repeated_colour_info_does_nothing() {
    let (sim, _clock, mut r) = start();
    r.on_color_info_changed(ColorInfo::sdr()).unwrap();
    assert!(sim.presents().is_empty());
    assert_eq!(r.scene().color_changes().len(), 1);
}

#[test]
fn device_loss_at_present_is_recovered_once() {
    let (sim, _clock, mut r) = start();
    r.on_size_changed(RenderSize::new(1200, 900), 1.0).unwrap();
    r.on_color_info_changed(ColorInfo::hdr(4.0, 1.5)).unwrap();
    let before = *sim.presents().last().unwrap();
    let presents_before = sim.presents().len();
    assert_eq!(r.scene().last_frame().unwrap().brightness_boost, Some(2.5));

    sim.inject(SimFault::DeviceLostOnPresent);
    r.render().unwrap();

    assert_eq!(r.error_state(), ErrorState::NoError);
    assert_eq!(r.device_recoveries(), 1);
    assert_eq!(sim.devices_created(), 2);
    assert_eq!(r.scene().devices_created(), 2);
    assert_eq!(r.scene().devices_released(), 1);

    // The rebuilt device renders what the lost one did.
    let presents = sim.presents();
    assert_eq!(presents.len(), presents_before + 1);
    let after = *presents.last().unwrap();
    assert!(after.rendered);
    assert_eq!((after.width, after.height), (1200, 900));
    assert_eq!((before.width, before.height), (1200, 900));
    assert_eq!(after.format, before.format);
    assert_eq!(after.format, PixelFormat::Rgba16Float);
    assert_eq!(after.color_space, before.color_space);
    assert_eq!(after.color_space, ColorSpace::ScRgbLinear);
    assert_eq!(r.scene().last_frame().unwrap().brightness_boost, Some(2.5));

    r.render().unwrap();
    assert_eq!(r.device_recoveries(), 1);
    assert!(sim.violations().is_empty());
}

#[test]
fn device_loss_at_signal_is_recovered() {
    let (sim, _clock, mut r) = start();
    sim.inject(SimFault::DeviceLostOnSignal);
    r.render().unwrap();

    assert_eq!(r.device_recoveries(), 1);
    assert_eq!(r.error_state(), ErrorState::NoError);
    assert!(sim.violations().is_empty());
}

#[test]
fn device_loss_while_minimized_rebuilds_on_restore() {
    let (sim, _clock, mut r) = start();
    r.render().unwrap();
    r.on_size_changed(RenderSize::new(0, 0), 1.0).unwrap();

    sim.inject(SimFault::DeviceLostOnSignal);
    r.on_color_info_changed(ColorInfo::hdr(4.0, 1.5)).unwrap();

    assert_eq!(r.error_state(), ErrorState::NoError);
    assert_eq!(r.device_recoveries(), 1);
    assert!(r.context().is_none());
    assert_eq!(sim.devices_created(), 1);
    assert_eq!(sim.presents().len(), 1);

    r.on_size_changed(RenderSize::new(800, 600), 1.0).unwrap();
    assert_eq!(sim.devices_created(), 2);
    assert_eq!(r.swap_chain().unwrap().size(), RenderSize::new(800, 600));
    let last = *sim.presents().last().unwrap();
    assert!(last.rendered);
    assert_eq!(last.color_space, ColorSpace::ScRgbLinear);
    assert_eq!(r.scene().last_frame().unwrap().brightness_boost, Some(2.5));
    assert!(sim.violations().is_empty());
}

#[test]
fn loss_during_recovery_is_fatal() {
    let (sim, _clock, mut r) = start();
    sim.inject(SimFault::DeviceLostOnPresent);
    sim.inject(SimFault::DeviceLostOnPresent);

    let err = r.render().unwrap_err();
    assert!(matches!(err, RenderError::Fatal(GpuError::DeviceLost)));
    assert_eq!(r.error_state(), ErrorState::Error);
    assert_eq!(r.device_recoveries(), 1);

    assert!(matches!(r.render(), Err(RenderError::Terminated)));
    assert!(matches!(
        r.on_size_changed(RenderSize::new(10, 10), 1.0),
        Err(RenderError::Terminated)
    ));
}

#[test]
fn non_device_errors_are_fatal() {
    let (sim, _clock, mut r) = start();
    sim.inject(SimFault::FailResizeBuffers);

    let err = r.on_size_changed(RenderSize::new(300, 300), 1.0).unwrap_err();
    assert!(matches!(err, RenderError::Fatal(GpuError::Call { op: "resize_buffers", .. })));
    assert_eq!(r.error_state(), ErrorState::Error);
    assert_eq!(r.device_recoveries(), 0);
}

#[test]
fn initialization_without_adapters_fails() {
    let instance = SimInstance::with_adapters(Vec::new());
    let mut r: SimRenderer = Renderer::new(
        instance,
        SimScene::default(),
        Box::new(lumen_render::NullCompositorClock),
        RendererOptions::default(),
    );

    let err = r
        .initialize(RenderSize::new(800, 600), 1.0, ColorInfo::sdr())
        .unwrap_err();
    assert!(matches!(err, RenderError::Initialization(GpuError::NoAdapter)));
    assert_eq!(err.gpu_error(), Some(&GpuError::NoAdapter));
    assert_eq!(r.error_state(), ErrorState::Error);
}

#[test]
fn notifications_from_other_threads_apply_on_processing() {
    let (sim, _clock, mut r) = start();
    let notifier = r.notifier();

    thread::spawn(move || {
        notifier.notify(Notification::ColorInfoChanged(ColorInfo::hdr(6.0, 2.0)));
        notifier.notify(Notification::DisplayTopologyChanged);
    })
    .join()
    .unwrap();

    // Nothing happens until the render thread drains the queue.
    assert_eq!(r.color_info(), &ColorInfo::sdr());

    assert_eq!(r.process_notifications().unwrap(), 2);
    assert_eq!(r.color_info(), &ColorInfo::hdr(6.0, 2.0));
    assert_eq!(sim.resizes().len(), 1);
    assert_eq!(r.process_notifications().unwrap(), 0);
}

#[test]
fn software_device_moves_to_new_hardware() {
    let instance = SimInstance::with_adapters(vec![SimInstance::software_adapter(0)]);
    let (sim, _clock, mut r) = start_with(instance, RenderSize::new(800, 600));
    assert!(r.context().unwrap().is_software_adapter());

    r.on_window_position_changed().unwrap();
    assert_eq!(sim.devices_created(), 1);

    sim.set_adapters(vec![
        SimInstance::hardware_adapter(0),
        SimInstance::software_adapter(1),
    ]);
    r.on_display_topology_changed().unwrap();

    assert!(!r.context().unwrap().is_software_adapter());
    assert_eq!(sim.devices_created(), 2);
    assert_eq!(r.scene().devices_released(), 1);
    assert_eq!(sim.presents().len(), 1);
    assert_eq!(r.device_recoveries(), 0);

    r.on_display_topology_changed().unwrap();
    assert_eq!(sim.devices_created(), 2);
}

#[test]
fn new_hardware_while_minimized_is_picked_up_on_restore() {
    let instance = SimInstance::with_adapters(vec![SimInstance::software_adapter(0)]);
    let (sim, _clock, mut r) = start_with(instance, RenderSize::new(800, 600));
    r.render().unwrap();
    r.on_size_changed(RenderSize::new(0, 0), 1.0).unwrap();

    sim.set_adapters(vec![
        SimInstance::hardware_adapter(0),
        SimInstance::software_adapter(1),
    ]);
    r.on_display_topology_changed().unwrap();

    assert_eq!(r.error_state(), ErrorState::NoError);
    assert!(r.context().is_none());
    assert_eq!(sim.devices_created(), 1);
    assert_eq!(sim.presents().len(), 1);

    r.on_size_changed(RenderSize::new(800, 600), 1.0).unwrap();
    assert!(!r.context().unwrap().is_software_adapter());
    assert_eq!(sim.devices_created(), 2);
    assert_eq!(sim.presents().len(), 2);
    assert_eq!(r.device_recoveries(), 0);
    assert!(sim.violations().is_empty());
}

#[test]
fn hardware_device_ignores_topology_changes() {
    let (sim, _clock, mut r) = start();
    sim.set_adapters(vec![
        SimInstance::hardware_adapter(0),
        SimInstance::hardware_adapter(1),
        SimInstance::software_adapter(2),
    ]);
    r.on_display_topology_changed().unwrap();
    assert_eq!(sim.devices_created(), 1);
}

#[test]
fn mixed_event_sequences_never_break_gpu_ordering() {
    let (sim, _clock, mut r) = start();

    // Small LCG so the sequence is fixed but not hand-picked.
    let mut seed: u32 = 0x2545_f491;
    let mut next = move || {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        seed >> 24
    };

    for _ in 0..200 {
        match next() % 8 {
            0 | 1 | 2 => r.render().unwrap(),
            3 => {
                let w = 200 + next() * 4;
                let h = 150 + next() * 3;
                r.on_size_changed(RenderSize::new(w, h), 1.0).unwrap();
            }
            4 => r.on_resize_started(),
            5 => r.on_resize_ended().unwrap(),
            6 => {
                let color = if next() % 2 == 0 {
                    ColorInfo::sdr()
                } else {
                    ColorInfo::hdr(4.0, 1.0 + (next() % 3) as f32)
                };
                r.on_color_info_changed(color).unwrap();
            }
            _ => r.on_size_changed(RenderSize::new(0, 0), 1.0).unwrap(),
        }
    }

    assert!(sim.violations().is_empty(), "{:?}", sim.violations());
    assert_eq!(r.error_state(), ErrorState::NoError);
    assert!(sim.presents().iter().all(|p| p.rendered));
}
