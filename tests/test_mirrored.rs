use proptest::prelude::*;
use unimem::backend::emulated::{EmulatedRuntime, EmulatorConfig};
use unimem::prelude::*;

const PLACEMENTS: [Placement; 4] = [
    Placement::Default,
    Placement::Pinned,
    Placement::Mapped,
    Placement::NotPinned,
];

fn placement() -> impl Strategy<Value = Placement> {
    (0..PLACEMENTS.len()).prop_map(|i| PLACEMENTS[i])
}

fn runtime_and_device(index: usize) -> (EmulatedRuntime, Device) {
    let runtime = EmulatedRuntime::default();
    let mut device = Device::enumerate(runtime.clone()).unwrap();
    device.select(index).unwrap();
    (runtime, device)
}

proptest! {
    #[test]
    fn zero_copy_writes_are_visible_on_the_device(
        data in prop::collection::vec(any::<i32>(), 1..256),
        host in placement(),
        dev in placement(),
    ) {
        let (_rt, device) = runtime_and_device(0);
        let mut m = Mirrored::<i32>::new();
        m.alloc(data.len(), &device, host, dev).unwrap();
        prop_assert!(m.is_zero_copy());
        m.host_mut().copy_from_slice(&data);

        let mut seen = HostBuffer::<i32>::alloc(data.len(), &device, Placement::Default).unwrap();
        copy(&mut seen, m.device(), Extent::All, false).unwrap();
        prop_assert_eq!(&data[..], seen.as_slice());
    }

    #[test]
    fn discrete_round_trip_is_identity(
        data in prop::collection::vec(any::<u16>(), 1..256),
        host in placement(),
        dev in placement(),
        asynchronous in any::<bool>(),
    ) {
        let (_rt, device) = runtime_and_device(1);
        let mut m = Mirrored::<u16>::new();
        m.alloc(data.len(), &device, host, dev).unwrap();
        prop_assert!(!m.is_zero_copy());
        m.host_mut().copy_from_slice(&data);
        m.update_device(Extent::All, asynchronous).unwrap();
        device.sync().unwrap();

        m.host_mut().iter_mut().for_each(|x| *x = 0);
        m.update_host(Extent::All, asynchronous).unwrap();
        device.sync().unwrap();
        prop_assert_eq!(&data[..], m.host());
    }

    #[test]
    fn staged_transfer_converts_each_element(
        data in prop::collection::vec(-1.0e6f64..1.0e6, 1..128),
        shared in any::<bool>(),
    ) {
        let (_rt, device) = runtime_and_device(if shared { 0 } else { 1 });
        let mut m = Mirrored::<f64, f32>::new();
        m.alloc(data.len(), &device, Placement::Pinned, Placement::Default).unwrap();
        prop_assert!(!m.is_zero_copy());
        m.host_mut().copy_from_slice(&data);
        m.update_device(Extent::All, false).unwrap();

        let mut seen = HostBuffer::<f32>::alloc(data.len(), &device, Placement::Default).unwrap();
        copy(&mut seen, m.device(), Extent::All, false).unwrap();
        let expected: Vec<f32> = data.iter().map(|&x| x as f32).collect();
        prop_assert_eq!(&expected[..], seen.as_slice());

        m.update_host(Extent::All, false).unwrap();
        for (&before, &after) in data.iter().zip(m.host()) {
            prop_assert!((before - after).abs() <= before.abs() * 1e-6 + 1e-6);
        }
    }
}

#[test]
fn shared_thousand_element_object_is_a_view() {
    let (runtime, device) = runtime_and_device(0);
    let mut m = Mirrored::<f32>::new();
    m.alloc(1000, &device, Placement::Default, Placement::Default)
        .unwrap();
    assert_eq!(Placement::View, m.device().kind());
    assert_eq!(1000, m.device().len());
    assert_eq!(0, runtime.stats().device_allocs);

    drop(m);
    let stats = runtime.stats();
    assert_eq!(1, stats.host_allocs);
    assert_eq!(1, stats.host_frees);
    assert_eq!(0, stats.invalid_frees);
}

#[test]
fn differing_types_use_a_matching_cast_buffer() {
    let (runtime, device) = runtime_and_device(1);
    let mut m = Mirrored::<f64, f32>::new();
    m.alloc((10, 20), &device, Placement::Pinned, Placement::Default)
        .unwrap();
    let cast = m.cast_buffer().unwrap();
    assert_eq!(Shape::Matrix { rows: 10, cols: 20 }, cast.shape());
    assert_eq!(200, cast.len());
    assert_eq!(Placement::Pinned, cast.kind());

    for (i, x) in m.host_mut().iter_mut().enumerate() {
        *x = i as f64 + 0.25;
    }
    m.update_device(Extent::All, true).unwrap();
    // The conversion is done before the transfer is issued, so the cast buffer is ready even
    // though the transfer itself has not been waited on.
    let cast = m.cast_buffer().unwrap();
    assert_eq!(199.25f32, cast[199]);
    assert_eq!(1, runtime.stats().queued_copies);
    device.sync().unwrap();
}

#[test]
fn resize_twice_allocates_once() {
    for &index in &[0, 1] {
        let (runtime, device) = runtime_and_device(index);
        let mut m = Mirrored::<u32, i64>::new();
        m.alloc(16, &device, Placement::Default, Placement::Default)
            .unwrap();
        m.resize(64).unwrap();
        let once = runtime.stats();
        m.resize(64).unwrap();
        assert_eq!(once, runtime.stats());
        assert_eq!(64, m.len());
        assert_eq!(64, m.cast_buffer().unwrap().len());
        assert_eq!(64, m.device().len());

        let mut same = Mirrored::<u32>::new();
        same.alloc(16, &device, Placement::Default, Placement::Default)
            .unwrap();
        same.resize((4, 8)).unwrap();
        let once = runtime.stats();
        same.resize((4, 8)).unwrap();
        assert_eq!(once, runtime.stats());
        assert_eq!(Shape::Matrix { rows: 4, cols: 8 }, same.device().shape());
    }
}

#[test]
fn partial_updates_touch_only_the_requested_block() {
    let (_rt, device) = runtime_and_device(1);
    let mut m = Mirrored::<u8>::new();
    m.alloc((3, 3), &device, Placement::Default, Placement::Default)
        .unwrap();
    m.update_device(Extent::All, false).unwrap();
    m.host_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
    m.update_device(Extent::Block { rows: 2, cols: 2 }, false)
        .unwrap();
    m.host_mut().iter_mut().for_each(|x| *x = 0);
    m.update_host(Extent::All, false).unwrap();
    assert_eq!(&[1, 2, 0, 4, 5, 0, 0, 0, 0], m.host());

    assert_eq!(
        Err(MemError::ShapeMismatch),
        m.update_device(Extent::Cols(10), false)
    );
}

#[test]
fn zero_devices_cannot_be_selected() {
    let mut device = Device::enumerate(EmulatedRuntime::new(EmulatorConfig::empty())).unwrap();
    assert_eq!(0, device.num_devices());
    assert_eq!(
        Err(MemError::InvalidDeviceIndex { index: 0, count: 0 }),
        device.select(0)
    );
}

#[test]
fn repeated_select_keeps_queues() {
    let (_rt, mut device) = runtime_and_device(1);
    device.push_queue().unwrap();
    let before = device.queue(1).unwrap().id();
    for _ in 0..3 {
        device.select(1).unwrap();
    }
    assert_eq!(2, device.queue_count());
    assert_eq!(before, device.queue(1).unwrap().id());
}
