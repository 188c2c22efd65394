use unimem::prelude::*;
use unimem::quick_init;

#[test]
fn test_queue_transfers_complete_after_synchronize() {
    let mut device = quick_init().unwrap();
    device.select(1).unwrap();
    device.push_queue_with(QueueFlags::NON_BLOCKING).unwrap();
    let queue = device.queue(1).unwrap();

    let host = HostBuffer::from_slice(&[1u32, 2, 3, 4], &device, Placement::Pinned).unwrap();
    let mut gpu = DeviceBuffer::<u32>::alloc(4, queue, Placement::Default).unwrap();
    let mut back = HostBuffer::<u32>::alloc(4, queue, Placement::Pinned).unwrap();

    copy(&mut gpu, &host, Extent::All, queue).unwrap();
    copy(&mut back, &gpu, Extent::All, queue).unwrap();
    queue.synchronize().unwrap();
    assert_eq!(&[1, 2, 3, 4], back.as_slice());
}

#[test]
fn test_queue_drop_returns_nothing_on_success() {
    let mut device = quick_init().unwrap();
    device.push_queue().unwrap();
    device.push_queue().unwrap();
    assert_eq!(3, device.queue_count());
    device.pop_queue().unwrap();
    device.pop_queue().unwrap();
    device.pop_queue().unwrap();
    assert_eq!(1, device.queue_count());
    assert!(device.queue(0).unwrap().is_default());
}

#[test]
fn test_memory_outlives_device_switch() {
    let mut device = quick_init().unwrap();
    let mut host = HostBuffer::<u8>::alloc(8, &device, Placement::Default).unwrap();
    host.copy_from_slice(b"unimem!!");
    device.select(1).unwrap();
    let mut gpu = DeviceBuffer::<u8>::alloc(8, &device, Placement::Default).unwrap();
    let mut back = HostBuffer::<u8>::alloc(8, &device, Placement::Default).unwrap();
    copy(&mut gpu, &host, Extent::All, false).unwrap();
    copy(&mut back, &gpu, Extent::All, false).unwrap();
    assert_eq!(b"unimem!!", back.as_slice());
}
