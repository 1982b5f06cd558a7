// this example sorts keys without uploading values: the sorted values are
// the original positions of the keys (an argsort)
use std::num::NonZeroU32;

use wgpu_radix_sort::{
    utils::{create_sorter, download_buffer, upload_to_buffer},
    GPUSorter,
};

#[pollster::main]
async fn main() {
    env_logger::init();

    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());

    let adapter = wgpu::util::initialize_adapter_from_env_or_default(&instance, None)
        .await
        .unwrap();

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: None,
                required_features: GPUSorter::required_features(),
                required_limits: GPUSorter::required_limits(),
                memory_hints: Default::default(),
            },
            None,
        )
        .await
        .unwrap();

    let sorter = create_sorter(&device, &queue)
        .await
        .expect("could not build a sorter for this device");

    let keys: Vec<u32> = vec![40, 10, 30, 20, 0];
    let n = keys.len() as u32;
    let buffers = sorter.create_sort_buffers(&device, NonZeroU32::new(n).unwrap());

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: None,
    });
    upload_to_buffer(&mut encoder, buffers.keys(), &device, &keys);

    sorter.argsort(&mut encoder, &buffers, None).unwrap();

    let idx = queue.submit([encoder.finish()]);
    device
        .poll(wgpu::Maintain::WaitForSubmissionIndex(idx))
        .panic_on_timeout();

    let keys_sorted = download_buffer::<u32>(buffers.sorted_keys(), &device, &queue, ..).await;
    let order = download_buffer::<u32>(buffers.sorted_values(), &device, &queue, ..).await;

    println!("keys:   {keys:?}");
    println!("sorted: {keys_sorted:?}");
    println!("order:  {order:?}");
}
