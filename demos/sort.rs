// this example creates an array with 10 key-value pairs and sorts them on the gpu
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
    println!("using subgroup size {}", sorter.subgroup_size());

    let n = 10u32;
    let buffers = sorter.create_sort_buffers(&device, NonZeroU32::new(n).unwrap());

    let keys: Vec<u32> = (0..n).rev().collect();
    let vals: Vec<u32> = keys.iter().map(|k| k * 100).collect();

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: None,
    });
    upload_to_buffer(&mut encoder, buffers.keys(), &device, &keys);
    upload_to_buffer(&mut encoder, buffers.values(), &device, &vals);

    println!(
        "before: {:?}",
        keys.iter().zip(vals.iter()).collect::<Vec<_>>()
    );

    sorter.sort(&mut encoder, &buffers, None).unwrap();

    // wait for the sorter to finish
    let idx = queue.submit([encoder.finish()]);
    device
        .poll(wgpu::Maintain::WaitForSubmissionIndex(idx))
        .panic_on_timeout();

    let keys_sorted = download_buffer::<u32>(buffers.sorted_keys(), &device, &queue, ..).await;
    let vals_sorted = download_buffer::<u32>(buffers.sorted_values(), &device, &queue, ..).await;

    println!(
        "after: {:?}",
        keys_sorted.iter().zip(vals_sorted.iter()).collect::<Vec<_>>()
    );
}
