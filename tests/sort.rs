use std::num::NonZeroU32;

use rand::{rngs::StdRng, Rng, SeedableRng};
use wgpu_radix_sort::{
    utils::{create_sorter, download_buffer, upload_to_buffer},
    GPUSorter, SortBuffers, BLOCK_KVS,
};

async fn setup_with_limits(limits: wgpu::Limits) -> (wgpu::Device, wgpu::Queue) {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());

    let adapter = wgpu::util::initialize_adapter_from_env_or_default(&instance, None)
        .await
        .unwrap();

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: None,
                required_features: GPUSorter::required_features(),
                required_limits: limits,
                memory_hints: Default::default(),
            },
            None,
        )
        .await
        .unwrap();

    (device, queue)
}

async fn setup() -> (wgpu::Device, wgpu::Queue) {
    setup_with_limits(GPUSorter::required_limits()).await
}

/// stable CPU sort of the same pairs, the ground truth for every test
fn cpu_sorted(keys: &[u32], vals: &[u32]) -> (Vec<u32>, Vec<u32>) {
    let mut pairs: Vec<(u32, u32)> = keys.iter().copied().zip(vals.iter().copied()).collect();
    pairs.sort_by_key(|pair| pair.0);
    pairs.into_iter().unzip()
}

fn upload_pairs(
    device: &wgpu::Device,
    sorter: &GPUSorter,
    keys: &[u32],
    vals: &[u32],
    encoder: &mut wgpu::CommandEncoder,
) -> SortBuffers {
    let buffers = sorter.create_sort_buffers(device, NonZeroU32::new(keys.len() as u32).unwrap());
    upload_to_buffer(encoder, buffers.keys(), device, keys);
    if !vals.is_empty() {
        upload_to_buffer(encoder, buffers.values(), device, vals);
    }
    buffers
}

async fn download_sorted(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    buffers: &SortBuffers,
) -> (Vec<u32>, Vec<u32>) {
    let keys = download_buffer::<u32>(buffers.sorted_keys(), device, queue, ..).await;
    let vals = download_buffer::<u32>(buffers.sorted_values(), device, queue, ..).await;
    (keys, vals)
}

/// Uploads the pairs, sorts them on the gpu and checks the result against
/// the stable CPU sort.
async fn run_sort(device: &wgpu::Device, queue: &wgpu::Queue, keys: &[u32], vals: &[u32]) {
    let sorter = create_sorter(device, queue).await.unwrap();

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("GPUSorter test_sort"),
    });
    let buffers = upload_pairs(device, &sorter, keys, vals, &mut encoder);
    sorter.sort(&mut encoder, &buffers, None).unwrap();
    let idx = queue.submit([encoder.finish()]);
    device
        .poll(wgpu::Maintain::WaitForSubmissionIndex(idx))
        .panic_on_timeout();

    let (keys_gpu, vals_gpu) = download_sorted(device, queue, &buffers).await;
    let (keys_cpu, vals_cpu) = cpu_sorted(keys, vals);
    assert_eq!(keys_gpu, keys_cpu, "GPU keys equal to keys sorted on CPU");
    assert_eq!(
        vals_gpu, vals_cpu,
        "GPU values equal to values sorted on CPU"
    );
}

async fn test_sort_random(n: u32) {
    let (device, queue) = setup().await;
    let mut rng = StdRng::seed_from_u64(0);
    let keys: Vec<u32> = (0..n).map(|_| rng.gen()).collect();
    let vals: Vec<u32> = (0..n).collect();
    run_sort(&device, &queue, &keys, &vals).await;
}

/// tests sorting of four pairs
#[pollster::test]
async fn sort_small() {
    let (device, queue) = setup().await;
    run_sort(&device, &queue, &[3, 1, 2, 0], &[10, 11, 12, 13]).await;
}

/// equal keys must keep their input order
#[pollster::test]
async fn sort_stable() {
    let (device, queue) = setup().await;
    let sorter = create_sorter(&device, &queue).await.unwrap();

    let keys = [5u32, 1, 5, 1, 5, 1];
    let vals = [0u32, 1, 2, 3, 4, 5];
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: None,
    });
    let buffers = upload_pairs(&device, &sorter, &keys, &vals, &mut encoder);
    sorter.sort(&mut encoder, &buffers, None).unwrap();
    let idx = queue.submit([encoder.finish()]);
    device
        .poll(wgpu::Maintain::WaitForSubmissionIndex(idx))
        .panic_on_timeout();

    let (keys_gpu, vals_gpu) = download_sorted(&device, &queue, &buffers).await;
    assert_eq!(keys_gpu, vec![1, 1, 1, 5, 5, 5]);
    assert_eq!(vals_gpu, vec![1, 3, 5, 0, 2, 4]);
}

/// keys that only differ in their upper bytes must survive the later passes
#[pollster::test]
async fn sort_cross_byte_carry() {
    let (device, queue) = setup().await;
    run_sort(
        &device,
        &queue,
        &[0x0000_00ff, 0x0000_0100, 0x0000_ffff, 0x0001_0000],
        &[0, 1, 2, 3],
    )
    .await;
}

/// an all-equal array is already sorted and must stay untouched
#[pollster::test]
async fn sort_all_equal() {
    let (device, queue) = setup().await;
    run_sort(&device, &queue, &[7u32; 8], &[0, 1, 2, 3, 4, 5, 6, 7]).await;
}

/// tests sorting around the workgroup and block size boundaries
#[pollster::test]
async fn sort_boundary_lengths() {
    let (device, queue) = setup().await;
    let sorter = create_sorter(&device, &queue).await.unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    for n in [
        1,
        255,
        256,
        257,
        BLOCK_KVS - 1,
        BLOCK_KVS,
        BLOCK_KVS + 1,
        3 * BLOCK_KVS + 13,
    ] {
        let keys: Vec<u32> = (0..n).map(|_| rng.gen()).collect();
        let vals: Vec<u32> = (0..n).collect();

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: None,
        });
        let buffers = upload_pairs(&device, &sorter, &keys, &vals, &mut encoder);
        sorter.sort(&mut encoder, &buffers, None).unwrap();
        let idx = queue.submit([encoder.finish()]);
        device
            .poll(wgpu::Maintain::WaitForSubmissionIndex(idx))
            .panic_on_timeout();

        let (keys_gpu, vals_gpu) = download_sorted(&device, &queue, &buffers).await;
        let (keys_cpu, vals_cpu) = cpu_sorted(&keys, &vals);
        assert_eq!(keys_gpu, keys_cpu, "keys mismatch for n = {n}");
        assert_eq!(vals_gpu, vals_cpu, "values mismatch for n = {n}");
    }
}

/// tests sorting of one million random pairs
#[pollster::test]
async fn sort_large() {
    test_sort_random(1 << 20).await;
}

/// a block count that is not a power of two exercises the padded scan rows
#[pollster::test]
async fn sort_padded_block_count() {
    test_sort_random(5 * BLOCK_KVS + 321).await;
}

/// reverse sorted input is the worst case for the scatter order
#[pollster::test]
async fn sort_reverse() {
    let (device, queue) = setup().await;
    let n = 100_000u32;
    let keys: Vec<u32> = (0..n).rev().collect();
    let vals: Vec<u32> = (0..n).collect();
    run_sort(&device, &queue, &keys, &vals).await;
}

/// already sorted input must come out unchanged
#[pollster::test]
async fn sort_presorted() {
    let (device, queue) = setup().await;
    let n = 100_000u32;
    let keys: Vec<u32> = (0..n).collect();
    let vals: Vec<u32> = (0..n).map(|v| v ^ 0xdead_beef).collect();
    run_sort(&device, &queue, &keys, &vals).await;
}

/// multiplicative hashing pushes every radix through every pass
#[pollster::test]
async fn sort_radix_coverage() {
    let (device, queue) = setup().await;
    let n = 1u32 << 16;
    let keys: Vec<u32> = (0..n).map(|i| i.wrapping_mul(0x9e37_79b9)).collect();
    let vals: Vec<u32> = (0..n).collect();
    run_sort(&device, &queue, &keys, &vals).await;
}

/// argsort seeds the values with the identity permutation on pass 0
#[pollster::test]
async fn argsort_small() {
    let (device, queue) = setup().await;
    let sorter = create_sorter(&device, &queue).await.unwrap();

    let keys = [40u32, 10, 30, 20, 0];
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: None,
    });
    let buffers = upload_pairs(&device, &sorter, &keys, &[], &mut encoder);
    sorter.argsort(&mut encoder, &buffers, None).unwrap();
    let idx = queue.submit([encoder.finish()]);
    device
        .poll(wgpu::Maintain::WaitForSubmissionIndex(idx))
        .panic_on_timeout();

    let (keys_gpu, vals_gpu) = download_sorted(&device, &queue, &buffers).await;
    assert_eq!(keys_gpu, vec![0, 10, 20, 30, 40]);
    assert_eq!(vals_gpu, vec![4, 1, 3, 2, 0]);
}

/// argsort of a larger array against a CPU argsort
#[pollster::test]
async fn argsort_large() {
    let (device, queue) = setup().await;
    let sorter = create_sorter(&device, &queue).await.unwrap();

    let n = 100_000u32;
    let mut rng = StdRng::seed_from_u64(3);
    let keys: Vec<u32> = (0..n).map(|_| rng.gen()).collect();

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: None,
    });
    let buffers = upload_pairs(&device, &sorter, &keys, &[], &mut encoder);
    sorter.argsort(&mut encoder, &buffers, None).unwrap();
    let idx = queue.submit([encoder.finish()]);
    device
        .poll(wgpu::Maintain::WaitForSubmissionIndex(idx))
        .panic_on_timeout();

    let (keys_gpu, vals_gpu) = download_sorted(&device, &queue, &buffers).await;

    let mut indices: Vec<u32> = (0..n).collect();
    indices.sort_by_key(|&i| keys[i as usize]);
    let keys_cpu: Vec<u32> = indices.iter().map(|&i| keys[i as usize]).collect();

    assert_eq!(keys_gpu, keys_cpu);
    assert_eq!(vals_gpu, indices, "values are the original key positions");
}

/// tests sorting only the first half of the buffer
#[pollster::test]
async fn sort_half() {
    let (device, queue) = setup().await;
    let sorter = create_sorter(&device, &queue).await.unwrap();

    let n = 1_000_000u32;
    let n_sorted = 500_000usize;
    let mut rng = StdRng::seed_from_u64(1);
    let keys: Vec<u32> = (0..n).map(|_| rng.gen()).collect();
    let vals: Vec<u32> = (0..n).collect();

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: None,
    });
    let buffers = upload_pairs(&device, &sorter, &keys, &vals, &mut encoder);
    sorter
        .sort(&mut encoder, &buffers, Some(n_sorted as u32))
        .unwrap();
    let idx = queue.submit([encoder.finish()]);
    device
        .poll(wgpu::Maintain::WaitForSubmissionIndex(idx))
        .panic_on_timeout();

    let (keys_gpu, vals_gpu) = download_sorted(&device, &queue, &buffers).await;
    let (keys_cpu, vals_cpu) = cpu_sorted(&keys[..n_sorted], &vals[..n_sorted]);
    assert_eq!(keys_gpu[..n_sorted], keys_cpu[..]);
    assert_eq!(vals_gpu[..n_sorted], vals_cpu[..]);
}

/// sorting zero elements records no work and leaves the buffers alone
#[pollster::test]
async fn sort_nothing() {
    let (device, queue) = setup().await;
    let sorter = create_sorter(&device, &queue).await.unwrap();

    let keys = [3u32, 1, 2, 0];
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: None,
    });
    let buffers = upload_pairs(&device, &sorter, &keys, &keys, &mut encoder);
    sorter.sort(&mut encoder, &buffers, Some(0)).unwrap();
    let idx = queue.submit([encoder.finish()]);
    device
        .poll(wgpu::Maintain::WaitForSubmissionIndex(idx))
        .panic_on_timeout();

    let untouched = download_buffer::<u32>(buffers.keys(), &device, &queue, ..).await;
    assert_eq!(untouched, keys);
}

/// asking for more pairs than the buffers hold must fail before recording
#[pollster::test]
async fn sort_too_many() {
    let (device, queue) = setup().await;
    let sorter = create_sorter(&device, &queue).await.unwrap();

    let buffers = sorter.create_sort_buffers(&device, NonZeroU32::new(16).unwrap());
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: None,
    });
    assert!(sorter.sort(&mut encoder, &buffers, Some(17)).is_err());
}

/// a tiny dispatch limit forces the driver to split the count and scatter
/// grids and to address the extra blocks through workgroup_offset
#[pollster::test]
async fn sort_split_dispatch() {
    let (device, queue) = setup_with_limits(wgpu::Limits {
        max_compute_workgroups_per_dimension: 4,
        ..GPUSorter::required_limits()
    })
    .await;
    let sorter = create_sorter(&device, &queue).await.unwrap();

    // 10 blocks against a 4 workgroup limit: a (4, 2) grid plus a remainder
    let n = 9 * BLOCK_KVS + 5;
    let mut rng = StdRng::seed_from_u64(2);
    let keys: Vec<u32> = (0..n).map(|_| rng.gen()).collect();
    let vals: Vec<u32> = (0..n).collect();

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: None,
    });
    let buffers = upload_pairs(&device, &sorter, &keys, &vals, &mut encoder);
    sorter.sort(&mut encoder, &buffers, None).unwrap();
    let idx = queue.submit([encoder.finish()]);
    device
        .poll(wgpu::Maintain::WaitForSubmissionIndex(idx))
        .panic_on_timeout();

    let (keys_gpu, vals_gpu) = download_sorted(&device, &queue, &buffers).await;
    let (keys_cpu, vals_cpu) = cpu_sorted(&keys, &vals);
    assert_eq!(keys_gpu, keys_cpu);
    assert_eq!(vals_gpu, vals_cpu);
}
