use std::ops::{Deref, RangeBounds};

use anyhow::{bail, Context, Result};
use wgpu::util::DeviceExt;

use crate::GPUSorter;

/// Copies `values` into `buffer` through a staging buffer.
pub fn upload_to_buffer<T: bytemuck::Pod>(
    encoder: &mut wgpu::CommandEncoder,
    buffer: &wgpu::Buffer,
    device: &wgpu::Device,
    values: &[T],
) {
    let staging_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("staging buffer"),
        contents: bytemuck::cast_slice(values),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
    });
    encoder.copy_buffer_to_buffer(&staging_buffer, 0, buffer, 0, staging_buffer.size());
}

/// Reads a buffer range back to the host. Blocks until the copy finished.
pub async fn download_buffer<T: Clone + bytemuck::Pod>(
    buffer: &wgpu::Buffer,
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    range: impl RangeBounds<wgpu::BufferAddress>,
) -> Vec<T> {
    // copy buffer data
    let download_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("download buffer"),
        size: buffer.size(),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("copy encoder"),
    });
    encoder.copy_buffer_to_buffer(buffer, 0, &download_buffer, 0, buffer.size());
    queue.submit([encoder.finish()]);

    // download buffer
    let buffer_slice = download_buffer.slice(range);
    let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
    buffer_slice.map_async(wgpu::MapMode::Read, move |result| tx.send(result).unwrap());
    device.poll(wgpu::Maintain::Wait).panic_on_timeout();
    rx.receive().await.unwrap().unwrap();

    let data = buffer_slice.get_mapped_range();
    bytemuck::cast_slice(data.deref()).to_vec()
}

/// Asks the device for its subgroup size by running a one-workgroup kernel
/// that writes the `subgroup_size` builtin into a buffer.
///
/// The result is what [GPUSorter::new] should be specialized with.
pub async fn probe_subgroup_size(device: &wgpu::Device, queue: &wgpu::Queue) -> Result<u32> {
    if !device.features().contains(wgpu::Features::SUBGROUP) {
        bail!("device does not support subgroup operations");
    }

    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("subgroup probe shader"),
        source: wgpu::ShaderSource::Wgsl(include_str!("subgroup_probe.wgsl").into()),
    });
    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("subgroup probe bind group layout"),
        entries: &[wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }],
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("subgroup probe pipeline layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("probe_subgroup_size"),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: Some("probe_subgroup_size"),
        compilation_options: Default::default(),
        cache: None,
    });

    let result_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("subgroup probe buffer"),
        size: std::mem::size_of::<u32>() as u64,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("subgroup probe bind group"),
        layout: &bind_group_layout,
        entries: &[wgpu::BindGroupEntry {
            binding: 0,
            resource: result_buffer.as_entire_binding(),
        }],
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("subgroup probe encoder"),
    });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("probe subgroup size"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(1, 1, 1);
    }
    let idx = queue.submit([encoder.finish()]);
    device
        .poll(wgpu::Maintain::WaitForSubmissionIndex(idx))
        .panic_on_timeout();

    let sizes = download_buffer::<u32>(&result_buffer, device, queue, ..).await;
    let subgroup_size = *sizes.first().context("empty probe readback")?;
    if subgroup_size == 0 {
        bail!("device reported a zero subgroup size");
    }
    log::debug!("device reports subgroup size {subgroup_size}");
    Ok(subgroup_size)
}

/// Probes the device and builds a matching [GPUSorter] in one go.
pub async fn create_sorter(device: &wgpu::Device, queue: &wgpu::Queue) -> Result<GPUSorter> {
    let subgroup_size = probe_subgroup_size(device, queue).await?;
    GPUSorter::new(device, subgroup_size)
}
