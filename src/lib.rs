#![doc = include_str!("../README.md")]
/*
    This file implements a gpu version of radix sort. A good introduction to general purpose radix sort can
    be found here: http://www.codercorner.com/RadixSortRevisited.htm

    This implementation is a least-significant-digit sort with an 8 bit radix: four passes over 32-bit
    key-value pairs. Every pass counts radix occurrences per block, turns the (block x 256) count matrix
    into prefix sums with an up-sweep/down-sweep scan over the block axis, and scatters the pairs with a
    subgroup-ballot based local sort. All kernels can be found in radix_sort.wgsl

    Requires a device with subgroup operations and push constants, see GPUSorter::required_features.
*/

use std::{mem, num::NonZeroU32};

pub mod utils;

use anyhow::{bail, Result};
use bytemuck::bytes_of;
use wgpu::ComputePassDescriptor;

// IMPORTANT: the following constants have to be synced with the numbers in radix_sort.wgsl

/// we sort 8 bits per pass
const RADIX_BITS: u32 = 8;

/// 256 entries into the radix table
const RADIX_SIZE: u32 = 1 << RADIX_BITS;

/// workgroup size of all kernels
/// must equal RADIX_SIZE so that one thread owns exactly one radix bin
const WORKGROUP_SIZE: u32 = 256;

/// rows of keys each scatter/count workgroup processes
const BLOCK_ROWS: u32 = 8;

/// number of elements counted and scattered by one work group
pub const BLOCK_KVS: u32 = WORKGROUP_SIZE * BLOCK_ROWS;

/// number of passes used for sorting
/// we sort 8 bits per pass so 4 passes are required for a 32 bit key
const NUM_PASSES: u32 = 32 / RADIX_BITS;

/// Per-dispatch parameters, in the layout the shaders expect.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PushConstants {
    workgroup_offset: u32,
    number_of_keys: u32,
    number_of_blks: u32,
    pass_index: u32,
    sweep_size: u32,
    init_index: u32,
}

/// Sorting pipeline. It can be used to sort key-value pairs stored in [SortBuffers]
pub struct GPUSorter {
    count_p: wgpu::ComputePipeline,
    up_sweep_p: wgpu::ComputePipeline,
    down_sweep_p: wgpu::ComputePipeline,
    last_block_p: wgpu::ComputePipeline,
    scatter_p: wgpu::ComputePipeline,
    subgroup_size: u32,
    max_workgroups_per_dim: u32,
}

impl GPUSorter {
    /// Builds the five sort pipelines specialized for `subgroup_size`.
    ///
    /// The subgroup size must match the device, see [utils::probe_subgroup_size].
    /// Fails if the device lacks the required features or cannot hold the
    /// workgroup memory the scatter kernel needs.
    pub fn new(device: &wgpu::Device, subgroup_size: u32) -> Result<Self> {
        if !device.features().contains(Self::required_features()) {
            bail!(
                "device is missing features {:?}",
                Self::required_features() - device.features()
            );
        }
        if device.limits().max_push_constant_size < mem::size_of::<PushConstants>() as u32 {
            bail!(
                "device push constant budget is {} bytes, the sorter needs {}",
                device.limits().max_push_constant_size,
                mem::size_of::<PushConstants>()
            );
        }
        if !subgroup_size.is_power_of_two()
            || WORKGROUP_SIZE % subgroup_size != 0
            || subgroup_size * subgroup_size < WORKGROUP_SIZE
            || subgroup_size > 128
        {
            bail!("unsupported subgroup size {subgroup_size}");
        }

        let num_subgroups = WORKGROUP_SIZE / subgroup_size;
        // shared arena of the scatter kernel: it must fit one full block for
        // the reorder phase and the [num_subgroups][256] rank table
        let reorder_size = BLOCK_KVS.max(RADIX_SIZE * num_subgroups);
        let scatter_smem = (RADIX_SIZE + reorder_size + num_subgroups) * 4;
        if scatter_smem > device.limits().max_compute_workgroup_storage_size {
            bail!(
                "scatter kernel needs {} bytes of workgroup memory, device offers {}",
                scatter_smem,
                device.limits().max_compute_workgroup_storage_size
            );
        }
        log::debug!(
            "specializing sort pipelines for subgroup size {subgroup_size} ({num_subgroups} subgroups per workgroup)"
        );

        let bind_group_layout = Self::bind_group_layout(device);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("radix sort pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[wgpu::PushConstantRange {
                stages: wgpu::ShaderStages::COMPUTE,
                range: 0..mem::size_of::<PushConstants>() as u32,
            }],
        });

        let raw_shader: &str = include_str!("radix_sort.wgsl");

        let shader_code = format!(
            "enable subgroups;\n\n\
            const SG_SIZE: u32 = {:}u;\n\
            const NUM_SUBGROUPS: u32 = {:}u;\n\
            const REORDER_SIZE: u32 = {:}u;\n\
            const RADIX_BITS: u32 = {:}u;\n\
            const RADIX_SIZE: u32 = {:}u;\n\
            const WG_SIZE: u32 = {:}u;\n\
            const BLOCK_ROWS: u32 = {:}u;\n\
            const BLOCK_KVS: u32 = {:}u;\n{:}",
            subgroup_size,
            num_subgroups,
            reorder_size,
            RADIX_BITS,
            RADIX_SIZE,
            WORKGROUP_SIZE,
            BLOCK_ROWS,
            BLOCK_KVS,
            raw_shader
        );

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("radix sort shader"),
            source: wgpu::ShaderSource::Wgsl(shader_code.into()),
        });
        let count_p = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("count_radix"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("count_radix"),
            compilation_options: Default::default(),
            cache: None,
        });
        let up_sweep_p = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("scan_up_sweep"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("scan_up_sweep"),
            compilation_options: Default::default(),
            cache: None,
        });
        let down_sweep_p = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("scan_down_sweep"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("scan_down_sweep"),
            compilation_options: Default::default(),
            cache: None,
        });
        let last_block_p = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("scan_last_block"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("scan_last_block"),
            compilation_options: Default::default(),
            cache: None,
        });
        let scatter_p = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("scatter"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("scatter"),
            compilation_options: Default::default(),
            cache: None,
        });

        Ok(Self {
            count_p,
            up_sweep_p,
            down_sweep_p,
            last_block_p,
            scatter_p,
            subgroup_size,
            max_workgroups_per_dim: device.limits().max_compute_workgroups_per_dimension,
        })
    }

    /// Device features the sorter depends on.
    pub fn required_features() -> wgpu::Features {
        wgpu::Features::SUBGROUP | wgpu::Features::PUSH_CONSTANTS
    }

    /// Device limits the sorter depends on, on top of the defaults.
    pub fn required_limits() -> wgpu::Limits {
        wgpu::Limits {
            max_push_constant_size: mem::size_of::<PushConstants>() as u32,
            ..Default::default()
        }
    }

    /// The subgroup size the pipelines were specialized for.
    pub fn subgroup_size(&self) -> u32 {
        self.subgroup_size
    }

    fn bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = (0..5)
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("radix sort bind group layout"),
            entries: &entries,
        })
    }

    /// creates all buffers necessary for sorting
    pub fn create_sort_buffers(&self, device: &wgpu::Device, length: NonZeroU32) -> SortBuffers {
        let length = length.get();
        let keyval_size = (length as u64) * mem::size_of::<u32>() as u64;

        let keys_in = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("radix sort keys buffer"),
            size: keyval_size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let vals_in = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("radix sort values buffer"),
            size: keyval_size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let keys_aux = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("radix sort keys auxiliary buffer"),
            size: keyval_size,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let vals_aux = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("radix sort values auxiliary buffer"),
            size: keyval_size,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let keys_out = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("radix sort sorted keys buffer"),
            size: keyval_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let vals_out = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("radix sort sorted values buffer"),
            size: keyval_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        // one row of 256 counts per block, padded to a power of two rows for
        // the block-axis scan; wgpu zero-initializes the buffer and the
        // sweeps never leak stale values into rows the kernels consume
        let blocks_rows = num_blocks(length).next_power_of_two() as u64;
        let blocks = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("radix sort block matrix"),
            size: blocks_rows * RADIX_SIZE as u64 * mem::size_of::<u32>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        // pass chain: in -> aux, aux -> out, out -> aux, aux -> out
        let layout = Self::bind_group_layout(device);
        let bind_groups = [
            (&keys_in, &vals_in, &keys_aux, &vals_aux),
            (&keys_aux, &vals_aux, &keys_out, &vals_out),
            (&keys_out, &vals_out, &keys_aux, &vals_aux),
        ]
        .map(|(k_in, v_in, k_out, v_out)| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("radix sort bind group"),
                layout: &layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: k_in.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: v_in.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: blocks.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: k_out.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: v_out.as_entire_binding(),
                    },
                ],
            })
        });

        SortBuffers {
            keys_in,
            vals_in,
            keys_out,
            vals_out,
            keys_aux,
            vals_aux,
            blocks,
            bind_groups,
            length,
        }
    }

    /// Splits a linear workgroup count into dispatches that respect the
    /// per-dimension device limit. The remainder dispatch reaches the shader
    /// through the workgroup_offset push constant.
    fn dispatch_linear(
        &self,
        pass: &mut wgpu::ComputePass<'_>,
        mut consts: PushConstants,
        workgroups: u32,
    ) {
        let limit = self.max_workgroups_per_dim;
        if workgroups <= limit {
            consts.workgroup_offset = 0;
            pass.set_push_constants(0, bytes_of(&consts));
            pass.dispatch_workgroups(workgroups, 1, 1);
            return;
        }
        let rows = workgroups / limit;
        consts.workgroup_offset = 0;
        pass.set_push_constants(0, bytes_of(&consts));
        pass.dispatch_workgroups(limit, rows, 1);

        let remainder = workgroups - limit * rows;
        if remainder > 0 {
            consts.workgroup_offset = limit * rows;
            pass.set_push_constants(0, bytes_of(&consts));
            pass.dispatch_workgroups(remainder, 1, 1);
        }
    }

    /// Records the per-block radix histograms for one pass.
    pub fn record_count(
        &self,
        buffers: &SortBuffers,
        length: u32,
        pass_index: u32,
        encoder: &mut wgpu::CommandEncoder,
    ) {
        let blks = num_blocks(length);
        let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some("count radix histograms"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.count_p);
        pass.set_bind_group(0, buffers.pass_bind_group(pass_index), &[]);
        self.dispatch_linear(
            &mut pass,
            PushConstants {
                workgroup_offset: 0,
                number_of_keys: length,
                number_of_blks: blks,
                pass_index,
                sweep_size: 0,
                init_index: 0,
            },
            blks,
        );
    }

    /// Records the block-axis prefix scan and the last-block bin scan for
    /// one pass. Must run after [GPUSorter::record_count].
    pub fn record_scan(
        &self,
        buffers: &SortBuffers,
        length: u32,
        pass_index: u32,
        encoder: &mut wgpu::CommandEncoder,
    ) {
        let blks = num_blocks(length);
        let blks_pow2 = blks.next_power_of_two();

        let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some("prefix block matrix"),
            timestamp_writes: None,
        });
        pass.set_bind_group(0, buffers.pass_bind_group(pass_index), &[]);

        // the scan kernels see the padded matrix
        let consts = |sweep_size: u32| PushConstants {
            workgroup_offset: 0,
            number_of_keys: length,
            number_of_blks: blks_pow2,
            pass_index,
            sweep_size,
            init_index: 0,
        };

        pass.set_pipeline(&self.up_sweep_p);
        let mut sweep_size = 2;
        while sweep_size <= blks_pow2 {
            self.dispatch_linear(&mut pass, consts(sweep_size), blks_pow2 / sweep_size);
            sweep_size *= 2;
        }

        pass.set_pipeline(&self.down_sweep_p);
        sweep_size /= 2;
        while sweep_size >= 2 {
            let workgroups = (blks_pow2 / sweep_size) * sweep_size.trailing_zeros();
            self.dispatch_linear(&mut pass, consts(sweep_size), workgroups);
            sweep_size /= 2;
        }

        pass.set_pipeline(&self.last_block_p);
        pass.set_push_constants(
            0,
            bytes_of(&PushConstants {
                workgroup_offset: 0,
                number_of_keys: length,
                number_of_blks: blks,
                pass_index,
                sweep_size: 0,
                init_index: 0,
            }),
        );
        pass.dispatch_workgroups(1, 1, 1);
    }

    /// Records the scatter for one pass. With `init_index` set the kernel
    /// ignores the value input and emits each key's global index instead.
    /// Must run after [GPUSorter::record_scan].
    pub fn record_scatter(
        &self,
        buffers: &SortBuffers,
        length: u32,
        pass_index: u32,
        init_index: bool,
        encoder: &mut wgpu::CommandEncoder,
    ) {
        let blks = num_blocks(length);
        let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some("scatter keyvals"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.scatter_p);
        pass.set_bind_group(0, buffers.pass_bind_group(pass_index), &[]);
        self.dispatch_linear(
            &mut pass,
            PushConstants {
                workgroup_offset: 0,
                number_of_keys: length,
                number_of_blks: blks,
                pass_index,
                sweep_size: 0,
                init_index: init_index as u32,
            },
            blks,
        );
    }

    fn record_sort(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &SortBuffers,
        sort_first_n: Option<u32>,
        init_values: bool,
    ) -> Result<()> {
        let length = sort_first_n.unwrap_or(buffers.len());
        if length > buffers.len() {
            bail!(
                "cannot sort {} pairs, the buffers hold {}",
                length,
                buffers.len()
            );
        }
        if length == 0 {
            return Ok(());
        }
        for pass_index in 0..NUM_PASSES {
            self.record_count(buffers, length, pass_index, encoder);
            self.record_scan(buffers, length, pass_index, encoder);
            self.record_scatter(
                buffers,
                length,
                pass_index,
                init_values && pass_index == 0,
                encoder,
            );
        }
        Ok(())
    }

    /// Writes sort commands to the command encoder.
    /// If sort_first_n is not none only the first n elements are sorted.
    /// The result ends up in [SortBuffers::sorted_keys] and
    /// [SortBuffers::sorted_values].
    ///
    /// **IMPORTANT**: if less than the whole buffer is sorted the rest of the
    /// sorted buffers stays untouched
    pub fn sort(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &SortBuffers,
        sort_first_n: Option<u32>,
    ) -> Result<()> {
        self.record_sort(encoder, buffers, sort_first_n, false)
    }

    /// Like [GPUSorter::sort] but the values buffer does not need to be
    /// filled: pass 0 seeds it with the identity permutation, so the sorted
    /// values are the input positions in key order.
    pub fn argsort(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &SortBuffers,
        sort_first_n: Option<u32>,
    ) -> Result<()> {
        self.record_sort(encoder, buffers, sort_first_n, true)
    }
}

/// Struct containing all buffers necessary for sorting.
pub struct SortBuffers {
    /// keys to be sorted
    keys_in: wgpu::Buffer,
    /// values carried along with the keys
    vals_in: wgpu::Buffer,
    /// keys in ascending order after sorting
    keys_out: wgpu::Buffer,
    /// values in key order after sorting
    vals_out: wgpu::Buffer,

    /// intermediate key buffer for the ping-pong passes
    #[allow(dead_code)]
    keys_aux: wgpu::Buffer,
    /// intermediate value buffer for the ping-pong passes
    #[allow(dead_code)]
    vals_aux: wgpu::Buffer,

    /// (block x 256) count matrix, padded to a power of two rows
    blocks: wgpu::Buffer,

    /// bind groups for pass 0, the odd passes and the later even passes
    bind_groups: [wgpu::BindGroup; 3],

    // number of key-value pairs
    length: u32,
}

impl SortBuffers {
    /// number of key-value pairs that can be stored in this buffer
    pub fn len(&self) -> u32 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Buffer the keys to sort are uploaded to.
    pub fn keys(&self) -> &wgpu::Buffer {
        &self.keys_in
    }

    /// Buffer the values are uploaded to. Can stay untouched when sorting
    /// with [GPUSorter::argsort].
    pub fn values(&self) -> &wgpu::Buffer {
        &self.vals_in
    }

    /// Keys in ascending order, valid after the sort was submitted.
    pub fn sorted_keys(&self) -> &wgpu::Buffer {
        &self.keys_out
    }

    /// Values in key order, valid after the sort was submitted.
    pub fn sorted_values(&self) -> &wgpu::Buffer {
        &self.vals_out
    }

    /// The histogram matrix, one row of 256 counts per block. Only
    /// meaningful between the recorded phases of a pass.
    pub fn block_matrix(&self) -> &wgpu::Buffer {
        &self.blocks
    }

    fn pass_bind_group(&self, pass_index: u32) -> &wgpu::BindGroup {
        if pass_index == 0 {
            &self.bind_groups[0]
        } else if pass_index % 2 == 1 {
            &self.bind_groups[1]
        } else {
            &self.bind_groups[2]
        }
    }
}

/// number of blocks needed for n keys
fn num_blocks(n: u32) -> u32 {
    n.div_ceil(BLOCK_KVS)
}
