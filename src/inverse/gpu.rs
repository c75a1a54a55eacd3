//! wgpu compute path for batched inversion of single-precision matrices.

use num_complex::Complex32;
use wgpu::util::DeviceExt;

use crate::error::{Result, SolverError};

use super::shaders;

const WORKGROUP_SIZE: u32 = 64;

fn workgroup_count(n: u32) -> u32 {
    n.div_ceil(WORKGROUP_SIZE)
}

/// Matrices of order `n` that one dispatch can take: the work and inverse
/// bindings must each fit `max_binding_bytes`, and one thread per matrix
/// must fit `max_workgroups` workgroups.
fn matrices_per_chunk(n: usize, max_binding_bytes: u64, max_workgroups: u32) -> Result<usize> {
    let matrix_bytes = (n * n * 2 * std::mem::size_of::<f32>()) as u64;
    let by_binding = usize::try_from(max_binding_bytes / matrix_bytes).unwrap_or(usize::MAX);
    let by_dispatch = max_workgroups as usize * WORKGROUP_SIZE as usize;
    let per_chunk = by_binding.min(by_dispatch);
    if per_chunk == 0 {
        return Err(SolverError::Device(format!(
            "one {n}x{n} matrix needs {matrix_bytes} bytes, \
             storage bindings hold {max_binding_bytes}"
        )));
    }
    Ok(per_chunk)
}

// Shader Params layout: { n: u32, batch: u32 } padded to 16 bytes for the
// uniform address space.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    n: u32,
    batch: u32,
    _pad0: u32,
    _pad1: u32,
}

/// Device, queue and the compiled inversion pipeline.
pub(crate) struct GpuInverter {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
}

impl GpuInverter {
    pub(crate) fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| SolverError::Device("no GPU adapter found".into()))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("latsolve_inverse"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await
            .map_err(|e| SolverError::Device(format!("failed to get GPU device: {e}")))?;

        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("batch_invert"),
            source: wgpu::ShaderSource::Wgsl(shaders::SHADER_SOURCE.into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("batch_invert"),
            layout: None,
            module: &shader_module,
            entry_point: Some("batch_invert"),
            compilation_options: Default::default(),
            cache: None,
        });

        Ok(Self {
            device,
            queue,
            pipeline,
        })
    }

    /// Invert `batch` row-major `n x n` matrices from `a` into `out`, in as
    /// many dispatches as the device limits require.
    pub(crate) fn invert(
        &self,
        out: &mut [Complex32],
        a: &[Complex32],
        n: usize,
        batch: usize,
    ) -> Result<()> {
        if batch == 0 || n == 0 {
            return Ok(());
        }
        let limits = self.device.limits();
        let max_binding =
            u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
        let per_chunk =
            matrices_per_chunk(n, max_binding, limits.max_compute_workgroups_per_dimension)?;
        let chunk_len = per_chunk * n * n;
        tracing::debug!(batch, per_chunk, chunks = batch.div_ceil(per_chunk), "device inversion");

        for (out, a) in out.chunks_mut(chunk_len).zip(a.chunks(chunk_len)) {
            self.invert_chunk(out, a, n, a.len() / (n * n))?;
        }
        Ok(())
    }

    fn invert_chunk(
        &self,
        out: &mut [Complex32],
        a: &[Complex32],
        n: usize,
        batch: usize,
    ) -> Result<()> {
        let device = &self.device;
        let total = n * n * batch;

        let work: Vec<f32> = a.iter().flat_map(|z| [z.re, z.im]).collect();
        let mut identity = vec![0.0f32; 2 * total];
        for m in 0..batch {
            for i in 0..n {
                identity[2 * (m * n * n + i * n + i)] = 1.0;
            }
        }

        let work_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("invert_work"),
            contents: bytemuck::cast_slice(&work),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let inv_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("invert_out"),
            contents: bytemuck::cast_slice(&identity),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        });
        let params = Params {
            n: n as u32,
            batch: batch as u32,
            _pad0: 0,
            _pad1: 0,
        };
        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: None,
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &self.pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: work_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: inv_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });
        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, Some(&bg), &[]);
            pass.dispatch_workgroups(workgroup_count(batch as u32), 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));

        let flat = read_buffer_f32(device, &self.queue, &inv_buf, 2 * total)?;
        for (z, pair) in out.iter_mut().zip(flat.chunks_exact(2)) {
            *z = Complex32::new(pair[0], pair[1]);
        }
        Ok(())
    }
}

/// Read a GPU buffer back to the host as f32 values.
fn read_buffer_f32(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    src: &wgpu::Buffer,
    count: usize,
) -> Result<Vec<f32>> {
    let size = (count * std::mem::size_of::<f32>()) as u64;
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("read_staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&Default::default());
    encoder.copy_buffer_to_buffer(src, 0, &staging, 0, size);
    queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (sender, receiver) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = sender.send(r);
    });
    device
        .poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        })
        .map_err(|e| SolverError::Device(format!("device poll failed: {e}")))?;
    receiver
        .recv()
        .map_err(|e| SolverError::Device(format!("readback channel closed: {e}")))?
        .map_err(|e| SolverError::Device(format!("buffer map failed: {e}")))?;

    let data = slice.get_mapped_range();
    let result: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
    drop(data);
    staging.unmap();
    Ok(result)
}
