//! GPU resources: the two quad pipelines (standard and invert blend), the
//! shared geometry/uniform buffers, the color bitmap, the atlas texture, and
//! the flush that turns the quad stream into draw calls.

use wgpu::util::DeviceExt;

use super::atlas::GlyphAtlas;
use super::quads::{QuadStream, SpanEvent};
use super::types::{BlendMode, PsUniforms, QuadInstance, Vertex, VsUniforms};

/// Snapshot of the payload's color grid for one upload.
pub(crate) struct ColorBitmapSource<'a> {
    pub data: &'a [u32],
    pub row_stride: usize,
    pub generations: [u64; 2],
}

struct ColorBitmap {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    generations: [u64; 2],
    cell_count: [u16; 2],
}

struct AtlasTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    generation: u64,
}

pub(crate) struct ResourceManager {
    pipeline_standard: wgpu::RenderPipeline,
    pipeline_invert: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    bind_group: Option<wgpu::BindGroup>,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    instance_buffer: Option<wgpu::Buffer>,
    instance_capacity: usize,
    vs_uniform_buffer: wgpu::Buffer,
    ps_uniform_buffer: wgpu::Buffer,
    color_bitmap: Option<ColorBitmap>,
    atlas_texture: Option<AtlasTexture>,
}

impl ResourceManager {
    pub fn new(device: &wgpu::Device, surface_format: wgpu::TextureFormat) -> Self {
        let shader = device.create_shader_module(wgpu::include_wgsl!("../shaders/quad.wgsl"));

        let vertices = [
            Vertex { position: [0.0, 0.0] },
            Vertex { position: [1.0, 0.0] },
            Vertex { position: [1.0, 1.0] },
            Vertex { position: [0.0, 1.0] },
        ];
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("quad vertices"),
            contents: bytemuck::cast_slice(&vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let indices: [u16; 6] = [0, 1, 2, 2, 3, 0];
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("quad indices"),
            contents: bytemuck::cast_slice(&indices),
            usage: wgpu::BufferUsages::INDEX,
        });

        let vs_uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vs uniforms"),
            size: std::mem::size_of::<VsUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let ps_uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ps uniforms"),
            size: std::mem::size_of::<PsUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("quad bind group layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("quad pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        // The final ClearType step is a per-channel lerp between the
        // destination and the foreground, with the pixel shader emitting the
        // weights as the second source. Passthrough quads need plain
        // source-over at the same time, so the source factor stays ONE and
        // the shader pre-multiplies the foreground by the weights.
        let standard_blend = wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::OneMinusSrc1,
                operation: wgpu::BlendOperation::Add,
            },
            alpha: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::OneMinusSrc1Alpha,
                operation: wgpu::BlendOperation::Add,
            },
        };
        // dst - src inverts whatever the text pass produced underneath.
        let invert_blend = wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::ReverseSubtract,
            },
            alpha: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::Src1Alpha,
                dst_factor: wgpu::BlendFactor::Zero,
                operation: wgpu::BlendOperation::Add,
            },
        };

        let make_pipeline = |label: &str, blend: wgpu::BlendState| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[
                        wgpu::VertexBufferLayout {
                            array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
                            step_mode: wgpu::VertexStepMode::Vertex,
                            attributes: &wgpu::vertex_attr_array![0 => Float32x2],
                        },
                        wgpu::VertexBufferLayout {
                            array_stride: std::mem::size_of::<QuadInstance>()
                                as wgpu::BufferAddress,
                            step_mode: wgpu::VertexStepMode::Instance,
                            attributes: &wgpu::vertex_attr_array![
                                1 => Uint32,
                                2 => Sint16x2,
                                3 => Uint16x2,
                                4 => Uint16x2,
                                5 => Unorm8x4
                            ],
                        },
                    ],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: surface_format,
                        blend: Some(blend),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };

        Self {
            pipeline_standard: make_pipeline("quad pipeline", standard_blend),
            pipeline_invert: make_pipeline("quad pipeline (invert)", invert_blend),
            bind_group_layout,
            bind_group: None,
            vertex_buffer,
            index_buffer,
            instance_buffer: None,
            instance_capacity: 0,
            vs_uniform_buffer,
            ps_uniform_buffer,
            color_bitmap: None,
            atlas_texture: None,
        }
    }

    pub fn update_uniforms(&self, queue: &wgpu::Queue, settings: &crate::payload::RenderSettings) {
        let [w, h] = settings.target_size;
        let vs = VsUniforms {
            position_scale: [2.0 / w.max(1) as f32, -2.0 / h.max(1) as f32],
            _pad: [0.0; 2],
        };
        queue.write_buffer(&self.vs_uniform_buffer, 0, bytemuck::bytes_of(&vs));

        let font = &settings.font;
        let enhanced_contrast = match font.antialiasing_mode {
            crate::payload::AntialiasingMode::ClearType => font.cleartype_enhanced_contrast,
            _ => font.grayscale_enhanced_contrast,
        };
        let ps = PsUniforms {
            background_color: crate::payload::color_from_u32_premultiply(
                settings.misc.background_color,
            ),
            cell_size: [font.cell_size[0] as f32, font.cell_size[1] as f32],
            cell_count: [
                settings.cell_count[0] as f32,
                settings.cell_count[1] as f32,
            ],
            enhanced_contrast,
            gamma: if font.gamma > 0.0 { font.gamma } else { 1.0 },
            dashed_line_length: font.underline_width as f32 * 3.0,
            _pad: 0.0,
        };
        queue.write_buffer(&self.ps_uniform_buffer, 0, bytemuck::bytes_of(&ps));
    }

    pub fn recreate_color_bitmap(&mut self, device: &wgpu::Device, cell_count: [u16; 2]) {
        // Release first to avoid a usage spike.
        self.color_bitmap = None;
        self.bind_group = None;

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("color bitmap"),
            size: wgpu::Extent3d {
                width: cell_count[0].max(1) as u32,
                height: cell_count[1].max(1) as u32 * 2,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.color_bitmap = Some(ColorBitmap {
            texture,
            view,
            generations: [u64::MAX; 2],
            cell_count,
        });
    }

    fn upload_color_bitmap(
        &mut self,
        queue: &wgpu::Queue,
        source: &ColorBitmapSource<'_>,
        skip_foreground: bool,
    ) {
        let Some(cb) = self.color_bitmap.as_mut() else {
            return;
        };
        // Skipping the upload halves the GPU traffic of an ordinary frame;
        // the foreground half additionally only matters to ligature quads.
        if cb.generations[0] == source.generations[0]
            && (cb.generations[1] == source.generations[1] || skip_foreground)
        {
            return;
        }

        let width = cb.cell_count[0] as u32;
        let rows = cb.cell_count[1] as u32 * 2;
        let expected = source.row_stride * rows as usize;
        if source.row_stride < width as usize || source.data.len() < expected {
            log::warn!(
                "color bitmap too small: {} entries, stride {}, need {}",
                source.data.len(),
                source.row_stride,
                expected
            );
            return;
        }

        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &cb.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&source.data[..expected]),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(source.row_stride as u32 * 4),
                rows_per_image: Some(rows),
            },
            wgpu::Extent3d {
                width,
                height: rows,
                depth_or_array_layers: 1,
            },
        );

        cb.generations = source.generations;
    }

    /// Recreates the atlas texture when the atlas was reset. New textures
    /// come up zeroed, which doubles as the atlas clear.
    fn ensure_atlas_texture(&mut self, device: &wgpu::Device, atlas: &GlyphAtlas) {
        let current = self.atlas_texture.as_ref().map(|a| a.generation);
        if current == Some(atlas.generation()) {
            return;
        }

        self.atlas_texture = None;
        self.bind_group = None;

        let [w, h] = atlas.extent();
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("glyph atlas"),
            size: wgpu::Extent3d {
                width: w.max(1) as u32,
                height: h.max(1) as u32,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.atlas_texture = Some(AtlasTexture {
            texture,
            view,
            generation: atlas.generation(),
        });
    }

    fn ensure_bind_group(&mut self, device: &wgpu::Device) {
        if self.bind_group.is_some() {
            return;
        }
        let (Some(cb), Some(at)) = (self.color_bitmap.as_ref(), self.atlas_texture.as_ref())
        else {
            return;
        };
        self.bind_group = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("quad bind group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.vs_uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.ps_uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&cb.view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&at.view),
                },
            ],
        }));
    }

    fn ensure_instance_capacity(
        &mut self,
        device: &wgpu::Device,
        count: usize,
        cell_count: [u16; 2],
    ) {
        if self.instance_buffer.is_some() && count <= self.instance_capacity {
            return;
        }

        // The viewport cell count is the initial estimate; growth rounds up
        // to 64 KiB multiples to keep reallocations rare.
        let min_capacity = cell_count[0] as usize * cell_count[1] as usize;
        let capacity = count.max(min_capacity).max(1);
        let size = (capacity * std::mem::size_of::<QuadInstance>() + 0xffff) & !0xffff;

        self.instance_buffer = Some(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("quad instances"),
            size: size as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));
        self.instance_capacity = size / std::mem::size_of::<QuadInstance>();
        log::debug!("instance buffer capacity: {}", self.instance_capacity);
    }

    /// Uploads the color bitmap, the staged atlas blits and the instance
    /// stream, then issues one indexed instanced draw per state span.
    #[allow(clippy::too_many_arguments)]
    pub fn flush_quads(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        target: &wgpu::TextureView,
        frame_cleared: &mut bool,
        clear_color: wgpu::Color,
        atlas: &mut GlyphAtlas,
        quads: &mut QuadStream,
        color_bitmap: &ColorBitmapSource<'_>,
        cell_count: [u16; 2],
        skip_foreground: bool,
    ) {
        if quads.is_empty() {
            return;
        }

        self.upload_color_bitmap(queue, color_bitmap, skip_foreground);
        self.ensure_atlas_texture(device, atlas);
        self.ensure_bind_group(device);

        if let Some(at) = self.atlas_texture.as_ref() {
            for blit in atlas.take_pending() {
                queue.write_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture: &at.texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d {
                            x: blit.x,
                            y: blit.y,
                            z: 0,
                        },
                        aspect: wgpu::TextureAspect::All,
                    },
                    &blit.pixels,
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(blit.width * 4),
                        rows_per_image: Some(blit.height),
                    },
                    wgpu::Extent3d {
                        width: blit.width,
                        height: blit.height,
                        depth_or_array_layers: 1,
                    },
                );
            }
        }

        self.ensure_instance_capacity(device, quads.len(), cell_count);
        let Some(instance_buffer) = self.instance_buffer.as_ref() else {
            return;
        };
        queue.write_buffer(instance_buffer, 0, bytemuck::cast_slice(quads.as_slice()));

        let mut ops = Vec::new();
        quads.drain(|event| ops.push(event));

        let Some(bind_group) = self.bind_group.as_ref() else {
            log::error!("flush without bind group; dropping {} spans", ops.len());
            return;
        };

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("quad flush"),
        });
        {
            let load = if *frame_cleared {
                wgpu::LoadOp::Load
            } else {
                wgpu::LoadOp::Clear(clear_color)
            };
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("quad pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            pass.set_pipeline(&self.pipeline_standard);
            pass.set_bind_group(0, bind_group, &[]);
            pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            pass.set_vertex_buffer(1, instance_buffer.slice(..));
            pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);

            for op in ops {
                match op {
                    SpanEvent::Draw(range) => pass.draw_indexed(0..6, 0, range),
                    SpanEvent::SetBlend(BlendMode::Standard) => {
                        pass.set_pipeline(&self.pipeline_standard)
                    }
                    SpanEvent::SetBlend(BlendMode::Invert) => {
                        pass.set_pipeline(&self.pipeline_invert)
                    }
                }
            }
        }
        queue.submit(std::iter::once(encoder.finish()));
        *frame_cleared = true;
    }
}
