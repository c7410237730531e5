//! Post-processing: the user's custom WGSL shader or the built-in retro
//! terminal effect, applied over the finished frame.
//!
//! The frame is rendered into an offscreen texture, then one fullscreen pass
//! samples it through the chosen shader into the back buffer. A custom
//! shader is parsed and validated with naga before it goes anywhere near the
//! device; compile failures are reported through the payload's warning
//! callback and disable the pass.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::error::RenderWarning;
use crate::payload::MiscSettings;

/// Uniforms available to post-process shaders. The `time` member comes
/// first: whether a shader reads it decides `requires_continuous_redraw`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PostUniforms {
    /// Seconds since the shader was (re)created.
    pub time: f32,
    /// DPI scale (dpi / 96).
    pub scale: f32,
    /// Viewport resolution covered by cells, in pixels.
    pub resolution: [f32; 2],
    /// Premultiplied background color.
    pub background: [f32; 4],
}

pub struct PostPass {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    bind_group: Option<wgpu::BindGroup>,
    uniform_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
    start_time: Instant,
}

/// The post-process chain selection.
pub enum PostProcess {
    None,
    Retro(PostPass),
    Custom {
        pass: PostPass,
        requires_continuous_redraw: bool,
    },
}

impl PostProcess {
    /// Rebuilds the chain from the misc settings. A custom shader path wins
    /// over the retro flag.
    pub fn recreate(
        device: &wgpu::Device,
        surface_format: wgpu::TextureFormat,
        misc: &MiscSettings,
        mut warning: Option<&mut (dyn FnMut(RenderWarning) + Send + 'static)>,
    ) -> Self {
        if let Some(path) = &misc.custom_shader_path {
            match load_custom_shader(device, surface_format, path) {
                Ok((pass, requires_continuous_redraw)) => {
                    log::info!(
                        "custom post-process shader loaded from {} (continuous redraw: {})",
                        path.display(),
                        requires_continuous_redraw
                    );
                    Self::Custom {
                        pass,
                        requires_continuous_redraw,
                    }
                }
                Err(e) => {
                    log::error!("custom shader {}: {e:#}", path.display());
                    if let Some(warn) = warning.as_mut() {
                        warn(RenderWarning::ShaderCompile {
                            path: path.clone(),
                            message: format!("{e:#}"),
                        });
                    }
                    Self::None
                }
            }
        } else if misc.use_retro_terminal_effect {
            let pass = PostPass::new(
                device,
                surface_format,
                include_str!("shaders/retro.wgsl"),
                "retro post-process",
            );
            Self::Retro(pass)
        } else {
            Self::None
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn requires_continuous_redraw(&self) -> bool {
        match self {
            Self::Custom {
                requires_continuous_redraw,
                ..
            } => *requires_continuous_redraw,
            _ => false,
        }
    }

    pub fn pass_mut(&mut self) -> Option<&mut PostPass> {
        match self {
            Self::None => None,
            Self::Retro(pass) | Self::Custom { pass, .. } => Some(pass),
        }
    }
}

impl PostPass {
    fn new(
        device: &wgpu::Device,
        surface_format: wgpu::TextureFormat,
        fragment_source: &str,
        label: &str,
    ) -> Self {
        let vs_module = device.create_shader_module(wgpu::include_wgsl!("shaders/post.wgsl"));
        let fs_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(fragment_source.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("post bind group layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
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
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("post pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &vs_module,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &fs_module,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("post sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("post uniforms"),
            size: std::mem::size_of::<PostUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            pipeline,
            bind_group_layout,
            bind_group: None,
            uniform_buffer,
            sampler,
            start_time: Instant::now(),
        }
    }

    /// Rebuilds the bind group against a new offscreen content texture.
    pub fn rebind(&mut self, device: &wgpu::Device, content: &wgpu::TextureView) {
        self.bind_group = Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("post bind group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(content),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        }));
    }

    pub fn elapsed(&self) -> f32 {
        self.start_time.elapsed().as_secs_f32()
    }

    /// Runs the fullscreen pass into `dest`.
    pub fn execute(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        dest: &wgpu::TextureView,
        uniforms: PostUniforms,
    ) {
        let Some(bind_group) = self.bind_group.as_ref() else {
            log::error!("post-process pass without content bind group");
            return;
        };

        queue.write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("post-process"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("post-process pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: dest,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.draw(0..4, 0..1);
        }
        queue.submit(std::iter::once(encoder.finish()));
    }
}

fn load_custom_shader(
    device: &wgpu::Device,
    surface_format: wgpu::TextureFormat,
    path: &Path,
) -> Result<(PostPass, bool)> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read shader file: {}", path.display()))?;

    // Validate before the module reaches the device so errors are
    // reportable instead of a device loss.
    let module = naga::front::wgsl::parse_str(&source)
        .map_err(|e| anyhow::anyhow!("parse failed: {}", e.emit_to_string(&source)))?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::empty(),
    )
    .validate(&module)
    .map_err(|e| anyhow::anyhow!("validation failed: {:?}", e))?;

    if !module
        .entry_points
        .iter()
        .any(|ep| ep.stage == naga::ShaderStage::Fragment && ep.name == "fs_main")
    {
        anyhow::bail!("no fragment entry point named fs_main");
    }

    let requires_continuous_redraw = shader_reads_time(&module);
    let pass = PostPass::new(device, surface_format, &source, "custom post-process");
    Ok((pass, requires_continuous_redraw))
}

/// Whether any entry point reads the first member (`time`) of the shader's
/// uniform block. Shaders without a uniform block are conservatively treated
/// as animated.
pub(crate) fn shader_reads_time(module: &naga::Module) -> bool {
    let Some(uniform_handle) = module
        .global_variables
        .iter()
        .find(|(_, v)| v.space == naga::AddressSpace::Uniform)
        .map(|(h, _)| h)
    else {
        return true;
    };

    let functions = module
        .functions
        .iter()
        .map(|(_, f)| f)
        .chain(module.entry_points.iter().map(|ep| &ep.function));

    for function in functions {
        for (_, expr) in function.expressions.iter() {
            let base = match expr {
                // Member 0 by index, or a dynamic access we can't see
                // through.
                naga::Expression::AccessIndex { base, index: 0 } => base,
                naga::Expression::Access { base, .. } => base,
                _ => continue,
            };
            if let naga::Expression::GlobalVariable(gv) = function.expressions[*base]
                && gv == uniform_handle
            {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> naga::Module {
        naga::front::wgsl::parse_str(source).expect("test shader must parse")
    }

    const HEADER: &str = "
        struct PostUniforms {
            time: f32,
            scale: f32,
            resolution: vec2<f32>,
            background: vec4<f32>,
        }
        @group(0) @binding(0) var<uniform> uniforms: PostUniforms;
        @group(0) @binding(1) var content: texture_2d<f32>;
        @group(0) @binding(2) var content_sampler: sampler;
    ";

    #[test]
    fn time_reading_shader_requires_continuous_redraw() {
        let module = parse(&format!(
            "{HEADER}
            @fragment
            fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {{
                let flicker = sin(uniforms.time * 8.0) * 0.04;
                return textureSample(content, content_sampler, uv) + vec4(flicker);
            }}"
        ));
        assert!(shader_reads_time(&module));
    }

    #[test]
    fn static_shader_does_not_require_continuous_redraw() {
        let module = parse(&format!(
            "{HEADER}
            @fragment
            fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {{
                let px = uv * uniforms.resolution;
                var color = textureSample(content, content_sampler, uv);
                if (u32(px.y) % 2u) == 1u {{
                    color = color * 0.9;
                }}
                return color;
            }}"
        ));
        assert!(!shader_reads_time(&module));
    }

    #[test]
    fn shader_without_uniforms_is_assumed_animated() {
        let module = parse(
            "
            @group(0) @binding(1) var content: texture_2d<f32>;
            @group(0) @binding(2) var content_sampler: sampler;
            @fragment
            fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
                return textureSample(content, content_sampler, uv);
            }",
        );
        assert!(shader_reads_time(&module));
    }

    #[test]
    fn builtin_retro_shader_is_valid_and_static() {
        let source = include_str!("shaders/retro.wgsl");
        let module = parse(source);
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::empty(),
        )
        .validate(&module)
        .expect("retro shader must validate");
        assert!(
            module
                .entry_points
                .iter()
                .any(|ep| ep.stage == naga::ShaderStage::Fragment && ep.name == "fs_main")
        );
    }

    #[test]
    fn builtin_post_vertex_shader_is_valid() {
        let source = include_str!("shaders/post.wgsl");
        let module = parse(source);
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::empty(),
        )
        .validate(&module)
        .expect("post vertex shader must validate");
    }

    #[test]
    fn quad_shader_is_valid() {
        let source = include_str!("shaders/quad.wgsl");
        let module = parse(source);
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .expect("quad shader must validate");
    }
}
