//! The frame driver: per-frame phase ordering, settings synchronization,
//! flushing, the post-process pass and presentation.

use std::sync::Arc;
#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicI64, Ordering};
#[cfg(debug_assertions)]
use std::time::Instant;

use super::atlas::GlyphAtlas;
use super::decorations;
use super::pipeline::{ColorBitmapSource, ResourceManager};
use super::quads::QuadStream;
use super::text;
use super::types::CursorRect;
use crate::custom_shader_renderer::{PostProcess, PostUniforms};
use crate::error::RenderError;
use crate::font_manager::FontManager;
use crate::payload::{PixelRect, RenderingPayload, color_from_u32_premultiply};
#[cfg(debug_assertions)]
use crate::shader_watcher::{ShaderWatcher, WATCH_IDLE};
use crate::swap_chain::SwapChainManager;

struct OffscreenTarget {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: [u32; 2],
}

#[cfg(debug_assertions)]
struct HotReload {
    _watcher: ShaderWatcher,
    invalidation: Arc<AtomicI64>,
    epoch: Instant,
}

/// The renderer. One instance owns the device-facing resources for one
/// terminal surface; [`Renderer::render`] produces one frame from a payload.
pub struct Renderer {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    swap_chain: SwapChainManager,
    font_manager: FontManager,
    res: ResourceManager,
    post: PostProcess,
    offscreen: Option<OffscreenTarget>,
    atlas: GlyphAtlas,
    quads: QuadStream,
    cursor_rects: Vec<CursorRect>,
    skip_foreground_upload: bool,
    generation: u64,
    font_generation: u64,
    misc_generation: u64,
    cell_count: [u16; 2],
    #[cfg(debug_assertions)]
    hot_reload: Option<HotReload>,
}

impl Renderer {
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        swap_chain: SwapChainManager,
        font_manager: FontManager,
    ) -> Result<Self, RenderError> {
        // Subpixel text and the invert cursor both rely on the second blend
        // source.
        if !device.features().contains(wgpu::Features::DUAL_SOURCE_BLENDING) {
            return Err(RenderError::MissingDeviceFeature("DUAL_SOURCE_BLENDING"));
        }

        let res = ResourceManager::new(&device, swap_chain.format());
        Ok(Self {
            device,
            queue,
            swap_chain,
            font_manager,
            res,
            post: PostProcess::None,
            offscreen: None,
            atlas: GlyphAtlas::new(),
            quads: QuadStream::new(),
            cursor_rects: Vec::new(),
            skip_foreground_upload: false,
            generation: u64::MAX,
            font_generation: u64::MAX,
            misc_generation: u64::MAX,
            cell_count: [0, 0],
            #[cfg(debug_assertions)]
            hot_reload: None,
        })
    }

    pub fn font_manager_mut(&mut self) -> &mut FontManager {
        &mut self.font_manager
    }

    /// True while the active post-process shader animates and therefore
    /// needs a frame even when nothing changed.
    pub fn requires_continuous_redraw(&self) -> bool {
        self.post.requires_continuous_redraw()
    }

    pub fn wait_until_can_render(&self) {
        self.swap_chain.wait_until_can_render();
    }

    /// Renders one frame. On [`RenderError::DeviceLost`] the owner must
    /// recreate the device and discard this renderer.
    pub fn render(&mut self, p: &mut RenderingPayload) -> Result<(), RenderError> {
        if self.generation != p.settings.generation {
            self.handle_settings_update(p);
        }

        #[cfg(debug_assertions)]
        self.debug_update_shaders(p);

        let frame = self.swap_chain.get_buffer(&self.device)?;
        let surface_view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut frame_cleared = false;
        self.skip_foreground_upload = false;

        let clear_color = {
            let [r, g, b, a] = color_from_u32_premultiply(p.settings.misc.background_color);
            wgpu::Color {
                r: r as f64,
                g: g as f64,
                b: b as f64,
                a: a as f64,
            }
        };

        decorations::draw_background(&mut self.quads, &p.settings);
        decorations::draw_cursor_part1(
            &mut self.quads,
            &mut self.cursor_rects,
            &p.settings,
            p.cursor_rect,
            &p.color_bitmap,
            p.color_bitmap_row_stride,
        );

        let max_dim = self.device.limits().max_texture_dimension_2d;
        let skip_foreground;
        {
            let RenderingPayload {
                settings,
                rows,
                color_bitmap,
                color_bitmap_row_stride,
                color_bitmap_generations,
                invalidated_rows,
                dirty_rect_in_px,
                ..
            } = p;
            let device = &self.device;
            let queue = &self.queue;
            let res = &mut self.res;
            let target: &wgpu::TextureView = match self.offscreen.as_ref() {
                Some(offscreen) => &offscreen.view,
                None => &surface_view,
            };
            let cleared = &mut frame_cleared;
            let cell_count = settings.cell_count;

            let out = text::draw_text(
                &mut self.atlas,
                &mut self.font_manager,
                &mut self.quads,
                settings,
                rows,
                invalidated_rows,
                dirty_rect_in_px,
                max_dim,
                &mut |atlas, quads| {
                    res.flush_quads(
                        device,
                        queue,
                        target,
                        cleared,
                        clear_color,
                        atlas,
                        quads,
                        &ColorBitmapSource {
                            data: color_bitmap.as_slice(),
                            row_stride: *color_bitmap_row_stride,
                            generations: *color_bitmap_generations,
                        },
                        cell_count,
                        false,
                    );
                    Ok(())
                },
            )?;
            skip_foreground = out.skip_foreground_bitmap_upload;
        }
        self.skip_foreground_upload = skip_foreground;

        decorations::draw_gridlines(&mut self.quads, &p.settings, &p.rows);
        decorations::draw_cursor_part2(
            &mut self.quads,
            &self.cursor_rects,
            p.settings.cursor.cursor_color,
        );
        decorations::draw_selection(&mut self.quads, &p.settings, &p.rows);

        {
            let target: &wgpu::TextureView = match self.offscreen.as_ref() {
                Some(offscreen) => &offscreen.view,
                None => &surface_view,
            };
            self.res.flush_quads(
                &self.device,
                &self.queue,
                target,
                &mut frame_cleared,
                clear_color,
                &mut self.atlas,
                &mut self.quads,
                &ColorBitmapSource {
                    data: &p.color_bitmap,
                    row_stride: p.color_bitmap_row_stride,
                    generations: p.color_bitmap_generations,
                },
                p.settings.cell_count,
                self.skip_foreground_upload,
            );
        }

        if let Some(pass) = self.post.pass_mut() {
            let font = &p.settings.font;
            let uniforms = PostUniforms {
                time: pass.elapsed(),
                scale: font.dpi.max(1) as f32 / 96.0,
                resolution: [
                    (p.settings.cell_count[0] as u32 * font.cell_size[0] as u32) as f32,
                    (p.settings.cell_count[1] as u32 * font.cell_size[1] as u32) as f32,
                ],
                background: color_from_u32_premultiply(p.settings.misc.background_color),
            };
            pass.execute(&self.device, &self.queue, &surface_view, uniforms);

            // The shader may touch any pixel; partial presents are off the
            // table for this frame.
            p.dirty_rect_in_px = PixelRect {
                left: 0,
                top: 0,
                right: p.settings.target_size[0] as i32,
                bottom: p.settings.target_size[1] as i32,
            };
        }

        self.swap_chain.present(frame);
        Ok(())
    }

    fn handle_settings_update(&mut self, p: &mut RenderingPayload) {
        let mut dropped_target = false;
        self.swap_chain.update_settings(
            &p.settings,
            &self.device,
            || dropped_target = true,
            || {},
        );
        if dropped_target {
            self.offscreen = None;
        }

        let font_changed = self.font_generation != p.settings.font.generation;
        let misc_changed = self.misc_generation != p.settings.misc.generation;
        let cell_count_changed = self.cell_count != p.settings.cell_count;

        if font_changed {
            self.atlas.request_reset();
        }
        if misc_changed {
            self.post = PostProcess::recreate(
                &self.device,
                self.swap_chain.format(),
                &p.settings.misc,
                p.warning_callback.as_deref_mut(),
            );
            #[cfg(debug_assertions)]
            self.setup_hot_reload(p);
        }
        if cell_count_changed {
            self.res
                .recreate_color_bitmap(&self.device, p.settings.cell_count);
        }

        if self.post.is_active() {
            self.ensure_offscreen(p.settings.target_size);
        } else {
            self.offscreen = None;
        }

        self.res.update_uniforms(&self.queue, &p.settings);

        self.generation = p.settings.generation;
        self.font_generation = p.settings.font.generation;
        self.misc_generation = p.settings.misc.generation;
        self.cell_count = p.settings.cell_count;
    }

    /// (Re)creates the offscreen post-process input and points the pass at
    /// it.
    fn ensure_offscreen(&mut self, target_size: [u32; 2]) {
        let stale = self
            .offscreen
            .as_ref()
            .is_none_or(|offscreen| offscreen.size != target_size);
        if stale {
            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("post-process content"),
                size: wgpu::Extent3d {
                    width: target_size[0].max(1),
                    height: target_size[1].max(1),
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: self.swap_chain.format(),
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            self.offscreen = Some(OffscreenTarget {
                _texture: texture,
                view,
                size: target_size,
            });
        }

        if let Some((pass, offscreen)) = self.post.pass_mut().zip(self.offscreen.as_ref()) {
            pass.rebind(&self.device, &offscreen.view);
        }
    }

    #[cfg(debug_assertions)]
    fn setup_hot_reload(&mut self, p: &RenderingPayload) {
        self.hot_reload = None;
        let Some(path) = &p.settings.misc.custom_shader_path else {
            return;
        };
        let invalidation = Arc::new(AtomicI64::new(WATCH_IDLE));
        let epoch = Instant::now();
        match ShaderWatcher::new(path, Arc::clone(&invalidation), epoch) {
            Ok(watcher) => {
                self.hot_reload = Some(HotReload {
                    _watcher: watcher,
                    invalidation,
                    epoch,
                });
            }
            Err(e) => log::warn!("shader hot reload unavailable: {e:#}"),
        }
    }

    /// Recompiles the custom shader once the watcher's debounce deadline has
    /// passed.
    #[cfg(debug_assertions)]
    fn debug_update_shaders(&mut self, p: &mut RenderingPayload) {
        let Some(hot) = self.hot_reload.as_ref() else {
            return;
        };
        let deadline = hot.invalidation.load(Ordering::Relaxed);
        if deadline == WATCH_IDLE || (hot.epoch.elapsed().as_millis() as i64) < deadline {
            return;
        }
        hot.invalidation.store(WATCH_IDLE, Ordering::Relaxed);

        log::info!("custom shader changed on disk; recompiling");
        self.post = PostProcess::recreate(
            &self.device,
            self.swap_chain.format(),
            &p.settings.misc,
            p.warning_callback.as_deref_mut(),
        );
        if self.post.is_active() {
            self.ensure_offscreen(p.settings.target_size);
        } else {
            self.offscreen = None;
        }
    }
}
