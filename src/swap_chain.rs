//! Swap chain management: surface configuration, frame acquisition and
//! presentation.

use std::sync::Arc;

use winit::window::Window;

use crate::error::RenderError;
use crate::payload::RenderSettings;

pub struct SwapChainManager {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
}

impl SwapChainManager {
    /// Creates a surface for `window` and configures it. Picks a non-sRGB
    /// format so quad colors pass through unconverted.
    pub fn new(
        window: Arc<Window>,
        instance: &wgpu::Instance,
        adapter: &wgpu::Adapter,
        device: &wgpu::Device,
    ) -> Result<Self, RenderError> {
        let size = window.inner_size();
        let surface = instance
            .create_surface(window)
            .map_err(|e| RenderError::SurfaceConfig(e.to_string()))?;

        let caps = surface.get_capabilities(adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .unwrap_or(caps.formats[0]);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(device, &config);

        Ok(Self { surface, config })
    }

    /// Wraps an already-configured surface (embedders that own the window
    /// plumbing).
    pub fn from_surface(surface: wgpu::Surface<'static>, config: wgpu::SurfaceConfiguration) -> Self {
        Self { surface, config }
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    pub fn target_size(&self) -> [u32; 2] {
        [self.config.width, self.config.height]
    }

    /// Reconfigures the surface when the payload's target size changed,
    /// invoking the hooks so the caller can drop render-target-dependent
    /// resources around the resize.
    pub fn update_settings(
        &mut self,
        settings: &RenderSettings,
        device: &wgpu::Device,
        mut before_resize: impl FnMut(),
        mut after_resize: impl FnMut(),
    ) {
        let [width, height] = settings.target_size;
        if width == 0 || height == 0 {
            return;
        }
        if width != self.config.width || height != self.config.height {
            before_resize();
            self.config.width = width;
            self.config.height = height;
            self.surface.configure(device, &self.config);
            after_resize();
            log::debug!("swap chain resized to {width}x{height}");
        }
    }

    /// Acquires the back buffer. An outdated surface is reconfigured and
    /// retried once; a lost device is surfaced for the owner to handle.
    pub fn get_buffer(&mut self, device: &wgpu::Device) -> Result<wgpu::SurfaceTexture, RenderError> {
        match self.surface.get_current_texture() {
            Ok(frame) => Ok(frame),
            Err(wgpu::SurfaceError::Outdated) => {
                self.surface.configure(device, &self.config);
                self.surface.get_current_texture().map_err(map_surface_error)
            }
            Err(e) => Err(map_surface_error(e)),
        }
    }

    pub fn present(&mut self, frame: wgpu::SurfaceTexture) {
        frame.present();
    }

    /// Frame pacing is handled by the configured maximum frame latency; the
    /// acquire in `get_buffer` blocks when the queue is full.
    pub fn wait_until_can_render(&self) {}
}

fn map_surface_error(e: wgpu::SurfaceError) -> RenderError {
    match e {
        wgpu::SurfaceError::Lost | wgpu::SurfaceError::OutOfMemory => RenderError::DeviceLost,
        other => RenderError::Surface(other),
    }
}
