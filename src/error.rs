use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the renderer.
///
/// Recoverable conditions (a full atlas, a stale swap chain) are handled
/// internally within one frame; everything here aborts the frame.
#[derive(Debug, Error)]
pub enum RenderError {
    /// A glyph failed to pack into a freshly reset atlas. Retrying would loop
    /// forever, so the frame is aborted instead.
    #[error("glyph atlas deadlock: glyph does not fit into an empty atlas")]
    AtlasDeadlock,

    /// The graphics device is gone. The owner must recreate the device and
    /// discard this renderer.
    #[error("graphics device lost")]
    DeviceLost,

    /// Swap chain frame acquisition failed for a reason other than device
    /// loss.
    #[error("surface error: {0}")]
    Surface(wgpu::SurfaceError),

    /// No usable surface format / configuration could be negotiated.
    #[error("surface configuration failed: {0}")]
    SurfaceConfig(String),

    /// The device was created without a feature the renderer requires.
    #[error("device does not support {0}")]
    MissingDeviceFeature(&'static str),
}

/// Non-fatal conditions reported through `RenderingPayload::warning_callback`.
#[derive(Debug, Clone)]
pub enum RenderWarning {
    /// A user-supplied post-process shader failed to compile. The post-process
    /// pass is disabled until the next settings change fixes it.
    ShaderCompile { path: PathBuf, message: String },
}
