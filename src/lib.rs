//! atlasterm: a GPU glyph-atlas terminal renderer backend.
//!
//! Given a per-frame payload of shaped rows (glyph indices, advances,
//! per-cell colors), the renderer rasterizes missing glyphs into a shared
//! atlas texture on demand, compiles one packed stream of quad instances
//! for background, text, gridlines, cursor and selection, and submits it in
//! a handful of draw calls, with an optional user post-processing pass.
//!
//! Text shaping, escape-sequence handling and window plumbing live with the
//! embedding application; this crate starts where a [`payload::ShapedRow`]
//! ends.

/// Crate version, for embedders that report it.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod custom_shader_renderer;
pub mod error;
pub mod font_manager;
pub mod payload;
pub mod renderer;
pub mod shader_watcher;
pub mod swap_chain;

pub use error::{RenderError, RenderWarning};
pub use payload::RenderingPayload;
pub use renderer::Renderer;
pub use swap_chain::SwapChainManager;
