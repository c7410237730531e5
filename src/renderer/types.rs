//! GPU-visible instance/uniform layouts and small shared renderer types.

/// Shading type tags. The pixel shader dispatches on the low bits; the
/// ligature marker is OR-ed into text quads whose glyph overhangs its cell.
pub mod shading {
    pub const DEFAULT: u16 = 0;
    pub const BACKGROUND: u16 = 1;
    pub const SOLID_FILL: u16 = 2;
    pub const TEXT_GRAYSCALE: u16 = 3;
    pub const TEXT_CLEARTYPE: u16 = 4;
    pub const PASSTHROUGH: u16 = 5;

    /// Non-exclusive flag: clamp the foreground color to cell bounds.
    pub const LIGATURE_MARKER: u16 = 0x8000;
    pub const MASK: u16 = 0x7fff;
}

/// One instanced quad. Field order matters: the GPU input layout reads the
/// leading `u16 + u8x2` as a single `Uint32` attribute, then
/// `Sint16x2`/`Uint16x2`/`Uint16x2`/`Unorm8x4`. The trailing padding brings
/// the stride to 32 bytes so the stream stays fixed-size and SIMD-copyable.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct QuadInstance {
    pub shading_type: u16,
    /// Reserved for DECDHL shaders; 0 or 1 in each axis.
    pub rendition_scale: [u8; 2],
    /// Pixel coordinates, top-left origin.
    pub position: [i16; 2],
    pub size: [u16; 2],
    /// Atlas pixel coordinates; unused for solid fills.
    pub texcoord: [u16; 2],
    /// Premultiplied RGBA, little-endian.
    pub color: u32,
    pub _pad: [u32; 3],
}

/// Unit quad corner fed to the vertex shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
}

/// Vertex-stage uniforms.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct VsUniforms {
    /// `(2 / target_w, -2 / target_h)`: pixel coordinates to clip space.
    pub position_scale: [f32; 2],
    pub _pad: [f32; 2],
}

/// Fragment-stage uniforms.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PsUniforms {
    /// Premultiplied.
    pub background_color: [f32; 4],
    pub cell_size: [f32; 2],
    pub cell_count: [f32; 2],
    pub enhanced_contrast: f32,
    pub gamma: f32,
    pub dashed_line_length: f32,
    pub _pad: f32,
}

/// The two blend states of the renderer (baked into two pipelines in wgpu).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendMode {
    /// Dual-source over: text and opaque fills.
    Standard,
    /// Dual-source subtractive: the auto-color invert cursor.
    Invert,
}

/// A boundary in the quad stream at which the blend state changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub offset: u32,
    /// `None` marks the flush sentinel.
    pub blend: Option<BlendMode>,
}

/// Glyph cache value: where the glyph lives in the atlas and how to shade it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AtlasGlyphEntry {
    pub shading_type: u16,
    /// Drawing offset from the baseline origin.
    pub offset: [i16; 2],
    pub size: [u16; 2],
    /// Top-left in the atlas.
    pub texcoord: [u16; 2],
}

/// A cursor rectangle built in part 1 and re-emitted in part 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CursorRect {
    pub position: [i16; 2],
    pub size: [u16; 2],
    pub color: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_instance_is_32_bytes() {
        assert_eq!(std::mem::size_of::<QuadInstance>(), 32);
    }

    #[test]
    fn ligature_marker_is_outside_the_tag_mask() {
        assert_eq!(shading::LIGATURE_MARKER & shading::MASK, 0);
        let tagged = shading::TEXT_GRAYSCALE | shading::LIGATURE_MARKER;
        assert_eq!(tagged & shading::MASK, shading::TEXT_GRAYSCALE);
    }
}
