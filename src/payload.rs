//! Per-frame rendering payload and the settings blocks it carries.
//!
//! The payload is produced by the shaping/terminal layer and handed to
//! [`crate::Renderer::render`] by reference once per frame. Settings blocks
//! carry generation counters; the renderer rebuilds the corresponding GPU
//! resources whenever a generation disagrees with what it saw last frame.

use std::ops::Range;
use std::path::PathBuf;

use crate::error::RenderWarning;
use crate::font_manager::FontFaceId;

/// Line rendition of a row (DECDWL/DECDHL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LineRendition {
    #[default]
    SingleWidth,
    DoubleWidth,
    DoubleHeightTop,
    DoubleHeightBottom,
}

impl LineRendition {
    /// Both double-height halves rasterize at twice the cell height.
    pub fn is_double_height(self) -> bool {
        matches!(self, Self::DoubleHeightTop | Self::DoubleHeightBottom)
    }

    /// The other half of a double-height pair.
    pub fn opposite_half(self) -> Self {
        match self {
            Self::DoubleHeightTop => Self::DoubleHeightBottom,
            Self::DoubleHeightBottom => Self::DoubleHeightTop,
            other => other,
        }
    }
}

/// Text antialiasing mode, selecting the glyph rasterization format and the
/// shading type of text quads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AntialiasingMode {
    #[default]
    Grayscale,
    ClearType,
    Aliased,
}

/// Cursor shapes. `Legacy` is the classic bottom-slice cursor whose height is
/// a percentage of the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorShape {
    #[default]
    Legacy,
    VerticalBar,
    Underscore,
    EmptyBox,
    FullBox,
    DoubleUnderscore,
}

/// Set of gridlines to draw over a cell range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GridLineSet(u8);

impl GridLineSet {
    pub const LEFT: Self = Self(1 << 0);
    pub const TOP: Self = Self(1 << 1);
    pub const RIGHT: Self = Self(1 << 2);
    pub const BOTTOM: Self = Self(1 << 3);
    pub const UNDERLINE: Self = Self(1 << 4);
    pub const HYPERLINK_UNDERLINE: Self = Self(1 << 5);
    pub const DOUBLE_UNDERLINE: Self = Self(1 << 6);
    pub const STRIKETHROUGH: Self = Self(1 << 7);

    pub fn test(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn any(self) -> bool {
        self.0 != 0
    }
}

impl std::ops::BitOr for GridLineSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A run of cells `[from, to)` sharing one set of gridlines and one color.
#[derive(Debug, Clone, Copy)]
pub struct GridLineRange {
    pub from: u16,
    pub to: u16,
    /// Premultiplied RGBA.
    pub color: u32,
    pub lines: GridLineSet,
}

/// Per-glyph positioning offsets from the shaper, relative to the pen
/// position on the baseline.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlyphOffset {
    pub advance: f32,
    pub ascender: f32,
}

/// A contiguous span of glyphs within a row sharing one font face.
/// `font_face: None` selects the DRCS soft-font path.
#[derive(Debug, Clone, Copy)]
pub struct FontMapping {
    pub font_face: Option<FontFaceId>,
    pub glyphs_from: usize,
    pub glyphs_to: usize,
}

/// One shaped row of the viewport.
#[derive(Debug, Default)]
pub struct ShapedRow {
    pub rendition: LineRendition,
    pub glyph_indices: Vec<u16>,
    pub glyph_advances: Vec<f32>,
    pub glyph_offsets: Vec<GlyphOffset>,
    /// Per-glyph premultiplied foreground colors.
    pub colors: Vec<u32>,
    pub mappings: Vec<FontMapping>,
    pub gridline_ranges: Vec<GridLineRange>,
    pub selection_from: u16,
    pub selection_to: u16,
    /// Vertical pixel span the row's text touched this frame (mutable out).
    pub dirty_top: i32,
    pub dirty_bottom: i32,
}

/// A rectangle in cell coordinates, `[left, right)` x `[top, bottom)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellRect {
    pub left: u16,
    pub top: u16,
    pub right: u16,
    pub bottom: u16,
}

impl CellRect {
    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }
}

/// A rectangle in pixels, extended by `join_vertical` as rows dirty it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl PixelRect {
    pub const EMPTY: Self = Self {
        left: i32::MAX,
        top: i32::MAX,
        right: i32::MIN,
        bottom: i32::MIN,
    };

    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    pub fn join_vertical(&mut self, top: i32, bottom: i32) {
        self.top = self.top.min(top);
        self.bottom = self.bottom.max(bottom);
    }
}

impl Default for PixelRect {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Font-dependent metrics and rasterization parameters. All pixel values are
/// already scaled for the target DPI.
#[derive(Debug, Clone, Default)]
pub struct FontSettings {
    pub generation: u64,
    pub cell_size: [u16; 2],
    /// Em size passed to the rasterizer, in pixels.
    pub font_size: f32,
    pub baseline: u16,
    pub descender: u16,
    pub underline_pos: u16,
    pub underline_width: u16,
    pub double_underline_pos: [u16; 2],
    pub strikethrough_pos: u16,
    pub strikethrough_width: u16,
    pub thin_line_width: u16,
    pub dpi: u16,
    pub antialiasing_mode: AntialiasingMode,
    /// Glyphs at least one cell wide whose black box starts at or left of
    /// this trigger a ligature marker.
    pub ligature_overhang_trigger_left: i32,
    pub ligature_overhang_trigger_right: i32,
    /// DRCS soft font: one u16 bit row per scanline, glyphs stacked
    /// vertically, bit 0x8000 is the leftmost pixel.
    pub soft_font_pattern: Vec<u16>,
    pub soft_font_cell_size: [u16; 2],
    /// Blend gamma for text alpha correction.
    pub gamma: f32,
    pub cleartype_enhanced_contrast: f32,
    pub grayscale_enhanced_contrast: f32,
}

/// Miscellaneous settings: colors and the post-process selection.
#[derive(Debug, Clone, Default)]
pub struct MiscSettings {
    pub generation: u64,
    /// Straight-alpha RGBA; premultiplied when uploaded.
    pub background_color: u32,
    /// Premultiplied RGBA.
    pub selection_color: u32,
    /// Path to a user WGSL post-process shader. Takes precedence over the
    /// retro effect.
    pub custom_shader_path: Option<PathBuf>,
    pub use_retro_terminal_effect: bool,
}

/// Cursor settings. `cursor_color == 0xffffffff` selects the automatic
/// invert-over-text cursor.
#[derive(Debug, Clone, Copy)]
pub struct CursorSettings {
    pub cursor_color: u32,
    pub cursor_type: CursorShape,
    /// Height of the `Legacy` cursor as a percentage of the cell height.
    pub height_percentage: u16,
}

impl Default for CursorSettings {
    fn default() -> Self {
        Self {
            cursor_color: 0xffffffff,
            cursor_type: CursorShape::Legacy,
            height_percentage: 20,
        }
    }
}

/// Top-level settings block with its own generation counter. Bumping the
/// inner generations without bumping this one has no effect.
#[derive(Debug, Clone, Default)]
pub struct RenderSettings {
    pub generation: u64,
    /// Back buffer size in pixels.
    pub target_size: [u32; 2],
    pub cell_count: [u16; 2],
    pub font: FontSettings,
    pub misc: MiscSettings,
    pub cursor: CursorSettings,
}

/// Everything the renderer needs to produce one frame.
#[derive(Default)]
pub struct RenderingPayload {
    pub settings: RenderSettings,
    pub rows: Vec<ShapedRow>,
    /// Flat RGBA color grid: `cell_count.y` rows of background colors
    /// followed by `cell_count.y` rows of foreground colors, each row
    /// `color_bitmap_row_stride` wide.
    pub color_bitmap: Vec<u32>,
    pub color_bitmap_row_stride: usize,
    /// Background/foreground halves; uploaded when they disagree with the
    /// renderer's copy.
    pub color_bitmap_generations: [u64; 2],
    pub cursor_rect: CellRect,
    pub invalidated_rows: Range<u16>,
    /// Accumulated dirty region in pixels (mutable out).
    pub dirty_rect_in_px: PixelRect,
    pub warning_callback: Option<Box<dyn FnMut(RenderWarning) + Send>>,
}

impl std::fmt::Debug for RenderingPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderingPayload")
            .field("settings", &self.settings)
            .field("rows", &self.rows.len())
            .field("cursor_rect", &self.cursor_rect)
            .field("dirty_rect_in_px", &self.dirty_rect_in_px)
            .finish_non_exhaustive()
    }
}

/// Splits a premultiplied little-endian RGBA `u32` into float components.
pub fn color_from_u32(color: u32) -> [f32; 4] {
    [
        (color & 0xff) as f32 / 255.0,
        ((color >> 8) & 0xff) as f32 / 255.0,
        ((color >> 16) & 0xff) as f32 / 255.0,
        ((color >> 24) & 0xff) as f32 / 255.0,
    ]
}

/// Splits a straight-alpha `u32` and premultiplies the color channels.
pub fn color_from_u32_premultiply(color: u32) -> [f32; 4] {
    let [r, g, b, a] = color_from_u32(color);
    [r * a, g * a, b * a, a]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_split_is_little_endian() {
        let c = color_from_u32(0x80ff40c0);
        assert_eq!(c[0], 192.0 / 255.0);
        assert_eq!(c[1], 64.0 / 255.0);
        assert_eq!(c[2], 1.0);
        assert_eq!(c[3], 128.0 / 255.0);
    }

    #[test]
    fn premultiply_scales_color_by_alpha() {
        let c = color_from_u32_premultiply(0x80ffffff);
        let a = 128.0 / 255.0;
        assert_eq!(c, [a, a, a, a]);
    }

    #[test]
    fn pixel_rect_join() {
        let mut r = PixelRect::EMPTY;
        assert!(r.is_empty());
        r.join_vertical(4, 20);
        r.join_vertical(2, 10);
        assert_eq!((r.top, r.bottom), (2, 20));
    }

    #[test]
    fn gridline_set_ops() {
        let set = GridLineSet::UNDERLINE | GridLineSet::STRIKETHROUGH;
        assert!(set.test(GridLineSet::UNDERLINE));
        assert!(!set.test(GridLineSet::TOP));
        assert!(set.any());
        assert!(!GridLineSet::default().any());
    }
}
