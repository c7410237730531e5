//! The glyph atlas: rect packing, the glyph cache, and the two
//! rasterization paths that fill it.
//!
//! Rasterized bitmaps are staged CPU-side and uploaded in one batch when
//! drawing ends, before any draw call samples the texture. A failed pack
//! surfaces as [`PackFull`]; the text pipeline reacts by flushing, resetting
//! the atlas (which grows it) and retrying the run.

use super::glyph_cache::{FontFaceKey, GlyphCache};
use super::rect_packer::RectPacker;
use super::types::{AtlasGlyphEntry, shading};
use crate::font_manager::{GlyphRasterSource, RasterKind};
use crate::payload::{AntialiasingMode, FontSettings, LineRendition};

/// The glyph did not fit into the remaining atlas space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackFull;

/// A staged upload into the atlas texture.
pub struct AtlasBlit {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// RGBA rows, tightly packed.
    pub pixels: Vec<u8>,
}

/// Result of rasterizing one glyph: the entry for the requested rendition
/// key, plus the other half when a DECDHL glyph was split.
struct GlyphSlot {
    primary: AtlasGlyphEntry,
    sibling: Option<AtlasGlyphEntry>,
}

impl GlyphSlot {
    fn empty() -> Self {
        Self {
            primary: AtlasGlyphEntry::default(),
            sibling: None,
        }
    }
}

/// First soft-font glyph index (DRCS mapping area).
const SOFT_FONT_BASE: u16 = 0xef20;

pub struct GlyphAtlas {
    packer: RectPacker,
    pub cache: GlyphCache,
    pending: Vec<AtlasBlit>,
    extent: [u16; 2],
    /// Bumped on every reset; the GPU side recreates its texture on mismatch.
    generation: u64,
    drawing: bool,
    needs_reset: bool,
    soft_font_staging: Vec<u32>,
}

impl GlyphAtlas {
    pub fn new() -> Self {
        Self {
            packer: RectPacker::new(0, 0),
            cache: GlyphCache::new(),
            pending: Vec::new(),
            extent: [0, 0],
            generation: 0,
            drawing: false,
            needs_reset: true,
            soft_font_staging: Vec::new(),
        }
    }

    pub fn extent(&self) -> [u16; 2] {
        self.extent
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    /// Defer the (expensive) reset until text drawing actually needs the
    /// atlas; font changes land here.
    pub fn request_reset(&mut self) {
        self.needs_reset = true;
        self.soft_font_staging.clear();
    }

    /// Clears the atlas and adopts a new extent from the sizing heuristic.
    /// Invalidates every cache entry at once.
    pub fn reset(&mut self, font: &FontSettings, target_size: [u32; 2], max_dim: u32) {
        let extent = choose_atlas_extent(font.cell_size, target_size, self.extent, max_dim);
        if extent != self.extent {
            log::debug!(
                "glyph atlas: {}x{} -> {}x{}",
                self.extent[0],
                self.extent[1],
                extent[0],
                extent[1]
            );
        }
        self.extent = extent;
        self.packer.reset(extent[0] as u32, extent[1] as u32);
        self.cache.clear_glyphs();
        self.pending.clear();
        self.generation += 1;
        self.needs_reset = false;
    }

    pub fn begin_drawing(&mut self) {
        self.drawing = true;
    }

    /// Ends the drawing scope. Staged blits become eligible for upload; the
    /// caller must upload them before any draw call samples the atlas.
    pub fn end_drawing(&mut self) {
        self.drawing = false;
    }

    /// Hands the staged uploads to the GPU side.
    pub fn take_pending(&mut self) -> Vec<AtlasBlit> {
        debug_assert!(!self.drawing);
        std::mem::take(&mut self.pending)
    }

    /// Rasterizes one glyph into the atlas and caches it (both halves for
    /// DECDHL renditions). Returns the entry for `key`.
    pub fn draw_glyph(
        &mut self,
        source: &mut dyn GlyphRasterSource,
        key: FontFaceKey,
        glyph_index: u16,
        font: &FontSettings,
    ) -> Result<AtlasGlyphEntry, PackFull> {
        debug_assert!(self.drawing);
        let slot = match key.font_face {
            Some(face) => self.draw_outline_glyph(source, key, face, glyph_index, font)?,
            None => self.draw_soft_font_glyph(key.rendition, glyph_index, font)?,
        };

        self.cache.insert(key, glyph_index, slot.primary);
        if let Some(sibling) = slot.sibling {
            let sibling_key = FontFaceKey {
                rendition: key.rendition.opposite_half(),
                ..key
            };
            self.cache.insert(sibling_key, glyph_index, sibling);
        }
        Ok(slot.primary)
    }

    fn draw_outline_glyph(
        &mut self,
        source: &mut dyn GlyphRasterSource,
        key: FontFaceKey,
        face: crate::font_manager::FontFaceId,
        glyph_index: u16,
        font: &FontSettings,
    ) -> Result<GlyphSlot, PackFull> {
        // An empty bounding box means whitespace: cache it as an empty entry
        // so emission skips it.
        let Some(image) = source.rasterize(face, glyph_index, key.rendition, font) else {
            return Ok(GlyphSlot::empty());
        };

        let (x, y) = self.packer.pack(image.width, image.height).ok_or(PackFull)?;

        let left = image.left;
        let top = image.top;
        let right = left + image.width as i32;

        let mut shading_type = match image.kind {
            RasterKind::Color => shading::PASSTHROUGH,
            RasterKind::Subpixel => shading::TEXT_CLEARTYPE,
            RasterKind::Grayscale => shading::TEXT_GRAYSCALE,
        };
        if is_ligature_overhang(font, left, right, image.width) {
            shading_type |= shading::LIGATURE_MARKER;
        }

        self.pending.push(AtlasBlit {
            x: x as u32,
            y: y as u32,
            width: image.width,
            height: image.height,
            pixels: image.pixels,
        });

        let entry = AtlasGlyphEntry {
            shading_type,
            offset: [left as i16, top as i16],
            size: [image.width as u16, image.height as u16],
            texcoord: [x, y],
        };

        if key.rendition.is_double_height() {
            let (primary, sibling) = split_double_height(font, key.rendition, entry);
            Ok(GlyphSlot {
                primary,
                sibling: Some(sibling),
            })
        } else {
            Ok(GlyphSlot {
                primary: entry,
                sibling: None,
            })
        }
    }

    /// Pixel-expands a 1-bpp DRCS pattern and blits it into the atlas,
    /// scaled to the (rendition-adjusted) cell size.
    fn draw_soft_font_glyph(
        &mut self,
        rendition: LineRendition,
        glyph_index: u16,
        font: &FontSettings,
    ) -> Result<GlyphSlot, PackFull> {
        let mut width = font.cell_size[0] as u32;
        let mut height = font.cell_size[1] as u32;
        if rendition != LineRendition::SingleWidth {
            width <<= 1;
            height <<= rendition.is_double_height() as u32;
        }

        let source_w = font.soft_font_cell_size[0] as usize;
        let source_h = font.soft_font_cell_size[1] as usize;
        let pattern_index = glyph_index.wrapping_sub(SOFT_FONT_BASE) as usize;
        let Some(rows) = font
            .soft_font_pattern
            .get(source_h * pattern_index..source_h * (pattern_index + 1))
        else {
            log::warn!("soft font glyph {glyph_index:#06x} outside the configured pattern");
            return Ok(GlyphSlot::empty());
        };
        if source_w == 0 || source_h == 0 || width == 0 || height == 0 {
            return Ok(GlyphSlot::empty());
        }

        let (x, y) = self.packer.pack(width, height).ok_or(PackFull)?;

        self.soft_font_staging.clear();
        self.soft_font_staging.reserve(source_w * source_h);
        for &row in rows {
            let mut bits = row;
            for _ in 0..source_w {
                let set = bits & 0x8000 != 0;
                self.soft_font_staging.push(if set { 0xffffffff } else { 0 });
                bits <<= 1;
            }
        }

        let smooth = font.antialiasing_mode != AntialiasingMode::Aliased;
        let pixels = scale_soft_font_bitmap(
            &self.soft_font_staging,
            source_w,
            source_h,
            width as usize,
            height as usize,
            smooth,
        );
        self.pending.push(AtlasBlit {
            x: x as u32,
            y: y as u32,
            width,
            height,
            pixels,
        });

        let mut entry = AtlasGlyphEntry {
            shading_type: shading::TEXT_GRAYSCALE,
            offset: [0, -(font.baseline as i16)],
            size: [width as u16, height as u16],
            texcoord: [x, y],
        };

        if rendition.is_double_height() {
            entry.offset[1] -= font.cell_size[1] as i16;
            let (primary, sibling) = split_double_height(font, rendition, entry);
            Ok(GlyphSlot {
                primary,
                sibling: Some(sibling),
            })
        } else {
            Ok(GlyphSlot {
                primary: entry,
                sibling: None,
            })
        }
    }
}

impl Default for GlyphAtlas {
    fn default() -> Self {
        Self::new()
    }
}

/// Ligatures are drawn with strict cell-wise foreground color while other
/// text may overhang its cell. The width condition excludes diacritics, the
/// trigger pair excludes ordinary wide glyphs that overlap a little.
pub(crate) fn is_ligature_overhang(font: &FontSettings, left: i32, right: i32, width: u32) -> bool {
    width >= font.cell_size[0] as u32
        && (left <= font.ligature_overhang_trigger_left
            || right >= font.ligature_overhang_trigger_right)
}

/// A DECDHL glyph is rasterized at double height once, then clipped into a
/// top-half and a bottom-half entry stored under the two rendition keys.
/// Zero-height halves (diacritics living entirely on one half) degrade to
/// empty entries.
pub(crate) fn split_double_height(
    font: &FontSettings,
    rendition: LineRendition,
    mut entry: AtlasGlyphEntry,
) -> (AtlasGlyphEntry, AtlasGlyphEntry) {
    // Twice the line height, twice the descender gap. For both halves.
    entry.offset[1] -= font.descender as i16;

    let mut other = entry;
    let is_top = rendition == LineRendition::DoubleHeightTop;
    let (top, bottom) = if is_top {
        (&mut entry, &mut other)
    } else {
        (&mut other, &mut entry)
    };

    let total_height = top.size[1] as i32;
    let top_height =
        (-(top.offset[1] as i32) - font.baseline as i32).clamp(0, total_height) as i16;

    top.offset[1] += font.cell_size[1] as i16;
    top.size[1] = top_height as u16;
    bottom.offset[1] += top_height;
    bottom.size[1] = (total_height - top_height as i32).max(0) as u16;
    bottom.texcoord[1] += top_height as u16;

    if top.size[1] == 0 {
        top.shading_type = shading::DEFAULT;
    }
    if bottom.size[1] == 0 {
        bottom.shading_type = shading::DEFAULT;
    }

    (entry, other)
}

/// Picks the new atlas area, then the smallest power-of-two texture covering
/// it with sides differing by at most one bit (width >= height).
///
/// The growth term doubles the current area so repeated overflows converge;
/// the 1.25x viewport term caps the cache so a frame can't get stuck
/// alternating between two half-full atlases; 95 cells covers printable
/// ASCII after a font change.
pub(crate) fn choose_atlas_extent(
    cell_size: [u16; 2],
    target_size: [u32; 2],
    current: [u16; 2],
    max_dim: u32,
) -> [u16; 2] {
    const MIN_AREA: u32 = 128 * 128;

    let max_area = max_dim.saturating_mul(max_dim);
    let cell_area = cell_size[0] as u32 * cell_size[1] as u32;
    let target_area = target_size[0].saturating_mul(target_size[1]);

    let min_by_font = cell_area.saturating_mul(95);
    let min_by_growth = (current[0] as u32 * current[1] as u32).saturating_mul(2);
    let min = MIN_AREA.max(min_by_font).max(min_by_growth);

    let max_by_font = target_area.saturating_add(target_area / 4);
    let area = max_area.min(max_by_font.min(min)).max(MIN_AREA);

    let index = 31 - (area - 1).leading_zeros();
    let u = 1u32 << ((index + 2) / 2);
    let v = 1u32 << ((index + 1) / 2);
    [u as u16, v as u16]
}

fn catmull_rom_weights(t: f32) -> [f32; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        -0.5 * t3 + t2 - 0.5 * t,
        1.5 * t3 - 2.5 * t2 + 1.0,
        -1.5 * t3 + 2.0 * t2 + 0.5 * t,
        0.5 * t3 - 0.5 * t2,
    ]
}

/// Scales the expanded 1-bpp bitmap to the packed slot. Nearest neighbor
/// keeps aliased mode crisp; antialiased modes get a bicubic resample.
fn scale_soft_font_bitmap(
    source: &[u32],
    sw: usize,
    sh: usize,
    dw: usize,
    dh: usize,
    smooth: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(dw * dh * 4);
    let alpha_at = |x: isize, y: isize| -> f32 {
        let x = x.clamp(0, sw as isize - 1) as usize;
        let y = y.clamp(0, sh as isize - 1) as usize;
        if source[y * sw + x] != 0 { 255.0 } else { 0.0 }
    };

    for dy in 0..dh {
        for dx in 0..dw {
            let alpha = if smooth {
                let fx = (dx as f32 + 0.5) * sw as f32 / dw as f32 - 0.5;
                let fy = (dy as f32 + 0.5) * sh as f32 / dh as f32 - 0.5;
                let ix = fx.floor();
                let iy = fy.floor();
                let wx = catmull_rom_weights(fx - ix);
                let wy = catmull_rom_weights(fy - iy);
                let mut acc = 0.0;
                for (j, wyj) in wy.iter().enumerate() {
                    for (i, wxi) in wx.iter().enumerate() {
                        acc += wyj
                            * wxi
                            * alpha_at(ix as isize + i as isize - 1, iy as isize + j as isize - 1);
                    }
                }
                acc.round().clamp(0.0, 255.0) as u8
            } else {
                let sx = dx * sw / dw;
                let sy = dy * sh / dh;
                if source[sy * sw + sx] != 0 { 255 } else { 0 }
            };
            out.extend_from_slice(&[255, 255, 255, alpha]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn font() -> FontSettings {
        FontSettings {
            cell_size: [8, 20],
            baseline: 15,
            descender: 3,
            ligature_overhang_trigger_left: -1,
            ligature_overhang_trigger_right: 9,
            ..Default::default()
        }
    }

    #[test]
    fn atlas_extent_matches_documented_example() {
        // A 985x1946 target wants 2048x1024.
        let extent = choose_atlas_extent([10, 20], [985, 1946], [0, 0], 8192);
        assert_eq!(extent, [2048, 1024]);
    }

    #[test]
    fn atlas_extent_floor_is_128() {
        let extent = choose_atlas_extent([1, 1], [64, 64], [0, 0], 8192);
        assert_eq!(extent, [128, 128]);
    }

    #[test]
    fn atlas_extent_growth_doubles_until_viewport_cap() {
        let target = [2000, 2000];
        let grown = choose_atlas_extent([8, 16], target, [512, 512], 8192);
        // 2x current area = 524288 -> 1024x512.
        assert_eq!(grown, [1024, 512]);

        // Once 2x current exceeds 1.25x the viewport, the viewport cap wins:
        // the smallest power-of-two pair covering 5,000,000 px.
        let capped = choose_atlas_extent([8, 16], target, [2048, 2048], 8192);
        assert_eq!(capped, [4096, 2048]);
    }

    #[test]
    fn atlas_extent_respects_device_limit() {
        let extent = choose_atlas_extent([20, 40], [16000, 16000], [4096, 4096], 4096);
        assert!(extent[0] <= 4096 && extent[1] <= 4096);
    }

    #[test]
    fn atlas_extent_sides_differ_by_at_most_one_bit() {
        for current in [[0u16, 0], [128, 128], [256, 128], [512, 512], [2048, 1024]] {
            let [u, v] = choose_atlas_extent([9, 19], [4000, 4000], current, 16384);
            assert!(u >= v, "{u}x{v}");
            assert!(u / v <= 2, "{u}x{v}");
            assert!(u.is_power_of_two() && v.is_power_of_two());
        }
    }

    #[test]
    fn double_height_split_reconstructs_the_glyph() {
        let f = font();
        // Rasterized at double height: 40 px tall, top 30 px above baseline.
        let entry = AtlasGlyphEntry {
            shading_type: shading::TEXT_GRAYSCALE,
            offset: [1, -30],
            size: [12, 40],
            texcoord: [64, 32],
        };

        let (top, bottom) = split_double_height(&f, LineRendition::DoubleHeightTop, entry);

        // offset.y first widens by the descender: -33; topHeight = 33 - 15 = 18.
        assert_eq!(top.size[1] + bottom.size[1], 40);
        assert_eq!(top.size[1], 18);
        assert_eq!(top.offset[1], -33 + 20);
        assert_eq!(bottom.offset[1], -33 + 18);
        assert_eq!(bottom.texcoord[1], 32 + 18);
        assert_eq!(top.texcoord[1], 32);
        // Horizontal placement is untouched.
        assert_eq!(top.offset[0], 1);
        assert_eq!(bottom.offset[0], 1);
    }

    #[test]
    fn double_height_bottom_key_returns_bottom_half_as_primary() {
        let f = font();
        let entry = AtlasGlyphEntry {
            shading_type: shading::TEXT_GRAYSCALE,
            offset: [0, -30],
            size: [12, 40],
            texcoord: [0, 0],
        };
        let (primary, sibling) = split_double_height(&f, LineRendition::DoubleHeightBottom, entry);
        // primary is the bottom half here, sibling the top.
        assert_eq!(primary.size[1] + sibling.size[1], 40);
        assert!(sibling.offset[1] > -33, "top half was raised by a cell");
        assert_eq!(primary.texcoord[1], sibling.size[1]);
    }

    #[test]
    fn zero_height_half_becomes_empty() {
        let f = font();
        // A low diacritic: lives entirely below the baseline.
        let entry = AtlasGlyphEntry {
            shading_type: shading::TEXT_GRAYSCALE,
            offset: [0, 5],
            size: [6, 4],
            texcoord: [0, 0],
        };
        let (top, bottom) = split_double_height(&f, LineRendition::DoubleHeightTop, entry);
        assert_eq!(top.shading_type, shading::DEFAULT);
        assert_eq!(bottom.size[1], 4);
    }

    #[test]
    fn ligature_trigger_requires_width_and_overhang() {
        let f = font();
        // Wide enough and overhanging left.
        assert!(is_ligature_overhang(&f, -1, 7, 8));
        // Wide enough and overhanging right.
        assert!(is_ligature_overhang(&f, 1, 9, 8));
        // Wide enough, no overhang.
        assert!(!is_ligature_overhang(&f, 0, 8, 8));
        // Overhangs but narrower than a cell (diacritic).
        assert!(!is_ligature_overhang(&f, -2, 5, 7));
    }

    #[test]
    fn soft_font_glyph_expands_pattern_bits() {
        let mut f = font();
        f.cell_size = [4, 4];
        f.soft_font_cell_size = [4, 4];
        f.antialiasing_mode = AntialiasingMode::Aliased;
        // A diagonal: one bit per row.
        f.soft_font_pattern = vec![0x8000, 0x4000, 0x2000, 0x1000];

        let mut atlas = GlyphAtlas::new();
        atlas.reset(&f, [400, 400], 8192);
        atlas.begin_drawing();
        let key = FontFaceKey {
            font_face: None,
            rendition: LineRendition::SingleWidth,
        };
        let entry = atlas.draw_glyph(&mut NoSource, key, SOFT_FONT_BASE, &f).unwrap();
        atlas.end_drawing();

        assert_eq!(entry.shading_type, shading::TEXT_GRAYSCALE);
        assert_eq!(entry.size, [4, 4]);
        assert_eq!(entry.offset, [0, -15]);

        let blits = atlas.take_pending();
        assert_eq!(blits.len(), 1);
        let pixels = &blits[0].pixels;
        for y in 0..4 {
            for x in 0..4 {
                let alpha = pixels[(y * 4 + x) * 4 + 3];
                assert_eq!(alpha == 255, x == y, "pixel {x},{y}");
            }
        }
    }

    #[test]
    fn soft_font_out_of_range_glyph_is_empty() {
        let mut f = font();
        f.soft_font_cell_size = [4, 4];
        f.soft_font_pattern = vec![0; 4];

        let mut atlas = GlyphAtlas::new();
        atlas.reset(&f, [400, 400], 8192);
        atlas.begin_drawing();
        let key = FontFaceKey {
            font_face: None,
            rendition: LineRendition::SingleWidth,
        };
        let entry = atlas
            .draw_glyph(&mut NoSource, key, SOFT_FONT_BASE + 7, &f)
            .unwrap();
        assert_eq!(entry.shading_type, shading::DEFAULT);
    }

    #[test]
    fn nearest_scaling_doubles_exactly() {
        let source = [0xffffffffu32, 0, 0, 0xffffffff];
        let out = scale_soft_font_bitmap(&source, 2, 2, 4, 4, false);
        let alpha = |x: usize, y: usize| out[(y * 4 + x) * 4 + 3];
        for y in 0..4 {
            for x in 0..4 {
                let expected = (x / 2) == (y / 2);
                assert_eq!(alpha(x, y) == 255, expected, "pixel {x},{y}");
            }
        }
    }

    #[test]
    fn bicubic_scaling_interpolates_edges() {
        let source = [0xffffffffu32, 0];
        let out = scale_soft_font_bitmap(&source, 2, 1, 8, 1, true);
        let alphas: Vec<u8> = (0..8).map(|x| out[x * 4 + 3]).collect();
        assert_eq!(alphas[0], 255);
        assert_eq!(alphas[7], 0);
        // Monotone falloff across the boundary.
        assert!(alphas.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn double_height_glyph_caches_both_halves() {
        let f = font();
        let mut atlas = GlyphAtlas::new();
        atlas.reset(&f, [800, 600], 8192);
        atlas.begin_drawing();

        let top_key = FontFaceKey {
            font_face: Some(crate::font_manager::FontFaceId(0)),
            rendition: LineRendition::DoubleHeightTop,
        };
        // An 'M'-like box: 40 px tall at double height, 30 px above baseline.
        let mut source = BoxSource {
            width: 14,
            height: 40,
            top: -30,
        };
        let top = atlas.draw_glyph(&mut source, top_key, 0x4d, &f).unwrap();
        atlas.end_drawing();

        let bottom_key = FontFaceKey {
            rendition: LineRendition::DoubleHeightBottom,
            ..top_key
        };
        let bottom = atlas.cache.get(bottom_key, 0x4d).expect("bottom half cached");

        assert_eq!(atlas.cache.get(top_key, 0x4d), Some(top));
        assert_eq!(top.size[1] + bottom.size[1], 40);
        assert!(top.size[1] > 0 && bottom.size[1] > 0);
        // Both halves share the packed rect, split vertically.
        assert_eq!(top.texcoord[0], bottom.texcoord[0]);
        assert_eq!(bottom.texcoord[1], top.texcoord[1] + top.size[1]);
    }

    struct BoxSource {
        width: u32,
        height: u32,
        top: i32,
    }

    impl GlyphRasterSource for BoxSource {
        fn rasterize(
            &mut self,
            _: crate::font_manager::FontFaceId,
            _: u16,
            _: LineRendition,
            _: &FontSettings,
        ) -> Option<crate::font_manager::RasterizedGlyph> {
            Some(crate::font_manager::RasterizedGlyph {
                left: 0,
                top: self.top,
                width: self.width,
                height: self.height,
                pixels: vec![0xff; (self.width * self.height * 4) as usize],
                kind: crate::font_manager::RasterKind::Grayscale,
            })
        }
    }

    struct NoSource;
    impl GlyphRasterSource for NoSource {
        fn rasterize(
            &mut self,
            _: crate::font_manager::FontFaceId,
            _: u16,
            _: LineRendition,
            _: &FontSettings,
        ) -> Option<crate::font_manager::RasterizedGlyph> {
            None
        }
    }
}
