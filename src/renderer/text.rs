//! The text pipeline: resolves glyphs through the cache (rasterizing on
//! miss), emits text quads, and tracks per-row dirty spans.
//!
//! When the atlas fills up mid-run, the pipeline ends drawing, flushes the
//! quads emitted so far (they reference the old texture and must be drawn
//! before it is cleared), resets the atlas and restarts the run. A run gets
//! two attempts; a third, or a retry that would reset an already-empty
//! atlas, is an atlas deadlock and aborts the frame.

use std::ops::Range;

use super::atlas::{GlyphAtlas, PackFull};
use super::glyph_cache::FontFaceKey;
use super::quads::QuadStream;
use super::types::{QuadInstance, shading};
use crate::error::RenderError;
use crate::font_manager::GlyphRasterSource;
use crate::payload::{LineRendition, PixelRect, RenderSettings, ShapedRow};

#[derive(Debug)]
pub(crate) struct TextPassOutput {
    /// True when no text quad carried the ligature marker: the next frame may
    /// skip uploading the foreground half of the color bitmap.
    pub skip_foreground_bitmap_upload: bool,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn draw_text(
    atlas: &mut GlyphAtlas,
    source: &mut dyn GlyphRasterSource,
    quads: &mut QuadStream,
    settings: &RenderSettings,
    rows: &mut [ShapedRow],
    invalidated_rows: &Range<u16>,
    dirty_rect_in_px: &mut PixelRect,
    max_dim: u32,
    flush: &mut dyn FnMut(&mut GlyphAtlas, &mut QuadStream) -> Result<(), RenderError>,
) -> Result<TextPassOutput, RenderError> {
    if atlas.needs_reset() {
        atlas.reset(&settings.font, settings.target_size, max_dim);
    }

    let font = &settings.font;
    let cell_height = font.cell_size[1] as i32;
    let mut shading_accumulator = 0u16;
    let mut dirty_top = i32::MAX;
    let mut dirty_bottom = i32::MIN;

    atlas.begin_drawing();

    for (y, row) in rows.iter_mut().enumerate() {
        let baseline_y = y as i32 * cell_height + font.baseline as i32;
        // A non-standard rendition makes glyphs twice as wide, so the
        // accumulated advance doubles. The per-glyph offsets arrive already
        // scaled, which is why the shift applies before adding them.
        let rendition_shift = (row.rendition != LineRendition::SingleWidth) as u32;
        let rendition_scale = [
            rendition_shift as u8,
            row.rendition.is_double_height() as u8,
        ];

        let mut run_start_x = 0f32;
        for m in &row.mappings {
            let key = FontFaceKey {
                font_face: m.font_face,
                rendition: row.rendition,
            };

            let mut attempts = 0;
            let baseline_x_after = 'attempt: loop {
                attempts += 1;
                if attempts > 2 {
                    return Err(RenderError::AtlasDeadlock);
                }

                let mut baseline_x = run_start_x;
                for x in m.glyphs_from..m.glyphs_to {
                    let glyph_index = row.glyph_indices[x];

                    let entry = match atlas.cache.get(key, glyph_index) {
                        Some(entry) => entry,
                        None => match atlas.draw_glyph(source, key, glyph_index, font) {
                            Ok(entry) => entry,
                            Err(PackFull) => {
                                if atlas.cache.is_empty() {
                                    return Err(RenderError::AtlasDeadlock);
                                }
                                atlas.end_drawing();
                                flush(atlas, quads)?;
                                atlas.reset(&settings.font, settings.target_size, max_dim);
                                atlas.begin_drawing();
                                continue 'attempt;
                            }
                        },
                    };

                    if entry.shading_type != shading::DEFAULT {
                        let offsets = row.glyph_offsets[x];
                        let l = (baseline_x + offsets.advance).round() as i32;
                        let t = (baseline_y as f32 - offsets.ascender).round() as i32;
                        let l = (l << rendition_shift) + entry.offset[0] as i32;
                        let t = t + entry.offset[1] as i32;

                        row.dirty_top = row.dirty_top.min(t);
                        row.dirty_bottom = row.dirty_bottom.max(t + entry.size[1] as i32);

                        quads.push(QuadInstance {
                            shading_type: entry.shading_type,
                            rendition_scale,
                            position: [l as i16, t as i16],
                            size: entry.size,
                            texcoord: entry.texcoord,
                            color: row.colors[x],
                            ..Default::default()
                        });

                        shading_accumulator |= entry.shading_type;
                    }

                    baseline_x += row.glyph_advances[x];
                }
                break baseline_x;
            };
            run_start_x = baseline_x_after;
        }

        if invalidated_rows.contains(&(y as u16)) && row.dirty_top < row.dirty_bottom {
            dirty_top = dirty_top.min(row.dirty_top);
            dirty_bottom = dirty_bottom.max(row.dirty_bottom);
        }
    }

    if dirty_top < dirty_bottom {
        dirty_rect_in_px.join_vertical(dirty_top, dirty_bottom);
    }

    atlas.end_drawing();

    Ok(TextPassOutput {
        skip_foreground_bitmap_upload: shading_accumulator & shading::LIGATURE_MARKER == 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::font_manager::{FontFaceId, RasterKind, RasterizedGlyph};
    use crate::payload::{FontMapping, FontSettings, GlyphOffset};

    /// Synthetic raster source: every glyph is a `width`x`height` box with a
    /// fixed bearing, except 0x20 which is whitespace.
    struct MockSource {
        width: u32,
        height: u32,
        left: i32,
        top: i32,
        rasterized: usize,
    }

    impl MockSource {
        fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                left: 1,
                top: -8,
                rasterized: 0,
            }
        }
    }

    impl GlyphRasterSource for MockSource {
        fn rasterize(
            &mut self,
            _face: FontFaceId,
            glyph_index: u16,
            _rendition: LineRendition,
            _font: &FontSettings,
        ) -> Option<RasterizedGlyph> {
            self.rasterized += 1;
            if glyph_index == 0x20 {
                return None;
            }
            Some(RasterizedGlyph {
                left: self.left,
                top: self.top,
                width: self.width,
                height: self.height,
                pixels: vec![0xff; (self.width * self.height * 4) as usize],
                kind: RasterKind::Grayscale,
            })
        }
    }

    fn settings(cell_count: [u16; 2]) -> RenderSettings {
        RenderSettings {
            target_size: [
                cell_count[0] as u32 * 8,
                cell_count[1] as u32 * 16,
            ],
            cell_count,
            font: FontSettings {
                cell_size: [8, 16],
                baseline: 12,
                descender: 3,
                font_size: 12.0,
                ligature_overhang_trigger_left: -1,
                ligature_overhang_trigger_right: 9,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn row(glyphs: &[u16], face: FontFaceId) -> ShapedRow {
        ShapedRow {
            glyph_indices: glyphs.to_vec(),
            glyph_advances: vec![8.0; glyphs.len()],
            glyph_offsets: vec![GlyphOffset::default(); glyphs.len()],
            colors: vec![0xffffffff; glyphs.len()],
            mappings: vec![FontMapping {
                font_face: Some(face),
                glyphs_from: 0,
                glyphs_to: glyphs.len(),
            }],
            dirty_top: i32::MAX,
            dirty_bottom: i32::MIN,
            ..Default::default()
        }
    }

    fn no_flush() -> impl FnMut(&mut GlyphAtlas, &mut QuadStream) -> Result<(), RenderError> {
        |_: &mut GlyphAtlas, _: &mut QuadStream| Ok(())
    }

    #[test]
    fn single_glyph_emits_one_text_quad_within_the_cell_row() {
        let settings = settings([2, 1]);
        let mut rows = vec![row(&[0x41], FontFaceId(0))];
        let mut atlas = GlyphAtlas::new();
        let mut quads = QuadStream::new();
        let mut source = MockSource::new(6, 10);

        let out = draw_text(
            &mut atlas,
            &mut source,
            &mut quads,
            &settings,
            &mut rows,
            &(0..1),
            &mut PixelRect::default(),
            8192,
            &mut no_flush(),
        )
        .unwrap();

        assert_eq!(quads.len(), 1);
        let q = quads.as_slice()[0];
        assert_eq!(q.shading_type, shading::TEXT_GRAYSCALE);
        // baseline (12) + glyph top (-8) + bearing offsets.
        assert_eq!(q.position, [1, 4]);
        assert!(q.position[1] >= 0 && (q.position[1] as i32) < 16);
        assert_eq!(q.size, [6, 10]);
        assert!(out.skip_foreground_bitmap_upload);
        // The row's dirty span covers the glyph.
        assert_eq!(rows[0].dirty_top, 4);
        assert_eq!(rows[0].dirty_bottom, 14);
    }

    #[test]
    fn empty_row_emits_nothing_and_leaves_dirty_rect_alone() {
        let settings = settings([4, 1]);
        let mut rows = vec![ShapedRow {
            dirty_top: i32::MAX,
            dirty_bottom: i32::MIN,
            ..Default::default()
        }];
        let mut atlas = GlyphAtlas::new();
        let mut quads = QuadStream::new();
        let mut source = MockSource::new(6, 10);
        let mut dirty = PixelRect::default();

        draw_text(
            &mut atlas,
            &mut source,
            &mut quads,
            &settings,
            &mut rows,
            &(0..1),
            &mut dirty,
            8192,
            &mut no_flush(),
        )
        .unwrap();

        assert!(quads.is_empty());
        assert_eq!(dirty, PixelRect::EMPTY);
        assert_eq!(source.rasterized, 0);
    }

    #[test]
    fn whitespace_glyphs_are_cached_but_not_emitted() {
        let settings = settings([4, 1]);
        let mut rows = vec![row(&[0x20, 0x41, 0x20], FontFaceId(0))];
        let mut atlas = GlyphAtlas::new();
        let mut quads = QuadStream::new();
        let mut source = MockSource::new(6, 10);

        draw_text(
            &mut atlas,
            &mut source,
            &mut quads,
            &settings,
            &mut rows,
            &(0..1),
            &mut PixelRect::default(),
            8192,
            &mut no_flush(),
        )
        .unwrap();

        assert_eq!(quads.len(), 1);
        // The second space is a cache hit, not a second rasterization.
        assert_eq!(source.rasterized, 2);
        // Advances still applied for whitespace: 'A' sits one cell in.
        assert_eq!(quads.as_slice()[0].position[0], 8 + 1);
    }

    #[test]
    fn atlas_overflow_resets_grows_and_rerenders_the_run() {
        // Small viewport cells but a large target keeps the initial atlas at
        // 128x128 while leaving growth room.
        let mut settings = settings([100, 4]);
        settings.target_size = [1000, 1000];

        let mut rows = Vec::new();
        for r in 0..4u16 {
            let indices: Vec<u16> = (0..100).map(|i| 0x100 + r * 100 + i).collect();
            rows.push(row(&indices, FontFaceId(0)));
        }

        let mut atlas = GlyphAtlas::new();
        let mut quads = QuadStream::new();
        let mut source = MockSource::new(12, 12);
        let mut flushes = 0;

        draw_text(
            &mut atlas,
            &mut source,
            &mut quads,
            &settings,
            &mut rows,
            &(0..4),
            &mut PixelRect::default(),
            8192,
            &mut |_atlas, _quads| {
                flushes += 1;
                Ok(())
            },
        )
        .unwrap();

        // 400 12x12 glyphs cannot fit the initial 128x128 atlas.
        assert!(atlas.generation() > 1, "at least one overflow reset");
        assert!(flushes >= 1);
        assert!(source.rasterized >= 400);
        // Every glyph of the last row's run survived into the final
        // generation (the run restarts from its beginning after a reset).
        let key = FontFaceKey {
            font_face: Some(FontFaceId(0)),
            rendition: LineRendition::SingleWidth,
        };
        for g in rows[3].glyph_indices.iter() {
            assert!(atlas.cache.contains(key, *g), "glyph {g:#x} missing");
        }
    }

    #[test]
    fn glyph_that_never_fits_is_an_atlas_deadlock() {
        let mut settings = settings([2, 1]);
        settings.target_size = [100, 100];
        let mut rows = vec![row(&[0x41], FontFaceId(0))];
        let mut atlas = GlyphAtlas::new();
        let mut quads = QuadStream::new();
        // Larger than the 128x128 atlas can ever be under max_dim = 128.
        let mut source = MockSource::new(200, 200);

        let err = draw_text(
            &mut atlas,
            &mut source,
            &mut quads,
            &settings,
            &mut rows,
            &(0..1),
            &mut PixelRect::default(),
            128,
            &mut no_flush(),
        )
        .unwrap_err();
        assert!(matches!(err, RenderError::AtlasDeadlock));
    }

    #[test]
    fn double_width_row_doubles_the_pen_advance() {
        let settings = settings([8, 1]);
        let mut rows = vec![row(&[0x41, 0x42], FontFaceId(0))];
        rows[0].rendition = LineRendition::DoubleWidth;
        let mut atlas = GlyphAtlas::new();
        let mut quads = QuadStream::new();
        let mut source = MockSource::new(6, 10);

        draw_text(
            &mut atlas,
            &mut source,
            &mut quads,
            &settings,
            &mut rows,
            &(0..1),
            &mut PixelRect::default(),
            8192,
            &mut no_flush(),
        )
        .unwrap();

        let qs = quads.as_slice();
        assert_eq!(qs.len(), 2);
        assert_eq!(qs[0].rendition_scale, [1, 0]);
        // Second glyph: advance 8 shifted once (16) plus bearing 1.
        assert_eq!(qs[1].position[0], 17);
    }

    #[test]
    fn invalidated_rows_extend_the_frame_dirty_rect() {
        let settings = settings([4, 2]);
        let mut rows = vec![row(&[0x41], FontFaceId(0)), row(&[0x42], FontFaceId(0))];
        let mut atlas = GlyphAtlas::new();
        let mut quads = QuadStream::new();
        let mut source = MockSource::new(6, 10);
        let mut dirty = PixelRect::default();

        // Only row 1 is invalidated.
        draw_text(
            &mut atlas,
            &mut source,
            &mut quads,
            &settings,
            &mut rows,
            &(1..2),
            &mut dirty,
            8192,
            &mut no_flush(),
        )
        .unwrap();

        // Row 1's glyph: baseline 16 + 12 - 8 = 20, bottom 30.
        assert_eq!(dirty.top, 20);
        assert_eq!(dirty.bottom, 30);
    }
}
