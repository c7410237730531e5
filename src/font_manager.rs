//! Font face storage and glyph rasterization.
//!
//! Font faces live in an arena indexed by [`FontFaceId`]; the glyph cache
//! refers to faces only through that index, never through back-references.
//! Rasterization goes through the [`GlyphRasterSource`] seam so the text
//! pipeline can be driven without a real font in tests.

use anyhow::Result;
use fontdb::{Database, Family, Query};
use std::sync::Arc;
use swash::scale::image::Content;
use swash::scale::{Render, ScaleContext, Source, StrikeWith};
use swash::zeno::{Format, Transform};
use swash::FontRef;

use crate::payload::{AntialiasingMode, FontSettings, LineRendition};

/// Stable index of a font face within the [`FontManager`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FontFaceId(pub u32);

/// Stores font data with lifetime management.
#[derive(Clone)]
pub struct FontData {
    #[allow(dead_code)]
    data: Arc<Vec<u8>>,
    font_ref: FontRef<'static>,
}

impl FontData {
    /// Create a new FontData from bytes.
    pub fn new(data: Vec<u8>) -> Option<Self> {
        let data_arc = Arc::new(data);

        // SAFETY: We ensure the data outlives the FontRef by storing it in an
        // Arc next to it. The FontRef never outlives the FontData struct.
        let font_ref = unsafe {
            let bytes = data_arc.as_slice();
            let static_bytes: &'static [u8] = std::mem::transmute(bytes);
            FontRef::from_index(static_bytes, 0)?
        };

        Some(FontData {
            data: data_arc,
            font_ref,
        })
    }
}

impl std::fmt::Debug for FontData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontData")
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// How a rasterized glyph's pixels are to be shaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterKind {
    /// White coverage in the alpha channel.
    Grayscale,
    /// Per-channel ClearType coverage weights in RGB.
    Subpixel,
    /// A premultiplied color bitmap (emoji and friends).
    Color,
}

/// One rasterized glyph bitmap, positioned relative to its baseline origin.
///
/// `left`/`top` locate the bitmap's top-left corner in the y-down coordinate
/// system used by the atlas: `top` is negative for glyphs that extend above
/// the baseline.
#[derive(Debug, Clone)]
pub struct RasterizedGlyph {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
    /// RGBA, interpreted per `kind`.
    pub pixels: Vec<u8>,
    pub kind: RasterKind,
}

/// Rasterization seam between the text pipeline and the font stack.
///
/// Returning `None` means the glyph has an empty bounding box (whitespace);
/// the caller stores an empty cache entry and emits nothing.
pub trait GlyphRasterSource {
    fn rasterize(
        &mut self,
        face: FontFaceId,
        glyph_index: u16,
        rendition: LineRendition,
        font: &FontSettings,
    ) -> Option<RasterizedGlyph>;
}

/// Owns the font face arena and the swash scaling context.
pub struct FontManager {
    faces: Vec<FontData>,
    font_db: Database,
    context: ScaleContext,
}

impl FontManager {
    pub fn new() -> Self {
        let mut font_db = Database::new();
        font_db.load_system_fonts();
        log::info!("Loaded {} system fonts", font_db.len());

        Self {
            faces: Vec::new(),
            font_db,
            context: ScaleContext::new(),
        }
    }

    /// Register a font face from raw file data.
    pub fn add_font_data(&mut self, data: Vec<u8>) -> Option<FontFaceId> {
        let font = FontData::new(data)?;
        let id = FontFaceId(self.faces.len() as u32);
        self.faces.push(font);
        Some(id)
    }

    /// Register a font face by family name from the system font database.
    pub fn add_family(&mut self, family_name: &str) -> Result<FontFaceId> {
        let query = Query {
            families: &[Family::Name(family_name), Family::Monospace],
            ..Query::default()
        };
        let id = self
            .font_db
            .query(&query)
            .ok_or_else(|| anyhow::anyhow!("font family '{family_name}' not found"))?;

        // SAFETY: make_shared_face_data is safe when called with a valid ID
        // from query().
        let (data, _) = unsafe { self.font_db.make_shared_face_data(id) }
            .ok_or_else(|| anyhow::anyhow!("failed to load face data for '{family_name}'"))?;

        let bytes = data.as_ref().as_ref();
        self.add_font_data(bytes.to_vec())
            .ok_or_else(|| anyhow::anyhow!("failed to parse font '{family_name}'"))
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }
}

impl Default for FontManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GlyphRasterSource for FontManager {
    fn rasterize(
        &mut self,
        face: FontFaceId,
        glyph_index: u16,
        rendition: LineRendition,
        font: &FontSettings,
    ) -> Option<RasterizedGlyph> {
        let data = self.faces.get(face.0 as usize)?;

        let mut scaler = self
            .context
            .builder(data.font_ref)
            .size(font.font_size)
            .hint(true)
            .build();

        // A non-standard line rendition doubles the glyph horizontally, and
        // for DECDHL also vertically. The scale is anchored at the baseline
        // origin, matching where the text pipeline places the quad.
        let transform = match rendition {
            LineRendition::SingleWidth => None,
            LineRendition::DoubleWidth => Some(Transform::scale(2.0, 1.0)),
            LineRendition::DoubleHeightTop | LineRendition::DoubleHeightBottom => {
                Some(Transform::scale(2.0, 2.0))
            }
        };

        let render_format = match font.antialiasing_mode {
            AntialiasingMode::ClearType => Format::Subpixel,
            _ => Format::Alpha,
        };

        let image = Render::new(&[
            Source::ColorOutline(0),
            Source::ColorBitmap(StrikeWith::BestFit),
            Source::Outline,
        ])
        .format(render_format)
        .transform(transform)
        .render(&mut scaler, glyph_index)?;

        let width = image.placement.width;
        let height = image.placement.height;
        if width == 0 || height == 0 {
            return None;
        }

        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        let kind = match image.content {
            Content::Color => {
                // swash color bitmaps are straight alpha; the blend state
                // expects premultiplied.
                for px in image.data.chunks_exact(4) {
                    let a = px[3] as u32;
                    pixels.push(((px[0] as u32 * a) / 255) as u8);
                    pixels.push(((px[1] as u32 * a) / 255) as u8);
                    pixels.push(((px[2] as u32 * a) / 255) as u8);
                    pixels.push(px[3]);
                }
                RasterKind::Color
            }
            Content::Mask => {
                for &mask in &image.data {
                    // Aliased mode thresholds the coverage for crisp edges.
                    let alpha = if font.antialiasing_mode == AntialiasingMode::Aliased {
                        if mask > 127 { 255 } else { 0 }
                    } else {
                        mask
                    };
                    pixels.extend_from_slice(&[255, 255, 255, alpha]);
                }
                RasterKind::Grayscale
            }
            Content::SubpixelMask => {
                // 3 bytes per pixel of per-channel coverage weights.
                for px in image.data.chunks_exact(3) {
                    let avg = ((px[0] as u32 + px[1] as u32 + px[2] as u32) / 3) as u8;
                    pixels.extend_from_slice(&[px[0], px[1], px[2], avg]);
                }
                RasterKind::Subpixel
            }
        };

        Some(RasterizedGlyph {
            left: image.placement.left,
            top: -image.placement.top,
            width,
            height,
            pixels,
            kind,
        })
    }
}
