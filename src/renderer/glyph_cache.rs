//! Two-level glyph cache: font face + line rendition, then glyph index.
//!
//! Entries live exactly as long as their atlas generation; a reset empties
//! every inner map at once while the outer font-face entries survive.

use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};

use super::types::AtlasGlyphEntry;
use crate::font_manager::FontFaceId;
use crate::payload::LineRendition;

/// Fibonacci-mix hasher for the small integer keys used here. Std's map is
/// already open-addressing; the default SipHash is the only part worth
/// replacing on this hot path.
#[derive(Default)]
pub struct IntMixHasher(u64);

impl IntMixHasher {
    #[inline]
    fn mix(&mut self, value: u64) {
        self.0 = (self.0 ^ value).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    }
}

impl Hasher for IntMixHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.mix(b as u64);
        }
    }

    fn write_u8(&mut self, i: u8) {
        self.mix(i as u64);
    }

    fn write_u16(&mut self, i: u16) {
        self.mix(i as u64);
    }

    fn write_u32(&mut self, i: u32) {
        self.mix(i as u64);
    }

    fn write_u64(&mut self, i: u64) {
        self.mix(i);
    }

    fn write_usize(&mut self, i: usize) {
        self.mix(i as u64);
    }
}

type IntMap<K, V> = HashMap<K, V, BuildHasherDefault<IntMixHasher>>;

/// Outer cache key. `font_face: None` selects the soft-font path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FontFaceKey {
    pub font_face: Option<FontFaceId>,
    pub rendition: LineRendition,
}

#[derive(Default)]
pub struct FontFaceEntry {
    glyphs: IntMap<u16, AtlasGlyphEntry>,
}

pub struct GlyphCache {
    faces: IntMap<FontFaceKey, FontFaceEntry>,
    live_glyphs: usize,
}

impl GlyphCache {
    pub fn new() -> Self {
        Self {
            faces: IntMap::default(),
            live_glyphs: 0,
        }
    }

    pub fn get(&self, key: FontFaceKey, glyph_index: u16) -> Option<AtlasGlyphEntry> {
        self.faces.get(&key)?.glyphs.get(&glyph_index).copied()
    }

    pub fn contains(&self, key: FontFaceKey, glyph_index: u16) -> bool {
        self.faces
            .get(&key)
            .is_some_and(|f| f.glyphs.contains_key(&glyph_index))
    }

    /// Inserts (or replaces) an entry, creating the font-face level on
    /// demand.
    pub fn insert(&mut self, key: FontFaceKey, glyph_index: u16, entry: AtlasGlyphEntry) {
        let face = self.faces.entry(key).or_default();
        if face.glyphs.insert(glyph_index, entry).is_none() {
            self.live_glyphs += 1;
        }
    }

    /// Invalidates every glyph entry at once (atlas reset) while keeping the
    /// outer font-face entries.
    pub fn clear_glyphs(&mut self) {
        for face in self.faces.values_mut() {
            face.glyphs.clear();
        }
        self.live_glyphs = 0;
    }

    /// True when no glyph survived since the last reset; retrying an atlas
    /// reset in this state cannot make progress.
    pub fn is_empty(&self) -> bool {
        self.live_glyphs == 0
    }
}

impl Default for GlyphCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::types::shading;

    fn key(face: u32, rendition: LineRendition) -> FontFaceKey {
        FontFaceKey {
            font_face: Some(FontFaceId(face)),
            rendition,
        }
    }

    fn entry(x: u16) -> AtlasGlyphEntry {
        AtlasGlyphEntry {
            shading_type: shading::TEXT_GRAYSCALE,
            texcoord: [x, 0],
            ..Default::default()
        }
    }

    #[test]
    fn renditions_are_distinct_outer_keys() {
        let mut cache = GlyphCache::new();
        cache.insert(key(0, LineRendition::SingleWidth), 65, entry(1));
        cache.insert(key(0, LineRendition::DoubleWidth), 65, entry(2));

        assert_eq!(
            cache.get(key(0, LineRendition::SingleWidth), 65),
            Some(entry(1))
        );
        assert_eq!(
            cache.get(key(0, LineRendition::DoubleWidth), 65),
            Some(entry(2))
        );
        assert_eq!(cache.live_glyphs, 2);
    }

    #[test]
    fn reinsert_replaces_without_recounting() {
        let mut cache = GlyphCache::new();
        let k = key(0, LineRendition::SingleWidth);
        cache.insert(k, 65, entry(1));
        cache.insert(k, 65, entry(2));
        assert_eq!(cache.live_glyphs, 1);
        assert_eq!(cache.get(k, 65), Some(entry(2)));
    }

    #[test]
    fn clear_glyphs_preserves_faces_and_empties_entries() {
        let mut cache = GlyphCache::new();
        let k = key(3, LineRendition::SingleWidth);
        cache.insert(k, 65, entry(1));
        cache.insert(k, 66, entry(2));
        assert!(!cache.is_empty());

        cache.clear_glyphs();
        assert!(cache.is_empty());
        assert!(!cache.contains(k, 65));
        // The outer entry still exists; inserting again reuses it.
        cache.insert(k, 65, entry(3));
        assert_eq!(cache.live_glyphs, 1);
    }

    #[test]
    fn soft_font_key_is_separate() {
        let mut cache = GlyphCache::new();
        let soft = FontFaceKey {
            font_face: None,
            rendition: LineRendition::SingleWidth,
        };
        cache.insert(soft, 0xef20, entry(9));
        assert!(cache.contains(soft, 0xef20));
        assert!(!cache.contains(key(0, LineRendition::SingleWidth), 0xef20));
    }
}
