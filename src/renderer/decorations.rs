//! Decoration quads: background fill, gridlines, the two cursor passes, and
//! selection.
//!
//! Cursor part 1 runs before text and part 2 after it; an auto-colored
//! cursor (sentinel `0xffffffff`) draws an XOR-tinted underlay in part 1 and
//! re-emits the same rectangles under the invert blend state in part 2 so
//! the cursor inverts whatever text was drawn over it.

use super::quads::QuadStream;
use super::types::{BlendMode, CursorRect, QuadInstance, shading};
use crate::payload::{CellRect, CursorShape, GridLineSet, RenderSettings, ShapedRow};

/// One full-viewport quad; the pixel shader samples the background half of
/// the color bitmap per cell.
pub(crate) fn draw_background(quads: &mut QuadStream, settings: &RenderSettings) {
    quads.push(QuadInstance {
        shading_type: shading::BACKGROUND,
        size: [
            settings.target_size[0] as u16,
            settings.target_size[1] as u16,
        ],
        ..Default::default()
    });
}

pub(crate) fn draw_gridlines(quads: &mut QuadStream, settings: &RenderSettings, rows: &[ShapedRow]) {
    for (y, row) in rows.iter().enumerate() {
        if !row.gridline_ranges.is_empty() {
            draw_gridline_row(quads, settings, row, y as u16);
        }
    }
}

fn draw_gridline_row(quads: &mut QuadStream, settings: &RenderSettings, row: &ShapedRow, y: u16) {
    let font = &settings.font;
    let cell_w = font.cell_size[0] as i32;
    let cell_h = font.cell_size[1] as i32;
    let top = cell_h * y as i32;

    for r in &row.gridline_ranges {
        debug_assert!(r.lines.any());

        let left = (r.from as i32 * cell_w) as i16;
        let width = ((r.to - r.from) as i32 * cell_w) as u16;
        let horizontal = |quads: &mut QuadStream, offset_y: u16, height: u16| {
            quads.push(QuadInstance {
                shading_type: shading::SOLID_FILL,
                position: [left, (top + offset_y as i32) as i16],
                size: [width, height],
                color: r.color,
                ..Default::default()
            });
        };
        let vertical = |quads: &mut QuadStream, col: i32| {
            quads.push(QuadInstance {
                shading_type: shading::SOLID_FILL,
                position: [(col * cell_w) as i16, top as i16],
                size: [font.thin_line_width, font.cell_size[1]],
                color: r.color,
                ..Default::default()
            });
        };

        if r.lines.test(GridLineSet::LEFT) {
            for col in r.from..r.to {
                vertical(quads, col as i32);
            }
        }
        if r.lines.test(GridLineSet::TOP) {
            horizontal(quads, 0, font.thin_line_width);
        }
        if r.lines.test(GridLineSet::RIGHT) {
            for col in (r.from + 1..=r.to).rev() {
                vertical(quads, col as i32);
            }
        }
        if r.lines.test(GridLineSet::BOTTOM) {
            horizontal(
                quads,
                font.cell_size[1] - font.thin_line_width,
                font.thin_line_width,
            );
        }
        if r.lines.test(GridLineSet::UNDERLINE) {
            horizontal(quads, font.underline_pos, font.underline_width);
        }
        if r.lines.test(GridLineSet::HYPERLINK_UNDERLINE) {
            horizontal(quads, font.underline_pos, font.underline_width);
        }
        if r.lines.test(GridLineSet::DOUBLE_UNDERLINE) {
            horizontal(quads, font.double_underline_pos[0], font.thin_line_width);
            horizontal(quads, font.double_underline_pos[1], font.thin_line_width);
        }
        if r.lines.test(GridLineSet::STRIKETHROUGH) {
            horizontal(quads, font.strikethrough_pos, font.strikethrough_width);
        }
    }
}

/// Builds the cursor rectangles by scanning the cursor row of the background
/// bitmap, coalescing horizontally over identical (opacified) colors. An
/// auto-colored cursor additionally draws the XOR underlay now.
pub(crate) fn draw_cursor_part1(
    quads: &mut QuadStream,
    cursor_rects: &mut Vec<CursorRect>,
    settings: &RenderSettings,
    cursor_rect: CellRect,
    color_bitmap: &[u32],
    color_bitmap_row_stride: usize,
) {
    cursor_rects.clear();

    if cursor_rect.is_empty() {
        return;
    }

    let font = &settings.font;
    let cursor = &settings.cursor;
    let cell_w = font.cell_size[0] as i32;
    let cell_h = font.cell_size[1] as i32;
    let thin = font.thin_line_width;
    let offset = cursor_rect.top as usize * color_bitmap_row_stride;

    let mut x1 = cursor_rect.left;
    while x1 < cursor_rect.right {
        let x0 = x1;
        let bg = color_bitmap[offset + x1 as usize] | 0xff000000;
        while x1 < cursor_rect.right && (color_bitmap[offset + x1 as usize] | 0xff000000) == bg {
            x1 += 1;
        }

        let color = if cursor.cursor_color == 0xffffffff {
            bg ^ 0x3f3f3f
        } else {
            cursor.cursor_color
        };
        let base = CursorRect {
            position: [
                (cell_w * x0 as i32) as i16,
                (cell_h * cursor_rect.top as i32) as i16,
            ],
            size: [(cell_w * (x1 - x0) as i32) as u16, cell_h as u16],
            color,
        };

        match cursor.cursor_type {
            CursorShape::Legacy => {
                let mut c = base;
                let height = (c.size[1] as u32 * cursor.height_percentage as u32 + 50) / 100;
                c.position[1] += (c.size[1] - height as u16) as i16;
                c.size[1] = height as u16;
                cursor_rects.push(c);
            }
            CursorShape::VerticalBar => {
                let mut c = base;
                c.size[0] = thin;
                cursor_rects.push(c);
            }
            CursorShape::Underscore => {
                let mut c = base;
                c.position[1] += font.underline_pos as i16;
                c.size[1] = font.underline_width;
                cursor_rects.push(c);
            }
            CursorShape::EmptyBox => {
                let i0 = cursor_rects.len();
                cursor_rects.push(base);
                let i1 = cursor_rects.len();
                cursor_rects.push(base);
                // Verticals only at the ends of the whole cursor span, inset
                // so they don't overlap the horizontal lines.
                if x0 == cursor_rect.left {
                    let mut c = base;
                    c.position[1] += thin as i16;
                    c.size[1] -= 2 * thin;
                    c.size[0] = thin;
                    cursor_rects.push(c);
                }
                if x1 == cursor_rect.right {
                    let mut c = base;
                    c.position[1] += thin as i16;
                    c.size[1] -= 2 * thin;
                    c.position[0] += (base.size[0] - thin) as i16;
                    c.size[0] = thin;
                    cursor_rects.push(c);
                }
                cursor_rects[i0].size[1] = thin;
                cursor_rects[i1].position[1] += (base.size[1] - thin) as i16;
                cursor_rects[i1].size[1] = thin;
            }
            CursorShape::FullBox => {
                cursor_rects.push(base);
            }
            CursorShape::DoubleUnderscore => {
                let mut c0 = base;
                c0.position[1] += font.double_underline_pos[0] as i16;
                c0.size[1] = thin;
                cursor_rects.push(c0);
                let mut c1 = base;
                c1.position[1] += font.double_underline_pos[1] as i16;
                c1.size[1] = thin;
                cursor_rects.push(c1);
            }
        }
    }

    if cursor.cursor_color == 0xffffffff {
        for c in cursor_rects.iter_mut() {
            quads.push(QuadInstance {
                shading_type: shading::SOLID_FILL,
                position: c.position,
                size: c.size,
                color: c.color,
                ..Default::default()
            });
            c.color = 0xffffffff;
        }
    }
}

/// Re-emits the part-1 rectangles over the text. The auto-colored cursor
/// brackets them with the invert blend state.
pub(crate) fn draw_cursor_part2(
    quads: &mut QuadStream,
    cursor_rects: &[CursorRect],
    cursor_color: u32,
) {
    if cursor_rects.is_empty() {
        return;
    }

    if cursor_color == 0xffffffff {
        quads.mark_state_change(BlendMode::Invert);
    }

    for c in cursor_rects {
        quads.push(QuadInstance {
            shading_type: shading::SOLID_FILL,
            position: c.position,
            size: c.size,
            color: c.color,
            ..Default::default()
        });
    }

    if cursor_color == 0xffffffff {
        quads.mark_state_change(BlendMode::Standard);
    }
}

/// One quad per selected row span; consecutive rows sharing the same span
/// stretch the previous quad downwards instead.
pub(crate) fn draw_selection(quads: &mut QuadStream, settings: &RenderSettings, rows: &[ShapedRow]) {
    let font = &settings.font;
    let cell_w = font.cell_size[0] as i32;
    let cell_h = font.cell_size[1];

    let mut last_from = 0u16;
    let mut last_to = 0u16;
    let mut last_y = usize::MAX;

    for (y, row) in rows.iter().enumerate() {
        if row.selection_to > row.selection_from {
            if row.selection_from == last_from
                && row.selection_to == last_to
                && last_y != usize::MAX
                && y == last_y + 1
            {
                quads.last_mut().size[1] += cell_h;
            } else {
                quads.push(QuadInstance {
                    shading_type: shading::SOLID_FILL,
                    position: [
                        (cell_w * row.selection_from as i32) as i16,
                        (cell_h as i32 * y as i32) as i16,
                    ],
                    size: [
                        (cell_w * (row.selection_to - row.selection_from) as i32) as u16,
                        cell_h,
                    ],
                    color: settings.misc.selection_color,
                    ..Default::default()
                });
                last_from = row.selection_from;
                last_to = row.selection_to;
            }
            last_y = y;
        }
    }
}
