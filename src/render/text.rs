/// Raster primitives for annotating exported images: a 3×5 bitmap font,
/// Bresenham lines and filled rectangles. Everything clips silently at the
/// image border and works on any `image::GenericImage` (RGB base layers and
/// RGBA overlays alike).

use image::GenericImage;

use crate::pipeline::layout::PixelRect;

/// Glyph rows, 3 bits each, most significant bit on the left.
fn glyph(c: char) -> [u8; 5] {
    match c {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b010, 0b010, 0b010],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        ',' => [0b000, 0b000, 0b000, 0b010, 0b100],
        '-' | '–' => [0b000, 0b000, 0b111, 0b000, 0b000],
        '+' => [0b000, 0b010, 0b111, 0b010, 0b000],
        '=' => [0b000, 0b111, 0b000, 0b111, 0b000],
        '(' => [0b010, 0b100, 0b100, 0b100, 0b010],
        ')' => [0b010, 0b001, 0b001, 0b001, 0b010],
        '/' => [0b001, 0b001, 0b010, 0b100, 0b100],
        ':' => [0b000, 0b010, 0b000, 0b010, 0b000],
        '_' => [0b000, 0b000, 0b000, 0b000, 0b111],
        '%' => [0b101, 0b001, 0b010, 0b100, 0b101],
        '#' => [0b101, 0b111, 0b101, 0b111, 0b101],
        '\'' => [0b010, 0b010, 0b000, 0b000, 0b000],
        ' ' => [0b000, 0b000, 0b000, 0b000, 0b000],
        'µ' | 'μ' => [0b000, 0b101, 0b101, 0b111, 0b100],
        'A' | 'a' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'B' | 'b' => [0b110, 0b101, 0b110, 0b101, 0b110],
        'C' | 'c' => [0b011, 0b100, 0b100, 0b100, 0b011],
        'D' | 'd' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'E' | 'e' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'F' | 'f' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'G' | 'g' => [0b011, 0b100, 0b101, 0b101, 0b011],
        'H' | 'h' => [0b101, 0b101, 0b111, 0b101, 0b101],
        'I' | 'i' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'J' | 'j' => [0b001, 0b001, 0b001, 0b101, 0b010],
        'K' | 'k' => [0b101, 0b110, 0b100, 0b110, 0b101],
        'L' | 'l' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'M' | 'm' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'N' | 'n' => [0b110, 0b101, 0b101, 0b101, 0b101],
        'O' | 'o' => [0b010, 0b101, 0b101, 0b101, 0b010],
        'P' | 'p' => [0b110, 0b101, 0b110, 0b100, 0b100],
        'Q' | 'q' => [0b010, 0b101, 0b101, 0b110, 0b011],
        'R' | 'r' => [0b110, 0b101, 0b110, 0b101, 0b101],
        'S' | 's' => [0b011, 0b100, 0b010, 0b001, 0b110],
        'T' | 't' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'U' | 'u' => [0b101, 0b101, 0b101, 0b101, 0b111],
        'V' | 'v' => [0b101, 0b101, 0b101, 0b101, 0b010],
        'W' | 'w' => [0b101, 0b101, 0b111, 0b111, 0b101],
        'X' | 'x' => [0b101, 0b101, 0b010, 0b101, 0b101],
        'Y' | 'y' => [0b101, 0b101, 0b010, 0b010, 0b010],
        'Z' | 'z' => [0b111, 0b001, 0b010, 0b100, 0b111],
        _ => [0b000, 0b000, 0b010, 0b000, 0b000],
    }
}

/// Glyph scale for a font size in points at the given resolution.
///
/// The bitmap glyph is 5 cells tall and stands in for the cap height,
/// roughly 70% of the nominal size.
pub fn scale_for_points(points: f32, dpi: u32) -> u32 {
    let px = (points as f64 * dpi as f64 / 72.0).max(8.0);
    ((px * 0.7 / 5.0).round() as u32).max(1)
}

/// Width in pixels of `text` at `scale`, without trailing spacing.
pub fn text_width(text: &str, scale: u32) -> u32 {
    let n = text.chars().count() as u32;
    if n == 0 {
        0
    } else {
        n * 4 * scale - scale
    }
}

pub fn text_height(scale: u32) -> u32 {
    5 * scale
}

/// Draw `text` with its top-left corner at (x, y).
pub fn draw_text<I: GenericImage>(img: &mut I, text: &str, x: i64, y: i64, color: I::Pixel, scale: u32) {
    let scale = scale.max(1) as i64;
    let (w, h) = (img.width() as i64, img.height() as i64);
    let mut cx = x;
    for ch in text.chars() {
        for (row, &bits) in glyph(ch).iter().enumerate() {
            for col in 0..3i64 {
                if (bits >> (2 - col)) & 1 == 0 {
                    continue;
                }
                for sy in 0..scale {
                    for sx in 0..scale {
                        let px = cx + col * scale + sx;
                        let py = y + row as i64 * scale + sy;
                        if px >= 0 && py >= 0 && px < w && py < h {
                            img.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
        cx += 4 * scale;
    }
}

/// Draw `text` horizontally centred on `center_x`.
pub fn draw_text_centered<I: GenericImage>(
    img: &mut I,
    text: &str,
    center_x: i64,
    y: i64,
    color: I::Pixel,
    scale: u32,
) {
    let half = text_width(text, scale) as i64 / 2;
    draw_text(img, text, center_x - half, y, color, scale);
}

/// Draw `text` so that it ends at `right_x`.
pub fn draw_text_right<I: GenericImage>(
    img: &mut I,
    text: &str,
    right_x: i64,
    y: i64,
    color: I::Pixel,
    scale: u32,
) {
    draw_text(img, text, right_x - text_width(text, scale) as i64, y, color, scale);
}

/// Bresenham line between two points.
pub fn draw_line<I: GenericImage>(img: &mut I, x0: i64, y0: i64, x1: i64, y1: i64, color: I::Pixel) {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let (mut cx, mut cy) = (x0, y0);
    loop {
        if cx >= 0 && cx < w && cy >= 0 && cy < h {
            img.put_pixel(cx as u32, cy as u32, color);
        }
        if cx == x1 && cy == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            cx += sx;
        }
        if e2 <= dx {
            err += dx;
            cy += sy;
        }
    }
}

pub fn fill_rect<I: GenericImage>(img: &mut I, rect: PixelRect, color: I::Pixel) {
    let x_end = (rect.x + rect.w).min(img.width());
    let y_end = (rect.y + rect.h).min(img.height());
    for y in rect.y..y_end {
        for x in rect.x..x_end {
            img.put_pixel(x, y, color);
        }
    }
}

/// Horizontal bar `thickness` pixels tall, vertically centred on `y`.
pub fn draw_hbar<I: GenericImage>(img: &mut I, x0: i64, x1: i64, y: i64, thickness: u32, color: I::Pixel) {
    let half = thickness as i64 / 2;
    for dy in 0..thickness.max(1) as i64 {
        draw_line(img, x0, y - half + dy, x1, y - half + dy, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn lit(img: &RgbImage) -> usize {
        img.pixels().filter(|p| p.0 != [0, 0, 0]).count()
    }

    #[test]
    fn test_text_metrics() {
        assert_eq!(text_width("", 3), 0);
        assert_eq!(text_width("A", 1), 3);
        assert_eq!(text_width("10", 2), 14);
        assert_eq!(text_height(4), 20);
        assert_eq!(scale_for_points(12.0, 300), 7);
        assert_eq!(scale_for_points(1.0, 10), 1);
    }

    #[test]
    fn test_draw_text_stays_in_bounds() {
        let mut img = RgbImage::new(20, 10);
        draw_text(&mut img, "Fe56 ppm", -5, 3, Rgb([255, 255, 255]), 2);
        assert!(lit(&img) > 0);
        let mut small = RgbImage::new(4, 6);
        draw_text(&mut small, "1", 0, 0, Rgb([255, 0, 0]), 1);
        // '1' has 8 lit cells.
        assert_eq!(lit(&small), 8);
    }

    #[test]
    fn test_m_and_n_differ() {
        assert_ne!(glyph('M'), glyph('N'));
        assert_eq!(glyph('µ'), glyph('μ'));
    }

    #[test]
    fn test_line_and_rect() {
        let mut img = RgbaImage::new(10, 10);
        draw_line(&mut img, 0, 0, 9, 9, Rgba([255, 0, 0, 255]));
        assert_eq!(img.get_pixel(5, 5).0, [255, 0, 0, 255]);
        fill_rect(&mut img, PixelRect { x: 8, y: 8, w: 5, h: 5 }, Rgba([0, 0, 255, 255]));
        assert_eq!(img.get_pixel(9, 9).0, [0, 0, 255, 255]);
        assert_eq!(img.get_pixel(0, 9).0, [0, 0, 0, 0]);
    }

    #[test]
    fn test_hbar_thickness() {
        let mut img = RgbImage::new(10, 10);
        draw_hbar(&mut img, 1, 8, 5, 3, Rgb([1, 1, 1]));
        assert_eq!(lit(&img), 8 * 3);
    }
}
