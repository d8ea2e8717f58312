/// Grid layout planner for multi-sample composites
///
/// A composite is a `rows × cols` grid of equally sized cells plus one extra,
/// narrower legend cell to the right of the last row.

use serde::{Deserialize, Serialize};

/// Width of the legend column relative to a map column.
pub const LEGEND_WIDTH_RATIO: f64 = 0.2;

/// Row count that leaves the fewest empty cells, then the squarest grid.
///
/// Candidates are scanned from 1 row upward and only a strictly better
/// candidate replaces the current one, so ties go to the smallest row count.
pub fn best_rows(n: usize) -> usize {
    if n == 0 {
        return 1;
    }
    let mut best: Option<(usize, usize, usize)> = None; // (empty, diff, rows)
    for rows in 1..=n {
        let cols = n.div_ceil(rows);
        let empty = rows * cols - n;
        let diff = rows.abs_diff(cols);
        let better = match best {
            None => true,
            Some((be, bd, _)) => empty < be || (empty == be && diff < bd),
        };
        if better {
            best = Some((empty, diff, rows));
        }
    }
    best.map_or(1, |(_, _, rows)| rows)
}

/// Rectangle in figure fractions, origin at the top-left corner
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FracRect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// Rectangle in output pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl FracRect {
    pub fn to_pixels(&self, width: u32, height: u32) -> PixelRect {
        let x0 = (self.x * width as f64).round() as u32;
        let y0 = (self.y * height as f64).round() as u32;
        let x1 = ((self.x + self.w) * width as f64).round() as u32;
        let y1 = ((self.y + self.h) * height as f64).round() as u32;
        PixelRect {
            x: x0,
            y: y0,
            w: x1.saturating_sub(x0),
            h: y1.saturating_sub(y0),
        }
    }
}

impl PixelRect {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.w && y >= self.y && y < self.y + self.h
    }

    pub fn center_x(&self) -> u32 {
        self.x + self.w / 2
    }

    /// Largest rectangle with aspect `aspect_w : aspect_h` centred inside.
    pub fn fit_aspect(&self, aspect_w: usize, aspect_h: usize) -> PixelRect {
        if aspect_w == 0 || aspect_h == 0 || self.w == 0 || self.h == 0 {
            return *self;
        }
        let scale = (self.w as f64 / aspect_w as f64).min(self.h as f64 / aspect_h as f64);
        let w = ((aspect_w as f64 * scale).floor() as u32).clamp(1, self.w);
        let h = ((aspect_h as f64 * scale).floor() as u32).clamp(1, self.h);
        PixelRect {
            x: self.x + (self.w - w) / 2,
            y: self.y + (self.h - h) / 2,
            w,
            h,
        }
    }
}

/// Arrangement of `count` maps on a grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeLayout {
    rows: usize,
    cols: usize,
    count: usize,
}

impl CompositeLayout {
    /// Layout chosen by [`best_rows`].
    pub fn best(count: usize) -> Self {
        Self::with_rows(count, best_rows(count))
    }

    /// Layout with a requested row count, clamped to `1..=count`.
    pub fn with_rows(count: usize, rows: usize) -> Self {
        let rows = rows.clamp(1, count.max(1));
        Self {
            rows,
            cols: count.div_ceil(rows),
            count,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Grid slots left without a map.
    pub fn empty_cells(&self) -> usize {
        self.rows * self.cols - self.count
    }

    /// (row, col) of map `index`, filled row by row.
    pub fn position(&self, index: usize) -> (usize, usize) {
        (index / self.cols.max(1), index % self.cols.max(1))
    }

    /// Figure size in cell units: map columns plus the legend column.
    pub fn figure_units(&self) -> (f64, f64) {
        (self.cols as f64 + LEGEND_WIDTH_RATIO, self.rows as f64)
    }

    /// Fractional rectangle of grid slot `index` (maps and padding alike).
    pub fn cell_rect(&self, index: usize) -> FracRect {
        let (row, col) = self.position(index);
        let (fw, fh) = self.figure_units();
        FracRect {
            x: col as f64 / fw,
            y: row as f64 / fh,
            w: 1.0 / fw,
            h: 1.0 / fh,
        }
    }

    /// Legend cell: right of the last column, same height as the last row.
    pub fn legend_rect(&self) -> FracRect {
        let (fw, fh) = self.figure_units();
        FracRect {
            x: self.cols as f64 / fw,
            y: (self.rows as f64 - 1.0) / fh,
            w: LEGEND_WIDTH_RATIO / fw,
            h: 1.0 / fh,
        }
    }
}
