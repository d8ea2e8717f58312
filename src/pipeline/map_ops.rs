/// Whole-map arithmetic on grids: two-map ratio with Pearson correlation,
/// z-stack summation of aligned slices, and rectangular crops.
///
/// All results are plain [`Grid`]s so they can be saved with
/// [`save_matrix_csv`](crate::pipeline::composite_matrix::save_matrix_csv)
/// or loaded into a session like any other map.

use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::data::matrix::{Grid, MISSING};
use crate::error::{MapError, Result};

/// Fewer valid pixel pairs than this leave the correlation undefined.
pub const MIN_CORRELATION_PAIRS: usize = 3;

#[derive(Debug, Clone)]
pub struct RatioMap {
    pub grid: Grid,
    /// Pearson r over pixels where both maps are populated and non-zero
    pub pearson_r: Option<f64>,
    pub pairs: usize,
}

/// Pixel-wise `numerator / denominator`.
///
/// Division by zero and missing inputs give missing pixels.
pub fn ratio_map(numerator: &Grid, denominator: &Grid) -> Result<RatioMap> {
    if numerator.shape() != denominator.shape() {
        return Err(MapError::ShapeMismatch {
            expected: numerator.shape(),
            found: denominator.shape(),
        });
    }
    let data = numerator
        .values()
        .iter()
        .zip(denominator.values())
        .map(|(&a, &b)| {
            let q = a / b;
            if q.is_finite() {
                q
            } else {
                MISSING
            }
        })
        .collect();
    let grid = Grid::new(numerator.rows(), numerator.cols(), data)?;

    let (xs, ys): (Vec<f64>, Vec<f64>) = numerator
        .values()
        .iter()
        .zip(denominator.values())
        .filter(|(a, b)| a.is_finite() && b.is_finite() && **a != 0.0 && **b != 0.0)
        .map(|(&a, &b)| (a, b))
        .unzip();
    let pearson_r = if xs.len() >= MIN_CORRELATION_PAIRS {
        pearson(&xs, &ys)
    } else {
        None
    };
    log::debug!("Ratio map over {} pixel pairs, r = {:?}", xs.len(), pearson_r);
    Ok(RatioMap {
        grid,
        pearson_r,
        pairs: xs.len(),
    })
}

/// Sample Pearson correlation; `None` when either side has no variance.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return None;
    }
    let mx = xs[..n].iter().sum::<f64>() / n as f64;
    let my = ys[..n].iter().sum::<f64>() / n as f64;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (x, y) in xs[..n].iter().zip(&ys[..n]) {
        let (dx, dy) = (x - mx, y - my);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return None;
    }
    Some((sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0))
}

/// `{numerator}_over_{denominator}_ratio.csv`
pub fn ratio_file_name(numerator: &str, denominator: &str) -> String {
    format!("{}_over_{}_ratio.csv", numerator, denominator)
}

/// Ordered slices of one element with a (dy, dx) offset each
#[derive(Debug, Clone, Default)]
pub struct ZStack {
    slices: Vec<Grid>,
    offsets: Vec<(i64, i64)>,
    /// Pad smaller slices with zeros on the bottom and right before summing
    pub auto_pad: bool,
}

impl ZStack {
    pub fn new() -> Self {
        Self {
            auto_pad: true,
            ..Default::default()
        }
    }

    pub fn push(&mut self, slice: Grid) {
        self.slices.push(slice);
        self.offsets.push((0, 0));
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn clear(&mut self) {
        self.slices.clear();
        self.offsets.clear();
    }

    pub fn offset(&self, index: usize) -> Option<(i64, i64)> {
        self.offsets.get(index).copied()
    }

    pub fn set_offset(&mut self, index: usize, dy: i64, dx: i64) -> Result<()> {
        let slot = self
            .offsets
            .get_mut(index)
            .ok_or_else(|| MapError::config(format!("no slice {} in the stack", index)))?;
        *slot = (dy, dx);
        Ok(())
    }

    /// Shift one slice by a relative amount.
    pub fn nudge(&mut self, index: usize, dy: i64, dx: i64) -> Result<()> {
        let (y, x) = self
            .offset(index)
            .ok_or_else(|| MapError::config(format!("no slice {} in the stack", index)))?;
        self.set_offset(index, y + dy, x + dx)
    }

    /// Pixel-wise sum of all slices after padding and shifting.
    ///
    /// Missing pixels count as zero. Without `auto_pad` every slice must
    /// have the first slice's shape.
    pub fn sum(&self) -> Result<Grid> {
        let first = self.slices.first().ok_or_else(|| MapError::data("z-stack has no slices"))?;
        let (rows, cols) = if self.auto_pad {
            (
                self.slices.iter().map(Grid::rows).max().unwrap_or(0),
                self.slices.iter().map(Grid::cols).max().unwrap_or(0),
            )
        } else {
            if let Some(s) = self.slices.iter().find(|s| s.shape() != first.shape()) {
                return Err(MapError::ShapeMismatch {
                    expected: first.shape(),
                    found: s.shape(),
                });
            }
            first.shape()
        };

        let mut total = Grid::filled(rows, cols, 0.0);
        for (slice, &(dy, dx)) in self.slices.iter().zip(&self.offsets) {
            for r in 0..slice.rows() {
                let tr = r as i64 + dy;
                if tr < 0 || tr >= rows as i64 {
                    continue;
                }
                for (c, &v) in slice.row(r).iter().enumerate() {
                    let tc = c as i64 + dx;
                    if tc < 0 || tc >= cols as i64 || !v.is_finite() {
                        continue;
                    }
                    let (tr, tc) = (tr as usize, tc as usize);
                    total.set(tr, tc, total.get(tr, tc) + v);
                }
            }
        }
        log::info!("Summed {} slice(s) into {}x{}", self.slices.len(), rows, cols);
        Ok(total)
    }
}

/// `Summed {element} matrix.csv`
pub fn zstack_file_name(element: Option<&str>) -> String {
    format!("Summed {} matrix.csv", element.unwrap_or("Total"))
}

/// Copy of `rows` x `cols` out of `grid` (half-open ranges).
pub fn crop(grid: &Grid, rows: Range<usize>, cols: Range<usize>) -> Result<Grid> {
    if rows.is_empty() || cols.is_empty() || rows.end > grid.rows() || cols.end > grid.cols() {
        return Err(MapError::config(format!(
            "crop rows {:?} cols {:?} outside a {}x{} map",
            rows,
            cols,
            grid.rows(),
            grid.cols()
        )));
    }
    let mut data = Vec::with_capacity(rows.len() * cols.len());
    for r in rows.clone() {
        data.extend_from_slice(&grid.row(r)[cols.clone()]);
    }
    Grid::new(rows.len(), cols.len(), data)
}

/// `{stem}_cropped_{x0}-{x1}_{y0}-{y1}.csv` next to the source file
pub fn cropped_path(source: &Path, rows: &Range<usize>, cols: &Range<usize>) -> PathBuf {
    let stem = source.file_stem().and_then(|s| s.to_str()).unwrap_or("matrix");
    source.with_file_name(format!(
        "{}_cropped_{}-{}_{}-{}.csv",
        stem, cols.start, cols.end, rows.start, rows.end
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid(rows: usize, cols: usize, values: &[f64]) -> Grid {
        Grid::new(rows, cols, values.to_vec()).unwrap()
    }

    #[test]
    fn test_ratio_masks_division_by_zero() {
        let a = grid(2, 2, &[4.0, 1.0, 0.0, f64::NAN]);
        let b = grid(2, 2, &[2.0, 0.0, 0.0, 3.0]);
        let out = ratio_map(&a, &b).unwrap();
        assert_eq!(out.grid.get(0, 0), 2.0);
        assert!(out.grid.get(0, 1).is_nan());
        assert!(out.grid.get(1, 0).is_nan());
        assert!(out.grid.get(1, 1).is_nan());
        // one usable pair is not enough for a correlation
        assert_eq!(out.pairs, 1);
        assert!(out.pearson_r.is_none());
    }

    #[test]
    fn test_ratio_correlation_skips_zeros() {
        let a = grid(1, 5, &[1.0, 2.0, 3.0, 0.0, 4.0]);
        let b = grid(1, 5, &[2.0, 4.0, 6.0, 9.0, 8.0]);
        let out = ratio_map(&a, &b).unwrap();
        assert_eq!(out.pairs, 4);
        assert_relative_eq!(out.pearson_r.unwrap(), 1.0, epsilon = 1e-12);

        let c = grid(1, 4, &[1.0, 2.0, 3.0, 4.0]);
        let d = grid(1, 4, &[4.0, 3.0, 2.0, 1.0]);
        assert_relative_eq!(ratio_map(&c, &d).unwrap().pearson_r.unwrap(), -1.0, epsilon = 1e-12);
        assert!(ratio_map(&c, &grid(2, 2, &[1.0; 4])).is_err());
    }

    #[test]
    fn test_pearson_without_variance() {
        assert!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).is_none());
        assert_relative_eq!(
            pearson(&[1.0, 2.0, 3.0, 4.0], &[1.0, 3.0, 2.0, 4.0]).unwrap(),
            0.8,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_zstack_pads_and_sums() {
        let mut stack = ZStack::new();
        stack.push(grid(2, 2, &[1.0, 1.0, 1.0, f64::NAN]));
        stack.push(grid(3, 1, &[10.0, 20.0, 30.0]));
        let total = stack.sum().unwrap();
        assert_eq!(total.shape(), (3, 2));
        assert_eq!(total.row(0), &[11.0, 1.0]);
        assert_eq!(total.row(1), &[21.0, 0.0]);
        assert_eq!(total.row(2), &[30.0, 0.0]);

        stack.auto_pad = false;
        assert!(matches!(stack.sum(), Err(MapError::ShapeMismatch { .. })));
        assert!(ZStack::new().sum().is_err());
    }

    #[test]
    fn test_zstack_offsets_shift_with_zero_fill() {
        let mut stack = ZStack::new();
        stack.push(grid(2, 2, &[1.0, 2.0, 3.0, 4.0]));
        stack.push(grid(2, 2, &[1.0, 2.0, 3.0, 4.0]));
        stack.nudge(1, 1, 0).unwrap();
        stack.nudge(1, 0, -1).unwrap();
        assert_eq!(stack.offset(1), Some((1, -1)));
        let total = stack.sum().unwrap();
        assert_eq!(total.row(0), &[1.0, 2.0]);
        assert_eq!(total.row(1), &[5.0, 4.0]);
        assert!(stack.nudge(2, 0, 1).is_err());
    }

    #[test]
    fn test_crop_and_names() {
        let g = grid(3, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let c = crop(&g, 1..3, 0..2).unwrap();
        assert_eq!(c.shape(), (2, 2));
        assert_eq!(c.values(), &[4.0, 5.0, 7.0, 8.0]);
        assert!(crop(&g, 2..4, 0..1).is_err());
        assert!(crop(&g, 1..1, 0..1).is_err());

        let p = cropped_path(Path::new("/data/A Fe56_ppm matrix.xlsx"), &(1..3), &(0..2));
        assert_eq!(p, PathBuf::from("/data/A Fe56_ppm matrix_cropped_0-2_1-3.csv"));
        assert_eq!(ratio_file_name("Fe56", "Zn66"), "Fe56_over_Zn66_ratio.csv");
        assert_eq!(zstack_file_name(Some("Fe56")), "Summed Fe56 matrix.csv");
    }
}
