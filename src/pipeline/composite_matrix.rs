/// Stitched numeric composite: all sample maps of one element laid out in the
/// composite grid, written as a single headerless CSV.
///
/// Every map is padded with missing values on the bottom and right to the
/// largest map shape. One missing column separates grid columns and one
/// missing row separates grid rows; unused grid cells are all missing.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::data::matrix::{ElementMatrix, Grid, MISSING};
use crate::error::{MapError, Result};
use crate::pipeline::layout::CompositeLayout;

/// `{dir}/{key}_composite_matrix.csv`
pub fn composite_matrix_path(element_dir: &Path, key: &str) -> PathBuf {
    element_dir.join(format!("{}_composite_matrix.csv", key))
}

pub fn build_composite_matrix(matrices: &[ElementMatrix], layout: &CompositeLayout) -> Result<Grid> {
    if matrices.is_empty() {
        return Err(MapError::data("no matrices to stitch"));
    }
    if layout.count() != matrices.len() {
        return Err(MapError::config(format!(
            "layout holds {} cells but {} matrices were given",
            layout.count(),
            matrices.len()
        )));
    }
    let max_h = matrices.iter().map(|m| m.grid.rows()).max().unwrap_or(0);
    let max_w = matrices.iter().map(|m| m.grid.cols()).max().unwrap_or(0);
    let (rows, cols) = (layout.rows(), layout.cols());
    let total_h = rows * max_h + rows.saturating_sub(1);
    let total_w = cols * max_w + cols.saturating_sub(1);

    let mut out = Grid::filled(total_h, total_w, MISSING);
    for (i, m) in matrices.iter().enumerate() {
        let (gr, gc) = layout.position(i);
        let top = gr * (max_h + 1);
        let left = gc * (max_w + 1);
        for r in 0..m.grid.rows() {
            for (c, &v) in m.grid.row(r).iter().enumerate() {
                out.set(top + r, left + c, v);
            }
        }
    }
    Ok(out)
}

/// Write a grid without header or index; missing cells become empty fields.
pub fn save_matrix_csv(grid: &Grid, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut w = BufWriter::new(fs::File::create(path)?);
    for r in 0..grid.rows() {
        let line: Vec<String> = grid
            .row(r)
            .iter()
            .map(|v| if v.is_finite() { v.to_string() } else { String::new() })
            .collect();
        writeln!(w, "{}", line.join(","))?;
    }
    w.flush()?;
    log::info!(
        "Matrix {}x{} written to {}",
        grid.rows(),
        grid.cols(),
        path.display()
    );
    Ok(())
}
