/// Matrix loader: reads a 2D grid of numeric cells from a workbook or a
/// delimited text export and turns it into a [`Grid`].
///
/// Any cell that is not a finite real number becomes the missing-value
/// sentinel; rows and columns left without a single populated cell are then
/// dropped.

use calamine::{open_workbook_auto, Data, Reader};
use std::fs;
use std::path::Path;

use crate::data::filename::parse_matrix_filename;
use crate::data::matrix::{ElementMatrix, Grid, MatrixMeta, UnitKind, MISSING};
use crate::error::{MapError, Result};

pub const WORKBOOK_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods"];
pub const DELIMITED_EXTENSIONS: &[&str] = &["csv", "txt", "tsv"];

/// Knobs for [`load_grid`]
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Treat negative values as missing (background-subtracted exports
    /// carry small negative noise outside the sample).
    pub mask_negative: bool,
}

impl LoadOptions {
    pub fn mask_negative(mut self, on: bool) -> Self {
        self.mask_negative = on;
        self
    }
}

/// Container formats the loader understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Workbook,
    Delimited,
}

fn container_for(path: &Path) -> Option<Container> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if WORKBOOK_EXTENSIONS.contains(&ext.as_str()) {
        Some(Container::Workbook)
    } else if DELIMITED_EXTENSIONS.contains(&ext.as_str()) {
        Some(Container::Delimited)
    } else {
        None
    }
}

/// Load a grid from `path`.
pub fn load_grid(path: &Path, opts: LoadOptions) -> Result<Grid> {
    if !path.exists() {
        return Err(MapError::FileMissing {
            path: path.to_path_buf(),
        });
    }
    let meta = fs::metadata(path)?;
    if meta.len() == 0 {
        return Err(MapError::FileUnreadable {
            path: path.to_path_buf(),
            reason: "file is empty (cloud-storage placeholder not synced yet?)".to_string(),
        });
    }

    let rows = match container_for(path) {
        Some(Container::Workbook) => read_workbook_rows(path)?,
        Some(Container::Delimited) => {
            let bytes = fs::read(path)?;
            parse_delimited(&String::from_utf8_lossy(&bytes))
        }
        None => {
            return Err(MapError::FileUnreadable {
                path: path.to_path_buf(),
                reason: "unsupported file extension".to_string(),
            })
        }
    };

    let mut grid = Grid::from_rows(rows);
    if opts.mask_negative {
        for r in 0..grid.rows() {
            for c in 0..grid.cols() {
                if grid.get(r, c) < 0.0 {
                    grid.set(r, c, MISSING);
                }
            }
        }
    }

    let grid = grid.trim_missing();
    if grid.valid_count() == 0 {
        return Err(MapError::data(format!(
            "{} contains no numeric cells",
            path.display()
        )));
    }
    log::debug!(
        "Loaded {} as {}x{} grid",
        path.display(),
        grid.rows(),
        grid.cols()
    );
    Ok(grid)
}

/// Load a grid and attach metadata parsed from the file name.
///
/// Names that do not follow the instrument convention fall back to the
/// first word of the file stem as sample and `Unknown` as element.
pub fn load_element_matrix(path: &Path, opts: LoadOptions) -> Result<ElementMatrix> {
    let grid = load_grid(path, opts)?;
    let meta = parse_matrix_filename(&path.to_string_lossy()).unwrap_or_else(|| fallback_meta(path));
    Ok(ElementMatrix::new(grid, meta))
}

fn fallback_meta(path: &Path) -> MatrixMeta {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sample = stem.split_whitespace().next().unwrap_or("sample");
    let mut element = "Unknown";
    let mut unit = UnitKind::Raw;
    for part in stem.split_whitespace() {
        if let Some(e) = part.strip_suffix("_ppm") {
            element = e;
            unit = UnitKind::Ppm;
        } else if let Some(e) = part.strip_suffix("_CPS") {
            element = e;
            unit = UnitKind::Cps;
        }
    }
    MatrixMeta::new(sample, element, unit)
}

fn read_workbook_rows(path: &Path) -> Result<Vec<Vec<f64>>> {
    let unreadable = |e: &dyn std::fmt::Display| {
        let text = e.to_string();
        let reason = if text.contains("Content_Types") || text.to_lowercase().contains("zip") {
            format!(
                "{} (workbook looks incomplete, possibly a cloud-storage placeholder)",
                text
            )
        } else {
            text
        };
        MapError::FileUnreadable {
            path: path.to_path_buf(),
            reason,
        }
    };

    let mut workbook = open_workbook_auto(path).map_err(|e| unreadable(&e))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| MapError::FileUnreadable {
            path: path.to_path_buf(),
            reason: "workbook has no worksheets".to_string(),
        })?
        .map_err(|e| unreadable(&e))?;

    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_value).collect())
        .collect())
}

fn cell_value(cell: &Data) -> f64 {
    match cell {
        Data::Int(i) => *i as f64,
        Data::Float(f) if f.is_finite() => *f,
        Data::String(s) => parse_number(s),
        _ => MISSING,
    }
}

fn parse_number(text: &str) -> f64 {
    let t = text.trim().trim_matches('"').trim();
    if t.is_empty() || t == "." {
        return MISSING;
    }
    match t.parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => MISSING,
    }
}

/// Pick the delimiter that occurs most often in the first few lines.
fn detect_delimiter(text: &str) -> char {
    let sample: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).take(5).collect();
    [',', '\t', ';']
        .into_iter()
        .max_by_key(|d| sample.iter().map(|l| l.matches(*d).count()).sum::<usize>())
        .unwrap_or(',')
}

/// Parse a delimited export into rows of values.
///
/// A leading label column (text cells, fewer than 30% numeric) is removed.
/// Header and metadata lines become all-missing rows that the caller drops.
pub(crate) fn parse_delimited(text: &str) -> Vec<Vec<f64>> {
    let delim = detect_delimiter(text);
    let raw: Vec<Vec<&str>> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.split(delim).collect())
        .collect();

    let first_col: Vec<&str> = raw.iter().filter_map(|r| r.first().copied()).collect();
    let numeric = first_col.iter().filter(|c| parse_number(c).is_finite()).count();
    let has_text = first_col.iter().any(|c| {
        let t = c.trim();
        !t.is_empty() && t != "." && !parse_number(t).is_finite()
    });
    let skip_first = has_text && (numeric as f64) < first_col.len() as f64 * 0.3;

    raw.iter()
        .map(|row| {
            row.iter()
                .skip(usize::from(skip_first))
                .map(|c| parse_number(c))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_missing_row_and_column_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "S1 Fe56_ppm matrix.csv", "1,x,2\n,,\n3,,4\n");
        let grid = load_grid(&path, LoadOptions::default()).unwrap();
        assert_eq!(grid.shape(), (2, 2));
        assert_eq!(grid.values(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_geopixe_style_export() {
        let body = "GeoPIXE image export\n.,0,1,2\nrow0,1.5,.,2.5\nrow1,3,4,5\n";
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "map.csv", body);
        let grid = load_grid(&path, LoadOptions::default()).unwrap();
        // Header line "0,1,2" is numeric and survives as the first row.
        assert_eq!(grid.shape(), (3, 3));
        assert!(grid.get(1, 1).is_nan());
        assert_eq!(grid.get(2, 2), 5.0);
    }

    #[test]
    fn test_semicolon_and_tab_delimiters() {
        assert_eq!(parse_delimited("1;2\n3;4\n"), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(parse_delimited("1\t2\n3\t4\n"), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
    }

    #[test]
    fn test_mask_negative() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "m.csv", "-1,2\n-3,4\n");
        let grid = load_grid(&path, LoadOptions::default().mask_negative(true)).unwrap();
        assert_eq!(grid.shape(), (2, 1));
        let unmasked = load_grid(&path, LoadOptions::default()).unwrap();
        assert_eq!(unmasked.shape(), (2, 2));
    }

    #[test]
    fn test_all_missing_is_data_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "m.csv", "a,b\nc,.\n");
        assert!(matches!(
            load_grid(&path, LoadOptions::default()),
            Err(MapError::Data(_))
        ));
    }

    #[test]
    fn test_missing_vs_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent Fe56_ppm matrix.xlsx");
        assert!(matches!(
            load_grid(&missing, LoadOptions::default()),
            Err(MapError::FileMissing { .. })
        ));

        let empty = write_file(dir.path(), "empty Fe56_ppm matrix.xlsx", "");
        assert!(matches!(
            load_grid(&empty, LoadOptions::default()),
            Err(MapError::FileUnreadable { .. })
        ));

        let corrupt = write_file(dir.path(), "bad Fe56_ppm matrix.xlsx", "not a zip archive");
        assert!(matches!(
            load_grid(&corrupt, LoadOptions::default()),
            Err(MapError::FileUnreadable { .. })
        ));
    }

    #[test]
    fn test_element_matrix_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "SampleB Mo98 matrix.csv", "1,2\n3,4\n");
        let m = load_element_matrix(&path, LoadOptions::default()).unwrap();
        assert_eq!(m.sample(), "SampleB");
        assert_eq!(m.element(), "Mo98");
        assert_eq!(m.unit(), UnitKind::Raw);

        let other = write_file(dir.path(), "Liver Zn66_CPS export.csv", "1\n");
        let m = load_element_matrix(&other, LoadOptions::default()).unwrap();
        assert_eq!(m.sample(), "Liver");
        assert_eq!(m.element(), "Zn66");
        assert_eq!(m.unit(), UnitKind::Cps);
    }
}
