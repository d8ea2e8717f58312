/// Per-sample side tables (pixel sizes, display aliases) and input folder
/// scanning.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::data::filename::parse_matrix_filename;
use crate::data::matrix::{MatrixMeta, UnitKind};
use crate::error::{MapError, Result};

/// File name used for the alias table inside an output folder.
pub const ALIASES_FILE: &str = "sample_aliases.csv";

/// Split a small comma-separated table into a header and records.
pub(crate) fn read_csv_records(text: &str) -> (Vec<String>, Vec<Vec<String>>) {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().map(split_csv_line).unwrap_or_default();
    let records = lines.map(split_csv_line).collect();
    (header, records)
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(ch),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

pub(crate) fn column_index(header: &[String], name: &str) -> Option<usize> {
    header.iter().position(|h| h.eq_ignore_ascii_case(name))
}

/// Quote a CSV field when it contains a delimiter or quote.
pub(crate) fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

// ── Pixel sizes ────────────────────────────────────────────────────

/// Physical pixel size (µm per matrix cell), globally or per sample
#[derive(Debug, Clone)]
pub struct PixelSizes {
    pub default_um: f64,
    custom: Option<BTreeMap<String, f64>>,
}

impl PixelSizes {
    pub fn uniform(default_um: f64) -> Self {
        Self {
            default_um,
            custom: None,
        }
    }

    /// Read a `Sample,Pixel Size` table.
    pub fn load_csv(path: &Path, default_um: f64) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MapError::FileMissing {
                path: path.to_path_buf(),
            },
            _ => MapError::Io(e),
        })?;
        let (header, records) = read_csv_records(&text);
        let (Some(si), Some(pi)) = (
            column_index(&header, "Sample"),
            column_index(&header, "Pixel Size"),
        ) else {
            return Err(MapError::config(format!(
                "{} needs 'Sample' and 'Pixel Size' columns",
                path.display()
            )));
        };

        let mut custom = BTreeMap::new();
        for rec in records {
            let (Some(sample), Some(size)) = (rec.get(si), rec.get(pi)) else {
                continue;
            };
            match size.parse::<f64>() {
                Ok(v) => {
                    custom.insert(sample.clone(), v);
                }
                Err(_) => log::warn!("Ignoring pixel size '{}' for sample {}", size, sample),
            }
        }
        log::info!("Imported custom pixel sizes for {} samples", custom.len());
        Ok(Self {
            default_um,
            custom: Some(custom),
        })
    }

    /// Write a template table with the default size for every sample.
    pub fn write_template<'a>(
        path: &Path,
        samples: impl IntoIterator<Item = &'a str>,
        default_um: f64,
    ) -> Result<()> {
        let mut out = String::from("Sample,Pixel Size\n");
        for s in samples {
            out.push_str(&format!("{},{}\n", csv_field(s), default_um));
        }
        fs::write(path, out)?;
        Ok(())
    }

    pub fn is_custom(&self) -> bool {
        self.custom.is_some()
    }

    /// With a custom table only listed samples take part in a composite.
    pub fn includes(&self, sample: &str) -> bool {
        self.custom
            .as_ref()
            .map_or(true, |table| table.contains_key(sample))
    }

    pub fn for_sample(&self, sample: &str) -> f64 {
        self.custom
            .as_ref()
            .and_then(|table| table.get(sample).copied())
            .unwrap_or(self.default_um)
    }
}

// ── Aliases ────────────────────────────────────────────────────────

/// Display names that replace raw sample IDs in image labels
#[derive(Debug, Clone, Default)]
pub struct SampleAliases {
    map: BTreeMap<String, String>,
}

impl SampleAliases {
    pub fn path_in(output_dir: &Path) -> PathBuf {
        output_dir.join(ALIASES_FILE)
    }

    /// Load the alias table; a missing file yields an empty table.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let (header, records) = read_csv_records(&text);
        let mut aliases = Self::default();
        if let (Some(si), Some(ai)) = (
            column_index(&header, "Sample"),
            column_index(&header, "Alias"),
        ) {
            for rec in records {
                if let (Some(s), Some(a)) = (rec.get(si), rec.get(ai)) {
                    aliases.set(s, a);
                }
            }
        }
        Ok(aliases)
    }

    /// Persist the table; an empty table removes the file instead.
    pub fn save(&self, path: &Path) -> Result<()> {
        if self.map.is_empty() {
            if path.exists() {
                fs::remove_file(path)?;
            }
            return Ok(());
        }
        let mut out = String::from("Sample,Alias\n");
        for (s, a) in &self.map {
            out.push_str(&format!("{},{}\n", csv_field(s), csv_field(a)));
        }
        fs::write(path, out)?;
        Ok(())
    }

    /// Set or clear an alias. Blank aliases and aliases equal to the sample
    /// name clear the entry.
    pub fn set(&mut self, sample: &str, alias: &str) {
        let alias = alias.trim();
        if alias.is_empty() || alias == sample {
            self.map.remove(sample);
        } else {
            self.map.insert(sample.to_string(), alias.to_string());
        }
    }

    pub fn display_name<'a>(&'a self, sample: &'a str) -> &'a str {
        self.map.get(sample).map(String::as_str).unwrap_or(sample)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ── Folder scan ────────────────────────────────────────────────────

/// A matrix file whose name parsed
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub meta: MatrixMeta,
}

/// All files of one element in one unit
#[derive(Debug, Clone)]
pub struct ElementGroup {
    pub element: String,
    pub unit: UnitKind,
    pub files: Vec<ScannedFile>,
}

impl ElementGroup {
    /// e.g. `Fe56_ppm`; used for output folder and file names.
    pub fn key(&self) -> String {
        format!("{}_{}", self.element, self.unit)
    }
}

/// Outcome of scanning an input folder
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub matched: Vec<ScannedFile>,
    pub skipped: Vec<PathBuf>,
}

/// List every `* matrix.*` candidate in `dir` and parse its name.
///
/// Parsed and skipped names are both logged so an operator can spot files
/// whose sample/element split came out wrong.
pub fn scan_input_dir(dir: &Path) -> Result<ScanResult> {
    if !dir.is_dir() {
        return Err(MapError::FileMissing {
            path: dir.to_path_buf(),
        });
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut result = ScanResult::default();
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.starts_with('.') || name.starts_with("~$") {
            continue;
        }
        match parse_matrix_filename(&name) {
            Some(meta) => {
                log::info!(
                    "Parsed '{}' -> sample '{}', element {}, unit {}",
                    name,
                    meta.sample,
                    meta.element,
                    meta.unit
                );
                result.matched.push(ScannedFile { path, meta });
            }
            None => {
                log::warn!("Skipped '{}': name does not match a matrix pattern", name);
                result.skipped.push(path);
            }
        }
    }
    Ok(result)
}

impl ScanResult {
    pub fn samples(&self) -> BTreeSet<&str> {
        self.matched.iter().map(|f| f.meta.sample.as_str()).collect()
    }

    /// Files grouped by (element, unit): ppm groups first, then CPS, then raw.
    pub fn element_groups(&self) -> Vec<ElementGroup> {
        let mut groups: BTreeMap<(UnitKind, String), Vec<ScannedFile>> = BTreeMap::new();
        for f in &self.matched {
            groups
                .entry((f.meta.unit, f.meta.element.clone()))
                .or_default()
                .push(f.clone());
        }
        groups
            .into_iter()
            .map(|((unit, element), files)| ElementGroup {
                element,
                unit,
                files,
            })
            .collect()
    }

    /// The group for `element`; when `unit` is not given the element must
    /// exist in exactly one of ppm / CPS (raw is only used when neither does).
    pub fn group_for(&self, element: &str, unit: Option<UnitKind>) -> Result<ElementGroup> {
        let candidates: Vec<ElementGroup> = self
            .element_groups()
            .into_iter()
            .filter(|g| g.element == element)
            .collect();

        let chosen = match unit {
            Some(u) => candidates.into_iter().find(|g| g.unit == u),
            None => {
                let has = |u: UnitKind| candidates.iter().any(|g| g.unit == u);
                if has(UnitKind::Ppm) && has(UnitKind::Cps) {
                    return Err(MapError::config(format!(
                        "element {} has both ppm and CPS files; choose a unit",
                        element
                    )));
                }
                candidates.into_iter().next()
            }
        };
        chosen.ok_or_else(|| {
            MapError::data(format!(
                "no files for element {}{}",
                element,
                unit.map(|u| format!(" ({})", u)).unwrap_or_default()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "1,2\n3,4\n").unwrap();
    }

    #[test]
    fn test_scan_and_group() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "A Fe56_ppm matrix.csv");
        touch(dir.path(), "B Fe56_ppm matrix.csv");
        touch(dir.path(), "A Fe56 matrix.csv");
        touch(dir.path(), "A Cu63_CPS matrix.csv");
        touch(dir.path(), "notes.txt");

        let scan = scan_input_dir(dir.path()).unwrap();
        assert_eq!(scan.matched.len(), 4);
        assert_eq!(scan.skipped.len(), 1);

        let keys: Vec<String> = scan.element_groups().iter().map(|g| g.key()).collect();
        assert_eq!(keys, vec!["Fe56_ppm", "Cu63_CPS", "Fe56_raw"]);

        let fe = scan.group_for("Fe56", None).unwrap();
        assert_eq!(fe.unit, UnitKind::Ppm);
        assert_eq!(fe.files.len(), 2);

        let raw = scan.group_for("Fe56", Some(UnitKind::Raw)).unwrap();
        assert_eq!(raw.files.len(), 1);
        assert!(scan.group_for("Zn66", None).is_err());
    }

    #[test]
    fn test_mixed_units_need_explicit_choice() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "A Fe56_ppm matrix.csv");
        touch(dir.path(), "B Fe56_CPS matrix.csv");
        let scan = scan_input_dir(dir.path()).unwrap();
        assert!(matches!(scan.group_for("Fe56", None), Err(MapError::Config(_))));
        assert_eq!(scan.group_for("Fe56", Some(UnitKind::Cps)).unwrap().files.len(), 1);
    }

    #[test]
    fn test_pixel_size_table_and_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("px.csv");
        PixelSizes::write_template(&path, ["S1", "S2"], 6.0).unwrap();
        fs::write(&path, "Sample,Pixel Size\nS1,6\nS2,10\nS3,oops\n").unwrap();

        let sizes = PixelSizes::load_csv(&path, 5.0).unwrap();
        assert!(sizes.is_custom());
        assert_eq!(sizes.for_sample("S2"), 10.0);
        assert_eq!(sizes.for_sample("S9"), 5.0);
        assert!(sizes.includes("S1"));
        assert!(!sizes.includes("S3"));
        assert!(PixelSizes::uniform(4.0).includes("anything"));
    }

    #[test]
    fn test_template_lists_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.csv");
        PixelSizes::write_template(&path, ["Liver, left", "Kidney"], 6.0).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Sample,Pixel Size\n"));
        assert!(text.contains("\"Liver, left\",6"));

        let sizes = PixelSizes::load_csv(&path, 1.0).unwrap();
        assert_eq!(sizes.for_sample("Liver, left"), 6.0);
        assert_eq!(sizes.for_sample("Kidney"), 6.0);
    }

    #[test]
    fn test_aliases_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = SampleAliases::path_in(dir.path());
        let mut aliases = SampleAliases::load(&path).unwrap();
        assert!(aliases.is_empty());

        aliases.set("S1", "Control");
        aliases.set("S2", "S2");
        aliases.save(&path).unwrap();

        let loaded = SampleAliases::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.display_name("S1"), "Control");
        assert_eq!(loaded.display_name("S2"), "S2");

        let empty = SampleAliases::default();
        empty.save(&path).unwrap();
        assert!(!path.exists());
    }
}
