/// Metadata extraction from instrument-exported matrix file names
///
/// Two layouts are recognised:
/// - `{sample}[ _]{element}_{ppm|CPS} matrix.{ext}` (explicit unit)
/// - `{sample} {element} matrix.{ext}` (raw counts, unit `raw`)
///
/// Element tokens are 1–2 letters followed by 1–3 digits (`Fe56`) or a
/// summed channel `Total<Name>` (`TotalMo`). Both patterns are anchored at
/// the end of the name and the sample capture is greedy, so the element is
/// always the last token before the unit suffix.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use crate::data::loader::{DELIMITED_EXTENSIONS, WORKBOOK_EXTENSIONS};
use crate::data::matrix::{MatrixMeta, UnitKind};

const ELEMENT_PATTERN: &str = r"Total[A-Za-z]+|[A-Za-z]{1,2}\d{1,3}";

/// Every extension the loader can read, case-insensitive.
fn extension_pattern() -> String {
    let all: Vec<&str> = WORKBOOK_EXTENSIONS.iter().chain(DELIMITED_EXTENSIONS).copied().collect();
    format!("(?i:{})", all.join("|"))
}

fn explicit_unit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"^(?P<sample>.+)[ _](?P<element>{})_(?P<unit>ppm|CPS) matrix\.{}$",
            ELEMENT_PATTERN,
            extension_pattern()
        ))
        .expect("explicit-unit filename pattern is valid")
    })
}

fn raw_unit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"^(?P<sample>.+) (?P<element>{}) matrix\.{}$",
            ELEMENT_PATTERN,
            extension_pattern()
        ))
        .expect("raw filename pattern is valid")
    })
}

/// Parse a file name (a full path is accepted; only the final component is
/// looked at). Returns `None` for names that fit neither layout.
pub fn parse_matrix_filename(name: &str) -> Option<MatrixMeta> {
    let base = Path::new(name)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());

    if let Some(caps) = explicit_unit_re().captures(&base) {
        let unit = caps["unit"].parse::<UnitKind>().ok()?;
        return Some(MatrixMeta::new(&caps["sample"], &caps["element"], unit));
    }

    if let Some(caps) = raw_unit_re().captures(&base) {
        return Some(MatrixMeta::new(
            &caps["sample"],
            &caps["element"],
            UnitKind::Raw,
        ));
    }

    None
}

/// Whether `token` is a valid element token on its own.
pub fn is_element_token(token: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!("^(?:{})$", ELEMENT_PATTERN)).expect("element pattern is valid")
    })
    .is_match(token)
}

/// Canonical file name for a sample/element/unit triple.
pub fn matrix_filename(meta: &MatrixMeta, ext: &str) -> String {
    match meta.unit {
        UnitKind::Raw => format!("{} {} matrix.{}", meta.sample, meta.element, ext),
        unit => format!("{} {}_{} matrix.{}", meta.sample, meta.element, unit, ext),
    }
}
