// Element-map composites for laser-ablation imaging exports.
//
// Matrices are loaded from workbook or text exports (`data`), scaled and
// laid out (`pipeline`), then painted as annotated composites, colour bars,
// histograms and RGB channel overlays (`render`).

pub mod config;
pub mod data;
pub mod error;
pub mod log;
pub mod pipeline;
pub mod render;
pub mod session;

pub use config::RenderSettings;
pub use error::{MapError, Result};
pub use session::ViewSession;
