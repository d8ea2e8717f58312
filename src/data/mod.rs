pub mod filename;
pub mod loader;
pub mod matrix;
pub mod samples;
