pub mod composite;
pub mod histogram;
pub mod mixer;
pub mod palette;
pub mod text;
