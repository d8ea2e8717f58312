pub mod batch;
pub mod composite_matrix;
pub mod expression;
pub mod layout;
pub mod map_ops;
pub mod normalize;
pub mod stats;
