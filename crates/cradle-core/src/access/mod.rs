pub mod evaluation;
pub mod model;
pub mod vector;
