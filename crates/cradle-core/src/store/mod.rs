pub mod database;
pub mod records;
pub mod schema;
