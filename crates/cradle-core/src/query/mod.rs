pub mod cache;
pub mod compiler;
pub mod guards;
pub mod predicate;
pub mod search;
