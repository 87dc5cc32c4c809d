pub mod lease;
pub mod policy;
pub mod queue;
pub mod runner;
