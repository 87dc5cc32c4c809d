pub mod aliases;
pub mod children;
pub mod maintenance;
