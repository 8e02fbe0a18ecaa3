pub mod core;
pub mod expander;
pub mod loader;
