pub mod actions;
pub mod compiler;
pub mod dsl;
pub mod error;
pub mod runtime;
