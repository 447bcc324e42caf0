//! Engine configuration structures.

pub mod engine;

pub use engine::{CacheType, EngineSetting};
