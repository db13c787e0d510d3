//! Engine configuration.
//!
//! - `engine` - [`EngineConfig`] and its `FIXTURES_*` environment overlay
//! - `duration` - human-readable duration parsing shared by env and serde loading

mod duration;
mod engine;

pub use duration::*;
pub use engine::*;
