mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec};
pub use selectors::{ModelSelection, ModelSelector};

/// Capability every analysis model must carry.
pub const VISION_CAPABILITY: &str = "vision";
