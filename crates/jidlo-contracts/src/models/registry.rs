use indexmap::IndexMap;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub context_window: Option<u64>,
    /// Upper bound accepted by the API for `max_tokens`.
    pub max_output_tokens: u32,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }

    /// Clamps a requested output budget into `1..=max_output_tokens`.
    pub fn clamp_output_tokens(&self, requested: u32) -> u32 {
        requested.clamp(1, self.max_output_tokens.max(1))
    }
}

/// Insertion order matters: the first model with a capability is its default.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert =
        |name: &str, capabilities: &[&str], context_window: Option<u64>, max_output: u32| {
            map.insert(
                name.to_string(),
                ModelSpec {
                    name: name.to_string(),
                    provider: "anthropic".to_string(),
                    capabilities: capabilities
                        .iter()
                        .map(|item| (*item).to_string())
                        .collect(),
                    context_window,
                    max_output_tokens: max_output,
                },
            );
        };

    insert(
        "claude-3-5-sonnet-20241022",
        &["text", "vision"],
        Some(200_000),
        8192,
    );
    insert(
        "claude-3-5-sonnet-20240620",
        &["text", "vision"],
        Some(200_000),
        8192,
    );
    insert(
        "claude-sonnet-4-20250514",
        &["text", "vision"],
        Some(200_000),
        64_000,
    );
    insert(
        "claude-opus-4-20250514",
        &["text", "vision"],
        Some(200_000),
        32_000,
    );
    insert(
        "claude-3-opus-20240229",
        &["text", "vision"],
        Some(200_000),
        4096,
    );
    insert(
        "claude-3-sonnet-20240229",
        &["text", "vision"],
        Some(200_000),
        4096,
    );
    insert(
        "claude-3-haiku-20240307",
        &["text", "vision"],
        Some(200_000),
        4096,
    );
    insert("claude-3-5-haiku-20241022", &["text"], Some(200_000), 8192);

    map
}
