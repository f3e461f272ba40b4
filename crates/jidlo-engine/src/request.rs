use jidlo_contracts::prompts::PromptTemplate;
use serde_json::{json, Value};

use crate::config::AnalyzerConfig;
use crate::normalize::NormalizedImage;

/// One analysis call: the fixed instruction plus the canonical image.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    model: String,
    max_tokens: u32,
    prompt: &'static PromptTemplate,
    image: NormalizedImage,
}

pub fn build_request(config: &AnalyzerConfig, image: NormalizedImage) -> AnalysisRequest {
    AnalysisRequest {
        model: config.model.name.clone(),
        max_tokens: config.max_tokens,
        prompt: config.prompt,
        image,
    }
}

impl AnalysisRequest {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn prompt(&self) -> &'static PromptTemplate {
        self.prompt
    }

    pub fn image(&self) -> &NormalizedImage {
        &self.image
    }

    /// Messages API body. The image media type comes from the normalized
    /// image itself, never from the upload.
    pub fn to_body(&self) -> Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "text",
                        "text": self.prompt.text,
                    },
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": self.image.media_type(),
                            "data": self.image.to_base64(),
                        }
                    }
                ]
            }]
        })
    }
}
