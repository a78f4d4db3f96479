use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::TemplateId;
use crate::request::ResourceSpec;

/// Base image + kernel + resource defaults + warmup command, identified
/// by ID. The catalog is the authority on which templates exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub image: String,
    pub kernel: String,
    pub default_resources: ResourceSpec,
    #[serde(default)]
    pub warmup_command: Vec<String>,
}

impl Template {
    pub fn new(id: TemplateId, image: impl Into<String>) -> Self {
        Self {
            id,
            image: image.into(),
            kernel: "vmlinux-default".to_string(),
            default_resources: ResourceSpec::new(500, 256, Duration::from_secs(60)),
            warmup_command: Vec::new(),
        }
    }
}
