//! Template catalog seam. The catalog is the authority on which sandbox
//! templates exist; submissions against unknown templates fail before
//! anything is persisted.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use warden_model::{Template, TemplateId};

use crate::error::{Result, WardenError};

#[async_trait]
pub trait TemplateCatalog: Send + Sync {
    async fn get(&self, id: &TemplateId) -> Result<Template>;
}

#[derive(Debug, Default)]
pub struct InMemoryTemplateCatalog {
    templates: RwLock<HashMap<TemplateId, Template>>,
}

impl InMemoryTemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, template: Template) {
        let mut templates = self.templates.write().await;
        templates.insert(template.id.clone(), template);
    }
}

#[async_trait]
impl TemplateCatalog for InMemoryTemplateCatalog {
    async fn get(&self, id: &TemplateId) -> Result<Template> {
        let templates = self.templates.read().await;
        templates
            .get(id)
            .cloned()
            .ok_or_else(|| WardenError::TemplateNotFound(id.clone()))
    }
}
