use crate::loader::ProviderConfig;
use crate::provider::{CreateResponse, PropertyPolicy, Provider, provider_error};
use crate::resource::{PropertyBag, ResourceId, fingerprint};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Filesystem-backed provider: every resource materializes as one JSON
/// document under `<root>/<physical-id>.json`. Useful for local workflows
/// and as the reference adapter implementation.
pub struct LocalProvider {
    kind: String,
    root: PathBuf,
    policy: HashMap<String, PropertyPolicy>,
}

#[derive(Serialize, Deserialize)]
struct Document {
    identity: String,
    properties: PropertyBag,
}

impl LocalProvider {
    pub fn new(kind: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            kind: kind.into(),
            root: root.into(),
            policy: HashMap::new(),
        }
    }

    pub fn from_config(kind: &str, root: impl Into<PathBuf>, config: &ProviderConfig) -> Self {
        let mut provider = Self::new(kind, root);
        for key in &config.replace_on {
            provider = provider.replace_on(key);
        }
        provider
    }

    pub fn replace_on(mut self, key: &str) -> Self {
        self.policy
            .insert(key.to_string(), PropertyPolicy::RequiresReplacement);
        self
    }

    fn document_path(&self, physical_id: &str) -> PathBuf {
        self.root.join(format!("{physical_id}.json"))
    }

    /// Physical ids encode the logical name plus a content digest, so a
    /// replacement gets a fresh id while the dependents still update.
    fn mint_physical_id(id: &ResourceId, props: &PropertyBag) -> String {
        format!("{}-{}-{}", id.kind, id.name, &fingerprint(props)[..8])
    }

    fn write_document(&self, physical_id: &str, identity: &str, props: &PropertyBag) -> Result<PathBuf> {
        let path = self.document_path(physical_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let doc = Document {
            identity: identity.to_string(),
            properties: props.clone(),
        };
        let text = serde_json::to_string_pretty(&doc)
            .map_err(|e| EngineError::Parse(format!("serialize document: {e}")))?;
        fs::write(&path, text)?;
        Ok(path)
    }

    fn outputs_for(props: &PropertyBag, path: &Path) -> PropertyBag {
        // Resolved properties double as outputs, plus the document location.
        let mut outputs = props.clone();
        outputs.insert("path".to_string(), Value::String(path.display().to_string()));
        outputs
    }
}

impl Provider for LocalProvider {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn replacement_policy(&self) -> &HashMap<String, PropertyPolicy> {
        &self.policy
    }

    fn create(&self, id: &ResourceId, props: &PropertyBag) -> Result<CreateResponse> {
        let physical_id = Self::mint_physical_id(id, props);
        let path = self
            .write_document(&physical_id, &id.to_string(), props)
            .map_err(|e| provider_error(id, e.to_string()))?;
        tracing::debug!(identity = %id, physical_id, "materialized document");
        Ok(CreateResponse {
            physical_id,
            outputs: Self::outputs_for(props, &path),
        })
    }

    fn read(&self, physical_id: &str) -> Result<PropertyBag> {
        let path = self.document_path(physical_id);
        let text = fs::read_to_string(&path)?;
        let doc: Document = serde_json::from_str(&text)
            .map_err(|e| EngineError::Parse(format!("corrupt document {}: {e}", path.display())))?;
        Ok(doc.properties)
    }

    fn update(
        &self,
        physical_id: &str,
        _old: &PropertyBag,
        new: &PropertyBag,
    ) -> Result<PropertyBag> {
        let path = self.document_path(physical_id);
        if !path.exists() {
            return Err(EngineError::Parse(format!(
                "document {physical_id} does not exist"
            )));
        }
        let text = fs::read_to_string(&path)?;
        let doc: Document = serde_json::from_str(&text)
            .map_err(|e| EngineError::Parse(format!("corrupt document {}: {e}", path.display())))?;
        let path = self.write_document(physical_id, &doc.identity, new)?;
        tracing::debug!(physical_id, "rewrote document");
        Ok(Self::outputs_for(new, &path))
    }

    fn delete(&self, physical_id: &str) -> Result<()> {
        let path = self.document_path(physical_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(physical_id, "removed document");
                Ok(())
            }
            // Already gone: deletion is idempotent.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
