use crate::resource::{PropertyBag, ResourceId};
use crate::{EngineError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// How a change to a property converges: rewrite the live resource, or
/// destroy and recreate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyPolicy {
    UpdateInPlace,
    RequiresReplacement,
}

/// Result of a successful create call.
#[derive(Debug, Clone)]
pub struct CreateResponse {
    pub physical_id: String,
    pub outputs: PropertyBag,
}

/// Capability set a resource type implements. This is the external
/// collaborator boundary: everything behind it is the real provisioning
/// API, and every failure crossing it is surfaced as a `Provider` error the
/// caller may retry. The engine never retries on its own.
pub trait Provider: Send + Sync {
    /// Resource type this provider serves.
    fn kind(&self) -> &str;

    /// Static per-property replacement policy table.
    fn replacement_policy(&self) -> &HashMap<String, PropertyPolicy>;

    fn create(&self, id: &ResourceId, props: &PropertyBag) -> Result<CreateResponse>;

    fn read(&self, physical_id: &str) -> Result<PropertyBag>;

    /// Only called for properties declared update-in-place. Returns the
    /// refreshed outputs.
    fn update(
        &self,
        physical_id: &str,
        old: &PropertyBag,
        new: &PropertyBag,
    ) -> Result<PropertyBag>;

    fn delete(&self, physical_id: &str) -> Result<()>;

    /// Policy for one property key. Undeclared keys default to in-place
    /// updates.
    fn policy(&self, key: &str) -> PropertyPolicy {
        self.replacement_policy()
            .get(key)
            .copied()
            .unwrap_or(PropertyPolicy::UpdateInPlace)
    }
}

pub fn provider_error(id: &ResourceId, message: impl Into<String>) -> EngineError {
    EngineError::Provider {
        identity: id.to_string(),
        message: message.into(),
    }
}

/// Maps resource types to their providers. A fallback provider may serve
/// types with no dedicated registration.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    fallback: Option<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.kind().to_string(), provider);
    }

    pub fn set_fallback(&mut self, provider: Arc<dyn Provider>) {
        self.fallback = Some(provider);
    }

    pub fn provider_for(&self, kind: &str) -> Result<&dyn Provider> {
        self.providers
            .get(kind)
            .or(self.fallback.as_ref())
            .map(Arc::as_ref)
            .ok_or_else(|| EngineError::UnsupportedType(kind.to_string()))
    }
}
