use std::sync::Arc;

use rdp_providers::ProviderFactory;

pub struct ProviderManager;

impl ProviderManager {
    /// Factory for a provider compiled into this binary, or None.
    pub fn get_factory(provider_name: &str) -> Option<Arc<dyn ProviderFactory>> {
        match provider_name.to_ascii_lowercase().as_str() {
            #[cfg(feature = "provider-mock")]
            "mock" => Some(Arc::new(rdp_providers::mock::MockCloud::new())),
            _ => None,
        }
    }
}
