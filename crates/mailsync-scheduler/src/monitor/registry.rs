//! Lookup table from provider tag to monitor factory.

use std::collections::HashMap;
use std::sync::Arc;

use super::MonitorFactory;
use crate::account::Account;

/// Provider tag of the fallback mail backend.
pub const GENERIC_PROVIDER: &str = "generic";

/// Monitor factories known to this process.
///
/// Mail monitors are chosen per provider with a generic fallback. Events have
/// a polling variant and, optionally, a push variant.
#[derive(Clone)]
pub struct MonitorRegistry {
    email: HashMap<String, Arc<dyn MonitorFactory>>,
    generic_email: Arc<dyn MonitorFactory>,
    contacts: Arc<dyn MonitorFactory>,
    events: Arc<dyn MonitorFactory>,
    push_events: Option<Arc<dyn MonitorFactory>>,
}

impl MonitorRegistry {
    /// Creates a registry with the generic mail backend and the contacts and
    /// polling events factories.
    pub fn new(
        generic_email: Arc<dyn MonitorFactory>,
        contacts: Arc<dyn MonitorFactory>,
        events: Arc<dyn MonitorFactory>,
    ) -> Self {
        Self {
            email: HashMap::new(),
            generic_email,
            contacts,
            events,
            push_events: None,
        }
    }

    /// Uses one factory for every kind and provider.
    pub fn uniform(factory: Arc<dyn MonitorFactory>) -> Self {
        Self::new(factory.clone(), factory.clone(), factory)
    }

    /// Registers a provider-specific mail backend.
    #[must_use]
    pub fn with_email_backend(
        mut self,
        provider: impl Into<String>,
        factory: Arc<dyn MonitorFactory>,
    ) -> Self {
        self.email.insert(provider.into(), factory);
        self
    }

    /// Registers the push-capable events variant.
    #[must_use]
    pub fn with_push_events(mut self, factory: Arc<dyn MonitorFactory>) -> Self {
        self.push_events = Some(factory);
        self
    }

    /// Mail factory for a provider, falling back to the generic backend.
    pub fn email_factory(&self, provider: &str) -> &Arc<dyn MonitorFactory> {
        self.email.get(provider).unwrap_or(&self.generic_email)
    }

    pub fn contacts_factory(&self) -> &Arc<dyn MonitorFactory> {
        &self.contacts
    }

    /// Events factory for an account.
    ///
    /// The push variant is used only when the feature is on, the provider
    /// supports push delivery and a push factory is registered.
    pub fn events_factory(&self, account: &Account, push_enabled: bool) -> &Arc<dyn MonitorFactory> {
        match &self.push_events {
            Some(push) if push_enabled && account.provider_info.push_events => push,
            _ => &self.events,
        }
    }

    /// Provider tags with a dedicated mail backend, plus the generic one.
    pub fn providers(&self) -> Vec<&str> {
        let mut providers: Vec<&str> = self.email.keys().map(String::as_str).collect();
        providers.push(GENERIC_PROVIDER);
        providers.sort_unstable();
        providers
    }
}

impl std::fmt::Debug for MonitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorRegistry")
            .field("providers", &self.providers())
            .field("push_events", &self.push_events.is_some())
            .finish_non_exhaustive()
    }
}
