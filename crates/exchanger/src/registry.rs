use crate::bitloga::BitlogaAdapter;
use crate::greengo::GreengoAdapter;
use crate::luckypay::LuckyPayAdapter;
use crate::mock::TestAdapter;
use crate::racs::RacsAdapter;
use crate::{bitloga, greengo, luckypay, mock, racs, AdapterContext, ProviderAdapter};
use payrouter_core::ExchangerConfig;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds an adapter for one configured exchanger.
pub type AdapterFactory =
    Arc<dyn Fn(&ExchangerConfig, &AdapterContext) -> Arc<dyn ProviderAdapter> + Send + Sync>;

/// Provider name to adapter factory. Names are matched exactly.
#[derive(Clone)]
pub struct AdapterRegistry {
    ctx: AdapterContext,
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new(ctx: AdapterContext) -> Self {
        Self {
            ctx,
            factories: HashMap::new(),
        }
    }

    /// Registry with every backend shipped in this crate.
    pub fn with_builtin(ctx: AdapterContext) -> Self {
        let mut registry = Self::new(ctx);
        registry.register(bitloga::NAME, |cfg, ctx| {
            Arc::new(BitlogaAdapter::new(cfg.clone(), ctx.clone()))
        });
        registry.register(greengo::NAME, |cfg, ctx| {
            Arc::new(GreengoAdapter::new(cfg.clone(), ctx.clone()))
        });
        registry.register(luckypay::NAME, |cfg, ctx| {
            Arc::new(LuckyPayAdapter::new(cfg.clone(), ctx.clone()))
        });
        registry.register(racs::NAME, |cfg, ctx| {
            Arc::new(RacsAdapter::new(cfg.clone(), ctx.clone()))
        });
        registry.register(mock::NAME, |_, ctx| Arc::new(TestAdapter::new(ctx.clone())));
        registry
    }

    /// Adds or replaces the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ExchangerConfig, &AdapterContext) -> Arc<dyn ProviderAdapter> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn resolve(&self, config: &ExchangerConfig) -> Option<Arc<dyn ProviderAdapter>> {
        self.factories
            .get(&config.name)
            .map(|factory| factory(config, &self.ctx))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
