use std::collections::HashMap;
use std::sync::Arc;

use crate::adaptor::Adaptor;

pub type AdaptorFactory = Arc<dyn Fn() -> Box<dyn Adaptor> + Send + Sync>;

/// Channel-type key to adaptor factory. Each request gets a fresh adaptor.
#[derive(Default, Clone)]
pub struct AdaptorRegistry {
    factories: HashMap<String, AdaptorFactory>,
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, channel_type: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Adaptor> + Send + Sync + 'static,
    {
        self.factories
            .insert(channel_type.into().to_ascii_lowercase(), Arc::new(factory));
    }

    pub fn create(&self, channel_type: &str) -> Option<Box<dyn Adaptor>> {
        self.factories
            .get(&channel_type.to_ascii_lowercase())
            .map(|factory| factory())
    }

    pub fn contains(&self, channel_type: &str) -> bool {
        self.factories
            .contains_key(&channel_type.to_ascii_lowercase())
    }

    pub fn channel_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}
