//! Adapters behind the application ports: file-backed checkpoints, the
//! in-memory ledger/rule/history stores, and the two classifier backends
//! (offline stub and OpenAI-style HTTP).

pub mod checkpoints;
pub mod http_classifier;
pub mod memory;
pub mod stub;

use crate::app::ports::ClassifierPort;
use crate::common::error::Result;
use crate::config::{ClassifierProvider, ExternalConfig};
use std::sync::Arc;

/// Build the configured classifier backend.
pub fn classifier_for(provider: ClassifierProvider, config: &ExternalConfig) -> Result<Arc<dyn ClassifierPort>> {
    match provider {
        ClassifierProvider::Stub => Ok(Arc::new(stub::StubClassifier::new())),
        ClassifierProvider::Http => Ok(Arc::new(http_classifier::HttpClassifier::new(config)?)),
    }
}
