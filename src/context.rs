use crate::config::Config;
use crate::connectors::Connectors;
use crate::publish::GitPublisher;
use crate::secrets::SecretEngine;

/// Everything the engine needs, built once at startup and read-only
/// thereafter. Connectors are selected here by configuration; nothing
/// downstream makes wiring decisions.
pub struct Context {
    pub config: Config,
    pub secrets: SecretEngine,
    pub connectors: Connectors,
    pub publisher: GitPublisher,
}

impl Context {
    pub fn new(
        config: Config,
        secrets: SecretEngine,
        connectors: Connectors,
        publisher: GitPublisher,
    ) -> Self {
        Self {
            config,
            secrets,
            connectors,
            publisher,
        }
    }
}
