use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::agent::{ChatEngine, EngineConfig};
use crate::config::BottleConfig;
use crate::database::ConversationStore;
use crate::error::{ChatError, ChatResult};
use crate::http_client::build_http_client_with_timeout;
use crate::llm_client::{CompletionClient, LlmClient};

const MAX_STORE_ID_LEN: usize = 64;

/// Lazily opened chat engines, one per store identity.
///
/// Engines share the completion client and the database file but no mutable
/// state, so different identities proceed in parallel.
pub struct EngineRegistry {
    database_path: PathBuf,
    client: Arc<dyn CompletionClient>,
    config: EngineConfig,
    engines: Mutex<HashMap<String, Arc<ChatEngine>>>,
}

impl EngineRegistry {
    pub fn new(
        database_path: impl Into<PathBuf>,
        client: Arc<dyn CompletionClient>,
        config: EngineConfig,
    ) -> Self {
        Self {
            database_path: database_path.into(),
            client,
            config,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Engine for `store_id`, opening its store on first use.
    pub async fn engine(&self, store_id: &str) -> ChatResult<Arc<ChatEngine>> {
        validate_store_id(store_id)?;

        let mut engines = self.engines.lock().await;
        if let Some(engine) = engines.get(store_id) {
            return Ok(engine.clone());
        }

        let store = ConversationStore::open(
            &self.database_path,
            store_id,
            self.config.max_turn_chars,
        )?;
        let engine = Arc::new(ChatEngine::new(
            Arc::new(store),
            self.client.clone(),
            self.config.clone(),
        ));
        engines.insert(store_id.to_string(), engine.clone());
        Ok(engine)
    }

    pub async fn open_count(&self) -> usize {
        self.engines.lock().await.len()
    }
}

fn validate_store_id(store_id: &str) -> ChatResult<()> {
    if store_id.is_empty() || store_id.len() > MAX_STORE_ID_LEN {
        return Err(ChatError::validation(format!(
            "store id must be 1-{} characters",
            MAX_STORE_ID_LEN
        )));
    }
    if !store_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ChatError::validation(
            "store id may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

pub struct BackendRuntime {
    pub config: BottleConfig,
    pub engines: Arc<EngineRegistry>,
}

impl BackendRuntime {
    pub fn bootstrap(config: BottleConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let http = build_http_client_with_timeout(Some(config.request_timeout()))?;
        let client = LlmClient::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
            http,
        );
        if config.llm_api_key.is_none() {
            tracing::info!("LLM_API_KEY not set; completion requests are sent unauthenticated");
        }
        tracing::info!(
            "Completion endpoint {} (model {})",
            config.llm_api_url,
            client.model()
        );

        Ok(Self::with_client(config, Arc::new(client)))
    }

    /// Build a runtime around an arbitrary completion client.
    pub fn with_client(config: BottleConfig, client: Arc<dyn CompletionClient>) -> Self {
        let engines = Arc::new(EngineRegistry::new(
            config.database_path.clone(),
            client,
            config.engine_config(),
        ));
        Self { config, engines }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::CompletionRequest;
    use async_trait::async_trait;

    struct EchoClient;

    #[async_trait]
    impl CompletionClient for EchoClient {
        async fn complete(&self, request: CompletionRequest) -> ChatResult<String> {
            Ok(request.user_content)
        }
    }

    fn registry(dir: &tempfile::TempDir) -> EngineRegistry {
        EngineRegistry::new(
            dir.path().join("registry.db"),
            Arc::new(EchoClient),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn same_id_returns_same_engine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(&dir);

        let a = registry.engine("alice").await.unwrap();
        let again = registry.engine("alice").await.unwrap();
        let b = registry.engine("bob").await.unwrap();

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.open_count().await, 2);
    }

    #[tokio::test]
    async fn engines_for_different_ids_do_not_share_turns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(&dir);

        let alice = registry.engine("alice").await.unwrap();
        let bob = registry.engine("bob").await.unwrap();
        alice.submit_user_turn("only alice sees this").await.unwrap();

        assert_eq!(alice.transcript().unwrap().len(), 1);
        assert!(bob.transcript().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_bad_store_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry(&dir);

        let too_long = "x".repeat(65);
        for bad in ["", "../etc", "has space", too_long.as_str()] {
            assert!(matches!(
                registry.engine(bad).await,
                Err(ChatError::Validation(_))
            ));
        }
        assert_eq!(registry.open_count().await, 0);
    }

    #[test]
    fn with_client_uses_configured_gating() {
        let config = BottleConfig {
            synthesis_threshold: 7,
            ..BottleConfig::default()
        };
        let runtime = BackendRuntime::with_client(config, Arc::new(EchoClient));
        assert_eq!(runtime.engines.config.synthesis_threshold, 7);
    }
}
