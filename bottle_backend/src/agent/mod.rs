pub mod persona;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::database::{ConversationStore, PersonalityProfile, Sender, Turn};
use crate::error::{ChatError, ChatResult};
use crate::llm_client::{CompletionClient, CompletionRequest};
use persona::PersonalitySynthesizer;

/// Gating, windowing and sampling knobs for one engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Turns (user + assistant) required before a profile is synthesized
    pub synthesis_threshold: usize,
    /// Trailing turns included in each reply prompt
    pub context_window: usize,
    pub max_turn_chars: usize,
    pub request_timeout: Duration,
    pub synthesis_temperature: f32,
    pub synthesis_max_tokens: u32,
    pub reply_temperature: f32,
    pub reply_max_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            synthesis_threshold: 50,
            context_window: 5,
            max_turn_chars: 500,
            request_timeout: Duration::from_secs(30),
            synthesis_temperature: 0.7,
            synthesis_max_tokens: 500,
            reply_temperature: 0.8,
            reply_max_tokens: 150,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngagementState {
    /// No profile, below the threshold
    Locked,
    /// Threshold met but no profile yet (synthesis failed or not attempted)
    ReadyToSynthesize,
    /// Profile present; every user turn gets a reply attempt
    Active,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Engagement {
    pub state: EngagementState,
    pub count: usize,
    pub threshold: usize,
}

/// Result of one `submit_user_turn` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    /// The user turn, followed by the assistant turn when one was produced
    pub added: Vec<Turn>,
    pub engagement: Engagement,
    /// Recovered service/synthesis failure, if any
    pub advisory: Option<ChatError>,
}

/// Orchestrates gating, one-shot synthesis and windowed replies over a single
/// conversation store.
///
/// All durable state lives in the store. Mutating calls are serialized on the
/// store, so engines sharing one store never interleave; reads go straight to
/// the store and never wait on an in-flight completion.
pub struct ChatEngine {
    store: Arc<ConversationStore>,
    client: Arc<dyn CompletionClient>,
    synthesizer: PersonalitySynthesizer,
    config: EngineConfig,
}

impl ChatEngine {
    pub fn new(
        store: Arc<ConversationStore>,
        client: Arc<dyn CompletionClient>,
        config: EngineConfig,
    ) -> Self {
        let synthesizer = PersonalitySynthesizer::new(
            client.clone(),
            config.synthesis_temperature,
            config.synthesis_max_tokens,
        );
        Self {
            store,
            client,
            synthesizer,
            config,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Record a user turn and, depending on the gating state, synthesize a
    /// profile and/or generate one assistant reply.
    ///
    /// Validation and storage failures are returned as `Err`. Completion
    /// failures leave the user turn recorded and come back as
    /// `SubmitOutcome::advisory`.
    pub async fn submit_user_turn(&self, text: &str) -> ChatResult<SubmitOutcome> {
        let _guard = self.store.lock_submissions().await;

        // the reply window is the turns before this one
        let window = self.store.recent(self.config.context_window)?;
        let user_turn = self.store.append(Turn::new(Sender::User, text.trim()))?;
        let mut added = vec![user_turn.clone()];
        let mut advisory = None;

        let mut profile = self.store.profile()?;
        if profile.is_none() {
            let count = self.store.count()?;
            if count >= self.config.synthesis_threshold {
                tracing::debug!(
                    "Store '{}' reached {}/{} turns, synthesizing personality",
                    self.store.store_id(),
                    count,
                    self.config.synthesis_threshold
                );
                match self.synthesize_profile().await {
                    Ok(synthesized) => profile = Some(synthesized),
                    Err(e) if e.is_advisory() => {
                        tracing::warn!(
                            "Personality synthesis failed for '{}': {}",
                            self.store.store_id(),
                            e
                        );
                        advisory = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            } else {
                tracing::debug!(
                    "Store '{}' locked at {}/{} turns",
                    self.store.store_id(),
                    count,
                    self.config.synthesis_threshold
                );
            }
        }

        if let Some(profile) = profile {
            match self.generate_reply(&profile, &window, &user_turn.text).await {
                Ok(reply) => added.push(reply),
                Err(e) if e.is_advisory() => {
                    tracing::warn!(
                        "Reply generation failed for '{}': {}",
                        self.store.store_id(),
                        e
                    );
                    advisory = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(SubmitOutcome {
            added,
            engagement: self.engagement()?,
            advisory,
        })
    }

    async fn synthesize_profile(&self) -> ChatResult<PersonalityProfile> {
        let transcript = self.store.all()?;
        let profile = with_timeout(
            self.config.request_timeout,
            self.synthesizer.synthesize(&transcript),
        )
        .await
        .map_err(|e| match e {
            ChatError::Service(message) => ChatError::Synthesis(message),
            other => other,
        })?;

        self.store.set_profile(profile.clone())?;
        tracing::info!(
            "Personality synthesized for '{}' from {} turns",
            self.store.store_id(),
            profile.source_turn_count
        );
        Ok(profile)
    }

    async fn generate_reply(
        &self,
        profile: &PersonalityProfile,
        window: &[Turn],
        last_message: &str,
    ) -> ChatResult<Turn> {
        let request = self.build_reply_request(profile, window, last_message);
        let reply =
            with_timeout(self.config.request_timeout, self.client.complete(request)).await?;

        let reply = reply.trim();
        if reply.is_empty() {
            return Err(ChatError::service("completion returned an empty reply"));
        }
        let reply = clip_chars(reply, self.store.max_turn_chars());

        self.store.append(Turn::new(Sender::Assistant, reply))
    }

    fn build_reply_request(
        &self,
        profile: &PersonalityProfile,
        window: &[Turn],
        last_message: &str,
    ) -> CompletionRequest {
        let context = window
            .iter()
            .map(|turn| turn.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        CompletionRequest {
            system_instruction: format!(
                "You are an AI with the following personality: {}\n\
                 Respond in a way that matches this personality and maintains conversation context.",
                profile.text
            ),
            user_content: format!("Context: {}\nLast message: {}", context, last_message),
            temperature: self.config.reply_temperature,
            max_output_tokens: self.config.reply_max_tokens,
        }
    }

    pub fn transcript(&self) -> ChatResult<Vec<Turn>> {
        self.store.all()
    }

    pub fn profile(&self) -> ChatResult<Option<PersonalityProfile>> {
        self.store.profile()
    }

    pub fn engagement(&self) -> ChatResult<Engagement> {
        let count = self.store.count()?;
        let threshold = self.config.synthesis_threshold;
        let state = if self.store.profile()?.is_some() {
            EngagementState::Active
        } else if count >= threshold {
            EngagementState::ReadyToSynthesize
        } else {
            EngagementState::Locked
        };
        Ok(Engagement {
            state,
            count,
            threshold,
        })
    }

    /// Clear transcript and profile; the engine starts over as Locked.
    pub async fn reset(&self) -> ChatResult<()> {
        let _guard = self.store.lock_submissions().await;
        self.store.clear()
    }
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> ChatResult<T>
where
    F: Future<Output = ChatResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ChatError::service(format!(
            "completion timed out after {:?}",
            limit
        ))),
    }
}

fn clip_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}
