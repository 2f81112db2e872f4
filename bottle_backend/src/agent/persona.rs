// Personality synthesis
//
// Once the transcript crosses the gating threshold, the whole history is handed
// to the completion service in a single call. Whatever text comes back is the
// profile; nothing downstream parses it.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::database::{PersonalityProfile, Sender, Turn};
use crate::error::{ChatError, ChatResult};
use crate::llm_client::{CompletionClient, CompletionRequest};

const SYNTHESIS_INSTRUCTION: &str = "Analyze the following chat history and create a \
personality profile. Include traits, speaking style, and common phrases.";

#[derive(Serialize)]
struct TranscriptEntry<'a> {
    sender: Sender,
    text: &'a str,
    created_at: String,
}

pub struct PersonalitySynthesizer {
    client: Arc<dyn CompletionClient>,
    temperature: f32,
    max_output_tokens: u32,
}

impl PersonalitySynthesizer {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        temperature: f32,
        max_output_tokens: u32,
    ) -> Self {
        Self {
            client,
            temperature,
            max_output_tokens,
        }
    }

    /// Build a profile from the full transcript with exactly one completion call.
    ///
    /// Any failure, including an empty reply, is reported as `ChatError::Synthesis`.
    pub async fn synthesize(&self, transcript: &[Turn]) -> ChatResult<PersonalityProfile> {
        let request = CompletionRequest {
            system_instruction: SYNTHESIS_INSTRUCTION.to_string(),
            user_content: serialize_transcript(transcript)?,
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
        };

        let text = self
            .client
            .complete(request)
            .await
            .map_err(|e| ChatError::synthesis(e.to_string()))?;

        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::synthesis("completion returned an empty profile"));
        }

        Ok(PersonalityProfile {
            text: text.to_string(),
            created_at: Utc::now(),
            source_turn_count: transcript.len(),
        })
    }
}

fn serialize_transcript(transcript: &[Turn]) -> ChatResult<String> {
    let entries: Vec<TranscriptEntry<'_>> = transcript
        .iter()
        .map(|turn| TranscriptEntry {
            sender: turn.sender,
            text: &turn.text,
            created_at: turn.created_at.to_rfc3339(),
        })
        .collect();

    serde_json::to_string(&entries).map_err(|e| ChatError::synthesis(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingClient {
        reply: ChatResult<String>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl RecordingClient {
        fn new(reply: ChatResult<String>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for RecordingClient {
        async fn complete(&self, request: CompletionRequest) -> ChatResult<String> {
            self.requests.lock().unwrap().push(request);
            self.reply.clone()
        }
    }

    fn transcript() -> Vec<Turn> {
        vec![
            Turn::new(Sender::User, "I love rainy mornings"),
            Turn::new(Sender::User, "tea > coffee, always"),
        ]
    }

    #[tokio::test]
    async fn one_call_with_whole_transcript() {
        let client = RecordingClient::new(Ok("  cozy, wry, says 'always'  ".to_string()));
        let synth = PersonalitySynthesizer::new(client.clone(), 0.7, 500);

        let profile = synth.synthesize(&transcript()).await.expect("profile");
        assert_eq!(profile.text, "cozy, wry, says 'always'");
        assert_eq!(profile.source_turn_count, 2);

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].system_instruction.contains("personality profile"));
        assert_eq!(requests[0].max_output_tokens, 500);

        let payload: serde_json::Value =
            serde_json::from_str(&requests[0].user_content).expect("json transcript");
        assert_eq!(payload.as_array().unwrap().len(), 2);
        assert_eq!(payload[0]["sender"], "user");
        assert_eq!(payload[1]["text"], "tea > coffee, always");
    }

    #[tokio::test]
    async fn service_failure_becomes_synthesis_error() {
        let client = RecordingClient::new(Err(ChatError::service("503")));
        let synth = PersonalitySynthesizer::new(client, 0.7, 500);

        let err = synth.synthesize(&transcript()).await.unwrap_err();
        assert!(matches!(err, ChatError::Synthesis(_)));
    }

    #[tokio::test]
    async fn blank_reply_is_rejected() {
        let client = RecordingClient::new(Ok("\n  ".to_string()));
        let synth = PersonalitySynthesizer::new(client, 0.7, 500);

        let err = synth.synthesize(&transcript()).await.unwrap_err();
        assert!(matches!(err, ChatError::Synthesis(_)));
    }
}
