mod api;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use api::{ApiClient, DEFAULT_STORE_ID};
use bottle_backend::{Engagement, EngagementState, Sender, SubmitOutcome, Turn};

enum Command<'a> {
    Say(&'a str),
    History,
    State,
    Reset,
    Quit,
    Unknown(&'a str),
}

fn parse_command(line: &str) -> Option<Command<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let command = match line {
        "/history" => Command::History,
        "/state" => Command::State,
        "/reset" => Command::Reset,
        "/quit" | "/exit" => Command::Quit,
        other if other.starts_with('/') => Command::Unknown(other),
        text => Command::Say(text),
    };
    Some(command)
}

fn progress_line(engagement: &Engagement) -> String {
    match engagement.state {
        EngagementState::Locked => format!(
            "{}/{} messages until AI chat is available",
            engagement.count, engagement.threshold
        ),
        EngagementState::ReadyToSynthesize => {
            "Enough messages collected; the AI will try to learn your style on your next message"
                .to_string()
        }
        EngagementState::Active => format!("AI chat active ({} messages)", engagement.count),
    }
}

fn render_turn(turn: &Turn) -> String {
    let who = match turn.sender {
        Sender::User => "you",
        Sender::Assistant => "ai",
    };
    format!(
        "[{}] {}: {}",
        turn.created_at.format("%H:%M:%S"),
        who,
        turn.text
    )
}

fn render_outcome(outcome: &SubmitOutcome) {
    for turn in outcome.added.iter().filter(|t| t.sender == Sender::Assistant) {
        println!("{}", render_turn(turn));
    }
    if let Some(advisory) = &outcome.advisory {
        println!("(notice) {}", advisory);
    }
    if outcome.engagement.state != EngagementState::Active {
        println!("{}", progress_line(&outcome.engagement));
    }
}

async fn run(api: ApiClient, store_id: String) -> Result<()> {
    let engagement = api
        .engagement(&store_id)
        .await
        .context("Backend unreachable")?;
    println!("Message Bottle AI chat ({})", store_id);
    println!("{}", progress_line(&engagement));
    println!("Commands: /history /state /reset /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_command(&line) else {
            continue;
        };

        match command {
            Command::Say(text) => match api.submit_turn(&store_id, text).await {
                Ok(outcome) => render_outcome(&outcome),
                Err(e) => println!("(error) {}", e),
            },
            Command::History => {
                for turn in api.list_turns(&store_id).await? {
                    println!("{}", render_turn(&turn));
                }
            }
            Command::State => {
                let engagement = api.engagement(&store_id).await?;
                println!("{}", progress_line(&engagement));
            }
            Command::Reset => {
                if api.reset(&store_id).await? {
                    println!("Conversation cleared.");
                }
            }
            Command::Quit => break,
            Command::Unknown(other) => println!("Unknown command {}", other),
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bottle=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let api_client = ApiClient::from_env();
    tracing::info!("Backend API: {}", api_client.base_url());
    if std::env::var("BOTTLE_BACKEND_TOKEN")
        .ok()
        .map(|token| token.trim().is_empty())
        .unwrap_or(true)
    {
        tracing::warn!(
            "BOTTLE_BACKEND_TOKEN is unset/empty; requests will fail unless backend auth mode is disabled"
        );
    }

    let store_id = std::env::var("BOTTLE_STORE_ID")
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| DEFAULT_STORE_ID.to_string());

    run(api_client, store_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_and_text() {
        assert!(parse_command("   ").is_none());
        assert!(matches!(parse_command("/reset"), Some(Command::Reset)));
        assert!(matches!(parse_command("/exit"), Some(Command::Quit)));
        assert!(matches!(parse_command("/dance"), Some(Command::Unknown("/dance"))));
        assert!(matches!(parse_command("  hi there "), Some(Command::Say("hi there"))));
    }

    #[test]
    fn locked_progress_shows_count_over_threshold() {
        let engagement = Engagement {
            state: EngagementState::Locked,
            count: 12,
            threshold: 50,
        };
        assert_eq!(
            progress_line(&engagement),
            "12/50 messages until AI chat is available"
        );
    }
}
