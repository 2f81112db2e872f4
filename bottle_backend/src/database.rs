use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::error::{ChatError, ChatResult};

/// Who authored a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Assistant,
}

impl Sender {
    fn as_db_str(self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Assistant => "assistant",
        }
    }

    fn from_db(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Sender::User),
            "assistant" => Some(Sender::Assistant),
            _ => None,
        }
    }
}

/// One recorded message. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub id: String,
    pub text: String,
    pub sender: Sender,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            sender,
            created_at: Utc::now(),
        }
    }
}

/// Opaque style descriptor synthesized from a transcript snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersonalityProfile {
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Transcript length the profile was built from
    pub source_turn_count: usize,
}

struct StoreState {
    conn: Connection,
    turns: Vec<Turn>,
    profile: Option<PersonalityProfile>,
}

/// Durable, append-only turn log plus the optional personality profile for
/// one store identity.
///
/// Every mutation is written to SQLite first and only then applied to the
/// cached view, so a failed write leaves both views unchanged.
///
/// Multi-step writers (submit, reset) hold `lock_submissions` for their whole
/// sequence, so anything sharing the store is serialized with them.
pub struct ConversationStore {
    store_id: String,
    max_turn_chars: usize,
    state: Mutex<StoreState>,
    submissions: AsyncMutex<()>,
}

impl ConversationStore {
    /// Open (or create) the store for `store_id` inside the database at `path`.
    ///
    /// Keep one instance per `store_id` in a process and share it through an
    /// `Arc`. A second instance does not see the first one's writes in its
    /// cached view.
    pub fn open<P: AsRef<Path>>(
        path: P,
        store_id: &str,
        max_turn_chars: usize,
    ) -> ChatResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, store_id, max_turn_chars)
    }

    /// Non-durable store, used by tests and throwaway sessions.
    pub fn open_in_memory(store_id: &str, max_turn_chars: usize) -> ChatResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, store_id, max_turn_chars)
    }

    fn from_connection(
        conn: Connection,
        store_id: &str,
        max_turn_chars: usize,
    ) -> ChatResult<Self> {
        let store_id = store_id.trim();
        if store_id.is_empty() {
            return Err(ChatError::validation("store id cannot be empty"));
        }

        ensure_schema(&conn)?;
        let turns = load_turns(&conn, store_id)?;
        let profile = load_profile(&conn, store_id)?;

        tracing::info!(
            "Opened conversation store '{}' ({} turns, profile: {})",
            store_id,
            turns.len(),
            profile.is_some()
        );

        Ok(Self {
            store_id: store_id.to_string(),
            max_turn_chars,
            state: Mutex::new(StoreState {
                conn,
                turns,
                profile,
            }),
            submissions: AsyncMutex::new(()),
        })
    }

    fn lock_state(&self) -> ChatResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|e| ChatError::storage(format!("store lock poisoned: {}", e)))
    }

    /// Exclusive section for a whole submit or reset sequence on this store.
    pub async fn lock_submissions(&self) -> AsyncMutexGuard<'_, ()> {
        self.submissions.lock().await
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn max_turn_chars(&self) -> usize {
        self.max_turn_chars
    }

    /// Validate and durably append a turn, returning it as stored.
    ///
    /// `created_at` is clamped so timestamps never go backwards within the log.
    pub fn append(&self, mut turn: Turn) -> ChatResult<Turn> {
        self.validate_text(&turn.text)?;

        let mut state = self.lock_state()?;
        if let Some(last) = state.turns.last() {
            if turn.created_at < last.created_at {
                turn.created_at = last.created_at;
            }
        }

        state.conn.execute(
            "INSERT INTO chat_turns (store_id, seq, id, text, sender, created_at)
             VALUES (
                ?1,
                (SELECT COALESCE(MAX(seq), -1) + 1 FROM chat_turns WHERE store_id = ?1),
                ?2, ?3, ?4, ?5
             )",
            params![
                self.store_id,
                turn.id,
                turn.text,
                turn.sender.as_db_str(),
                turn.created_at.to_rfc3339(),
            ],
        )?;

        state.turns.push(turn.clone());
        Ok(turn)
    }

    fn validate_text(&self, text: &str) -> ChatResult<()> {
        if text.trim().is_empty() {
            return Err(ChatError::validation("turn text cannot be empty"));
        }
        let chars = text.chars().count();
        if chars > self.max_turn_chars {
            return Err(ChatError::validation(format!(
                "turn text is {} characters, limit is {}",
                chars, self.max_turn_chars
            )));
        }
        Ok(())
    }

    /// Full transcript in insertion order.
    pub fn all(&self) -> ChatResult<Vec<Turn>> {
        Ok(self.lock_state()?.turns.clone())
    }

    /// The last `n` turns in insertion order (fewer if the log is shorter).
    pub fn recent(&self, n: usize) -> ChatResult<Vec<Turn>> {
        let state = self.lock_state()?;
        let start = state.turns.len().saturating_sub(n);
        Ok(state.turns[start..].to_vec())
    }

    pub fn count(&self) -> ChatResult<usize> {
        Ok(self.lock_state()?.turns.len())
    }

    pub fn profile(&self) -> ChatResult<Option<PersonalityProfile>> {
        Ok(self.lock_state()?.profile.clone())
    }

    /// Store the profile, replacing any previous one wholesale.
    pub fn set_profile(&self, profile: PersonalityProfile) -> ChatResult<()> {
        if profile.text.trim().is_empty() {
            return Err(ChatError::validation("personality profile cannot be empty"));
        }

        let mut state = self.lock_state()?;
        state.conn.execute(
            "INSERT INTO chat_profiles (store_id, profile_text, source_turn_count, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(store_id) DO UPDATE SET
                profile_text = excluded.profile_text,
                source_turn_count = excluded.source_turn_count,
                created_at = excluded.created_at",
            params![
                self.store_id,
                profile.text,
                profile.source_turn_count as i64,
                profile.created_at.to_rfc3339(),
            ],
        )?;
        state.profile = Some(profile);
        Ok(())
    }

    /// Remove every turn and the profile in one transaction.
    pub fn clear(&self) -> ChatResult<()> {
        let mut state = self.lock_state()?;
        let tx = state.conn.transaction()?;
        tx.execute("DELETE FROM chat_turns WHERE store_id = ?1", [&self.store_id])?;
        tx.execute(
            "DELETE FROM chat_profiles WHERE store_id = ?1",
            [&self.store_id],
        )?;
        tx.commit()?;

        state.turns.clear();
        state.profile = None;
        tracing::info!("Cleared conversation store '{}'", self.store_id);
        Ok(())
    }
}

fn ensure_schema(conn: &Connection) -> ChatResult<()> {
    conn.execute(
        r#"CREATE TABLE IF NOT EXISTS chat_turns (
            store_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            id TEXT NOT NULL,
            text TEXT NOT NULL,
            sender TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (store_id, seq)
        )"#,
        [],
    )?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_chat_turns_id ON chat_turns(store_id, id)",
        [],
    )?;

    conn.execute(
        r#"CREATE TABLE IF NOT EXISTS chat_profiles (
            store_id TEXT PRIMARY KEY,
            profile_text TEXT NOT NULL,
            source_turn_count INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )"#,
        [],
    )?;

    Ok(())
}

fn load_turns(conn: &Connection, store_id: &str) -> ChatResult<Vec<Turn>> {
    let mut stmt = conn.prepare(
        "SELECT id, text, sender, created_at FROM chat_turns
         WHERE store_id = ?1
         ORDER BY seq ASC",
    )?;

    let turns = stmt
        .query_map([store_id], |row| {
            let sender_raw: String = row.get(2)?;
            let sender = Sender::from_db(&sender_raw).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    format!("unknown sender '{}'", sender_raw).into(),
                )
            })?;
            Ok(Turn {
                id: row.get(0)?,
                text: row.get(1)?,
                sender,
                created_at: parse_rfc3339(row.get::<_, String>(3)?, 3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(turns)
}

fn load_profile(conn: &Connection, store_id: &str) -> ChatResult<Option<PersonalityProfile>> {
    let mut stmt = conn.prepare(
        "SELECT profile_text, source_turn_count, created_at FROM chat_profiles
         WHERE store_id = ?1",
    )?;
    let mut rows = stmt.query([store_id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    Ok(Some(PersonalityProfile {
        text: row.get(0)?,
        source_turn_count: row.get::<_, i64>(1)?.max(0) as usize,
        created_at: parse_rfc3339(row.get::<_, String>(2)?, 2)?,
    }))
}

fn parse_rfc3339(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn memory_store() -> ConversationStore {
        ConversationStore::open_in_memory("test", 500).expect("store")
    }

    fn profile(text: &str) -> PersonalityProfile {
        PersonalityProfile {
            text: text.to_string(),
            created_at: Utc::now(),
            source_turn_count: 50,
        }
    }

    #[test]
    fn append_keeps_insertion_order() {
        let store = memory_store();
        for i in 0..10 {
            store
                .append(Turn::new(Sender::User, format!("message {}", i)))
                .expect("append");
        }

        let turns = store.all().expect("all");
        assert_eq!(store.count().unwrap(), 10);
        assert_eq!(turns.len(), 10);
        for (i, turn) in turns.iter().enumerate() {
            assert_eq!(turn.text, format!("message {}", i));
        }
    }

    #[test]
    fn rejects_empty_and_oversized_text() {
        let store = memory_store();
        assert!(matches!(
            store.append(Turn::new(Sender::User, "   ")),
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            store.append(Turn::new(Sender::User, "x".repeat(501))),
            Err(ChatError::Validation(_))
        ));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn length_bound_counts_characters_not_bytes() {
        let store = memory_store();
        let text = "é".repeat(500);
        assert!(text.len() > 500);
        store.append(Turn::new(Sender::User, text)).expect("500 chars fits");
    }

    #[test]
    fn created_at_never_goes_backwards() {
        let store = memory_store();
        let first = store.append(Turn::new(Sender::User, "first")).unwrap();

        let mut stale = Turn::new(Sender::Assistant, "second");
        stale.created_at = first.created_at - Duration::seconds(60);
        let second = store.append(stale).unwrap();

        assert!(second.created_at >= first.created_at);
    }

    #[test]
    fn recent_returns_suffix_in_order() {
        let store = memory_store();
        for i in 0..8 {
            store
                .append(Turn::new(Sender::User, format!("t{}", i)))
                .unwrap();
        }
        let texts: Vec<_> = store
            .recent(3)
            .unwrap()
            .into_iter()
            .map(|t| t.text)
            .collect();
        assert_eq!(texts, vec!["t5", "t6", "t7"]);
        assert_eq!(store.recent(100).unwrap().len(), 8);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bottle.db");

        {
            let store = ConversationStore::open(&path, "alice", 500).expect("open");
            store.append(Turn::new(Sender::User, "hello")).unwrap();
            store.append(Turn::new(Sender::Assistant, "hi!")).unwrap();
            store.set_profile(profile("warm and brief")).unwrap();
        }

        let reopened = ConversationStore::open(&path, "alice", 500).expect("reopen");
        let turns = reopened.all().unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "hello");
        assert_eq!(turns[1].sender, Sender::Assistant);
        assert_eq!(reopened.profile().unwrap().unwrap().text, "warm and brief");
    }

    #[test]
    fn stores_sharing_a_file_are_independent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bottle.db");

        let alice = ConversationStore::open(&path, "alice", 500).unwrap();
        let bob = ConversationStore::open(&path, "bob", 500).unwrap();
        alice.append(Turn::new(Sender::User, "from alice")).unwrap();
        alice.set_profile(profile("alice style")).unwrap();
        bob.append(Turn::new(Sender::User, "from bob")).unwrap();
        bob.clear().unwrap();

        let alice_again = ConversationStore::open(&path, "alice", 500).unwrap();
        assert_eq!(alice_again.count().unwrap(), 1);
        assert!(alice_again.profile().unwrap().is_some());
        assert_eq!(bob.count().unwrap(), 0);
    }

    #[test]
    fn set_profile_overwrites() {
        let store = memory_store();
        store.set_profile(profile("first")).unwrap();
        store.set_profile(profile("second")).unwrap();
        assert_eq!(store.profile().unwrap().unwrap().text, "second");
    }

    #[test]
    fn clear_removes_turns_and_profile_durably() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bottle.db");

        let store = ConversationStore::open(&path, "alice", 500).unwrap();
        store.append(Turn::new(Sender::User, "hello")).unwrap();
        store.set_profile(profile("style")).unwrap();
        store.clear().unwrap();

        assert_eq!(store.count().unwrap(), 0);
        assert!(store.profile().unwrap().is_none());

        let reopened = ConversationStore::open(&path, "alice", 500).unwrap();
        assert_eq!(reopened.count().unwrap(), 0);
        assert!(reopened.profile().unwrap().is_none());
    }

    #[test]
    fn failed_write_leaves_cached_view_untouched() {
        let store = memory_store();
        store.append(Turn::new(Sender::User, "kept")).unwrap();

        store
            .state
            .lock()
            .unwrap()
            .conn
            .execute("DROP TABLE chat_turns", [])
            .unwrap();

        let result = store.append(Turn::new(Sender::User, "lost"));
        assert!(matches!(result, Err(ChatError::Storage(_))));
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.all().unwrap()[0].text, "kept");
    }

    #[test]
    fn second_handle_on_same_id_appends_after_existing_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bottle.db");

        let first = ConversationStore::open(&path, "alice", 500).unwrap();
        let second = ConversationStore::open(&path, "alice", 500).unwrap();
        first.append(Turn::new(Sender::User, "one")).unwrap();
        second.append(Turn::new(Sender::User, "two")).expect("no seq conflict");
        first.append(Turn::new(Sender::User, "three")).unwrap();

        let reopened = ConversationStore::open(&path, "alice", 500).unwrap();
        let texts: Vec<_> = reopened.all().unwrap().into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn blank_store_id_is_rejected() {
        assert!(ConversationStore::open_in_memory("  ", 500).is_err());
    }
}
