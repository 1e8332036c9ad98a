use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::model::{
    now_millis, Agent, BlockStatus, ChatMessage, FeedComment, FeedPost, Group, MessageKind,
    PendingSummary, Relationship, Sticker, SummaryRecord, Timestamp, USER_SENDER_ID,
};

pub const RELATIONSHIP_SCORE_MIN: i64 = -100;
pub const RELATIONSHIP_SCORE_MAX: i64 = 100;

/// SQLite-backed record store for everything the simulation reads or writes.
///
/// Single-record writes go through the `*_on` helpers so callers can batch
/// them inside [`SimDatabase::transaction`].
pub struct SimDatabase {
    conn: Mutex<Connection>,
}

impl SimDatabase {
    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                persona TEXT NOT NULL DEFAULT '',
                block_status TEXT,
                action_count INTEGER NOT NULL DEFAULT 0,
                last_summary_action_count INTEGER NOT NULL DEFAULT 0,
                pending_summary TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                enable_offline_sim INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                PRIMARY KEY (group_id, agent_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                hidden INTEGER NOT NULL DEFAULT 0,
                reactive INTEGER NOT NULL DEFAULT 0,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
                ON messages(conversation_id, timestamp);

            CREATE TABLE IF NOT EXISTS summaries (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                content TEXT NOT NULL,
                keywords TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_summaries_conversation_end
                ON summaries(conversation_id, end_time DESC);

            CREATE TABLE IF NOT EXISTS relationships (
                agent_id TEXT NOT NULL,
                other_id TEXT NOT NULL,
                score INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (agent_id, other_id)
            );

            CREATE TABLE IF NOT EXISTS feed_posts (
                id TEXT PRIMARY KEY,
                author_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_feed_posts_created_at
                ON feed_posts(created_at DESC);

            CREATE TABLE IF NOT EXISTS feed_likes (
                post_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (post_id, agent_id)
            );

            CREATE TABLE IF NOT EXISTS feed_comments (
                id TEXT PRIMARY KEY,
                post_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS stickers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS sim_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    /// Run `f` inside one SQLite transaction. Nothing is written unless `f`
    /// returns `Ok`.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ========================================================================
    // Agents
    // ========================================================================

    pub fn create_agent(&self, name: &str, persona: &str) -> Result<Agent> {
        let agent = Agent {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            persona: persona.to_string(),
            block_status: None,
            action_count: 0,
            last_summary_action_count: 0,
            pending_summary: None,
            created_at: now_millis(),
        };
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO agents (id, name, persona, block_status, action_count,
                                 last_summary_action_count, pending_summary, created_at)
             VALUES (?1, ?2, ?3, NULL, 0, 0, NULL, ?4)",
            params![agent.id, agent.name, agent.persona, agent.created_at],
        )?;
        Ok(agent)
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let conn = self.lock_conn()?;
        load_agent_on(&conn, id)
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY created_at ASC", AGENT_SELECT))?;
        let agents = stmt
            .query_map([], agent_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    /// Transactional read-modify-write of the fields this core owns.
    /// `action_count` is never written back, so a concurrent
    /// [`record_exchange`](Self::record_exchange) cannot be lost.
    pub fn update_agent<T>(&self, id: &str, f: impl FnOnce(&mut Agent) -> T) -> Result<Option<T>> {
        self.transaction(|tx| {
            let Some(mut agent) = load_agent_on(tx, id)? else {
                return Ok(None);
            };
            let out = f(&mut agent);
            write_agent_state_on(tx, &agent)?;
            Ok(Some(out))
        })
    }

    pub fn set_block_status(&self, id: &str, status: Option<BlockStatus>) -> Result<bool> {
        let status_json = status
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize block status")?;
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE agents SET block_status = ?2 WHERE id = ?1",
            params![id, status_json],
        )?;
        Ok(changed > 0)
    }

    /// Count one user-visible exchange for the agent. Owned by the chat
    /// collaborator; the background core only reads the counter.
    pub fn record_exchange(&self, id: &str) -> Result<u64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE agents SET action_count = action_count + 1 WHERE id = ?1",
            [id],
        )?;
        let count = conn
            .query_row(
                "SELECT action_count FROM agents WHERE id = ?1",
                [id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .ok_or_else(|| anyhow!("agent '{}' not found", id))?;
        Ok(count.max(0) as u64)
    }

    // ========================================================================
    // Groups
    // ========================================================================

    pub fn create_group(
        &self,
        name: &str,
        enable_offline_sim: bool,
        members: &[String],
    ) -> Result<Group> {
        let group = Group {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            enable_offline_sim,
            members: members.to_vec(),
        };
        self.transaction(|tx| {
            tx.execute(
                "INSERT INTO groups (id, name, enable_offline_sim, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![group.id, group.name, group.enable_offline_sim, now_millis()],
            )?;
            for member in &group.members {
                tx.execute(
                    "INSERT OR IGNORE INTO group_members (group_id, agent_id) VALUES (?1, ?2)",
                    params![group.id, member],
                )?;
            }
            Ok(())
        })?;
        Ok(group)
    }

    pub fn add_group_member(&self, group_id: &str, agent_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO group_members (group_id, agent_id) VALUES (?1, ?2)",
            params![group_id, agent_id],
        )?;
        Ok(())
    }

    pub fn get_group(&self, id: &str) -> Result<Option<Group>> {
        let conn = self.lock_conn()?;
        let group = conn
            .query_row(
                "SELECT id, name, enable_offline_sim FROM groups WHERE id = ?1",
                [id],
                |row| {
                    Ok(Group {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        enable_offline_sim: row.get(2)?,
                        members: Vec::new(),
                    })
                },
            )
            .optional()?;
        match group {
            Some(mut group) => {
                group.members = group_members_on(&conn, &group.id)?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    pub fn list_groups(&self) -> Result<Vec<Group>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, enable_offline_sim FROM groups ORDER BY created_at ASC")?;
        let mut groups = stmt
            .query_map([], |row| {
                Ok(Group {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    enable_offline_sim: row.get(2)?,
                    members: Vec::new(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for group in &mut groups {
            group.members = group_members_on(&conn, &group.id)?;
        }
        Ok(groups)
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Append a message stamped with the current time, nudged forward if
    /// needed so timestamps stay unique within the conversation.
    pub fn append_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        kind: MessageKind,
        content: &str,
    ) -> Result<ChatMessage> {
        let conn = self.lock_conn()?;
        append_message_on(&conn, conversation_id, sender_id, kind, content)
    }

    /// Insert a fully specified message (imports, system events, fixtures).
    pub fn insert_message(&self, message: &ChatMessage) -> Result<()> {
        let conn = self.lock_conn()?;
        insert_message_on(&conn, message)
    }

    /// The latest `limit` messages, oldest first.
    pub fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE conversation_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
            MESSAGE_SELECT
        ))?;
        let messages = stmt
            .query_map(params![conversation_id, limit.max(1) as i64], message_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages.into_iter().rev().collect())
    }

    pub fn messages_after(
        &self,
        conversation_id: &str,
        after: Timestamp,
    ) -> Result<Vec<ChatMessage>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE conversation_id = ?1 AND timestamp > ?2 ORDER BY timestamp ASC",
            MESSAGE_SELECT
        ))?;
        let messages = stmt
            .query_map(params![conversation_id, after], message_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub fn messages_at(
        &self,
        conversation_id: &str,
        timestamps: &[Timestamp],
    ) -> Result<Vec<ChatMessage>> {
        if timestamps.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE conversation_id = ?1 AND timestamp = ?2",
            MESSAGE_SELECT
        ))?;
        let mut messages = Vec::new();
        for ts in timestamps {
            let found = stmt
                .query_map(params![conversation_id, ts], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            messages.extend(found);
        }
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    pub fn last_message(&self, conversation_id: &str) -> Result<Option<ChatMessage>> {
        Ok(self.recent_messages(conversation_id, 1)?.pop())
    }

    // ========================================================================
    // Summaries
    // ========================================================================

    pub fn latest_summary_end(&self, conversation_id: &str) -> Result<Option<Timestamp>> {
        let conn = self.lock_conn()?;
        let end = conn.query_row(
            "SELECT MAX(end_time) FROM summaries WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(end)
    }

    pub fn list_summaries(&self, conversation_id: &str) -> Result<Vec<SummaryRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, content, keywords, start_time, end_time, priority, enabled
             FROM summaries
             WHERE conversation_id = ?1
             ORDER BY start_time ASC, created_at ASC",
        )?;
        let records = stmt
            .query_map([conversation_id], |row| {
                let keywords_raw: String = row.get(3)?;
                Ok(SummaryRecord {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    content: row.get(2)?,
                    keywords: parse_json_column(&keywords_raw, 3)?,
                    start_time: row.get(4)?,
                    end_time: row.get(5)?,
                    priority: row.get(6)?,
                    enabled: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn count_summaries(&self, conversation_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(1) FROM summaries WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count.max(0) as usize)
    }

    pub fn set_summary_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE summaries SET enabled = ?2 WHERE id = ?1",
            params![id, enabled],
        )?;
        Ok(changed > 0)
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    pub fn adjust_relationship(&self, agent_id: &str, other_id: &str, delta: i64) -> Result<i64> {
        let conn = self.lock_conn()?;
        adjust_relationship_on(&conn, agent_id, other_id, delta)
    }

    pub fn relationships_for(&self, agent_id: &str) -> Result<Vec<Relationship>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT agent_id, other_id, score FROM relationships
             WHERE agent_id = ?1
             ORDER BY score DESC",
        )?;
        let relationships = stmt
            .query_map([agent_id], |row| {
                Ok(Relationship {
                    agent_id: row.get(0)?,
                    other_id: row.get(1)?,
                    score: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(relationships)
    }

    // ========================================================================
    // Feed
    // ========================================================================

    pub fn create_post(&self, author_id: &str, content: &str) -> Result<FeedPost> {
        let conn = self.lock_conn()?;
        create_post_on(&conn, author_id, content)
    }

    pub fn get_post(&self, id: &str) -> Result<Option<FeedPost>> {
        let conn = self.lock_conn()?;
        load_post_on(&conn, id)
    }

    /// Posts an agent can see: the user's, its own, and those of agents it
    /// shares a group with. Newest first.
    pub fn visible_posts(&self, agent_id: &str, limit: usize) -> Result<Vec<FeedPost>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, author_id, content, created_at FROM feed_posts
             WHERE author_id = ?1
                OR author_id = ?2
                OR author_id IN (
                    SELECT peer.agent_id FROM group_members own
                    JOIN group_members peer ON peer.group_id = own.group_id
                    WHERE own.agent_id = ?2
                )
             ORDER BY created_at DESC
             LIMIT ?3",
        )?;
        let mut posts = stmt
            .query_map(
                params![USER_SENDER_ID, agent_id, limit.max(1) as i64],
                post_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for post in &mut posts {
            fill_post_reactions_on(&conn, post)?;
        }
        Ok(posts)
    }

    // ========================================================================
    // Stickers
    // ========================================================================

    pub fn add_sticker(&self, name: &str, description: &str) -> Result<Sticker> {
        let sticker = Sticker {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            description: description.to_string(),
        };
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO stickers (id, name, description) VALUES (?1, ?2, ?3)",
            params![sticker.id, sticker.name, sticker.description],
        )?;
        Ok(sticker)
    }

    pub fn list_stickers(&self) -> Result<Vec<Sticker>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT id, name, description FROM stickers ORDER BY name")?;
        let stickers = stmt
            .query_map([], |row| {
                Ok(Sticker {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stickers)
    }

    // ========================================================================
    // Key/value state
    // ========================================================================

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row("SELECT value FROM sim_state WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sim_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

// ============================================================================
// Connection-level helpers, usable inside a transaction
// ============================================================================

const AGENT_SELECT: &str = "SELECT id, name, persona, block_status, action_count,
        last_summary_action_count, pending_summary, created_at FROM agents";

const MESSAGE_SELECT: &str = "SELECT id, conversation_id, sender_id, kind, content, hidden,
        reactive, timestamp FROM messages";

pub fn load_agent_on(conn: &Connection, id: &str) -> Result<Option<Agent>> {
    let agent = conn
        .query_row(&format!("{} WHERE id = ?1", AGENT_SELECT), [id], agent_from_row)
        .optional()?;
    Ok(agent)
}

/// Persist the background-owned fields of `agent`.
pub fn write_agent_state_on(conn: &Connection, agent: &Agent) -> Result<()> {
    let status_json = agent
        .block_status
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to serialize block status")?;
    let pending_json = agent
        .pending_summary
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to serialize pending summary")?;
    conn.execute(
        "UPDATE agents
         SET block_status = ?2, last_summary_action_count = ?3, pending_summary = ?4
         WHERE id = ?1",
        params![
            agent.id,
            status_json,
            agent.last_summary_action_count as i64,
            pending_json
        ],
    )?;
    Ok(())
}

pub fn insert_message_on(conn: &Connection, message: &ChatMessage) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, kind, content, hidden, reactive, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            message.id,
            message.conversation_id,
            message.sender_id,
            message.kind.as_db_str(),
            message.content,
            message.hidden,
            message.reactive,
            message.timestamp,
        ],
    )?;
    Ok(())
}

pub fn append_message_on(
    conn: &Connection,
    conversation_id: &str,
    sender_id: &str,
    kind: MessageKind,
    content: &str,
) -> Result<ChatMessage> {
    let last: Option<i64> = conn.query_row(
        "SELECT MAX(timestamp) FROM messages WHERE conversation_id = ?1",
        [conversation_id],
        |row| row.get(0),
    )?;
    let now = now_millis();
    let timestamp = match last {
        Some(last) if last >= now => last + 1,
        _ => now,
    };
    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        kind,
        content: content.to_string(),
        hidden: false,
        reactive: false,
        timestamp,
    };
    insert_message_on(conn, &message)?;
    Ok(message)
}

/// Mark pending reactive system events in a conversation as handled.
pub fn clear_reactive_on(conn: &Connection, conversation_id: &str) -> Result<usize> {
    let cleared = conn.execute(
        "UPDATE messages SET reactive = 0 WHERE conversation_id = ?1 AND reactive = 1",
        [conversation_id],
    )?;
    Ok(cleared)
}

pub fn insert_summary_on(conn: &Connection, record: &SummaryRecord) -> Result<()> {
    let keywords_json =
        serde_json::to_string(&record.keywords).context("Failed to serialize keywords")?;
    conn.execute(
        "INSERT INTO summaries (id, conversation_id, content, keywords, start_time, end_time,
                                priority, enabled, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.id,
            record.conversation_id,
            record.content,
            keywords_json,
            record.start_time,
            record.end_time,
            record.priority,
            record.enabled,
            now_millis(),
        ],
    )?;
    Ok(())
}

/// Atomic clamped add; concurrent adjustments from different tasks compose
/// instead of overwriting each other.
pub fn adjust_relationship_on(
    conn: &Connection,
    agent_id: &str,
    other_id: &str,
    delta: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO relationships (agent_id, other_id, score, updated_at)
         VALUES (?1, ?2, MAX(?4, MIN(?5, ?3)), ?6)
         ON CONFLICT(agent_id, other_id) DO UPDATE SET
            score = MAX(?4, MIN(?5, relationships.score + ?3)),
            updated_at = ?6",
        params![
            agent_id,
            other_id,
            delta,
            RELATIONSHIP_SCORE_MIN,
            RELATIONSHIP_SCORE_MAX,
            now_millis()
        ],
    )?;
    let score = conn.query_row(
        "SELECT score FROM relationships WHERE agent_id = ?1 AND other_id = ?2",
        params![agent_id, other_id],
        |row| row.get(0),
    )?;
    Ok(score)
}

pub fn create_post_on(conn: &Connection, author_id: &str, content: &str) -> Result<FeedPost> {
    let post = FeedPost {
        id: Uuid::new_v4().to_string(),
        author_id: author_id.to_string(),
        content: content.to_string(),
        created_at: now_millis(),
        likes: Vec::new(),
        comments: Vec::new(),
    };
    conn.execute(
        "INSERT INTO feed_posts (id, author_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![post.id, post.author_id, post.content, post.created_at],
    )?;
    Ok(post)
}

pub fn load_post_on(conn: &Connection, id: &str) -> Result<Option<FeedPost>> {
    let post = conn
        .query_row(
            "SELECT id, author_id, content, created_at FROM feed_posts WHERE id = ?1",
            [id],
            post_from_row,
        )
        .optional()?;
    match post {
        Some(mut post) => {
            fill_post_reactions_on(conn, &mut post)?;
            Ok(Some(post))
        }
        None => Ok(None),
    }
}

/// Returns false if the agent had already liked the post.
pub fn like_post_on(conn: &Connection, post_id: &str, agent_id: &str) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO feed_likes (post_id, agent_id, created_at) VALUES (?1, ?2, ?3)",
        params![post_id, agent_id, now_millis()],
    )?;
    Ok(inserted > 0)
}

pub fn comment_on_post_on(
    conn: &Connection,
    post_id: &str,
    author_id: &str,
    content: &str,
) -> Result<FeedComment> {
    let comment = FeedComment {
        id: Uuid::new_v4().to_string(),
        post_id: post_id.to_string(),
        author_id: author_id.to_string(),
        content: content.to_string(),
        created_at: now_millis(),
    };
    conn.execute(
        "INSERT INTO feed_comments (id, post_id, author_id, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            comment.id,
            comment.post_id,
            comment.author_id,
            comment.content,
            comment.created_at
        ],
    )?;
    Ok(comment)
}

pub fn find_sticker_on(conn: &Connection, key: &str) -> Result<Option<Sticker>> {
    let sticker = conn
        .query_row(
            "SELECT id, name, description FROM stickers
             WHERE id = ?1 OR LOWER(name) = LOWER(?1)
             LIMIT 1",
            [key.trim()],
            |row| {
                Ok(Sticker {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(sticker)
}

fn group_members_on(conn: &Connection, group_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT agent_id FROM group_members WHERE group_id = ?1 ORDER BY agent_id")?;
    let members = stmt
        .query_map([group_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(members)
}

fn fill_post_reactions_on(conn: &Connection, post: &mut FeedPost) -> Result<()> {
    let mut likes_stmt =
        conn.prepare("SELECT agent_id FROM feed_likes WHERE post_id = ?1 ORDER BY created_at")?;
    post.likes = likes_stmt
        .query_map([&post.id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut comments_stmt = conn.prepare(
        "SELECT id, post_id, author_id, content, created_at FROM feed_comments
         WHERE post_id = ?1 ORDER BY created_at",
    )?;
    post.comments = comments_stmt
        .query_map([&post.id], |row| {
            Ok(FeedComment {
                id: row.get(0)?,
                post_id: row.get(1)?,
                author_id: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(())
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let block_raw: Option<String> = row.get(3)?;
    let pending_raw: Option<String> = row.get(6)?;
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        persona: row.get(2)?,
        block_status: block_raw
            .as_deref()
            .map(|raw| parse_json_column::<BlockStatus>(raw, 3))
            .transpose()?,
        action_count: row.get::<_, i64>(4)?.max(0) as u64,
        last_summary_action_count: row.get::<_, i64>(5)?.max(0) as u64,
        pending_summary: pending_raw
            .as_deref()
            .map(|raw| parse_json_column::<PendingSummary>(raw, 6))
            .transpose()?,
        created_at: row.get(7)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        kind: MessageKind::from_db(&row.get::<_, String>(3)?),
        content: row.get(4)?,
        hidden: row.get(5)?,
        reactive: row.get(6)?,
        timestamp: row.get(7)?,
    })
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<FeedPost> {
    Ok(FeedPost {
        id: row.get(0)?,
        author_id: row.get(1)?,
        content: row.get(2)?,
        created_at: row.get(3)?,
        likes: Vec::new(),
        comments: Vec::new(),
    })
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    raw: &str,
    column: usize,
) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Thread;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("murmur_{}_{}.db", name, Uuid::new_v4()));
        path
    }

    #[test]
    fn agent_state_roundtrip_preserves_block_status_and_pending_cache() {
        let path = temp_db_path("agent_roundtrip");
        let db = SimDatabase::new(&path).expect("db init");
        let agent = db.create_agent("Mira", "A quiet painter").expect("create agent");

        db.update_agent(&agent.id, |a| {
            a.block_status = Some(BlockStatus::BlockedByUser { since: 1_000 });
            a.pending_summary = Some(PendingSummary {
                threads: vec![Thread {
                    topic_summary: "weekend trip".to_string(),
                    keywords: vec!["trip".to_string()],
                    message_timestamps: vec![5, 6],
                    ongoing: true,
                    priority: 0,
                }],
                analyzed_up_to: 6,
            });
            a.last_summary_action_count = 4;
        })
        .expect("update agent");

        let loaded = db.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(
            loaded.block_status,
            Some(BlockStatus::BlockedByUser { since: 1_000 })
        );
        assert_eq!(loaded.last_summary_action_count, 4);
        assert_eq!(loaded.pending_summary.unwrap().analyzed_up_to, 6);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn update_agent_never_overwrites_action_count() {
        let path = temp_db_path("action_count");
        let db = SimDatabase::new(&path).expect("db init");
        let agent = db.create_agent("Rook", "").unwrap();

        let stale = db.get_agent(&agent.id).unwrap().unwrap();
        db.record_exchange(&agent.id).unwrap();
        db.record_exchange(&agent.id).unwrap();

        db.update_agent(&stale.id, |a| {
            a.action_count = 0;
            a.last_summary_action_count = 1;
        })
        .unwrap();

        let loaded = db.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(loaded.action_count, 2);
        assert_eq!(loaded.last_summary_action_count, 1);

        assert!(db.update_agent("missing", |_| ()).unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn failed_transaction_writes_nothing() {
        let path = temp_db_path("tx_rollback");
        let db = SimDatabase::new(&path).expect("db init");

        let result: Result<()> = db.transaction(|tx| {
            append_message_on(tx, "conv", "user", MessageKind::Text, "hello")?;
            Err(anyhow!("simulated crash"))
        });
        assert!(result.is_err());
        assert!(db.recent_messages("conv", 10).unwrap().is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn appended_timestamps_stay_unique_and_ordered() {
        let path = temp_db_path("message_ts");
        let db = SimDatabase::new(&path).expect("db init");

        let mut last = 0;
        for i in 0..5 {
            let message = db
                .append_message("conv", "user", MessageKind::Text, &format!("m{i}"))
                .unwrap();
            assert!(message.timestamp > last);
            last = message.timestamp;
        }

        let recent = db.recent_messages("conv", 3).unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);

        let after = db.messages_after("conv", recent[0].timestamp).unwrap();
        assert_eq!(after.len(), 2);

        let picked = db
            .messages_at("conv", &[recent[2].timestamp, recent[0].timestamp])
            .unwrap();
        assert_eq!(picked[0].content, "m2");
        assert_eq!(picked[1].content, "m4");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn relationship_adjustments_compose_and_clamp() {
        let path = temp_db_path("relationships");
        let db = SimDatabase::new(&path).expect("db init");

        assert_eq!(db.adjust_relationship("a", "b", 30).unwrap(), 30);
        assert_eq!(db.adjust_relationship("a", "b", -5).unwrap(), 25);
        assert_eq!(db.adjust_relationship("a", "b", 500).unwrap(), 100);
        assert_eq!(db.adjust_relationship("a", "c", -500).unwrap(), -100);

        let rels = db.relationships_for("a").unwrap();
        assert_eq!(rels.len(), 2);
        assert_eq!(rels[0].other_id, "b");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn visible_posts_follow_group_membership() {
        let path = temp_db_path("feed");
        let db = SimDatabase::new(&path).expect("db init");
        let ana = db.create_agent("Ana", "").unwrap();
        let ben = db.create_agent("Ben", "").unwrap();
        let cal = db.create_agent("Cal", "").unwrap();
        db.create_group("Book club", true, &[ana.id.clone(), ben.id.clone()])
            .unwrap();

        let user_post = db.create_post(USER_SENDER_ID, "sunny day").unwrap();
        db.create_post(&ben.id, "reading Dune").unwrap();
        db.create_post(&cal.id, "nobody sees this").unwrap();

        {
            let conn = db.lock_conn().unwrap();
            assert!(like_post_on(&conn, &user_post.id, &ana.id).unwrap());
            assert!(!like_post_on(&conn, &user_post.id, &ana.id).unwrap());
            comment_on_post_on(&conn, &user_post.id, &ana.id, "lovely").unwrap();
        }

        let visible = db.visible_posts(&ana.id, 10).unwrap();
        let contents: Vec<_> = visible.iter().map(|p| p.content.as_str()).collect();
        assert!(contents.contains(&"sunny day"));
        assert!(contents.contains(&"reading Dune"));
        assert!(!contents.contains(&"nobody sees this"));

        let loaded = db.get_post(&user_post.id).unwrap().unwrap();
        assert_eq!(loaded.likes, vec![ana.id.clone()]);
        assert_eq!(loaded.comments.len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn summaries_track_latest_end_and_enable_toggle() {
        let path = temp_db_path("summaries");
        let db = SimDatabase::new(&path).expect("db init");
        assert_eq!(db.latest_summary_end("conv").unwrap(), None);

        let record = SummaryRecord {
            id: Uuid::new_v4().to_string(),
            conversation_id: "conv".to_string(),
            content: "Talked about tea".to_string(),
            keywords: vec!["tea".to_string()],
            start_time: 10,
            end_time: 40,
            priority: 0,
            enabled: true,
        };
        db.transaction(|tx| insert_summary_on(tx, &record)).unwrap();

        assert_eq!(db.latest_summary_end("conv").unwrap(), Some(40));
        assert!(db.set_summary_enabled(&record.id, false).unwrap());
        let stored = db.list_summaries("conv").unwrap();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].enabled);
        assert_eq!(stored[0].keywords, vec!["tea".to_string()]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn stickers_resolve_by_id_or_name() {
        let path = temp_db_path("stickers");
        let db = SimDatabase::new(&path).expect("db init");
        let sticker = db.add_sticker("Wave", "a friendly wave").unwrap();

        let conn = db.lock_conn().unwrap();
        assert_eq!(find_sticker_on(&conn, "wave").unwrap().unwrap().id, sticker.id);
        assert_eq!(
            find_sticker_on(&conn, &sticker.id).unwrap().unwrap().name,
            "Wave"
        );
        assert!(find_sticker_on(&conn, "shrug").unwrap().is_none());
        drop(conn);

        let _ = std::fs::remove_file(&path);
    }
}
