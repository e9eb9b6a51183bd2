use std::collections::HashMap;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use threadline_contracts::{Channel, Direction, Message, SentBy};
use threadline_kernel::{format_millis, thread_key, OrderingKey};

/// A validated, normalized turn waiting for its sequence number.
#[derive(Debug, Clone)]
pub(crate) struct PendingMessage {
    pub id: String,
    pub organization_id: String,
    pub lead_id: Option<String>,
    pub phone: String,
    pub channel: Channel,
    pub direction: Direction,
    pub sent_by: SentBy,
    pub content: String,
    pub timestamp_ms: i64,
    pub created_at_ms: i64,
    pub external_ref: Option<String>,
}

impl PendingMessage {
    fn into_message(self, sequence_number: i64) -> Message {
        Message {
            id: self.id,
            organization_id: self.organization_id,
            lead_id: self.lead_id,
            phone_number_normalized: self.phone,
            channel: self.channel,
            direction: self.direction,
            sent_by: self.sent_by,
            content: self.content,
            timestamp: format_millis(self.timestamp_ms),
            sequence_number,
            created_at: format_millis(self.created_at_ms),
            external_ref: self.external_ref,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CallSession {
    pub conversation_id: String,
    pub organization_id: String,
    pub phone: String,
    pub lead_id: Option<String>,
    pub started_at_ms: i64,
}

pub(crate) enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    threads: HashMap<String, Vec<(OrderingKey, Message)>>,
    counters: HashMap<String, i64>,
    lead_links: HashMap<String, String>,
    aliases: HashMap<String, String>,
    calls: HashMap<String, CallSession>,
}

pub(crate) struct SqliteStore {
    conn: Connection,
}

fn scoped(organization_id: &str, name: &str) -> String {
    format!("{organization_id}:{name}")
}

impl StoreBackend {
    pub fn find_by_external_ref(
        &self,
        organization_id: &str,
        phone: &str,
        external_ref: &str,
    ) -> Result<Option<Message>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .threads
                .get(&thread_key(organization_id, phone))
                .and_then(|rows| {
                    rows.iter()
                        .map(|(_, m)| m)
                        .find(|m| m.external_ref.as_deref() == Some(external_ref))
                        .cloned()
                })),
            StoreBackend::Sqlite(store) => {
                store.find_by_external_ref(organization_id, phone, external_ref)
            }
        }
    }

    /// Assigns the next sequence number of the thread and persists the row as
    /// one atomic step.
    pub fn insert_sequenced(&mut self, pending: PendingMessage) -> Result<Message, String> {
        match self {
            StoreBackend::Memory(store) => {
                let key = thread_key(&pending.organization_id, &pending.phone);
                let sequence = store.next_sequence(&key);
                let message = pending.into_message(sequence);
                let ordering = OrderingKey::of(&message)
                    .ok_or_else(|| "message timestamps are not RFC3339".to_string())?;
                let rows = store.threads.entry(key).or_default();
                let idx = rows.partition_point(|(k, _)| *k < ordering);
                rows.insert(idx, (ordering, message.clone()));
                Ok(message)
            }
            StoreBackend::Sqlite(store) => store.insert_sequenced(pending),
        }
    }

    /// Messages strictly after `after` in ascending total order.
    pub fn history(
        &self,
        organization_id: &str,
        phone: &str,
        after: Option<&OrderingKey>,
        limit: usize,
    ) -> Result<Vec<Message>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .threads
                .get(&thread_key(organization_id, phone))
                .map(|rows| {
                    let start = match after {
                        Some(cursor) => rows.partition_point(|(k, _)| k <= cursor),
                        None => 0,
                    };
                    rows[start..]
                        .iter()
                        .take(limit)
                        .map(|(_, m)| m.clone())
                        .collect()
                })
                .unwrap_or_default()),
            StoreBackend::Sqlite(store) => store.history(organization_id, phone, after, limit),
        }
    }

    /// The newest `limit` messages, returned oldest first.
    pub fn latest(
        &self,
        organization_id: &str,
        phone: &str,
        limit: usize,
    ) -> Result<Vec<Message>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .threads
                .get(&thread_key(organization_id, phone))
                .map(|rows| {
                    let start = rows.len().saturating_sub(limit);
                    rows[start..].iter().map(|(_, m)| m.clone()).collect()
                })
                .unwrap_or_default()),
            StoreBackend::Sqlite(store) => store.latest(organization_id, phone, limit),
        }
    }

    pub fn latest_sequence(
        &self,
        organization_id: &str,
        phone: &str,
    ) -> Result<Option<i64>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .threads
                .get(&thread_key(organization_id, phone))
                .and_then(|rows| rows.iter().map(|(k, _)| k.sequence_number).max())),
            StoreBackend::Sqlite(store) => store.latest_sequence(organization_id, phone),
        }
    }

    pub fn lead_for_phone(
        &self,
        organization_id: &str,
        phone: &str,
    ) -> Result<Option<String>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .lead_links
                .get(&scoped(organization_id, phone))
                .cloned()),
            StoreBackend::Sqlite(store) => store.lead_for_phone(organization_id, phone),
        }
    }

    pub fn phone_for_lead(
        &self,
        organization_id: &str,
        lead_id: &str,
    ) -> Result<Option<String>, String> {
        match self {
            StoreBackend::Memory(store) => {
                let prefix = format!("{organization_id}:");
                let mut phones: Vec<&String> = store
                    .lead_links
                    .iter()
                    .filter(|(k, v)| k.starts_with(&prefix) && v.as_str() == lead_id)
                    .map(|(k, _)| k)
                    .collect();
                phones.sort();
                Ok(phones
                    .first()
                    .map(|k| k[prefix.len()..].to_string()))
            }
            StoreBackend::Sqlite(store) => store.phone_for_lead(organization_id, lead_id),
        }
    }

    /// Links a phone thread to a lead unless it is already linked; returns
    /// the lead that owns the thread afterwards.
    pub fn link_lead(
        &mut self,
        organization_id: &str,
        phone: &str,
        lead_id: &str,
    ) -> Result<String, String> {
        match self {
            StoreBackend::Memory(store) => {
                let key = scoped(organization_id, phone);
                if let Some(existing) = store.lead_links.get(&key) {
                    return Ok(existing.clone());
                }
                store.lead_links.insert(key, lead_id.to_string());
                if let Some(rows) = store.threads.get_mut(&thread_key(organization_id, phone)) {
                    for (_, message) in rows.iter_mut() {
                        if message.lead_id.is_none() {
                            message.lead_id = Some(lead_id.to_string());
                        }
                    }
                }
                Ok(lead_id.to_string())
            }
            StoreBackend::Sqlite(store) => store.link_lead(organization_id, phone, lead_id),
        }
    }

    pub fn alias_target(
        &self,
        organization_id: &str,
        alias: &str,
    ) -> Result<Option<String>, String> {
        match self {
            StoreBackend::Memory(store) => {
                Ok(store.aliases.get(&scoped(organization_id, alias)).cloned())
            }
            StoreBackend::Sqlite(store) => store.alias_target(organization_id, alias),
        }
    }

    /// First write wins: an alias keeps the lead it was first bound to.
    pub fn bind_alias(
        &mut self,
        organization_id: &str,
        alias: &str,
        lead_id: &str,
    ) -> Result<String, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .aliases
                .entry(scoped(organization_id, alias))
                .or_insert_with(|| lead_id.to_string())
                .clone()),
            StoreBackend::Sqlite(store) => store.bind_alias(organization_id, alias, lead_id),
        }
    }

    pub fn aliases_of(&self, organization_id: &str, lead_id: &str) -> Result<Vec<String>, String> {
        match self {
            StoreBackend::Memory(store) => {
                let prefix = format!("{organization_id}:");
                let mut aliases: Vec<String> = store
                    .aliases
                    .iter()
                    .filter(|(k, v)| k.starts_with(&prefix) && v.as_str() == lead_id)
                    .map(|(k, _)| k[prefix.len()..].to_string())
                    .collect();
                aliases.sort();
                Ok(aliases)
            }
            StoreBackend::Sqlite(store) => store.aliases_of(organization_id, lead_id),
        }
    }

    pub fn save_call(&mut self, call: &CallSession) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .calls
                    .insert(call.conversation_id.clone(), call.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.save_call(call),
        }
    }

    pub fn find_call(&self, conversation_id: &str) -> Result<Option<CallSession>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.calls.get(conversation_id).cloned()),
            StoreBackend::Sqlite(store) => store.find_call(conversation_id),
        }
    }

    pub fn purge_thread(&mut self, organization_id: &str, phone: &str) -> Result<u64, String> {
        match self {
            StoreBackend::Memory(store) => {
                let key = thread_key(organization_id, phone);
                store.counters.remove(&key);
                Ok(store
                    .threads
                    .remove(&key)
                    .map(|rows| rows.len() as u64)
                    .unwrap_or(0))
            }
            StoreBackend::Sqlite(store) => store.purge_thread(organization_id, phone),
        }
    }

    /// Numbers rows written before sequencing existed. Returns how many rows
    /// received a number; zero on a second run.
    pub fn backfill_sequences(&mut self) -> Result<usize, String> {
        match self {
            StoreBackend::Memory(_) => Ok(0),
            StoreBackend::Sqlite(store) => store.backfill_sequences(),
        }
    }
}

impl MemoryStore {
    fn next_sequence(&mut self, thread: &str) -> i64 {
        let counter = self.counters.entry(thread.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

const MESSAGE_COLUMNS: &str = "id, organization_id, lead_id, phone, channel, direction, sent_by, \
     content, timestamp_ms, sequence_number, created_at_ms, external_ref";

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                lead_id TEXT,
                phone TEXT NOT NULL,
                channel TEXT NOT NULL,
                direction TEXT NOT NULL,
                sent_by TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                sequence_number INTEGER,
                created_at_ms INTEGER NOT NULL,
                external_ref TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS messages_thread_sequence
                ON messages (organization_id, phone, sequence_number);
            CREATE UNIQUE INDEX IF NOT EXISTS messages_thread_external_ref
                ON messages (organization_id, phone, external_ref)
                WHERE external_ref IS NOT NULL;
            CREATE INDEX IF NOT EXISTS messages_lead
                ON messages (organization_id, lead_id);
            CREATE INDEX IF NOT EXISTS messages_thread_order
                ON messages (organization_id, phone, timestamp_ms, sequence_number, created_at_ms, id);
            CREATE TABLE IF NOT EXISTS thread_counters (
                organization_id TEXT NOT NULL,
                phone TEXT NOT NULL,
                last_sequence INTEGER NOT NULL,
                PRIMARY KEY (organization_id, phone)
            );
            CREATE TABLE IF NOT EXISTS lead_links (
                organization_id TEXT NOT NULL,
                phone TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                PRIMARY KEY (organization_id, phone)
            );
            CREATE INDEX IF NOT EXISTS lead_links_lead
                ON lead_links (organization_id, lead_id);
            CREATE TABLE IF NOT EXISTS lead_aliases (
                organization_id TEXT NOT NULL,
                alias TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                PRIMARY KEY (organization_id, alias)
            );
            CREATE TABLE IF NOT EXISTS voice_calls (
                conversation_id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                phone TEXT NOT NULL,
                lead_id TEXT,
                started_at_ms INTEGER NOT NULL
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn find_by_external_ref(
        &self,
        organization_id: &str,
        phone: &str,
        external_ref: &str,
    ) -> Result<Option<Message>, String> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE organization_id = ?1 AND phone = ?2 AND external_ref = ?3"
                ),
                params![organization_id, phone, external_ref],
                row_to_message,
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn insert_sequenced(&mut self, pending: PendingMessage) -> Result<Message, String> {
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        let sequence = next_sequence(&tx, &pending.organization_id, &pending.phone)?;
        tx.execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                pending.id,
                pending.organization_id,
                pending.lead_id,
                pending.phone,
                pending.channel.as_str(),
                pending.direction.as_str(),
                pending.sent_by.as_str(),
                pending.content,
                pending.timestamp_ms,
                sequence,
                pending.created_at_ms,
                pending.external_ref
            ],
        )
        .map_err(|e| e.to_string())?;
        tx.commit().map_err(|e| e.to_string())?;
        Ok(pending.into_message(sequence))
    }

    fn history(
        &self,
        organization_id: &str,
        phone: &str,
        after: Option<&OrderingKey>,
        limit: usize,
    ) -> Result<Vec<Message>, String> {
        let floor = OrderingKey {
            timestamp_ms: i64::MIN,
            sequence_number: i64::MIN,
            created_at_ms: i64::MIN,
            id: String::new(),
        };
        let after = after.unwrap_or(&floor);
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE organization_id = ?1 AND phone = ?2
                   AND (timestamp_ms, sequence_number, created_at_ms, id) > (?3, ?4, ?5, ?6)
                 ORDER BY timestamp_ms, sequence_number, created_at_ms, id
                 LIMIT ?7"
            ))
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(
                params![
                    organization_id,
                    phone,
                    after.timestamp_ms,
                    after.sequence_number,
                    after.created_at_ms,
                    after.id,
                    limit as i64
                ],
                row_to_message,
            )
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())
    }

    fn latest(
        &self,
        organization_id: &str,
        phone: &str,
        limit: usize,
    ) -> Result<Vec<Message>, String> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE organization_id = ?1 AND phone = ?2
                 ORDER BY timestamp_ms DESC, sequence_number DESC, created_at_ms DESC, id DESC
                 LIMIT ?3"
            ))
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![organization_id, phone, limit as i64], row_to_message)
            .map_err(|e| e.to_string())?;
        let mut messages = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        messages.reverse();
        Ok(messages)
    }

    fn latest_sequence(&self, organization_id: &str, phone: &str) -> Result<Option<i64>, String> {
        self.conn
            .query_row(
                "SELECT MAX(sequence_number) FROM messages WHERE organization_id = ?1 AND phone = ?2",
                params![organization_id, phone],
                |row| row.get::<_, Option<i64>>(0),
            )
            .map_err(|e| e.to_string())
    }

    fn lead_for_phone(&self, organization_id: &str, phone: &str) -> Result<Option<String>, String> {
        self.conn
            .query_row(
                "SELECT lead_id FROM lead_links WHERE organization_id = ?1 AND phone = ?2",
                params![organization_id, phone],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn phone_for_lead(&self, organization_id: &str, lead_id: &str) -> Result<Option<String>, String> {
        self.conn
            .query_row(
                "SELECT phone FROM lead_links WHERE organization_id = ?1 AND lead_id = ?2
                 ORDER BY phone LIMIT 1",
                params![organization_id, lead_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn link_lead(&mut self, organization_id: &str, phone: &str, lead_id: &str) -> Result<String, String> {
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        let inserted = tx
            .execute(
                "INSERT INTO lead_links (organization_id, phone, lead_id, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(organization_id, phone) DO NOTHING",
                params![
                    organization_id,
                    phone,
                    lead_id,
                    chrono::Utc::now().timestamp_millis()
                ],
            )
            .map_err(|e| e.to_string())?;
        if inserted > 0 {
            tx.execute(
                "UPDATE messages SET lead_id = ?3
                 WHERE organization_id = ?1 AND phone = ?2 AND lead_id IS NULL",
                params![organization_id, phone, lead_id],
            )
            .map_err(|e| e.to_string())?;
        }
        let owner: String = tx
            .query_row(
                "SELECT lead_id FROM lead_links WHERE organization_id = ?1 AND phone = ?2",
                params![organization_id, phone],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        tx.commit().map_err(|e| e.to_string())?;
        Ok(owner)
    }

    fn alias_target(&self, organization_id: &str, alias: &str) -> Result<Option<String>, String> {
        self.conn
            .query_row(
                "SELECT lead_id FROM lead_aliases WHERE organization_id = ?1 AND alias = ?2",
                params![organization_id, alias],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn bind_alias(&mut self, organization_id: &str, alias: &str, lead_id: &str) -> Result<String, String> {
        self.conn
            .execute(
                "INSERT INTO lead_aliases (organization_id, alias, lead_id, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(organization_id, alias) DO NOTHING",
                params![
                    organization_id,
                    alias,
                    lead_id,
                    chrono::Utc::now().timestamp_millis()
                ],
            )
            .map_err(|e| e.to_string())?;
        self.conn
            .query_row(
                "SELECT lead_id FROM lead_aliases WHERE organization_id = ?1 AND alias = ?2",
                params![organization_id, alias],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())
    }

    fn aliases_of(&self, organization_id: &str, lead_id: &str) -> Result<Vec<String>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT alias FROM lead_aliases WHERE organization_id = ?1 AND lead_id = ?2
                 ORDER BY alias",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![organization_id, lead_id], |row| row.get(0))
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<String>, _>>()
            .map_err(|e| e.to_string())
    }

    fn save_call(&mut self, call: &CallSession) -> Result<(), String> {
        self.conn
            .execute(
                "
                INSERT INTO voice_calls (conversation_id, organization_id, phone, lead_id, started_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(conversation_id) DO UPDATE SET
                    organization_id=excluded.organization_id,
                    phone=excluded.phone,
                    lead_id=excluded.lead_id
                ",
                params![
                    call.conversation_id,
                    call.organization_id,
                    call.phone,
                    call.lead_id,
                    call.started_at_ms
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn find_call(&self, conversation_id: &str) -> Result<Option<CallSession>, String> {
        self.conn
            .query_row(
                "SELECT conversation_id, organization_id, phone, lead_id, started_at_ms
                 FROM voice_calls WHERE conversation_id = ?1",
                params![conversation_id],
                |row| {
                    Ok(CallSession {
                        conversation_id: row.get(0)?,
                        organization_id: row.get(1)?,
                        phone: row.get(2)?,
                        lead_id: row.get(3)?,
                        started_at_ms: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn purge_thread(&mut self, organization_id: &str, phone: &str) -> Result<u64, String> {
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        let deleted = tx
            .execute(
                "DELETE FROM messages WHERE organization_id = ?1 AND phone = ?2",
                params![organization_id, phone],
            )
            .map_err(|e| e.to_string())?;
        tx.execute(
            "DELETE FROM thread_counters WHERE organization_id = ?1 AND phone = ?2",
            params![organization_id, phone],
        )
        .map_err(|e| e.to_string())?;
        tx.commit().map_err(|e| e.to_string())?;
        Ok(deleted as u64)
    }

    fn backfill_sequences(&mut self) -> Result<usize, String> {
        let tx = self.conn.transaction().map_err(|e| e.to_string())?;
        let threads: Vec<(String, String)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT DISTINCT organization_id, phone FROM messages
                     WHERE sequence_number IS NULL ORDER BY organization_id, phone",
                )
                .map_err(|e| e.to_string())?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| e.to_string())?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?
        };

        let mut numbered = 0usize;
        for (organization_id, phone) in threads {
            let highest: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(sequence_number), 0) FROM messages
                     WHERE organization_id = ?1 AND phone = ?2",
                    params![organization_id, phone],
                    |row| row.get(0),
                )
                .map_err(|e| e.to_string())?;
            let counter: i64 = tx
                .query_row(
                    "SELECT last_sequence FROM thread_counters
                     WHERE organization_id = ?1 AND phone = ?2",
                    params![organization_id, phone],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| e.to_string())?
                .unwrap_or(0);

            let ids: Vec<String> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT id FROM messages
                         WHERE organization_id = ?1 AND phone = ?2 AND sequence_number IS NULL
                         ORDER BY timestamp_ms ASC, created_at_ms ASC, id ASC",
                    )
                    .map_err(|e| e.to_string())?;
                let rows = stmt
                    .query_map(params![organization_id, phone], |row| row.get(0))
                    .map_err(|e| e.to_string())?;
                rows.collect::<Result<Vec<_>, _>>()
                    .map_err(|e| e.to_string())?
            };

            let mut next = highest.max(counter);
            for id in &ids {
                next += 1;
                tx.execute(
                    "UPDATE messages SET sequence_number = ?1 WHERE id = ?2",
                    params![next, id],
                )
                .map_err(|e| e.to_string())?;
            }
            tx.execute(
                "
                INSERT INTO thread_counters (organization_id, phone, last_sequence)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(organization_id, phone) DO UPDATE SET last_sequence = excluded.last_sequence
                ",
                params![organization_id, phone, next],
            )
            .map_err(|e| e.to_string())?;
            numbered += ids.len();
        }
        tx.commit().map_err(|e| e.to_string())?;
        Ok(numbered)
    }
}

/// Atomically bumps the thread counter inside the caller's transaction.
fn next_sequence(tx: &Transaction<'_>, organization_id: &str, phone: &str) -> Result<i64, String> {
    tx.query_row(
        "
        INSERT INTO thread_counters (organization_id, phone, last_sequence)
        VALUES (?1, ?2, 1)
        ON CONFLICT(organization_id, phone) DO UPDATE SET last_sequence = last_sequence + 1
        RETURNING last_sequence
        ",
        params![organization_id, phone],
        |row| row.get(0),
    )
    .map_err(|e| format!("sequence assignment failed: {e}"))
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let channel: String = row.get(4)?;
    let direction: String = row.get(5)?;
    let sent_by: String = row.get(6)?;
    let timestamp_ms: i64 = row.get(8)?;
    let created_at_ms: i64 = row.get(10)?;
    Ok(Message {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        lead_id: row.get(2)?,
        phone_number_normalized: row.get(3)?,
        channel: Channel::parse(&channel)
            .ok_or_else(|| invalid_column(4, "channel"))?,
        direction: Direction::parse(&direction)
            .ok_or_else(|| invalid_column(5, "direction"))?,
        sent_by: SentBy::parse(&sent_by).ok_or_else(|| invalid_column(6, "sent_by"))?,
        content: row.get(7)?,
        timestamp: format_millis(timestamp_ms),
        sequence_number: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
        created_at: format_millis(created_at_ms),
        external_ref: row.get(11)?,
    })
}

fn invalid_column(idx: usize, name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, name.to_string(), Type::Text)
}
