use crate::models::{ConversationSummaryRow, MessageMeta, MessageRow, PresenceRow, UserRow};
use crate::{Database, PRESENCE_STALE_SECS, TYPING_TTL_SECS, fmt_ts, parse_ts};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rally_types::models::{Presence, PresenceStatus};
use rusqlite::{Transaction, params};

/// Canonical key for an unordered participant pair. The UNIQUE constraint on
/// this column is what closes the concurrent find-or-create race.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

impl Database {
    // -- Users (profile mirror) --

    pub fn upsert_user(
        &self,
        id: &str,
        display_name: &str,
        avatar_url: Option<&str>,
        now: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, display_name, avatar_url, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     display_name = excluded.display_name,
                     avatar_url = excluded.avatar_url",
                params![id, display_name, avatar_url, now],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, display_name, avatar_url, created_at FROM users WHERE id = ?1",
            )?;
            let row = stmt
                .query_row([id], |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        avatar_url: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    // -- Conversations --

    /// Find-or-create the 1:1 conversation between requester and target.
    /// Returns (conversation_id, existing). The caller supplies the id used
    /// if a new conversation is created.
    pub fn start_conversation(
        &self,
        new_id: &str,
        requester_id: &str,
        target_id: &str,
        now: &str,
    ) -> Result<(String, bool)> {
        let key = pair_key(requester_id, target_id);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if let Some(existing) = query_conversation_by_pair(&tx, &key)? {
                tx.commit()?;
                return Ok((existing, true));
            }

            match tx.execute(
                "INSERT INTO conversations (id, created_by, pair_key, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![new_id, requester_id, &key, now],
            ) {
                Ok(_) => {}
                // Another writer won the race between our SELECT and INSERT
                // (possible with a second process on the same file); the
                // pair constraint fires and we adopt the winner's row.
                Err(e) if is_unique_violation(&e) => {
                    let existing = query_conversation_by_pair(&tx, &key)?
                        .ok_or_else(|| anyhow::anyhow!("pair conflict without a row"))?;
                    tx.commit()?;
                    return Ok((existing, true));
                }
                Err(e) => return Err(e.into()),
            }

            tx.execute(
                "INSERT INTO participants (conversation_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3), (?1, ?4, ?3)",
                params![new_id, requester_id, now, target_id],
            )?;

            tx.commit()?;
            Ok((new_id.to_string(), false))
        })
    }

    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
                    params![conversation_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn conversation_exists(&self, conversation_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM conversations WHERE id = ?1",
                    [conversation_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Caller's inbox: one row per conversation with the other participant's
    /// profile, the newest message, and the caller's unread count. Ordered
    /// by conversation activity, newest first.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummaryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.updated_at,
                        u.id, u.display_name, u.avatar_url,
                        (SELECT m.sender_id FROM messages m WHERE m.conversation_id = c.id
                          ORDER BY m.created_at DESC, m.seq DESC LIMIT 1),
                        (SELECT m.content FROM messages m WHERE m.conversation_id = c.id
                          ORDER BY m.created_at DESC, m.seq DESC LIMIT 1),
                        (SELECT m.created_at FROM messages m WHERE m.conversation_id = c.id
                          ORDER BY m.created_at DESC, m.seq DESC LIMIT 1),
                        (SELECT COUNT(*) FROM messages m
                          WHERE m.conversation_id = c.id AND m.sender_id <> ?1
                            AND (p.last_read_at IS NULL OR m.created_at > p.last_read_at))
                 FROM participants p
                 JOIN conversations c ON c.id = p.conversation_id
                 JOIN participants op ON op.conversation_id = c.id AND op.user_id <> ?1
                 JOIN users u ON u.id = op.user_id
                 WHERE p.user_id = ?1
                 ORDER BY c.updated_at DESC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationSummaryRow {
                        id: row.get(0)?,
                        updated_at: row.get(1)?,
                        partner_id: row.get(2)?,
                        partner_display_name: row.get(3)?,
                        partner_avatar_url: row.get(4)?,
                        last_sender_id: row.get(5)?,
                        last_content: row.get(6)?,
                        last_created_at: row.get(7)?,
                        unread_count: row.get(8)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Messages --

    /// Insert a message and bump the conversation's updated_at, atomically.
    /// Returns the per-conversation sequence number assigned to the message.
    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        now: &str,
    ) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, seq, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, conversation_id, sender_id, content, seq, now],
            )?;

            tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![now, conversation_id],
            )?;

            tx.commit()?;
            Ok(seq)
        })
    }

    /// Messages in chronological (ascending) order, ties broken by seq.
    /// `before` is a created_at cursor for fetching older history; `limit`
    /// bounds the page to the newest messages within the window.
    pub fn list_messages(
        &self,
        conversation_id: &str,
        limit: Option<u32>,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT m.id, m.conversation_id, m.sender_id, u.display_name, u.avatar_url,
                        m.content, m.seq, m.created_at, m.delivered_at, m.read_at
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.conversation_id = ?1",
            );

            let mut params_vec: Vec<&dyn rusqlite::types::ToSql> = vec![&conversation_id];
            if let Some(ref cursor) = before {
                sql.push_str(" AND m.created_at < ?2");
                params_vec.push(cursor);
            }
            sql.push_str(" ORDER BY m.created_at DESC, m.seq DESC");
            if let Some(n) = limit {
                sql.push_str(&format!(" LIMIT {}", n));
            }

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(params_vec.as_slice(), |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        sender_id: row.get(2)?,
                        sender_display_name: row
                            .get::<_, Option<String>>(3)?
                            .unwrap_or_else(|| "unknown".to_string()),
                        sender_avatar_url: row.get(4)?,
                        content: row.get(5)?,
                        seq: row.get(6)?,
                        created_at: row.get(7)?,
                        delivered_at: row.get(8)?,
                        read_at: row.get(9)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            // Queried newest-first to make LIMIT take the newest page;
            // callers want chronological order.
            rows.reverse();
            Ok(rows)
        })
    }

    pub fn message_meta(&self, message_id: &str) -> Result<Option<MessageMeta>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT conversation_id, sender_id, delivered_at FROM messages WHERE id = ?1",
                    [message_id],
                    |row| {
                        Ok(MessageMeta {
                            conversation_id: row.get(0)?,
                            sender_id: row.get(1)?,
                            delivered_at: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    // -- Delivery / read tracking --

    /// Set delivered_at if currently null. Returns true when this call made
    /// the transition; false means it was already delivered (no-op).
    pub fn mark_delivered(&self, message_id: &str, now: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET delivered_at = ?1
                 WHERE id = ?2 AND delivered_at IS NULL",
                params![now, message_id],
            )?;
            Ok(changed == 1)
        })
    }

    /// Mark every unread message from the other participant as read and
    /// advance the reader's watermark. Read implies delivered, so a still
    /// null delivered_at is set in the same statement. Returns the number of
    /// messages newly marked.
    pub fn mark_read(&self, conversation_id: &str, reader_id: &str, now: &str) -> Result<u64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let marked = tx.execute(
                "UPDATE messages
                 SET read_at = ?1, delivered_at = COALESCE(delivered_at, ?1)
                 WHERE conversation_id = ?2 AND sender_id <> ?3 AND read_at IS NULL",
                params![now, conversation_id, reader_id],
            )?;

            tx.execute(
                "UPDATE participants SET last_read_at = ?1
                 WHERE conversation_id = ?2 AND user_id = ?3",
                params![now, conversation_id, reader_id],
            )?;

            tx.commit()?;
            Ok(marked as u64)
        })
    }

    /// Aggregate unread count across every conversation the user is in.
    /// A null watermark counts every partner message as unread.
    pub fn unread_count(&self, user_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*)
                 FROM messages m
                 JOIN participants p ON p.conversation_id = m.conversation_id
                 WHERE p.user_id = ?1 AND m.sender_id <> ?1
                   AND (p.last_read_at IS NULL OR m.created_at > p.last_read_at)",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    // -- Typing indicators --

    pub fn set_typing(&self, conversation_id: &str, user_id: &str, now: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO typing_indicators (conversation_id, user_id, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(conversation_id, user_id) DO UPDATE SET
                     updated_at = excluded.updated_at",
                params![conversation_id, user_id, now],
            )?;
            Ok(())
        })
    }

    pub fn clear_typing(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "DELETE FROM typing_indicators WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id, user_id],
            )?;
            Ok(())
        })
    }

    /// Users currently typing in a conversation, the reader excluded. Rows
    /// older than the TTL are treated as stale, so a client that disconnected
    /// mid-type without a stop signal reads as not typing.
    pub fn typing_users(
        &self,
        conversation_id: &str,
        exclude_user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let cutoff = fmt_ts(now - Duration::seconds(TYPING_TTL_SECS));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM typing_indicators
                 WHERE conversation_id = ?1 AND user_id <> ?2 AND updated_at > ?3",
            )?;
            let rows = stmt
                .query_map(params![conversation_id, exclude_user_id, cutoff], |row| {
                    row.get(0)
                })?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(rows)
        })
    }

    // -- Presence --

    /// Refresh a user's presence from a heartbeat. Returns true when this
    /// heartbeat transitioned the user to online (previously absent,
    /// explicitly offline, or stale), so the caller can fan out exactly one
    /// PresenceUpdate per transition.
    pub fn heartbeat(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let now_s = fmt_ts(now);
        let stale_cutoff = fmt_ts(now - Duration::seconds(PRESENCE_STALE_SECS));

        self.with_conn_mut(|conn| {
            let previous: Option<(String, String)> = conn
                .query_row(
                    "SELECT status, last_seen FROM presence WHERE user_id = ?1",
                    [user_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let was_online = matches!(
                &previous,
                Some((status, last_seen)) if status == "online" && *last_seen >= stale_cutoff
            );

            conn.execute(
                "INSERT INTO presence (user_id, status, last_seen)
                 VALUES (?1, 'online', ?2)
                 ON CONFLICT(user_id) DO UPDATE SET
                     status = 'online', last_seen = excluded.last_seen",
                params![user_id, now_s],
            )?;

            Ok(!was_online)
        })
    }

    /// Best-effort explicit offline, called on client teardown.
    pub fn mark_offline(&self, user_id: &str, now: DateTime<Utc>) -> Result<()> {
        let now_s = fmt_ts(now);
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO presence (user_id, status, last_seen)
                 VALUES (?1, 'offline', ?2)
                 ON CONFLICT(user_id) DO UPDATE SET
                     status = 'offline', last_seen = excluded.last_seen",
                params![user_id, now_s],
            )?;
            Ok(())
        })
    }

    /// Presence with staleness applied: no record or a heartbeat older than
    /// the staleness window reads as offline.
    pub fn get_presence(&self, user_id: &str, now: DateTime<Utc>) -> Result<Presence> {
        let stale_cutoff = fmt_ts(now - Duration::seconds(PRESENCE_STALE_SECS));

        let row = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT user_id, status, last_seen FROM presence WHERE user_id = ?1",
                    [user_id],
                    |row| {
                        Ok(PresenceRow {
                            user_id: row.get(0)?,
                            status: row.get(1)?,
                            last_seen: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })?;

        Ok(match row {
            None => Presence {
                status: PresenceStatus::Offline,
                last_seen: None,
            },
            Some(row) => {
                let status = if row.status == "online" && row.last_seen >= stale_cutoff {
                    PresenceStatus::Online
                } else {
                    PresenceStatus::Offline
                };
                Presence {
                    status,
                    last_seen: parse_ts(&row.last_seen),
                }
            }
        })
    }
}

fn query_conversation_by_pair(tx: &Transaction<'_>, key: &str) -> Result<Option<String>> {
    let id = tx
        .query_row(
            "SELECT id FROM conversations WHERE pair_key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_ts;
    use chrono::TimeZone;

    fn db_with_users(users: &[(&str, &str)]) -> Database {
        let db = Database::open_in_memory().unwrap();
        for (id, name) in users {
            db.upsert_user(id, name, None, &now_ts()).unwrap();
        }
        db
    }

    const ANA: &str = "0a0a0a0a-0000-0000-0000-000000000001";
    const BEN: &str = "0b0b0b0b-0000-0000-0000-000000000002";
    const CARA: &str = "0c0c0c0c-0000-0000-0000-000000000003";

    fn seeded() -> Database {
        db_with_users(&[(ANA, "Ana"), (BEN, "Ben"), (CARA, "Cara")])
    }

    #[test]
    fn start_conversation_deduplicates_unordered_pair() {
        let db = seeded();

        let (c1, existing) = db.start_conversation("conv-1", ANA, BEN, &now_ts()).unwrap();
        assert_eq!(c1, "conv-1");
        assert!(!existing);

        // Reverse direction resolves to the same conversation
        let (c2, existing) = db.start_conversation("conv-2", BEN, ANA, &now_ts()).unwrap();
        assert_eq!(c2, "conv-1");
        assert!(existing);

        // Both participants were registered
        assert!(db.is_participant("conv-1", ANA).unwrap());
        assert!(db.is_participant("conv-1", BEN).unwrap());
        assert!(!db.is_participant("conv-1", CARA).unwrap());
    }

    #[test]
    fn pair_constraint_rejects_duplicate_rows() {
        let db = seeded();
        db.start_conversation("conv-1", ANA, BEN, &now_ts()).unwrap();

        // A second row for the same pair trips the UNIQUE constraint even if
        // the find-or-create path is bypassed entirely.
        let err = db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO conversations (id, created_by, pair_key, created_at, updated_at)
                     VALUES ('conv-x', ?1, ?2, '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z')",
                    params![ANA, pair_key(ANA, BEN)],
                )?;
                Ok(())
            })
            .unwrap_err();
        let sqlite_err = err.downcast_ref::<rusqlite::Error>().unwrap();
        assert!(is_unique_violation(sqlite_err));
    }

    #[test]
    fn concurrent_starts_converge_on_one_conversation() {
        use std::sync::Arc;

        let db = Arc::new(seeded());
        let mut handles = Vec::new();

        // Both sides race find-or-create from several threads at once;
        // exactly one creation may win and everyone must agree on its id.
        for i in 0..8 {
            let db = db.clone();
            handles.push(std::thread::spawn(move || {
                let (requester, target) = if i % 2 == 0 { (ANA, BEN) } else { (BEN, ANA) };
                db.start_conversation(&format!("conv-{}", i), requester, target, &now_ts())
                    .unwrap()
            }));
        }

        let results: Vec<(String, bool)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winner = &results.iter().find(|(_, existing)| !existing).unwrap().0;
        assert!(results.iter().all(|(id, _)| id == winner));
        assert_eq!(results.iter().filter(|(_, existing)| !existing).count(), 1);
    }

    #[test]
    fn pair_key_is_order_independent() {
        assert_eq!(pair_key(ANA, BEN), pair_key(BEN, ANA));
        assert_ne!(pair_key(ANA, BEN), pair_key(ANA, CARA));
    }

    #[test]
    fn message_ordering_breaks_timestamp_ties_by_seq() {
        let db = seeded();
        let (cid, _) = db.start_conversation("conv-1", ANA, BEN, &now_ts()).unwrap();

        // Same wall-clock timestamp for both inserts
        let ts = "2026-03-01T10:00:00.000000Z";
        db.insert_message("m1", &cid, ANA, "first", ts).unwrap();
        db.insert_message("m2", &cid, BEN, "second", ts).unwrap();

        let rows = db.list_messages(&cid, None, None).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "m1");
        assert_eq!(rows[0].seq, 1);
        assert_eq!(rows[1].id, "m2");
        assert_eq!(rows[1].seq, 2);
        assert_eq!(rows[0].sender_display_name, "Ana");
    }

    #[test]
    fn insert_message_bumps_conversation_updated_at() {
        let db = seeded();
        let (cid, _) = db
            .start_conversation("conv-1", ANA, BEN, "2026-03-01T09:00:00.000000Z")
            .unwrap();

        db.insert_message("m1", &cid, ANA, "hola", "2026-03-01T10:00:00.000000Z")
            .unwrap();

        let updated_at: String = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT updated_at FROM conversations WHERE id = ?1",
                    [cid.as_str()],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(updated_at, "2026-03-01T10:00:00.000000Z");
    }

    #[test]
    fn list_messages_honors_limit_and_before_cursor() {
        let db = seeded();
        let (cid, _) = db.start_conversation("conv-1", ANA, BEN, &now_ts()).unwrap();

        for i in 1..=5 {
            let ts = format!("2026-03-01T10:00:0{}.000000Z", i);
            db.insert_message(&format!("m{}", i), &cid, ANA, "x", &ts).unwrap();
        }

        // limit takes the newest page, returned chronologically
        let page = db.list_messages(&cid, Some(2), None).unwrap();
        assert_eq!(page.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), ["m4", "m5"]);

        // before walks further back in history
        let older = db
            .list_messages(&cid, Some(2), Some("2026-03-01T10:00:04.000000Z"))
            .unwrap();
        assert_eq!(older.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), ["m2", "m3"]);
    }

    #[test]
    fn mark_delivered_is_idempotent() {
        let db = seeded();
        let (cid, _) = db.start_conversation("conv-1", ANA, BEN, &now_ts()).unwrap();
        db.insert_message("m1", &cid, ANA, "hola", &now_ts()).unwrap();

        assert!(db.mark_delivered("m1", "2026-03-01T10:00:00.000000Z").unwrap());
        let first = db.message_meta("m1").unwrap().unwrap().delivered_at;
        assert_eq!(first.as_deref(), Some("2026-03-01T10:00:00.000000Z"));

        // Second call is a no-op and does not move the timestamp
        assert!(!db.mark_delivered("m1", "2026-03-01T11:00:00.000000Z").unwrap());
        let second = db.message_meta("m1").unwrap().unwrap().delivered_at;
        assert_eq!(second, first);
    }

    #[test]
    fn mark_read_is_idempotent_and_implies_delivered() {
        let db = seeded();
        let (cid, _) = db.start_conversation("conv-1", ANA, BEN, &now_ts()).unwrap();
        db.insert_message("m1", &cid, ANA, "hola", &now_ts()).unwrap();
        db.insert_message("m2", &cid, ANA, "que tal", &now_ts()).unwrap();

        let marked = db.mark_read(&cid, BEN, &now_ts()).unwrap();
        assert_eq!(marked, 2);

        // Read implies delivered
        let rows = db.list_messages(&cid, None, None).unwrap();
        assert!(rows.iter().all(|m| m.read_at.is_some() && m.delivered_at.is_some()));

        // Second call observes nothing unread
        assert_eq!(db.mark_read(&cid, BEN, &now_ts()).unwrap(), 0);
    }

    #[test]
    fn mark_read_skips_own_messages() {
        let db = seeded();
        let (cid, _) = db.start_conversation("conv-1", ANA, BEN, &now_ts()).unwrap();
        db.insert_message("m1", &cid, BEN, "own message", &now_ts()).unwrap();

        // Ben reading the conversation must not mark his own message
        assert_eq!(db.mark_read(&cid, BEN, &now_ts()).unwrap(), 0);
        assert_eq!(db.mark_read(&cid, ANA, &now_ts()).unwrap(), 1);
    }

    #[test]
    fn unread_counts_follow_the_watermark() {
        let db = seeded();
        assert_eq!(db.unread_count(BEN).unwrap(), 0);

        let (cid, _) = db.start_conversation("conv-1", ANA, BEN, &now_ts()).unwrap();
        for i in 0..3 {
            db.insert_message(&format!("m{}", i), &cid, ANA, "hola", &now_ts()).unwrap();
        }

        // Sender never counts own messages as unread
        assert_eq!(db.unread_count(ANA).unwrap(), 0);
        assert_eq!(db.unread_count(BEN).unwrap(), 3);

        db.mark_read(&cid, BEN, &now_ts()).unwrap();
        assert_eq!(db.unread_count(BEN).unwrap(), 0);

        // A message after the watermark counts again
        db.insert_message("m9", &cid, ANA, "otra", &now_ts()).unwrap();
        assert_eq!(db.unread_count(BEN).unwrap(), 1);
    }

    #[test]
    fn unread_count_sums_across_conversations() {
        let db = seeded();
        let (c1, _) = db.start_conversation("conv-1", ANA, BEN, &now_ts()).unwrap();
        let (c2, _) = db.start_conversation("conv-2", CARA, BEN, &now_ts()).unwrap();

        db.insert_message("m1", &c1, ANA, "hola", &now_ts()).unwrap();
        db.insert_message("m2", &c2, CARA, "hey", &now_ts()).unwrap();
        db.insert_message("m3", &c2, CARA, "you there?", &now_ts()).unwrap();

        assert_eq!(db.unread_count(BEN).unwrap(), 3);
    }

    #[test]
    fn typing_rows_expire_at_read_time() {
        let db = seeded();
        let (cid, _) = db.start_conversation("conv-1", ANA, BEN, &now_ts()).unwrap();

        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        db.set_typing(&cid, ANA, &fmt_ts(t0)).unwrap();

        // Fresh within the TTL, stale after it
        let fresh = db.typing_users(&cid, BEN, t0 + Duration::seconds(2)).unwrap();
        assert_eq!(fresh, vec![ANA.to_string()]);
        let stale = db.typing_users(&cid, BEN, t0 + Duration::seconds(10)).unwrap();
        assert!(stale.is_empty());

        // The typer never sees themselves
        let own = db.typing_users(&cid, ANA, t0 + Duration::seconds(2)).unwrap();
        assert!(own.is_empty());
    }

    #[test]
    fn explicit_stop_clears_typing() {
        let db = seeded();
        let (cid, _) = db.start_conversation("conv-1", ANA, BEN, &now_ts()).unwrap();

        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        db.set_typing(&cid, ANA, &fmt_ts(t0)).unwrap();
        db.clear_typing(&cid, ANA).unwrap();
        assert!(db.typing_users(&cid, BEN, t0).unwrap().is_empty());
    }

    #[test]
    fn presence_heartbeat_and_staleness() {
        let db = seeded();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();

        // Unknown user reads as offline with no last_seen
        let p = db.get_presence(ANA, t0).unwrap();
        assert_eq!(p.status, PresenceStatus::Offline);
        assert!(p.last_seen.is_none());

        // First heartbeat is a transition; a prompt second one is not
        assert!(db.heartbeat(ANA, t0).unwrap());
        assert!(!db.heartbeat(ANA, t0 + Duration::seconds(30)).unwrap());

        let p = db.get_presence(ANA, t0 + Duration::seconds(31)).unwrap();
        assert_eq!(p.status, PresenceStatus::Online);
        assert_eq!(p.last_seen, Some(t0 + Duration::seconds(30)));

        // No heartbeat for 2x the interval reads as offline
        let p = db.get_presence(ANA, t0 + Duration::seconds(120)).unwrap();
        assert_eq!(p.status, PresenceStatus::Offline);

        // A heartbeat after staleness is a transition again
        assert!(db.heartbeat(ANA, t0 + Duration::seconds(120)).unwrap());
    }

    #[test]
    fn explicit_offline_wins_over_recent_heartbeat() {
        let db = seeded();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();

        db.heartbeat(ANA, t0).unwrap();
        db.mark_offline(ANA, t0 + Duration::seconds(1)).unwrap();

        let p = db.get_presence(ANA, t0 + Duration::seconds(2)).unwrap();
        assert_eq!(p.status, PresenceStatus::Offline);
        assert!(p.last_seen.is_some());
    }

    #[test]
    fn inbox_summaries_carry_preview_and_unread() {
        let db = seeded();
        let (c1, _) = db
            .start_conversation("conv-1", ANA, BEN, "2026-03-01T09:00:00.000000Z")
            .unwrap();
        let (c2, _) = db
            .start_conversation("conv-2", CARA, BEN, "2026-03-01T09:30:00.000000Z")
            .unwrap();

        db.insert_message("m1", &c1, ANA, "hola", "2026-03-01T10:00:00.000000Z").unwrap();
        db.insert_message("m2", &c1, ANA, "que tal", "2026-03-01T10:01:00.000000Z").unwrap();

        let inbox = db.list_conversations(BEN).unwrap();
        assert_eq!(inbox.len(), 2);

        // Most recently active first
        assert_eq!(inbox[0].id, c1);
        assert_eq!(inbox[0].partner_display_name, "Ana");
        assert_eq!(inbox[0].last_content.as_deref(), Some("que tal"));
        assert_eq!(inbox[0].unread_count, 2);

        assert_eq!(inbox[1].id, c2);
        assert_eq!(inbox[1].partner_display_name, "Cara");
        assert!(inbox[1].last_content.is_none());
        assert_eq!(inbox[1].unread_count, 0);

        // From Ana's side her own messages are not unread
        let inbox = db.list_conversations(ANA).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].partner_display_name, "Ben");
        assert_eq!(inbox[0].unread_count, 0);
    }
}
