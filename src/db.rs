use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::models::Event;

/// Store writes are chunked so a huge batch never exceeds statement limits.
pub const WRITE_CHUNK_SIZE: usize = 200;

#[derive(Debug, Clone)]
pub struct LocationRow {
    pub name_ja: Option<String>,
    pub name_en: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VenueRow {
    pub name: String,
    pub canonical: String,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events(
                url TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                first_seen_utc TEXT NOT NULL,
                last_seen_utc TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS locations(
                name_ja TEXT,
                name_en TEXT,
                timezone TEXT
            );
            CREATE TABLE IF NOT EXISTS venues(
                name TEXT PRIMARY KEY,
                canonical TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Idempotent upsert keyed on `url`: writing the same event twice
    /// overwrites the payload, never duplicates the row.
    pub fn upsert_events(&mut self, events: &[Event]) -> rusqlite::Result<()> {
        let now = Utc::now().to_rfc3339();
        for chunk in events.chunks(WRITE_CHUNK_SIZE) {
            let tx = self.conn.transaction()?;
            for event in chunk {
                let payload = serde_json::to_string(event).map_err(|err| {
                    rusqlite::Error::ToSqlConversionFailure(Box::new(err))
                })?;
                tx.execute(
                    "INSERT INTO events (url, payload, first_seen_utc, last_seen_utc)
                     VALUES (?1, ?2, ?3, ?3)
                     ON CONFLICT(url) DO UPDATE SET
                       payload = excluded.payload,
                       last_seen_utc = excluded.last_seen_utc",
                    params![event.url, payload, now],
                )?;
            }
            tx.commit()?;
        }
        Ok(())
    }

    /// Stored URLs containing `pattern`, used to scope reconciliation to one
    /// source's rows.
    pub fn urls_matching(&self, pattern: &str) -> rusqlite::Result<Vec<String>> {
        let like = format!("%{pattern}%");
        let mut stmt = self
            .conn
            .prepare("SELECT url FROM events WHERE url LIKE ?1")?;
        let rows = stmt.query_map(params![like], |row| row.get::<_, String>(0))?;
        rows.collect()
    }

    pub fn delete_urls(&mut self, urls: &[String]) -> rusqlite::Result<usize> {
        let mut deleted = 0;
        for chunk in urls.chunks(WRITE_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!("DELETE FROM events WHERE url IN ({placeholders})");
            let deleted_now = self
                .conn
                .execute(&sql, rusqlite::params_from_iter(chunk.iter()))?;
            deleted += deleted_now;
        }
        Ok(deleted)
    }

    pub fn load_payload(&self, url: &str) -> rusqlite::Result<Option<String>> {
        use rusqlite::OptionalExtension;
        self.conn
            .query_row(
                "SELECT payload FROM events WHERE url = ?1",
                params![url],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn count_events(&self) -> rusqlite::Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
    }

    pub fn load_locations(&self) -> rusqlite::Result<Vec<LocationRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name_ja, name_en, timezone FROM locations")?;
        let rows = stmt.query_map([], |row| {
            Ok(LocationRow {
                name_ja: row.get(0)?,
                name_en: row.get(1)?,
                timezone: row.get(2)?,
            })
        })?;
        rows.collect()
    }

    pub fn load_venues(&self) -> rusqlite::Result<Vec<VenueRow>> {
        let mut stmt = self.conn.prepare("SELECT name, canonical FROM venues")?;
        let rows = stmt.query_map([], |row| {
            Ok(VenueRow {
                name: row.get(0)?,
                canonical: row.get(1)?,
            })
        })?;
        rows.collect()
    }

    /// Registers a venue name first seen this run so later runs canonicalize
    /// it consistently.
    pub fn insert_venue(&mut self, name: &str, canonical: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO venues (name, canonical) VALUES (?1, ?2)
             ON CONFLICT(name) DO NOTHING",
            params![name, canonical],
        )?;
        Ok(())
    }

    pub fn insert_location(
        &mut self,
        name_ja: Option<&str>,
        name_en: Option<&str>,
        timezone: Option<&str>,
    ) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO locations (name_ja, name_en, timezone) VALUES (?1, ?2, ?3)",
            params![name_ja, name_en, timezone],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventDraft;

    fn event(url: &str) -> Event {
        EventDraft {
            url: Some(url.to_string()),
            title: vec!["Test Show".to_string()],
            ..EventDraft::default()
        }
        .build()
        .expect("valid event")
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut store = Store::open_in_memory().expect("store");
        let batch = vec![event("https://x/1"), event("https://x/2")];
        store.upsert_events(&batch).expect("first upsert");
        store.upsert_events(&batch).expect("second upsert");
        assert_eq!(store.count_events().unwrap(), 2);
    }

    #[test]
    fn urls_matching_scopes_by_pattern() {
        let mut store = Store::open_in_memory().expect("store");
        store
            .upsert_events(&[
                event("https://songkick.com/e/1"),
                event("https://eplus.jp/e/2"),
            ])
            .expect("upsert");
        let matched = store.urls_matching("songkick.com").unwrap();
        assert_eq!(matched, vec!["https://songkick.com/e/1".to_string()]);
    }

    #[test]
    fn delete_urls_removes_only_named_rows() {
        let mut store = Store::open_in_memory().expect("store");
        store
            .upsert_events(&[event("https://x/1"), event("https://x/2")])
            .expect("upsert");
        let deleted = store
            .delete_urls(&["https://x/1".to_string(), "https://x/404".to_string()])
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count_events().unwrap(), 1);
    }

    #[test]
    fn venue_registry_keeps_first_canonical() {
        let mut store = Store::open_in_memory().expect("store");
        store.insert_venue("Zepp Tokyo", "Zepp Tokyo").unwrap();
        store.insert_venue("Zepp Tokyo", "Other").unwrap();
        let venues = store.load_venues().unwrap();
        assert_eq!(venues.len(), 1);
        assert_eq!(venues[0].canonical, "Zepp Tokyo");
    }
}
