use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use tracing::{debug, info};

use crate::db::Store;
use crate::models::Event;

/// Writes one run's harvest into the store: drop past events, dedup by
/// identity URL, upsert what remains, then reconcile each successful source's
/// rows against what that source reported this run.
pub struct Importer {
    reference_tz: Tz,
    dry_run: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ImportSummary {
    /// Events handed to the importer before filtering.
    pub fetched: usize,
    /// Events surviving the future-date filter and identity dedup.
    pub kept: usize,
    /// Rows written (equals `kept` unless dry-run).
    pub written: usize,
    /// Stale rows removed by reconciliation.
    pub deleted: usize,
}

impl Importer {
    pub fn new(reference_tz: Tz) -> Self {
        Self {
            reference_tz,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// "Today" in the pipeline's reference timezone, the boundary for the
    /// future-date filter.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.reference_tz).date_naive()
    }

    /// Future-date filter plus identity dedup; on a duplicate URL the first
    /// occurrence wins. Order is otherwise preserved.
    pub fn prepare(&self, events: Vec<Event>) -> Vec<Event> {
        let today = self.today();
        let mut seen: HashSet<String> = HashSet::new();
        events
            .into_iter()
            .filter(|event| keep_upcoming(event, today))
            .filter(|event| seen.insert(event.url.clone()))
            .collect()
    }

    pub fn import(&self, store: &mut Store, events: &[Event]) -> Result<usize> {
        if self.dry_run {
            info!(count = events.len(), "dry-run, skipping writes");
            return Ok(0);
        }
        store
            .upsert_events(events)
            .context("event upsert failed")?;
        Ok(events.len())
    }

    /// Removes rows belonging to `pattern` whose URL the source did not
    /// report this run. Call only for sources whose fetch succeeded; a failed
    /// source reports nothing and reconciling it would wipe its rows.
    pub fn reconcile(
        &self,
        store: &mut Store,
        pattern: &str,
        found_urls: &HashSet<String>,
    ) -> Result<usize> {
        let stored = store
            .urls_matching(pattern)
            .context("stale row scan failed")?;
        let stale: Vec<String> = stored
            .into_iter()
            .filter(|url| !found_urls.contains(url))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        if self.dry_run {
            info!(pattern, count = stale.len(), "dry-run, would delete stale rows");
            return Ok(0);
        }
        debug!(pattern, count = stale.len(), "deleting stale rows");
        let deleted = store.delete_urls(&stale).context("stale delete failed")?;
        Ok(deleted)
    }
}

/// Whether the event is today-or-later. Events whose dates cannot be parsed
/// at all are kept; dropping data on a parse failure is worse than showing a
/// possibly-past listing.
pub fn keep_upcoming(event: &Event, today: NaiveDate) -> bool {
    let Some(values) = event.dates.as_ref() else {
        return true;
    };
    let days: Vec<NaiveDate> = values.iter().flat_map(|value| value.days()).collect();
    if days.is_empty() {
        return true;
    }
    days.into_iter().any(|day| day >= today)
}
