pub mod base;
pub mod eplus;
pub mod pia;
pub mod songkick;

use async_trait::async_trait;

use crate::models::Event;

/// Knobs the CLI passes down to every adapter run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Debug mode caps pagination and fan-out so a run finishes quickly.
    pub debug: bool,
}

impl RunOptions {
    pub fn max_pages(&self) -> Option<usize> {
        if self.debug {
            Some(1)
        } else {
            None
        }
    }
}

/// One external listing source. `fetch_events` returns every event the
/// source could recover this cycle; it errors only when the source is
/// entirely unusable (origin unreachable, first page unrecognizable) —
/// individual malformed items are skipped, not raised.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Substring identifying this source's rows in the store; reconciliation
    /// deletes are scoped to URLs matching it.
    fn url_pattern(&self) -> &'static str;

    async fn fetch_events(&self, options: &RunOptions) -> anyhow::Result<Vec<Event>>;
}

pub fn active_sources() -> Vec<Box<dyn SourceAdapter>> {
    vec![
        Box::new(songkick::Songkick),
        Box::new(eplus::Eplus),
        Box::new(pia::Pia),
    ]
}

/// Case-insensitive substring match, the `--source` CLI filter.
pub fn matching_sources(filter: &str) -> Vec<Box<dyn SourceAdapter>> {
    let needle = filter.to_lowercase();
    active_sources()
        .into_iter()
        .filter(|source| source.name().to_lowercase().contains(&needle))
        .collect()
}
