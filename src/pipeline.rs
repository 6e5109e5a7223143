use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::Config;
use crate::db::Store;
use crate::geocode::NominatimGeocoder;
use crate::import::{ImportSummary, Importer};
use crate::sources::{active_sources, matching_sources, RunOptions, SourceAdapter};
use crate::standardize::{LookupTables, Standardizer};

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Case-insensitive substring filter over source names.
    pub source_filter: Option<String>,
    pub dry_run: bool,
    pub debug: bool,
}

#[derive(Debug)]
pub struct SourceReport {
    pub name: &'static str,
    pub fetched: usize,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct RunReport {
    pub sources: Vec<SourceReport>,
    pub summary: ImportSummary,
}

pub async fn run(config: &Config, options: &PipelineOptions) -> Result<RunReport> {
    let sources = match &options.source_filter {
        Some(filter) => matching_sources(filter),
        None => active_sources(),
    };
    if sources.is_empty() {
        bail!(
            "no source matches {:?}",
            options.source_filter.as_deref().unwrap_or("")
        );
    }

    let database_path = config.database_path.clone();
    let (store, tables) = tokio::task::spawn_blocking(move || {
        let store = Store::open(&database_path)?;
        let tables = LookupTables::load(&store);
        Ok::<_, rusqlite::Error>((store, tables))
    })
    .await
    .context("store task panicked")??;

    let geocoder = if config.geocoding_enabled {
        Some(Box::new(NominatimGeocoder::new()) as Box<dyn crate::geocode::Geocoder>)
    } else {
        None
    };
    let standardizer = Standardizer::new(tables, geocoder);
    let importer = Importer::new(config.reference_tz).dry_run(options.dry_run);
    let run_options = RunOptions {
        debug: options.debug,
    };

    let (report, _store) = execute(sources, store, standardizer, importer, run_options).await?;
    Ok(report)
}

/// One full ingestion cycle over the given adapters. An adapter failure is
/// isolated: its error lands in the report and its stored rows are left
/// untouched; only a run where every adapter fails is itself an error.
pub async fn execute(
    sources: Vec<Box<dyn SourceAdapter>>,
    store: Store,
    standardizer: Standardizer,
    importer: Importer,
    run_options: RunOptions,
) -> Result<(RunReport, Store)> {
    let mut tasks = JoinSet::new();
    let mut labels: std::collections::HashMap<tokio::task::Id, &'static str> =
        std::collections::HashMap::new();
    for source in sources {
        let name = source.name();
        let handle = tasks.spawn(async move {
            let pattern = source.url_pattern();
            let result = source.fetch_events(&run_options).await;
            (name, pattern, result)
        });
        labels.insert(handle.id(), name);
    }

    let mut reports = Vec::new();
    let mut successful_patterns: Vec<&'static str> = Vec::new();
    let mut events = Vec::new();
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((_, (name, pattern, Ok(fetched)))) => {
                info!(source = name, count = fetched.len(), "source fetch complete");
                reports.push(SourceReport {
                    name,
                    fetched: fetched.len(),
                    error: None,
                });
                // An empty successful fetch still reconciles: the source
                // affirmed it has nothing listed.
                successful_patterns.push(pattern);
                events.extend(fetched);
            }
            Ok((_, (name, _, Err(err)))) => {
                error!(source = name, error = %err, "source fetch failed");
                reports.push(SourceReport {
                    name,
                    fetched: 0,
                    error: Some(err.to_string()),
                });
            }
            // A panicked adapter is handled like a failed one: its rows stay
            // untouched and the siblings' results are kept.
            Err(join_error) => {
                let name = labels
                    .get(&join_error.id())
                    .copied()
                    .unwrap_or("unknown source");
                error!(source = name, error = %join_error, "source task panicked");
                reports.push(SourceReport {
                    name,
                    fetched: 0,
                    error: Some(join_error.to_string()),
                });
            }
        }
    }
    if successful_patterns.is_empty() {
        bail!("every source failed, nothing to import");
    }

    standardizer.standardize(&mut events).await;
    let new_venues = standardizer.drain_new_venues();

    let fetched = events.len();
    let kept = importer.prepare(events);
    let found_urls: HashSet<String> = kept.iter().map(|event| event.url.clone()).collect();

    let (summary, store) = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut store = store;
        let written = importer.import(&mut store, &kept)?;
        let mut deleted = 0;
        for pattern in successful_patterns {
            deleted += importer.reconcile(&mut store, pattern, &found_urls)?;
        }
        for venue in new_venues {
            store
                .insert_venue(&venue, &venue)
                .context("venue registration failed")?;
        }
        let summary = ImportSummary {
            fetched,
            kept: kept.len(),
            written,
            deleted,
        };
        Ok((summary, store))
    })
    .await
    .context("import task panicked")??;

    info!(
        fetched = summary.fetched,
        kept = summary.kept,
        written = summary.written,
        deleted = summary.deleted,
        "run complete"
    );
    Ok((
        RunReport {
            sources: reports,
            summary,
        },
        store,
    ))
}
