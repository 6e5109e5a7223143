use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::base::absolute_url;
use super::{RunOptions, SourceAdapter};
use crate::fetch::Fetcher;
use crate::models::{DateValue, Event, EventDraft, EventTime};

const API_URL: &str = "https://api.eplus.jp/v3/koen";
const API_TOKEN: &str = "FGXySj3mTd";
const WEB_BASE: &str = "https://eplus.jp/";
const PAGE_SIZE: u64 = 200;

/// Genre codes whose listings are dropped wholesale (stage plays and
/// classical programs).
const EXCLUDED_GENRES: [&str; 2] = ["200", "700"];

/// Performer strings the API pads listings with.
const PERFORMER_BOILERPLATE: [&str; 4] = ["ほか", "他", "and more", "出演者調整中"];

pub struct Eplus;

#[async_trait]
impl SourceAdapter for Eplus {
    fn name(&self) -> &'static str {
        "eplus"
    }

    fn url_pattern(&self) -> &'static str {
        "eplus.jp"
    }

    async fn fetch_events(&self, options: &RunOptions) -> Result<Vec<Event>> {
        let fetcher = Fetcher::new(2);

        // Exclusions first: performances filed under an excluded genre are
        // dropped even when they also show up in the main listing.
        let mut excluded: HashSet<String> = HashSet::new();
        for genre in EXCLUDED_GENRES {
            match fetch_all_pages(&fetcher, Some(genre), options.max_pages()).await {
                Ok(records) => {
                    excluded.extend(records.into_iter().filter_map(|record| record.koen_cd));
                }
                Err(err) => warn!(genre, error = %err, "exclusion genre fetch failed"),
            }
        }
        debug!(count = excluded.len(), "excluded performance codes");

        let records = fetch_all_pages(&fetcher, None, options.max_pages())
            .await
            .context("eplus listing fetch failed")?;

        let events: Vec<Event> = records
            .into_iter()
            .filter(|record| {
                record
                    .koen_cd
                    .as_ref()
                    .map_or(true, |code| !excluded.contains(code))
            })
            .filter_map(parse_record)
            .collect();

        info!(count = events.len(), "eplus listings collected");
        Ok(events)
    }
}

#[derive(Debug, Deserialize)]
struct KoenResponse {
    #[serde(default)]
    so_kensu: u64,
    #[serde(default)]
    koen_infos: Vec<KoenRecord>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KoenRecord {
    koen_cd: Option<String>,
    kogyo_name_1: Option<String>,
    kogyo_name_2: Option<String>,
    koenbi_term: Option<String>,
    kaien_time: Option<String>,
    shutsuensha: Option<String>,
    todofuken_name: Option<String>,
    koen_detail_url_pc: Option<String>,
    #[serde(default)]
    kanren_venue: Vec<KoenVenue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KoenVenue {
    venue_name: Option<String>,
}

/// Walks the offset-paginated listing until `so_kensu` records have been
/// seen. The first page errors the whole walk; later pages return what was
/// collected so far.
async fn fetch_all_pages(
    fetcher: &Fetcher,
    genre: Option<&str>,
    max_pages: Option<usize>,
) -> Result<Vec<KoenRecord>, crate::fetch::FetchError> {
    let mut records = Vec::new();
    let mut offset = 0u64;
    let mut total = None;
    let mut pages = 0usize;

    loop {
        pages += 1;
        if let Some(limit) = max_pages {
            if pages > limit {
                break;
            }
        }

        let page = match fetch_page(fetcher, genre, offset).await {
            Ok(page) => page,
            Err(err) if total.is_some() => {
                warn!(offset, error = %err, "eplus page fetch failed, keeping partial walk");
                break;
            }
            Err(err) => return Err(err),
        };

        total.get_or_insert(page.so_kensu);
        if page.koen_infos.is_empty() {
            break;
        }
        offset += page.koen_infos.len() as u64;
        records.extend(page.koen_infos);

        if offset >= total.unwrap_or(0) {
            break;
        }
    }

    Ok(records)
}

async fn fetch_page(
    fetcher: &Fetcher,
    genre: Option<&str>,
    offset: u64,
) -> Result<KoenResponse, crate::fetch::FetchError> {
    let response = fetcher
        .execute(API_URL, |client| {
            let mut request = client
                .get(API_URL)
                .header("X-APIToken", API_TOKEN)
                .query(&[
                    ("start", offset.to_string()),
                    ("kensu", PAGE_SIZE.to_string()),
                ]);
            if let Some(genre) = genre {
                request = request.query(&[("genre_cd", genre)]);
            }
            request
        })
        .await?;

    response
        .json()
        .await
        .map_err(|err| crate::fetch::FetchError::Transient {
            url: API_URL.to_string(),
            reason: err.to_string(),
        })
}

fn parse_record(record: KoenRecord) -> Option<Event> {
    let url = record
        .koen_detail_url_pc
        .as_deref()
        .and_then(|href| absolute_url(WEB_BASE, href))?;

    let title: Vec<String> = [record.kogyo_name_1, record.kogyo_name_2]
        .into_iter()
        .flatten()
        .collect();

    let dates = record
        .koenbi_term
        .as_deref()
        .map(parse_term_dates)
        .unwrap_or_default();

    let times: Vec<EventTime> = record
        .kaien_time
        .as_deref()
        .and_then(parse_api_time)
        .map(EventTime::naive)
        .into_iter()
        .collect();

    let performers = record
        .shutsuensha
        .as_deref()
        .map(split_performers)
        .unwrap_or_default();

    let venue: Vec<String> = record
        .kanren_venue
        .into_iter()
        .filter_map(|venue| venue.venue_name)
        .collect();

    let mut metadata = std::collections::HashMap::new();
    metadata.insert("country".to_string(), "JP".to_string());

    EventDraft {
        title,
        performers,
        dates,
        times,
        venue,
        location: record.todofuken_name.into_iter().collect(),
        url: Some(url),
        metadata,
        ..EventDraft::default()
    }
    .build()
}

/// `koenbi_term` is `yyyymmdd`, or two such bounds joined by a tilde. A term
/// that parses into no dates is kept raw so nothing is silently lost.
fn parse_term_dates(term: &str) -> Vec<DateValue> {
    let bounds: Vec<NaiveDate> = term
        .split(['～', '〜', '~'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| NaiveDate::parse_from_str(part, "%Y%m%d").ok())
        .collect();
    if bounds.is_empty() {
        if term.trim().is_empty() {
            Vec::new()
        } else {
            vec![DateValue::Raw(term.to_string())]
        }
    } else {
        bounds.into_iter().map(DateValue::Day).collect()
    }
}

/// `kaien_time` is `HHMM`, occasionally already colon-separated.
fn parse_api_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

fn split_performers(raw: &str) -> Vec<String> {
    raw.split(['／', '/', '、'])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter(|name| !PERFORMER_BOILERPLATE.contains(name))
        .map(str::to_string)
        .collect()
}
