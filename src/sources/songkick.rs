use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::base::{json_ld_items, strip_tracking_params};
use super::{RunOptions, SourceAdapter};
use crate::fetch::{FetchError, Fetcher};
use crate::models::{DateValue, Event, EventDraft, EventTime, OneOrMany};

const BASE_URL: &str = "https://www.songkick.com";
const METRO_CONCURRENCY: usize = 5;

/// Metro areas crawled each cycle. The full catalogue is much larger; these
/// carry nearly all listing volume.
const METROS: [&str; 16] = [
    "30717-japan-tokyo",
    "30647-japan-osaka",
    "30611-japan-nagoya",
    "30571-japan-kyoto",
    "30434-japan-fukuoka",
    "30754-japan-yokohama",
    "30668-japan-sapporo",
    "30545-japan-kobe",
    "30470-japan-hiroshima",
    "30673-japan-sendai",
    "30619-japan-niigata",
    "30534-japan-kawasaki",
    "30684-japan-shizuoka",
    "30518-japan-kanazawa",
    "30637-japan-okayama",
    "30641-japan-okinawa",
];

pub struct Songkick;

#[async_trait]
impl SourceAdapter for Songkick {
    fn name(&self) -> &'static str {
        "Songkick"
    }

    fn url_pattern(&self) -> &'static str {
        "songkick.com"
    }

    async fn fetch_events(&self, options: &RunOptions) -> Result<Vec<Event>> {
        let fetcher = Arc::new(Fetcher::new(METRO_CONCURRENCY));
        let metros: &[&str] = if options.debug { &METROS[..1] } else { &METROS };
        let max_pages = options.max_pages();

        let mut tasks = JoinSet::new();
        for &metro in metros {
            let fetcher = Arc::clone(&fetcher);
            tasks.spawn(async move { (metro, fetch_metro(&fetcher, metro, max_pages).await) });
        }

        let mut events = Vec::new();
        let mut failures = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(metro_events))) => events.extend(metro_events),
                Ok((metro, Err(err))) => {
                    warn!(metro, error = %err, "metro fetch failed");
                    failures += 1;
                }
                Err(err) => {
                    warn!(error = %err, "metro task panicked");
                    failures += 1;
                }
            }
        }

        // Partial metro failures degrade the run; losing every metro means
        // the origin is unusable this cycle.
        if events.is_empty() && failures == metros.len() {
            return Err(anyhow!("all {} metro areas failed", metros.len()));
        }
        info!(count = events.len(), "songkick metros collected");
        Ok(events)
    }
}

async fn fetch_metro(
    fetcher: &Fetcher,
    metro: &str,
    max_pages: Option<usize>,
) -> Result<Vec<Event>> {
    let events = walk_metro_pages(metro, max_pages, |page| {
        let url = format!("{BASE_URL}/metro-areas/{metro}?page={page}");
        async move { fetcher.get_text(&url).await }
    })
    .await?;
    Ok(events)
}

/// Pages through one metro area. An unreachable first page fails the metro;
/// a failure deeper in the walk keeps the pages already collected, so a
/// transient outage cannot make the metro's listings look vanished.
async fn walk_metro_pages<F, Fut>(
    metro: &str,
    max_pages: Option<usize>,
    fetch_page: F,
) -> Result<Vec<Event>, FetchError>
where
    F: Fn(usize) -> Fut,
    Fut: std::future::Future<Output = Result<String, FetchError>>,
{
    let mut events = Vec::new();
    let mut page = 0usize;

    loop {
        page += 1;
        if let Some(limit) = max_pages {
            if page > limit {
                break;
            }
        }

        let html = match fetch_page(page).await {
            Ok(html) => html,
            Err(err) if page > 1 => {
                warn!(metro, page, error = %err, "page fetch failed, keeping partial walk");
                break;
            }
            Err(err) => return Err(err),
        };

        let page_events: Vec<Event> = json_ld_items(&html, "MusicEvent")
            .iter()
            .filter_map(parse_music_event)
            .collect();

        // A page with no listings is the pagination terminator, not an error.
        if page_events.is_empty() {
            debug!(metro, page, "no events on page, stopping");
            break;
        }
        events.extend(page_events);
    }

    Ok(events)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LdEvent {
    name: Option<String>,
    url: Option<String>,
    #[serde(rename = "startDate")]
    start_date: Option<String>,
    #[serde(rename = "endDate")]
    end_date: Option<String>,
    organizer: Option<OneOrMany<LdNamed>>,
    performer: Option<OneOrMany<LdNamed>>,
    location: Option<OneOrMany<LdPlace>>,
    image: Option<OneOrMany<LdImage>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LdNamed {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LdPlace {
    name: Option<String>,
    address: Option<LdAddress>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LdAddress {
    Text(String),
    Object {
        #[serde(rename = "addressLocality")]
        locality: Option<String>,
        #[serde(rename = "addressCountry")]
        country: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LdImage {
    Url(String),
    Object { url: Option<String> },
}

impl LdImage {
    fn into_url(self) -> Option<String> {
        match self {
            LdImage::Url(url) => Some(url),
            LdImage::Object { url } => url,
        }
    }
}

fn parse_music_event(item: &serde_json::Value) -> Option<Event> {
    let ld: LdEvent = serde_json::from_value(item.clone()).ok()?;
    let url = strip_tracking_params(&ld.url?);

    // The organizer name is the listing title; the item name repeats the
    // headliner plus venue noise.
    let title = ld
        .organizer
        .and_then(|organizer| organizer.into_vec().into_iter().next())
        .and_then(|named| named.name)
        .or(ld.name);

    let performers: Vec<String> = ld
        .performer
        .map(|performer| {
            performer
                .into_vec()
                .into_iter()
                .filter_map(|named| named.name)
                .collect()
        })
        .unwrap_or_default();

    let start = ld.start_date.as_deref().map(parse_ld_instant);
    let end = ld.end_date.as_deref().map(parse_ld_instant);

    let mut dates = Vec::new();
    let mut times = Vec::new();
    match (&start, &end) {
        (Some(start), Some(end)) if start.date != end.date => {
            // Multi-day range: keep only the bounding dates and drop
            // time-of-day, which is ambiguous across the span.
            dates.push(start.as_date_value(ld.start_date.as_deref()));
            dates.push(end.as_date_value(ld.end_date.as_deref()));
        }
        (Some(start), _) => {
            dates.push(start.as_date_value(ld.start_date.as_deref()));
            if let Some(time) = start.time {
                times.push(time);
            }
        }
        (None, _) => return None,
    }

    let mut venue = Vec::new();
    let mut location = Vec::new();
    let mut metadata = std::collections::HashMap::new();
    if let Some(places) = ld.location {
        for place in places.into_vec() {
            if let Some(name) = place.name {
                venue.push(name);
            }
            match place.address {
                Some(LdAddress::Text(text)) => location.push(text),
                Some(LdAddress::Object { locality, country }) => {
                    if let Some(locality) = locality {
                        location.push(locality);
                    } else if let Some(ref country) = country {
                        location.push(country.clone());
                    }
                    if let Some(country) = country {
                        metadata.insert("country".to_string(), country);
                    }
                }
                None => {}
            }
        }
    }

    let images = ld
        .image
        .map(|image| image.into_vec().into_iter().filter_map(LdImage::into_url).collect())
        .unwrap_or_default();

    EventDraft {
        title: title.into_iter().collect(),
        performers,
        dates,
        times,
        venue,
        location,
        images,
        url: Some(url),
        metadata,
        ..EventDraft::default()
    }
    .build()
}

struct LdInstant {
    date: Option<NaiveDate>,
    time: Option<EventTime>,
}

impl LdInstant {
    fn as_date_value(&self, raw: Option<&str>) -> DateValue {
        match self.date {
            Some(date) => DateValue::Day(date),
            None => DateValue::Raw(raw.unwrap_or_default().to_string()),
        }
    }
}

/// JSON-LD dates arrive as bare `yyyy-mm-dd` or a full RFC 3339 datetime
/// with offset; offset-bearing times keep their offsets.
fn parse_ld_instant(raw: &str) -> LdInstant {
    if let Ok(datetime) = chrono::DateTime::parse_from_rfc3339(raw) {
        return LdInstant {
            date: Some(datetime.date_naive()),
            time: Some(EventTime::with_offset(datetime.time(), *datetime.offset())),
        };
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return LdInstant {
            date: Some(naive.date()),
            time: Some(EventTime::naive(naive.time())),
        };
    }
    let date = raw
        .get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok());
    LdInstant { date, time: None }
}
