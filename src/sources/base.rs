use std::collections::HashSet;
use std::time::Duration;

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tokio::time::sleep;
use tracing::debug;

use crate::fetch::{FetchError, Fetcher};
use crate::models::Event;
use crate::text::clean_text;

pub fn first_text(element: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|node| clean_text(&inner_text(node)))
}

pub fn inner_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ")
}

pub fn first_attr(element: &ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(str::to_string)
}

pub fn absolute_url(base: &str, href: &str) -> Option<String> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    let base_url = reqwest::Url::parse(base).ok()?;
    base_url.join(href).ok().map(|url| url.to_string())
}

/// Strips tracking query parameters so the identity URL is stable across
/// fetches of the same listing.
pub fn strip_tracking_params(url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return url.to_string();
    };
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !key.starts_with("utm_"))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let mut query = parsed.query_pairs_mut();
        query.clear();
        for (key, value) in &kept {
            query.append_pair(key, value);
        }
        drop(query);
    }
    parsed.to_string()
}

/// Key for the crawl visited-set: scheme/host case-folded, fragment dropped.
fn normalize_for_visit(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// All JSON-LD payloads on the page whose text mentions `type_hint`,
/// flattened (a script may hold a single object or an array).
pub fn json_ld_items(html: &str, type_hint: &str) -> Vec<Value> {
    static SCRIPT_SELECTOR: once_cell::sync::Lazy<Selector> = once_cell::sync::Lazy::new(|| {
        Selector::parse("script[type=\"application/ld+json\"]").expect("json-ld selector")
    });

    let document = Html::parse_document(html);
    let mut items = Vec::new();
    for script in document.select(&SCRIPT_SELECTOR) {
        let text = script.text().collect::<String>();
        if !text.contains(type_hint) {
            continue;
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Array(list)) => items.extend(list),
            Ok(value) => items.push(value),
            Err(err) => debug!(error = %err, "unparseable json-ld block"),
        }
    }
    items
}

/// What one crawled page contributed: finished events, plus further pages to
/// visit with the context each should inherit.
pub struct PageOutcome<C> {
    pub events: Vec<Event>,
    pub links: Vec<(String, C)>,
}

/// Container→leaf expansion as an explicit worklist with a visited set, so a
/// malformed link graph can neither recurse unboundedly nor cycle. A tripped
/// circuit breaker abandons the remaining queue and returns what was
/// collected; individual page failures skip that page only.
pub async fn crawl_pages<C, F>(
    fetcher: &Fetcher,
    seeds: Vec<(String, C)>,
    max_pages: usize,
    page_delay: Duration,
    parse: F,
) -> Vec<Event>
where
    C: Clone,
    F: Fn(&str, &C, &str) -> PageOutcome<C>,
{
    let mut queue: std::collections::VecDeque<(String, C)> = seeds.into();
    let mut visited: HashSet<String> = HashSet::new();
    let mut events = Vec::new();
    let mut fetched = 0usize;

    while let Some((url, context)) = queue.pop_front() {
        if !visited.insert(normalize_for_visit(&url)) {
            continue;
        }
        if fetched >= max_pages {
            debug!(max_pages, "crawl page budget exhausted");
            break;
        }
        fetched += 1;

        let html = match fetcher.get_text(&url).await {
            Ok(html) => html,
            Err(FetchError::CircuitOpen) => {
                debug!(%url, "crawl abandoned by circuit breaker");
                break;
            }
            Err(err) => {
                debug!(%url, error = %err, "skipping unfetchable page");
                continue;
            }
        };

        let outcome = parse(&url, &context, &html);
        events.extend(outcome.events);
        queue.extend(outcome.links);

        if !queue.is_empty() && !page_delay.is_zero() {
            sleep(page_delay).await;
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_url_joins_relative_paths() {
        assert_eq!(
            absolute_url("https://t.pia.jp/pia/list.do", "/pia/event.do?eventCd=1").as_deref(),
            Some("https://t.pia.jp/pia/event.do?eventCd=1")
        );
        assert_eq!(
            absolute_url("https://a.example", "https://b.example/x").as_deref(),
            Some("https://b.example/x")
        );
    }

    #[test]
    fn strips_utm_params_only() {
        let url = "https://www.songkick.com/concerts/1?utm_source=feed&utm_medium=web&page=2";
        assert_eq!(
            strip_tracking_params(url),
            "https://www.songkick.com/concerts/1?page=2"
        );
        let bare = "https://www.songkick.com/concerts/1?utm_source=feed";
        assert_eq!(
            strip_tracking_params(bare),
            "https://www.songkick.com/concerts/1"
        );
    }

    #[test]
    fn json_ld_extraction_handles_arrays_and_objects() {
        let html = r#"
            <script type="application/ld+json">[{"@type":"MusicEvent","name":"A"}]</script>
            <script type="application/ld+json">{"@type":"MusicEvent","name":"B"}</script>
            <script type="application/ld+json">{"@type":"Organization"}</script>
        "#;
        let items = json_ld_items(html, "MusicEvent");
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn visit_normalization_drops_fragments() {
        assert_eq!(
            normalize_for_visit("https://x.example/page#section"),
            normalize_for_visit("https://x.example/page")
        );
    }
}
