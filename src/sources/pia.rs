use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use tracing::info;

use super::base::{absolute_url, first_attr, first_text, inner_text, PageOutcome};
use super::{RunOptions, SourceAdapter};
use crate::fetch::Fetcher;
use crate::models::{DateValue, Event, EventDraft, EventTime};
use crate::text::clean_text;

const LIST_URL: &str = "https://t.pia.jp/pia/event/rlsInfo.do";
const PAGE_BUDGET: usize = 500;
const DEBUG_PAGE_BUDGET: usize = 5;
const PAGE_DELAY: Duration = Duration::from_millis(250);

static ITEM_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.event_link").expect("item selector"));
static LINK_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a").expect("link selector"));
static TITLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("li.is_title").expect("title selector"));
static PLACE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("li.is_place").expect("place selector"));
static START_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("time[itemprop=\"startDate\"]").expect("start selector"));
static NEXT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a.next").expect("next selector"));
static EVENT_NAME_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h2.event_name").expect("event name selector"));
static LOCATION_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("span[itemprop=\"location\"]").expect("location selector"));

pub struct Pia;

/// What a listing row already knows about the event its link leads to; the
/// leaf page refines rather than replaces it.
#[derive(Debug, Clone, Default)]
struct ListingContext {
    title: Option<String>,
    place: Option<String>,
    date_text: Option<String>,
}

#[derive(Debug, Clone)]
enum PiaPage {
    Listing,
    Leaf(ListingContext),
}

#[async_trait]
impl SourceAdapter for Pia {
    fn name(&self) -> &'static str {
        "Pia"
    }

    fn url_pattern(&self) -> &'static str {
        "pia.jp"
    }

    async fn fetch_events(&self, options: &RunOptions) -> Result<Vec<Event>> {
        let fetcher = Fetcher::new(3).with_breaker_threshold(20);

        let first_page = fetcher.get_text(LIST_URL).await?;
        if is_maintenance_page(&first_page) {
            bail!("pia is in maintenance mode");
        }

        let outcome = parse_page(LIST_URL, &PiaPage::Listing, &first_page);
        let mut events = outcome.events;

        let budget = if options.debug {
            DEBUG_PAGE_BUDGET
        } else {
            PAGE_BUDGET
        };
        let crawled = super::base::crawl_pages(
            &fetcher,
            outcome.links,
            budget,
            PAGE_DELAY,
            parse_page,
        )
        .await;
        events.extend(crawled);

        info!(count = events.len(), "pia listings collected");
        Ok(events)
    }
}

fn parse_page(url: &str, page: &PiaPage, html: &str) -> PageOutcome<PiaPage> {
    if is_maintenance_page(html) {
        return PageOutcome {
            events: Vec::new(),
            links: Vec::new(),
        };
    }
    match page {
        PiaPage::Listing => parse_listing(url, html),
        PiaPage::Leaf(context) => parse_leaf(url, context, html),
    }
}

fn parse_listing(url: &str, html: &str) -> PageOutcome<PiaPage> {
    let document = Html::parse_document(html);
    let mut links = Vec::new();

    for item in document.select(&ITEM_SELECTOR) {
        let Some(href) = first_attr(&item, &LINK_SELECTOR, "href") else {
            continue;
        };
        let Some(target) = absolute_url(url, &href) else {
            continue;
        };
        if !target.contains("eventCd=") {
            continue;
        }
        let context = ListingContext {
            title: first_text(&item, &TITLE_SELECTOR),
            place: first_text(&item, &PLACE_SELECTOR),
            date_text: first_text(&item, &START_SELECTOR),
        };
        links.push((target, PiaPage::Leaf(context)));
    }

    if let Some(next) = document
        .select(&NEXT_SELECTOR)
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| absolute_url(url, href))
    {
        links.push((next, PiaPage::Listing));
    }

    PageOutcome {
        events: Vec::new(),
        links,
    }
}

fn parse_leaf(url: &str, context: &ListingContext, html: &str) -> PageOutcome<PiaPage> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let title = first_text(&root, &EVENT_NAME_SELECTOR)
        .or_else(|| context.title.clone());

    let mut dates = Vec::new();
    let mut times = Vec::new();
    for node in document.select(&START_SELECTOR) {
        let raw = node
            .value()
            .attr("datetime")
            .map(str::to_string)
            .or_else(|| clean_text(&inner_text(node)));
        if let Some(raw) = raw {
            let (date, time) = parse_pia_datetime(&raw);
            if let Some(date) = date {
                dates.push(date);
            }
            if let Some(time) = time {
                times.push(time);
            }
        }
    }
    if dates.is_empty() {
        if let Some(raw) = &context.date_text {
            let (date, _) = parse_pia_datetime(raw);
            dates.extend(date);
        }
    }

    let venue: Vec<String> = document
        .select(&LOCATION_SELECTOR)
        .filter_map(|node| clean_text(&inner_text(node)))
        .collect();

    let mut metadata = std::collections::HashMap::new();
    metadata.insert("country".to_string(), "JP".to_string());

    let event = EventDraft {
        title: title.into_iter().collect(),
        dates,
        times,
        venue,
        location: context.place.clone().into_iter().collect(),
        url: Some(canonical_event_url(url)),
        metadata,
        ..EventDraft::default()
    }
    .build();

    PageOutcome {
        events: event.into_iter().collect(),
        links: Vec::new(),
    }
}

fn is_maintenance_page(html: &str) -> bool {
    html.contains("ただいまメンテナンス中") || html.contains("under maintenance")
}

/// Leaf identity is the `eventCd` alone; session and referrer query noise is
/// dropped so re-crawls key to the same row.
fn canonical_event_url(url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return url.to_string();
    };
    let event_cd = parsed
        .query_pairs()
        .find(|(key, _)| key == "eventCd")
        .map(|(_, value)| value.into_owned());
    match event_cd {
        Some(code) => {
            parsed.set_query(None);
            parsed
                .query_pairs_mut()
                .append_pair("eventCd", &code);
            parsed.to_string()
        }
        None => url.to_string(),
    }
}

/// Pia emits `yyyy/mm/dd(曜)` in listing rows and ISO-ish `datetime`
/// attributes on leaf pages, with or without a clock component.
fn parse_pia_datetime(raw: &str) -> (Option<DateValue>, Option<EventTime>) {
    let trimmed = raw.trim();
    if let Ok(datetime) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M") {
        return (
            Some(DateValue::Day(datetime.date())),
            Some(EventTime::naive(datetime.time())),
        );
    }
    let date_part: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '/' || *c == '-')
        .collect();
    let parsed = NaiveDate::parse_from_str(&date_part, "%Y/%m/%d")
        .or_else(|_| NaiveDate::parse_from_str(&date_part, "%Y-%m-%d"))
        .ok();
    match parsed {
        Some(date) => (Some(DateValue::Day(date)), None),
        None if trimmed.is_empty() => (None, None),
        None => (Some(DateValue::Raw(trimmed.to_string())), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_LISTING: &str = r#"
    <html><body>
      <div class="event_link">
        <a href="/pia/event/event.do?eventCd=2591234&rlsCd=1">
          <ul>
            <li class="is_title">灰色の朝 冬の単独公演</li>
            <time itemprop="startDate">2099/12/04(金)</time>
            <li class="is_place">東京都</li>
          </ul>
        </a>
      </div>
      <div class="event_link">
        <a href="/pia/news/whatever.do"><ul><li class="is_title">お知らせ</li></ul></a>
      </div>
      <a class="next" href="/pia/event/rlsInfo.do?page=2">次へ</a>
    </body></html>
    "#;

    const SAMPLE_LEAF: &str = r#"
    <html><body>
      <h2 class="event_name">灰色の朝 冬の単独公演 追加公演</h2>
      <time itemprop="startDate" datetime="2099-12-04T18:30">2099/12/04(金) 18:30</time>
      <span itemprop="location">Zepp DiverCity</span>
    </body></html>
    "#;

    #[test]
    fn listing_extracts_event_links_with_context() {
        let outcome = parse_listing("https://t.pia.jp/pia/event/rlsInfo.do", SAMPLE_LISTING);
        assert!(outcome.events.is_empty());
        assert_eq!(outcome.links.len(), 2);

        let (url, page) = &outcome.links[0];
        assert!(url.contains("eventCd=2591234"));
        let PiaPage::Leaf(context) = page else {
            panic!("expected leaf link");
        };
        assert_eq!(context.title.as_deref(), Some("灰色の朝 冬の単独公演"));
        assert_eq!(context.place.as_deref(), Some("東京都"));

        let (next_url, next_page) = &outcome.links[1];
        assert!(next_url.ends_with("rlsInfo.do?page=2"));
        assert!(matches!(next_page, PiaPage::Listing));
    }

    #[test]
    fn leaf_builds_event_with_canonical_url() {
        let context = ListingContext {
            title: Some("灰色の朝 冬の単独公演".to_string()),
            place: Some("東京都".to_string()),
            date_text: Some("2099/12/04(金)".to_string()),
        };
        let outcome = parse_leaf(
            "https://t.pia.jp/pia/event/event.do?eventCd=2591234&rlsCd=1",
            &context,
            SAMPLE_LEAF,
        );
        assert_eq!(outcome.events.len(), 1);
        let event = &outcome.events[0];
        assert_eq!(
            event.url,
            "https://t.pia.jp/pia/event/event.do?eventCd=2591234"
        );
        assert_eq!(
            event.title,
            Some(vec!["灰色の朝 冬の単独公演 追加公演".to_string()])
        );
        assert_eq!(event.venue, Some(vec!["Zepp DiverCity".to_string()]));
        assert_eq!(event.location, Some(vec!["東京都".to_string()]));
        assert_eq!(event.dates.as_ref().unwrap()[0].to_string(), "2099-12-04");
        assert_eq!(event.times.as_ref().unwrap()[0].to_string(), "18:30:00");
    }

    #[test]
    fn leaf_falls_back_to_listing_date() {
        let context = ListingContext {
            title: Some("タイトル".to_string()),
            place: None,
            date_text: Some("2099/12/04(金)".to_string()),
        };
        let bare = "<html><body><h2 class=\"event_name\">タイトル</h2></body></html>";
        let outcome = parse_leaf(
            "https://t.pia.jp/pia/event/event.do?eventCd=1",
            &context,
            bare,
        );
        let event = &outcome.events[0];
        assert_eq!(event.dates.as_ref().unwrap()[0].to_string(), "2099-12-04");
    }

    #[test]
    fn maintenance_page_yields_nothing() {
        let html = "<html><body>ただいまメンテナンス中です</body></html>";
        assert!(is_maintenance_page(html));
        let outcome = parse_page("https://t.pia.jp/x", &PiaPage::Listing, html);
        assert!(outcome.events.is_empty());
        assert!(outcome.links.is_empty());
    }

    #[test]
    fn datetime_shapes() {
        let (date, time) = parse_pia_datetime("2099-12-04T18:30");
        assert_eq!(date.unwrap().to_string(), "2099-12-04");
        assert_eq!(time.unwrap().to_string(), "18:30:00");

        let (date, time) = parse_pia_datetime("2099/12/04(金)");
        assert_eq!(date.unwrap().to_string(), "2099-12-04");
        assert!(time.is_none());

        let (date, _) = parse_pia_datetime("開催日未定");
        assert_eq!(date, Some(DateValue::Raw("開催日未定".to_string())));
    }
}
