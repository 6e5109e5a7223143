use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{NaiveDate, Offset, TimeZone};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::db::Store;
use crate::geocode::Geocoder;
use crate::models::Event;
use crate::text::clean_text;

/// Compound locations arrive joined by slash, comma (half- or full-width),
/// the Japanese middle dot, or an ampersand.
static LOCATION_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[/,、・&]").expect("location split regex"));

const JP_LOCATION_SUFFIXES: [char; 4] = ['都', '道', '府', '県'];

/// The 47 prefectures, seeded regardless of what the store's locations table
/// holds. Every prefecture resolves to Asia/Tokyo.
static PREFECTURES_JA_EN: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("北海道", "Hokkaido"),
        ("青森県", "Aomori"),
        ("岩手県", "Iwate"),
        ("宮城県", "Miyagi"),
        ("秋田県", "Akita"),
        ("山形県", "Yamagata"),
        ("福島県", "Fukushima"),
        ("茨城県", "Ibaraki"),
        ("栃木県", "Tochigi"),
        ("群馬県", "Gunma"),
        ("埼玉県", "Saitama"),
        ("千葉県", "Chiba"),
        ("東京都", "Tokyo"),
        ("神奈川県", "Kanagawa"),
        ("新潟県", "Niigata"),
        ("富山県", "Toyama"),
        ("石川県", "Ishikawa"),
        ("福井県", "Fukui"),
        ("山梨県", "Yamanashi"),
        ("長野県", "Nagano"),
        ("岐阜県", "Gifu"),
        ("静岡県", "Shizuoka"),
        ("愛知県", "Aichi"),
        ("三重県", "Mie"),
        ("滋賀県", "Shiga"),
        ("京都府", "Kyoto"),
        ("大阪府", "Osaka"),
        ("兵庫県", "Hyogo"),
        ("奈良県", "Nara"),
        ("和歌山県", "Wakayama"),
        ("鳥取県", "Tottori"),
        ("島根県", "Shimane"),
        ("岡山県", "Okayama"),
        ("広島県", "Hiroshima"),
        ("山口県", "Yamaguchi"),
        ("徳島県", "Tokushima"),
        ("香川県", "Kagawa"),
        ("愛媛県", "Ehime"),
        ("高知県", "Kochi"),
        ("福岡県", "Fukuoka"),
        ("佐賀県", "Saga"),
        ("長崎県", "Nagasaki"),
        ("熊本県", "Kumamoto"),
        ("大分県", "Oita"),
        ("宮崎県", "Miyazaki"),
        ("鹿児島県", "Kagoshima"),
        ("沖縄県", "Okinawa"),
    ]
});

/// Country code → representative IANA zone, the fast path for sources that
/// tag events with a country.
static COUNTRY_ZONES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("JP", "Asia/Tokyo"),
        ("KR", "Asia/Seoul"),
        ("TW", "Asia/Taipei"),
        ("HK", "Asia/Hong_Kong"),
        ("CN", "Asia/Shanghai"),
        ("SG", "Asia/Singapore"),
        ("TH", "Asia/Bangkok"),
        ("ID", "Asia/Jakarta"),
        ("PH", "Asia/Manila"),
        ("US", "America/New_York"),
        ("GB", "Europe/London"),
        ("FR", "Europe/Paris"),
        ("DE", "Europe/Berlin"),
        ("AU", "Australia/Sydney"),
    ])
});

fn country_to_code(raw: &str) -> Option<&'static str> {
    let upper = raw.trim().to_uppercase();
    match upper.as_str() {
        "JP" | "JPN" | "JAPAN" => Some("JP"),
        "KR" | "KOR" | "SOUTH KOREA" => Some("KR"),
        "US" | "USA" | "UNITED STATES" => Some("US"),
        "GB" | "UK" | "UNITED KINGDOM" => Some("GB"),
        other => COUNTRY_ZONES.get_key_value(other).map(|(key, _)| *key),
    }
}

/// Canonical-name and timezone lookup tables, loaded once at startup and
/// read-shared for the rest of the run.
#[derive(Debug, Default)]
pub struct LookupTables {
    /// Source-language (and canonical) location name → canonical name.
    locations: HashMap<String, String>,
    /// Canonical location name → IANA zone name.
    location_zones: HashMap<String, String>,
    /// Known venue name or variation → canonical venue name.
    venues: HashMap<String, String>,
}

impl LookupTables {
    /// The built-in prefecture table; always present so a store with no
    /// seeded locations still canonicalizes Japanese listings.
    pub fn built_in() -> Self {
        let mut tables = Self::default();
        for (ja, en) in PREFECTURES_JA_EN.iter() {
            tables.locations.insert((*ja).to_string(), (*en).to_string());
            tables.locations.insert((*en).to_string(), (*en).to_string());
            tables
                .location_zones
                .insert((*en).to_string(), "Asia/Tokyo".to_string());
        }
        tables
    }

    /// Built-in table augmented with the store's locations and venues.
    pub fn load(store: &Store) -> Self {
        let mut tables = Self::built_in();
        match store.load_locations() {
            Ok(rows) => {
                for row in rows {
                    let canonical = match (&row.name_en, &row.name_ja) {
                        (Some(en), _) => en.clone(),
                        (None, Some(ja)) => ja.clone(),
                        (None, None) => continue,
                    };
                    if let Some(ja) = row.name_ja {
                        tables.locations.insert(ja, canonical.clone());
                    }
                    tables
                        .locations
                        .insert(canonical.clone(), canonical.clone());
                    if let Some(zone) = row.timezone {
                        tables.location_zones.insert(canonical, zone);
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to load locations table"),
        }
        match store.load_venues() {
            Ok(rows) => {
                for row in rows {
                    tables.venues.insert(row.name, row.canonical);
                }
            }
            Err(err) => warn!(error = %err, "failed to load venues table"),
        }
        tables
    }

    pub fn insert_location(&mut self, name: &str, canonical: &str, zone: Option<&str>) {
        self.locations.insert(name.to_string(), canonical.to_string());
        self.locations
            .insert(canonical.to_string(), canonical.to_string());
        if let Some(zone) = zone {
            self.location_zones
                .insert(canonical.to_string(), zone.to_string());
        }
    }
}

/// Post-processing stage: canonicalizes location and venue text, resolves an
/// IANA timezone per event, and re-expresses naive times with a fixed,
/// DST-correct UTC offset. Every step is best-effort; an unresolvable field
/// passes through unchanged.
pub struct Standardizer {
    tables: LookupTables,
    geocoder: Option<Box<dyn Geocoder>>,
    /// Geocoding is slow and rate-limited; memoized by input string.
    /// First writer wins, results are deterministic per key.
    zone_cache: Mutex<HashMap<String, Option<String>>>,
    new_venues: Mutex<Vec<String>>,
}

impl Standardizer {
    pub fn new(tables: LookupTables, geocoder: Option<Box<dyn Geocoder>>) -> Self {
        Self {
            tables,
            geocoder,
            zone_cache: Mutex::new(HashMap::new()),
            new_venues: Mutex::new(Vec::new()),
        }
    }

    pub async fn standardize(&self, events: &mut [Event]) {
        for event in events.iter_mut() {
            if let Some(raw_parts) = event.location.take() {
                event.location = Some(self.canonicalize_locations(&raw_parts));
            }
            if let Some(raw_venues) = event.venue.take() {
                event.venue = Some(
                    raw_venues
                        .iter()
                        .map(|raw| self.canonicalize_venue(raw))
                        .collect(),
                );
            }
            if event.times.is_some() {
                if let Some(zone) = self.resolve_timezone(event).await {
                    attach_offsets(event, zone);
                }
            }
        }
    }

    /// Splits a compound location, substitutes known region names with their
    /// canonical form, and passes unknown parts through unchanged.
    pub fn canonicalize_locations(&self, raw_parts: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for raw in raw_parts {
            for part in LOCATION_SPLIT_RE.split(raw) {
                let Some(cleaned) = clean_text(part) else {
                    continue;
                };
                let canonical = self
                    .lookup_location(&cleaned)
                    .unwrap_or_else(|| cleaned.clone());
                if seen.insert(canonical.clone()) {
                    out.push(canonical);
                }
            }
        }
        out
    }

    fn lookup_location(&self, name: &str) -> Option<String> {
        if let Some(canonical) = self.tables.locations.get(name) {
            return Some(canonical.clone());
        }
        // Tolerate a missing or extra administrative suffix (東京 vs 東京都).
        for suffix in JP_LOCATION_SUFFIXES {
            if let Some(trimmed) = name.strip_suffix(suffix) {
                if let Some(canonical) = self.tables.locations.get(trimmed) {
                    return Some(canonical.clone());
                }
            }
            let with_suffix = format!("{name}{suffix}");
            if let Some(canonical) = self.tables.locations.get(&with_suffix) {
                return Some(canonical.clone());
            }
        }
        None
    }

    /// Venue canonicalization is text cleaning plus a registry lookup so the
    /// same hall spelled differently across runs collapses to one name.
    pub fn canonicalize_venue(&self, raw: &str) -> String {
        let Some(cleaned) = clean_text(raw) else {
            return raw.to_string();
        };
        if let Some(canonical) = self.tables.venues.get(&cleaned) {
            return canonical.clone();
        }
        self.new_venues
            .lock()
            .expect("venue queue poisoned")
            .push(cleaned.clone());
        cleaned
    }

    /// Venue names first seen this run, for persisting into the registry.
    pub fn drain_new_venues(&self) -> Vec<String> {
        std::mem::take(&mut *self.new_venues.lock().expect("venue queue poisoned"))
    }

    /// Resolution order: explicit country metadata, then the location→zone
    /// table, then the geocoding fallback.
    pub async fn resolve_timezone(&self, event: &Event) -> Option<Tz> {
        if let Some(country) = event.metadata.get("country") {
            if let Some(code) = country_to_code(country) {
                if let Some(zone) = COUNTRY_ZONES.get(code) {
                    return zone.parse().ok();
                }
            }
        }

        if let Some(locations) = &event.location {
            for name in locations {
                if let Some(zone) = self.tables.location_zones.get(name) {
                    return zone.parse().ok();
                }
            }
        }

        let query = event
            .location
            .as_ref()
            .and_then(|parts| parts.first())
            .or_else(|| event.venue.as_ref().and_then(|parts| parts.first()))?
            .clone();
        self.zone_via_geocoder(&query).await.and_then(|zone| zone.parse().ok())
    }

    async fn zone_via_geocoder(&self, query: &str) -> Option<String> {
        {
            let cache = self.zone_cache.lock().expect("zone cache poisoned");
            if let Some(cached) = cache.get(query) {
                return cached.clone();
            }
        }

        let geocoder = self.geocoder.as_ref()?;
        let resolved = match geocoder.geocode(query).await {
            Some(point) => point
                .country_code
                .as_deref()
                .and_then(country_to_code)
                .and_then(|code| COUNTRY_ZONES.get(code))
                .map(|zone| (*zone).to_string()),
            None => None,
        };
        if resolved.is_none() {
            debug!(query, "timezone unresolved, leaving times naive");
        }

        self.zone_cache
            .lock()
            .expect("zone cache poisoned")
            .entry(query.to_string())
            .or_insert(resolved.clone());
        resolved
    }
}

/// Re-expresses each naive time with the zone's fixed offset at the event's
/// own first date (today when no date parsed), so DST is resolved against the
/// performance date rather than "now". Offset-bearing times pass through.
fn attach_offsets(event: &mut Event, zone: Tz) {
    let reference = event
        .first_date()
        .unwrap_or_else(|| chrono::Utc::now().date_naive());
    if let Some(times) = &mut event.times {
        for entry in times.iter_mut() {
            if entry.offset.is_some() {
                continue;
            }
            entry.offset = Some(offset_at(zone, reference, entry.time));
        }
    }
}

fn offset_at(zone: Tz, date: NaiveDate, time: chrono::NaiveTime) -> chrono::FixedOffset {
    let naive = date.and_time(time);
    match zone.offset_from_local_datetime(&naive) {
        chrono::LocalResult::Single(offset) => offset.fix(),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.fix(),
        // Spring-forward gap: fall back to the offset in force at that UTC instant.
        chrono::LocalResult::None => zone.offset_from_utc_datetime(&naive).fix(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::GeoPoint;
    use crate::models::{EventDraft, EventTime};
    use async_trait::async_trait;
    use chrono::NaiveTime;

    fn standardizer() -> Standardizer {
        Standardizer::new(LookupTables::built_in(), None)
    }

    struct FakeGeocoder {
        country: &'static str,
    }

    #[async_trait]
    impl Geocoder for FakeGeocoder {
        async fn geocode(&self, _query: &str) -> Option<GeoPoint> {
            Some(GeoPoint {
                latitude: 0.0,
                longitude: 0.0,
                country_code: Some(self.country.to_string()),
            })
        }
    }

    fn event_with(location: &str, times: Vec<EventTime>, date: Option<&str>) -> Event {
        let mut draft = EventDraft {
            url: Some("https://example.com/e".to_string()),
            location: vec![location.to_string()],
            times,
            ..EventDraft::default()
        };
        if let Some(date) = date {
            draft.dates = vec![crate::models::DateValue::Day(
                NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            )];
        }
        draft.build().expect("valid event")
    }

    #[test]
    fn splits_and_canonicalizes_compound_locations() {
        let std = standardizer();
        let parts = std.canonicalize_locations(&["東京都・大阪府".to_string()]);
        assert_eq!(parts, vec!["Tokyo".to_string(), "Osaka".to_string()]);
    }

    #[test]
    fn unknown_location_parts_pass_through() {
        let std = standardizer();
        let parts = std.canonicalize_locations(&["Shibuya Underground / 東京都".to_string()]);
        assert_eq!(
            parts,
            vec!["Shibuya Underground".to_string(), "Tokyo".to_string()]
        );
    }

    #[test]
    fn location_suffix_tolerance() {
        let std = standardizer();
        let parts = std.canonicalize_locations(&["東京".to_string()]);
        assert_eq!(parts, vec!["Tokyo".to_string()]);
    }

    #[test]
    fn canonicalize_location_dedups_after_substitution() {
        let std = standardizer();
        let parts = std.canonicalize_locations(&["Tokyo, 東京都".to_string()]);
        assert_eq!(parts, vec!["Tokyo".to_string()]);
    }

    #[test]
    fn unseen_venue_is_queued_for_registration() {
        let std = standardizer();
        let canonical = std.canonicalize_venue("  Ｚｅｐｐ  Haneda ");
        assert_eq!(canonical, "Zepp Haneda");
        assert_eq!(std.drain_new_venues(), vec!["Zepp Haneda".to_string()]);
        assert!(std.drain_new_venues().is_empty());
    }

    #[tokio::test]
    async fn country_metadata_wins_timezone_resolution() {
        let std = standardizer();
        let mut event = event_with("Nowhere", vec![], None);
        event.metadata.insert("country".to_string(), "Japan".to_string());
        let zone = std.resolve_timezone(&event).await;
        assert_eq!(zone, Some(chrono_tz::Asia::Tokyo));
    }

    #[tokio::test]
    async fn location_table_resolves_timezone() {
        let std = standardizer();
        let event = event_with("東京都", vec![], None);
        let mut event = event;
        event.location = Some(std.canonicalize_locations(&event.location.clone().unwrap()));
        let zone = std.resolve_timezone(&event).await;
        assert_eq!(zone, Some(chrono_tz::Asia::Tokyo));
    }

    #[tokio::test]
    async fn geocoder_fallback_is_cached(){
        let std = Standardizer::new(
            LookupTables::built_in(),
            Some(Box::new(FakeGeocoder { country: "KR" })),
        );
        let event = event_with("Seoul Olympic Hall", vec![], None);
        assert_eq!(std.resolve_timezone(&event).await, Some(chrono_tz::Asia::Seoul));
        let cache = std.zone_cache.lock().unwrap();
        assert_eq!(
            cache.get("Seoul Olympic Hall"),
            Some(&Some("Asia/Seoul".to_string()))
        );
    }

    #[tokio::test]
    async fn jst_offset_is_plus_nine_regardless_of_date() {
        let std = standardizer();
        for date in ["2026-01-15", "2026-07-15"] {
            let mut event = event_with(
                "東京都",
                vec![EventTime::naive(NaiveTime::from_hms_opt(19, 0, 0).unwrap())],
                Some(date),
            );
            event.location = Some(std.canonicalize_locations(&event.location.clone().unwrap()));
            let mut batch = vec![event];
            std.standardize(&mut batch).await;
            let times = batch[0].times.as_ref().unwrap();
            assert_eq!(times[0].to_string(), "19:00:00+09:00");
        }
    }

    #[tokio::test]
    async fn dst_offset_follows_event_date() {
        let mut tables = LookupTables::built_in();
        tables.insert_location("New York", "New York", Some("America/New_York"));
        let std = Standardizer::new(tables, None);

        // January: EST (-05:00). July: EDT (-04:00).
        for (date, expected) in [("2026-01-15", "-05:00"), ("2026-07-15", "-04:00")] {
            let mut event = event_with(
                "New York",
                vec![EventTime::naive(NaiveTime::from_hms_opt(20, 0, 0).unwrap())],
                Some(date),
            );
            event.location = Some(vec!["New York".to_string()]);
            let mut batch = vec![event];
            std.standardize(&mut batch).await;
            let rendered = batch[0].times.as_ref().unwrap()[0].to_string();
            assert!(rendered.ends_with(expected), "{rendered} vs {expected}");
        }
    }

    #[tokio::test]
    async fn already_offset_times_pass_through() {
        let std = standardizer();
        let fixed = EventTime::with_offset(
            NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            chrono::FixedOffset::east_opt(3600).unwrap(),
        );
        let mut event = event_with("東京都", vec![fixed], Some("2026-03-01"));
        event.location = Some(std.canonicalize_locations(&event.location.clone().unwrap()));
        let mut batch = vec![event];
        std.standardize(&mut batch).await;
        assert_eq!(batch[0].times.as_ref().unwrap()[0].to_string(), "18:00:00+01:00");
    }

    #[tokio::test]
    async fn unresolved_timezone_leaves_times_naive() {
        let std = standardizer();
        let mut batch = vec![event_with(
            "Atlantis",
            vec![EventTime::naive(NaiveTime::from_hms_opt(19, 30, 0).unwrap())],
            Some("2026-05-01"),
        )];
        std.standardize(&mut batch).await;
        assert_eq!(batch[0].times.as_ref().unwrap()[0].to_string(), "19:30:00");
    }
}
