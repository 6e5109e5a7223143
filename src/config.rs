use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono_tz::Tz;

/// Reference timezone for the future-date filter when none is configured.
const DEFAULT_TZ: Tz = chrono_tz::Asia::Tokyo;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    /// Zone in which "today" is computed when filtering past events.
    pub reference_tz: Tz,
    /// Whether the standardizer may fall back to the network geocoder for
    /// unknown locations.
    pub geocoding_enabled: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_path = match std::env::var_os("GIGSYNC_DB") {
            Some(path) => PathBuf::from(path),
            None => default_database_path(),
        };

        let reference_tz = match std::env::var("GIGSYNC_TZ") {
            Ok(name) => name
                .parse()
                .ok()
                .with_context(|| format!("GIGSYNC_TZ is not an IANA zone: {name}"))?,
            Err(_) => DEFAULT_TZ,
        };

        let geocoding_enabled = std::env::var("GIGSYNC_NO_GEOCODE").is_err();

        Ok(Self {
            database_path,
            reference_tz,
            geocoding_enabled,
        })
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gigsync")
        .join("events.sqlite3")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_lands_in_app_data_dir() {
        let path = default_database_path();
        assert!(path.ends_with("gigsync/events.sqlite3"));
    }
}
