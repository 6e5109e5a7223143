pub mod config;
pub mod db;
pub mod fetch;
pub mod geocode;
pub mod import;
pub mod models;
pub mod pipeline;
pub mod sources;
pub mod standardize;
pub mod text;

pub use config::Config;
pub use db::Store;
pub use import::Importer;
pub use models::{Event, EventDraft};
pub use pipeline::{PipelineOptions, RunReport};
pub use standardize::{LookupTables, Standardizer};
