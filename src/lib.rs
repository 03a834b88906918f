pub mod aggregator;
pub mod config;
pub mod cron;
pub mod digest;
pub mod fetcher;
pub mod filters;
pub mod ingest;
pub mod normalizer;
pub mod store;
pub mod summarizer;
pub mod types;

pub use aggregator::{Brewer, Command, UpdateStats};
pub use config::Config;
pub use cron::CronSchedule;
pub use fetcher::{FetchOutcome, Fetcher};
pub use filters::{passes_filters, Combinator, Filter, FilterGroup, FilterUsage};
pub use store::{ArticleStore, MemoryStore};
pub use summarizer::{Summarizer, SummaryConfig, SummaryOutcome};
pub use types::*;
