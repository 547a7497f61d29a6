pub mod rows;
pub mod schema;
pub mod store;

pub use store::Store;

use crate::errors::{LedgerError, Result};
use chrono::{DateTime, Utc};

pub(crate) fn parse_ts(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::Database(format!("invalid stored timestamp {text:?}: {e}")))
}

pub(crate) fn parse_json(text: &str) -> Result<serde_json::Value> {
    serde_json::from_str(text)
        .map_err(|e| LedgerError::Database(format!("invalid stored JSON: {e}")))
}
