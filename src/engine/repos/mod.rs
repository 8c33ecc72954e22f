// ── Chatvend Engine: Repositories ──────────────────────────────────────────
// One module per aggregate. Every function takes `&Connection` so it runs
// identically inside `Store::with_tx` or on the shared connection; driver
// errors surface as `EngineError::Database` and nothing above this layer
// sees rusqlite types.

pub mod cached;
pub mod codes;
pub mod convstate;
pub mod jobs;
pub mod messages;
pub mod notifications;
pub mod payments;
pub mod plans;
pub mod pricing;
pub mod purchases;
pub mod sessions;
pub mod subscriptions;
pub mod users;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::atoms::error::{EngineError, EngineResult};

/// Timestamps persist as RFC 3339 text at microsecond precision, which
/// sorts lexicographically in the same order as the instants.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

pub(crate) fn parse_ts(s: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| EngineError::OperationFailed(format!("bad stored timestamp {:?}: {}", s, e)))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> EngineResult<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(&v)).transpose()
}
