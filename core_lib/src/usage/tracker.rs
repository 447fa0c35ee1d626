use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct UsageRecord {
    day: String,
    bytes_counted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaRejection {
    #[error("Daily traffic limit exceeded")]
    LimitReached { used: u64, limit: u64 },

    #[error("Daily upload limit exceeded")]
    WouldExceed { used: u64, requested: u64, limit: u64 },

    #[error("Daily download limit exceeded")]
    DownloadLimitReached { used: u64, limit: u64 },
}

/// `YYYY-MM-DD` for the UTC day containing `now`.
pub fn utc_day(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Per-client byte counters for one traffic direction, reset at UTC midnight.
/// Upload and download quotas each own a separate tracker.
#[derive(Clone)]
pub struct UsageTracker {
    usage: Arc<Mutex<HashMap<String, UsageRecord>>>,
    limit: u64,
}

impl UsageTracker {
    fn new(limit: u64) -> Self {
        Self {
            usage: Arc::new(Mutex::new(HashMap::new())),
            limit,
        }
    }

    pub fn uploads(limit: u64) -> Self {
        Self::new(limit)
    }

    pub fn downloads(limit: u64) -> Self {
        Self::new(limit)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Admit an upload of `declared` bytes and charge it up front.
    /// Returns the client's counted total after the charge.
    pub fn admit_upload(
        &self,
        client: &str,
        declared: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, QuotaRejection> {
        let day = utc_day(now);
        let mut usage = self.usage.lock();
        let record = current_record(&mut usage, client, &day);

        if record.bytes_counted >= self.limit {
            warn!(client = %client, used = record.bytes_counted, limit = self.limit, "Upload limit exceeded");
            return Err(QuotaRejection::LimitReached {
                used: record.bytes_counted,
                limit: self.limit,
            });
        }

        if record.bytes_counted.saturating_add(declared) > self.limit {
            return Err(QuotaRejection::WouldExceed {
                used: record.bytes_counted,
                requested: declared,
                limit: self.limit,
            });
        }

        record.bytes_counted += declared;
        Ok(record.bytes_counted)
    }

    /// Admit a download if the client is still under the limit. Returns the
    /// day the eventual byte count must be charged to.
    pub fn admit_download(&self, client: &str, now: DateTime<Utc>) -> Result<String, QuotaRejection> {
        let day = utc_day(now);
        let mut usage = self.usage.lock();
        let record = current_record(&mut usage, client, &day);

        if record.bytes_counted >= self.limit {
            warn!(client = %client, used = record.bytes_counted, limit = self.limit, "Download limit exceeded");
            return Err(QuotaRejection::DownloadLimitReached {
                used: record.bytes_counted,
                limit: self.limit,
            });
        }

        Ok(day)
    }

    /// Charge `bytes` to `client` for `day`. Charges for a day that has
    /// already rolled over are dropped.
    pub fn record(&self, client: &str, day: &str, bytes: u64) {
        let mut usage = self.usage.lock();

        match usage.get_mut(client) {
            Some(record) if record.day == day => {
                record.bytes_counted = record.bytes_counted.saturating_add(bytes);
            }
            Some(record) => {
                debug!(client = %client, charged_day = %day, current_day = %record.day, "Dropping charge for a past day");
            }
            None => {
                usage.insert(
                    client.to_string(),
                    UsageRecord {
                        day: day.to_string(),
                        bytes_counted: bytes,
                    },
                );
            }
        }
    }

    pub fn usage(&self, client: &str, now: DateTime<Utc>) -> u64 {
        let day = utc_day(now);
        self.usage
            .lock()
            .get(client)
            .filter(|record| record.day == day)
            .map(|record| record.bytes_counted)
            .unwrap_or(0)
    }
}

fn current_record<'a>(
    usage: &'a mut HashMap<String, UsageRecord>,
    client: &str,
    day: &str,
) -> &'a mut UsageRecord {
    let record = usage.entry(client.to_string()).or_insert_with(|| UsageRecord {
        day: day.to_string(),
        bytes_counted: 0,
    });

    if record.day != day {
        *record = UsageRecord {
            day: day.to_string(),
            bytes_counted: 0,
        };
    }

    record
}
