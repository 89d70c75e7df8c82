use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::{format_description, offset};

use crate::{HaetaeError, Result};

pub const SECONDS_PER_DAY: u64 = 86_400;

const KST_OFFSET_SECONDS: u64 = 9 * 60 * 60;

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs()
    }
}

const DAY_FORMAT: &[FormatItem<'_>] = format_description!("[year]-[month]-[day]");
const MONTH_FORMAT: &[FormatItem<'_>] = format_description!("[year]-[month]");

/// Calendar date in UTC+9 for the given instant, formatted `YYYY-MM-DD`.
pub fn kst_day_stamp(epoch_seconds: u64) -> Result<String> {
    format_kst(epoch_seconds, DAY_FORMAT)
}

/// Calendar month in UTC+9 for the given instant, formatted `YYYY-MM`.
pub fn kst_month_stamp(epoch_seconds: u64) -> Result<String> {
    format_kst(epoch_seconds, MONTH_FORMAT)
}

/// Seconds remaining until the next midnight in UTC+9. Always in `1..=86400`.
pub fn seconds_until_next_kst_day(epoch_seconds: u64) -> u64 {
    let elapsed = (epoch_seconds.wrapping_add(KST_OFFSET_SECONDS)) % SECONDS_PER_DAY;
    SECONDS_PER_DAY - elapsed
}

fn format_kst(epoch_seconds: u64, format: &[FormatItem<'_>]) -> Result<String> {
    let timestamp = i64::try_from(epoch_seconds).map_err(|_| {
        HaetaeError::InvalidResponse(format!("epoch seconds out of range: {epoch_seconds}"))
    })?;
    let utc = OffsetDateTime::from_unix_timestamp(timestamp)
        .map_err(|err| HaetaeError::InvalidResponse(format!("epoch seconds out of range: {err}")))?;
    utc.to_offset(offset!(+9))
        .format(format)
        .map_err(|err| HaetaeError::InvalidResponse(format!("failed to format kst stamp: {err}")))
}
