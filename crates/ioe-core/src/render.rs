//! Text rendering of pushed records for log sinks.

use crate::api::{CommRecord, EventRecord, LogRecord};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

/// Format device seconds-since-epoch as `2018-08-09 14:33:13.256` in the
/// local offset, or UTC when the local offset cannot be determined.
pub fn format_timestamp(secs: f64) -> String {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    format_timestamp_at(secs, offset)
}

pub fn format_timestamp_at(secs: f64, offset: UtcOffset) -> String {
    // Round to whole milliseconds first; f64 seconds cannot hold nanoseconds.
    let nanos = (secs * 1000.0).round() as i128 * 1_000_000;
    let format = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
    );
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map(|t| t.to_offset(offset))
        .ok()
        .and_then(|t| t.format(&format).ok())
        .unwrap_or_else(|| format!("{:.3}", secs))
}

pub fn render_log(record: &LogRecord) -> String {
    format!(
        "[{}] [{}] [{}] {}",
        format_timestamp(record.timestamp),
        record.level,
        record.process,
        record.content
    )
}

pub fn render_event(record: &EventRecord) -> String {
    let time = record
        .timestamp
        .map(format_timestamp)
        .unwrap_or_else(|| "-".to_string());
    format!(
        "[{}] [{}] [{}] [{}] {} {}",
        time, record.kind, record.app, record.level, record.info, record.data
    )
}

/// Comm frames are shown as lowercase hex; undecodable payloads are shown raw.
pub fn render_comm(record: &CommRecord) -> String {
    let payload = match record.payload() {
        Ok(bytes) => data_encoding::HEXLOWER.encode(&bytes),
        Err(_) => record.data.clone(),
    };
    format!(
        "[{}] [{}] [{}] {}",
        format_timestamp(record.ts),
        record.dir,
        record.sn,
        payload
    )
}
