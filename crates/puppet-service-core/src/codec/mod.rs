//! Payload codec: native puppet values to wire records and back.
//!
//! Pure and stateless. `event` covers the event stream payloads, `payload`
//! the entity records returned by the service façade.

pub mod event;
pub mod payload;

pub use event::{decode_envelope, encode_envelope};

use crate::error::{PuppetServiceError, Result};
use chrono::{DateTime, TimeZone, Utc};

pub(crate) fn datetime_to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| PuppetServiceError::payload("timestamp", format!("out of range: {}", millis)))
}
