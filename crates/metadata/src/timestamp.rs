//! Conversions between `OffsetDateTime` and the integer microsecond
//! timestamps stored in upload tables.

use beacon_core::CommitDate;
use time::OffsetDateTime;

/// Stored in `committed_at` when the commit could not be resolved.
pub const UNRESOLVABLE_COMMIT: i64 = i64::MIN;

pub fn to_micros(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000) as i64
}

pub fn from_micros(micros: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn commit_date_to_db(date: CommitDate) -> i64 {
    match date {
        CommitDate::At(at) => to_micros(at),
        CommitDate::Unresolvable => UNRESOLVABLE_COMMIT,
    }
}

pub fn commit_date_from_db(micros: i64) -> CommitDate {
    if micros == UNRESOLVABLE_COMMIT {
        CommitDate::Unresolvable
    } else {
        CommitDate::At(from_micros(micros))
    }
}
