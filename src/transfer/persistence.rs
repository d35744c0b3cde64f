//! Mapping of saved transfer lists back into queue state.
//!
//! Nothing that was in flight survives a restart: sockets and tokens are
//! gone. Downloads that were waiting or running come back as
//! `User logged off` and are requested again once their user is seen
//! online. Uploads are the remote user's business, so only the history of
//! finished ones is kept.

use std::collections::HashSet;

use super::record::Transfer;
use super::status::{FailureReason, TransferStatus};

pub fn restore_downloads(records: Vec<Transfer>) -> Vec<Transfer> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|t| seen.insert(t.key()))
        .map(|mut t| {
            t.status = match t.status {
                TransferStatus::Paused | TransferStatus::Cancelled => TransferStatus::Paused,
                TransferStatus::Filtered => TransferStatus::Filtered,
                TransferStatus::Finished => TransferStatus::Finished,
                _ if t.size > 0 && t.current_byte_offset >= t.size => TransferStatus::Finished,
                _ => TransferStatus::Failed(FailureReason::UserLoggedOff),
            };
            if t.status == TransferStatus::Finished {
                t.current_byte_offset = t.size;
            }
            t.current_byte_offset = t.current_byte_offset.min(t.size);
            t
        })
        .collect()
}

pub fn restore_uploads(records: Vec<Transfer>) -> Vec<Transfer> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|t| t.status == TransferStatus::Finished && seen.insert(t.key()))
        .map(|mut t| {
            t.current_byte_offset = t.size;
            t
        })
        .collect()
}
