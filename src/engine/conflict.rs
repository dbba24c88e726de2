use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_range(range: &TimeRange) -> Result<(), EngineError> {
    if range.start < 0 || range.end > DAY_MINUTES {
        return Err(EngineError::InvalidSlot("time of day out of range"));
    }
    if range.start >= range.end {
        return Err(EngineError::InvalidSlot("start must be before end"));
    }
    Ok(())
}

/// The authoritative overlap check against one resource-day page.
/// Half-open semantics: a slot ending exactly where `range` starts (or vice
/// versa) is not a conflict. The booking commit re-runs this against the same
/// page version it inserts into, so the answer cannot go stale.
pub(crate) fn check_no_conflict(page: &SlotPage, range: &TimeRange) -> Result<(), EngineError> {
    if let Some(hit) = page.overlapping(range).next() {
        return Err(EngineError::SlotConflict(hit.session_id));
    }
    Ok(())
}
