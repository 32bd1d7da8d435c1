use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Drop seconds and sub-second components. Saturates at `Ms::MIN`.
pub fn truncate_to_minute(t: Ms) -> Ms {
    t.saturating_sub(t.rem_euclid(MINUTE_MS))
}

/// Check date presence, order, range and duration bounds; return the
/// minute-truncated span, or `None` when both dates are absent.
///
/// Instants outside `[MIN_VALID_TIMESTAMP_MS, MAX_VALID_TIMESTAMP_MS]` are
/// rejected before any arithmetic on them.
///
/// Order and duration are checked on the instants as supplied. Truncating
/// both ends by less than a minute keeps any accepted duration inside
/// `[15 min, 23 h]`, so the returned span satisfies the same bounds.
pub fn validate_dates(start: Option<Ms>, end: Option<Ms>) -> Result<Option<Span>, EngineError> {
    let (start, end) = match (start, end) {
        (None, None) => return Ok(None),
        (Some(s), Some(e)) => (s, e),
        _ => return Err(EngineError::MissingDate),
    };
    if start >= end {
        return Err(EngineError::InvertedDates);
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let duration = end - start;
    if duration < MIN_EVENT_DURATION_MS {
        return Err(EngineError::TooShort {
            min_minutes: MIN_EVENT_DURATION_MINUTES,
        });
    }
    if duration > MAX_EVENT_DURATION_MS {
        return Err(EngineError::TooLong {
            max_hours: MAX_EVENT_DURATION_HOURS,
        });
    }
    Ok(Some(Span::new(truncate_to_minute(start), truncate_to_minute(end))))
}

/// Ids of live bookings on the timeline overlapping `span`, skipping `exclude`.
pub(crate) fn overlapping_ids(
    timeline: &StageTimeline,
    span: &Span,
    exclude: Option<ulid::Ulid>,
) -> Vec<ulid::Ulid> {
    timeline
        .overlapping(span)
        .filter(|slot| Some(slot.event_id) != exclude)
        .map(|slot| slot.event_id)
        .collect()
}
