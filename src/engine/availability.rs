use serde::{Deserialize, Serialize};

use crate::model::CalendarEvent;
use crate::timefmt;

// ── Busy slots ─────────────────────────────────────────────────────

/// Date portion of a requested timestamp. `None` when there is nothing to
/// resolve (empty or shorter than a date).
pub fn target_date(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    timefmt::date_part(raw)
}

/// Busy-slot markers for the day of `raw_target`.
///
/// Every timed event starting on that day contributes its 12-hour marker and
/// then its 24-hour marker, in event order. All-day events, events on other
/// days, and events whose time can't be read contribute nothing. An
/// unresolvable target yields an empty set.
pub fn busy_slots(raw_target: &str, events: &[CalendarEvent]) -> Vec<String> {
    let Some(target) = target_date(raw_target) else {
        return Vec::new();
    };

    let mut busy = Vec::new();
    for event in events {
        let Some(start) = event.start() else {
            continue;
        };
        if timefmt::date_part(start) != Some(target) {
            continue;
        }
        // All-day events don't hold a specific slot.
        let Some(hh_mm) = timefmt::time_of_day(start) else {
            continue;
        };
        let Some((hours, minutes)) = timefmt::parse_hh_mm(hh_mm) else {
            continue;
        };
        busy.push(timefmt::format_12h(hours, minutes));
        busy.push(timefmt::format_24h(hours, minutes));
    }
    busy
}

// ── Open slots ─────────────────────────────────────────────────────

/// Bookable day grid: `[open, close)` every `step_minutes`, as minutes since
/// midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotGrid {
    pub open: u32,
    pub close: u32,
    pub step_minutes: u32,
}

impl Default for SlotGrid {
    fn default() -> Self {
        Self {
            open: 9 * 60,
            close: 17 * 60,
            step_minutes: 30,
        }
    }
}

impl SlotGrid {
    /// 24-hour markers of every slot in the grid.
    pub fn slots(&self) -> Vec<String> {
        if self.step_minutes == 0 {
            return Vec::new();
        }
        (self.open..self.close)
            .step_by(self.step_minutes as usize)
            .map(|m| timefmt::format_24h(m / 60, m % 60))
            .collect()
    }
}

/// Grid slots that no busy marker claims. Grid order is kept.
pub fn open_slots(grid: &[String], busy: &[String]) -> Vec<String> {
    grid.iter()
        .filter(|slot| !busy.iter().any(|b| b == *slot))
        .cloned()
        .collect()
}
