//! Fixed-offset helpers over ISO-8601 strings.
//!
//! Calendar starts arrive as `YYYY-MM-DDTHH:MM:SS±TZ` or `YYYY-MM-DD`. We slice
//! them by position and never convert timezones: the hour and minute are the
//! ones written in the string.

/// Length of the `YYYY-MM-DD` prefix.
pub const DATE_LEN: usize = 10;

const TIME_START: usize = 11;
const TIME_END: usize = 16;

/// First ten characters of an ISO string. `None` if the string is shorter
/// (or the cut would land inside a multi-byte character).
pub fn date_part(iso: &str) -> Option<&str> {
    iso.get(..DATE_LEN)
}

/// The `HH:MM` slice of a date-time string, or `None` for a plain date.
pub fn time_of_day(iso: &str) -> Option<&str> {
    if !iso.contains('T') {
        return None;
    }
    iso.get(TIME_START..TIME_END)
}

/// Split `HH:MM` into hours and minutes.
pub fn parse_hh_mm(hh_mm: &str) -> Option<(u32, u32)> {
    let (h, m) = hh_mm.split_once(':')?;
    Some((h.parse().ok()?, m.parse().ok()?))
}

pub fn zero_pad(value: u32, width: usize) -> String {
    format!("{value:0width$}")
}

/// `hh:mm AM` / `hh:mm PM`. Hour 0 renders as 12.
pub fn format_12h(hours: u32, minutes: u32) -> String {
    let period = if hours >= 12 { "PM" } else { "AM" };
    let hour12 = match hours % 12 {
        0 => 12,
        h => h,
    };
    format!("{}:{} {period}", zero_pad(hour12, 2), zero_pad(minutes, 2))
}

pub fn format_24h(hours: u32, minutes: u32) -> String {
    format!("{}:{}", zero_pad(hours, 2), zero_pad(minutes, 2))
}

/// `HH:MM` → minutes since midnight.
pub fn minutes_of_day(hh_mm: &str) -> Option<u32> {
    let (h, m) = parse_hh_mm(hh_mm)?;
    if h > 24 || m >= 60 || (h == 24 && m > 0) {
        return None;
    }
    Some(h * 60 + m)
}
