//! Reduced cron matching for season and hibernation windows. Gates are
//! of the `"m h dom mon dow"` form; activation is decided on hour-of-day
//! and day-of-week after converting into the schedule's timezone.

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};

use crate::error::{Result, WardenError};

/// Day-of-week set in cron numbering (0 = Sunday .. 6 = Saturday).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DowSet([bool; 7]);

impl DowSet {
    fn any() -> Self {
        Self([true; 7])
    }

    fn empty() -> Self {
        Self([false; 7])
    }

    fn insert(&mut self, dow: usize) {
        self.0[dow % 7] = true;
    }

    pub fn contains(&self, instant: DateTime<FixedOffset>) -> bool {
        let dow = instant.weekday().num_days_from_sunday() as usize;
        self.0[dow]
    }

    fn contains_index(&self, dow: usize) -> bool {
        self.0[dow % 7]
    }
}

/// One parsed gate. Day-of-month and month are accepted but not matched;
/// the reduced form gates on hour and weekday only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronGate {
    pub minute: u32,
    /// None for `*`.
    pub hour: Option<u32>,
    pub dow: DowSet,
}

fn dow_index(token: &str) -> Result<usize> {
    let named = match token.to_ascii_uppercase().as_str() {
        "SUN" => Some(0),
        "MON" => Some(1),
        "TUE" => Some(2),
        "WED" => Some(3),
        "THU" => Some(4),
        "FRI" => Some(5),
        "SAT" => Some(6),
        _ => None,
    };
    if let Some(index) = named {
        return Ok(index);
    }
    let numeric: usize = token
        .parse()
        .map_err(|_| WardenError::InvalidConfig(format!("bad day-of-week token: {token}")))?;
    if numeric > 7 {
        return Err(WardenError::InvalidConfig(format!(
            "day-of-week out of range: {token}"
        )));
    }
    // Both 0 and 7 mean Sunday, as in classic cron.
    Ok(numeric % 7)
}

fn parse_dow(field: &str) -> Result<DowSet> {
    if field == "*" {
        return Ok(DowSet::any());
    }

    let mut set = DowSet::empty();
    for part in field.split(',') {
        match part.split_once('-') {
            Some((from, to)) => {
                let from = dow_index(from)?;
                let to = dow_index(to)?;
                // Wrap-around ranges (SAT-MON) walk through Sunday.
                let mut day = from;
                loop {
                    set.insert(day);
                    if day == to {
                        break;
                    }
                    day = (day + 1) % 7;
                }
            }
            None => set.insert(dow_index(part)?),
        }
    }
    Ok(set)
}

impl CronGate {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(WardenError::InvalidConfig(format!(
                "cron expression needs 5 fields, got {}: {expr:?}",
                fields.len()
            )));
        }

        let minute = if fields[0] == "*" {
            0
        } else {
            fields[0].parse().map_err(|_| {
                WardenError::InvalidConfig(format!("bad cron minute: {}", fields[0]))
            })?
        };
        let hour = if fields[1] == "*" {
            None
        } else {
            let hour: u32 = fields[1].parse().map_err(|_| {
                WardenError::InvalidConfig(format!("bad cron hour: {}", fields[1]))
            })?;
            if hour > 23 {
                return Err(WardenError::InvalidConfig(format!(
                    "cron hour out of range: {hour}"
                )));
            }
            Some(hour)
        };
        let dow = parse_dow(fields[4])?;

        Ok(Self { minute, hour, dow })
    }
}

/// Parse the schedule timezone: `None`/`"UTC"`, or a fixed offset such as
/// `"+02:00"` / `"-05:30"`.
pub fn parse_timezone(tz: Option<&str>) -> Result<FixedOffset> {
    let Some(tz) = tz else {
        return Ok(FixedOffset::east_opt(0).expect("zero offset"));
    };
    if tz.eq_ignore_ascii_case("utc") || tz.is_empty() {
        return Ok(FixedOffset::east_opt(0).expect("zero offset"));
    }

    let (sign, rest) = match tz.split_at_checked(1) {
        Some(("+", rest)) => (1i32, rest),
        Some(("-", rest)) => (-1i32, rest),
        _ => {
            return Err(WardenError::InvalidConfig(format!(
                "unsupported timezone: {tz} (use UTC or a +HH:MM offset)"
            )));
        }
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(|| {
        WardenError::InvalidConfig(format!("bad timezone offset: {tz}"))
    })?;
    let hours: i32 = hours
        .parse()
        .map_err(|_| WardenError::InvalidConfig(format!("bad timezone offset: {tz}")))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| WardenError::InvalidConfig(format!("bad timezone offset: {tz}")))?;
    if hours > 14 || minutes > 59 {
        return Err(WardenError::InvalidConfig(format!(
            "timezone offset out of range: {tz}"
        )));
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(|| {
        WardenError::InvalidConfig(format!("timezone offset out of range: {tz}"))
    })
}

/// A start/end gate pair with its timezone, ready to answer containment
/// questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronWindow {
    start: CronGate,
    end: CronGate,
    offset: FixedOffset,
}

impl CronWindow {
    pub fn new(start_expr: &str, end_expr: &str, tz: Option<&str>) -> Result<Self> {
        Ok(Self {
            start: CronGate::parse(start_expr)?,
            end: CronGate::parse(end_expr)?,
            offset: parse_timezone(tz)?,
        })
    }

    /// Whether `instant` falls inside the window. The start gate's
    /// weekday set decides which days open a window; windows whose end
    /// hour is at or before the start hour wrap past midnight into the
    /// next day.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.offset);
        let hour = local.hour();

        let (Some(start_hour), Some(end_hour)) = (self.start.hour, self.end.hour) else {
            // Hour-less gates degrade to pure weekday matching.
            return self.start.dow.contains(local);
        };

        if start_hour < end_hour {
            self.start.dow.contains(local) && hour >= start_hour && hour < end_hour
        } else {
            // Wrapping window: open late on a matching day, closing the
            // following morning.
            let today = local.weekday().num_days_from_sunday() as usize;
            let yesterday = (today + 6) % 7;
            (self.start.dow.contains_index(today) && hour >= start_hour)
                || (self.start.dow.contains_index(yesterday) && hour < end_hour)
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn parses_weekday_names_and_ranges() {
        let gate = CronGate::parse("0 9 * * MON-FRI").unwrap();
        assert_eq!(gate.hour, Some(9));
        // 2026-03-02 is a Monday, 2026-03-07 a Saturday.
        let monday = utc(2026, 3, 2, 9).with_timezone(&FixedOffset::east_opt(0).unwrap());
        let saturday = utc(2026, 3, 7, 9).with_timezone(&FixedOffset::east_opt(0).unwrap());
        assert!(gate.dow.contains(monday));
        assert!(!gate.dow.contains(saturday));
    }

    #[test]
    fn wraparound_range_walks_through_sunday() {
        let gate = CronGate::parse("0 0 * * SAT-MON").unwrap();
        let saturday = utc(2026, 3, 7, 0).with_timezone(&FixedOffset::east_opt(0).unwrap());
        let sunday = utc(2026, 3, 8, 0).with_timezone(&FixedOffset::east_opt(0).unwrap());
        let tuesday = utc(2026, 3, 10, 0).with_timezone(&FixedOffset::east_opt(0).unwrap());
        assert!(gate.dow.contains(saturday));
        assert!(gate.dow.contains(sunday));
        assert!(!gate.dow.contains(tuesday));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(CronGate::parse("0 9 * *").is_err());
        assert!(CronGate::parse("0 25 * * *").is_err());
        assert!(CronGate::parse("0 9 * * FUNDAY").is_err());
    }

    #[test]
    fn window_contains_business_hours() {
        let window = CronWindow::new("0 9 * * MON-FRI", "0 17 * * MON-FRI", None).unwrap();
        assert!(window.contains(utc(2026, 3, 2, 9)));
        assert!(window.contains(utc(2026, 3, 2, 16)));
        assert!(!window.contains(utc(2026, 3, 2, 17)));
        assert!(!window.contains(utc(2026, 3, 2, 8)));
        // Saturday is outside MON-FRI.
        assert!(!window.contains(utc(2026, 3, 7, 10)));
    }

    #[test]
    fn wrapping_window_crosses_midnight() {
        let window = CronWindow::new("0 22 * * MON", "0 6 * * TUE", None).unwrap();
        // Monday 23:00 is inside.
        assert!(window.contains(utc(2026, 3, 2, 23)));
        // Tuesday 03:00 is still inside (opened Monday night).
        assert!(window.contains(utc(2026, 3, 3, 3)));
        // Tuesday 07:00 is out.
        assert!(!window.contains(utc(2026, 3, 3, 7)));
        // Wednesday 03:00 is out (Tuesday did not open a window).
        assert!(!window.contains(utc(2026, 3, 4, 3)));
    }

    #[test]
    fn timezone_conversion_precedes_matching() {
        // 09:00-17:00 at +05:00: 04:00 UTC is 09:00 local.
        let window =
            CronWindow::new("0 9 * * MON-FRI", "0 17 * * MON-FRI", Some("+05:00")).unwrap();
        assert!(window.contains(utc(2026, 3, 2, 4)));
        assert!(!window.contains(utc(2026, 3, 2, 13))); // 18:00 local
    }

    #[test]
    fn timezone_parsing() {
        assert!(parse_timezone(Some("UTC")).is_ok());
        assert!(parse_timezone(Some("+05:30")).is_ok());
        assert!(parse_timezone(Some("-08:00")).is_ok());
        assert!(parse_timezone(Some("Europe/Berlin")).is_err());
    }
}
