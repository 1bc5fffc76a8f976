//! Six-field cron expressions: `seconds minutes hours day-of-month month
//! day-of-week`, evaluated in UTC.
//!
//! Each field supports `*`, `a`, `a-b`, `a-b/step`, `*/step` and comma
//! lists. Day-of-week 0 and 7 both denote Sunday. When both day fields are
//! constrained, a day matches on day-of-month, or on day-of-week when the
//! day falls within the first week of the month (day <= 7); outside the
//! first week day-of-month alone applies.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    sec: u64,
    min: u64,
    hour: u32,
    dom: u32,
    month: u16,
    dow: u8,
    dom_star: bool,
    dow_star: bool,
}

impl CronExpr {
    pub fn parse(s: &str) -> Result<CronExpr> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 6 {
            bail!("cron needs 6 fields (sec min hour dom month dow), got {}", fields.len());
        }

        let sec = parse_field(fields[0], 0, 59).with_context(|| format!("seconds field {:?}", fields[0]))?;
        let min = parse_field(fields[1], 0, 59).with_context(|| format!("minutes field {:?}", fields[1]))?;
        let hour = parse_field(fields[2], 0, 23).with_context(|| format!("hours field {:?}", fields[2]))?;
        let dom = parse_field(fields[3], 1, 31).with_context(|| format!("day-of-month field {:?}", fields[3]))?;
        let month = parse_field(fields[4], 1, 12).with_context(|| format!("month field {:?}", fields[4]))?;
        let dow_raw = parse_field(fields[5], 0, 7).with_context(|| format!("day-of-week field {:?}", fields[5]))?;

        // Fold 7 onto 0: both denote Sunday.
        let mut dow = (dow_raw & 0x7f) as u8;
        if dow_raw & (1 << 7) != 0 {
            dow |= 1;
        }

        Ok(CronExpr {
            source: s.to_string(),
            sec,
            min,
            hour: hour as u32,
            dom: (dom >> 1) as u32,
            month: (month >> 1) as u16,
            dow,
            dom_star: fields[3] == "*",
            dow_star: fields[5] == "*",
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Does `t` (UTC seconds) match the expression?
    pub fn matches(&self, t: u64) -> bool {
        let Some(dt) = Utc.timestamp_opt(t as i64, 0).single() else {
            return false;
        };
        self.sec & (1 << dt.second()) != 0
            && self.min & (1 << dt.minute()) != 0
            && self.hour & (1 << dt.hour()) != 0
            && self.month & (1 << (dt.month() - 1)) != 0
            && self.day_matches(dt.day(), dt.weekday().num_days_from_sunday())
    }

    fn day_matches(&self, day: u32, weekday0: u32) -> bool {
        let dom_hit = self.dom & (1 << (day - 1)) != 0;
        let dow_hit = self.dow & (1 << weekday0) != 0;
        match (self.dom_star, self.dow_star) {
            (true, true) => true,
            (false, true) => dom_hit,
            (true, false) => dow_hit,
            // Union, but DOW only applies inside the first week.
            (false, false) => dom_hit || (dow_hit && day <= 7),
        }
    }

    /// Smallest matching instant strictly after `t`. `None` when no match
    /// exists within the search horizon (an impossible date such as Feb 30
    /// in a constrained year range).
    pub fn next_after(&self, t: u64) -> Option<u64> {
        let mut dt = Utc.timestamp_opt(t as i64, 0).single()? + Duration::seconds(1);
        // Four years covers every leap-day/first-week combination.
        let horizon = dt + Duration::days(4 * 366);

        while dt < horizon {
            if self.month & (1 << (dt.month() - 1)) == 0 {
                dt = start_of_next_month(dt)?;
                continue;
            }
            if !self.day_matches(dt.day(), dt.weekday().num_days_from_sunday()) {
                dt = start_of_next_day(dt);
                continue;
            }
            if self.hour & (1 << dt.hour()) == 0 {
                dt = start_of_next_hour(dt);
                continue;
            }
            if self.min & (1 << dt.minute()) == 0 {
                dt = start_of_next_minute(dt);
                continue;
            }
            match next_set_bit(self.sec, dt.second()) {
                Some(sec) => {
                    let ts = dt.timestamp() as u64 - dt.second() as u64 + sec as u64;
                    return Some(ts);
                }
                None => {
                    dt = start_of_next_minute(dt);
                }
            }
        }
        None
    }
}

/// Lowest set bit at or above `from`.
fn next_set_bit(mask: u64, from: u32) -> Option<u32> {
    (from..64).find(|&i| mask & (1 << i) != 0)
}

fn start_of_next_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    let floored = dt.timestamp() - dt.second() as i64;
    Utc.timestamp_opt(floored + 60, 0).single().unwrap_or(dt)
}

fn start_of_next_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    let floored = dt.timestamp() - dt.minute() as i64 * 60 - dt.second() as i64;
    Utc.timestamp_opt(floored + 3600, 0).single().unwrap_or(dt)
}

fn start_of_next_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    let floored = dt.timestamp()
        - dt.hour() as i64 * 3600
        - dt.minute() as i64 * 60
        - dt.second() as i64;
    Utc.timestamp_opt(floored + 86_400, 0).single().unwrap_or(dt)
}

fn start_of_next_month(dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (y, m) = if dt.month() == 12 {
        (dt.year() + 1, 1)
    } else {
        (dt.year(), dt.month() + 1)
    };
    Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single()
}

/// Parse one field into a bitmask over `lo..=hi` (bit `n` = value `n`).
fn parse_field(field: &str, lo: u32, hi: u32) -> Result<u64> {
    if field.is_empty() {
        bail!("empty field");
    }
    let mut mask = 0u64;
    for item in field.split(',') {
        mask |= parse_item(item, lo, hi)?;
    }
    if mask == 0 {
        bail!("field matches nothing");
    }
    Ok(mask)
}

fn parse_item(item: &str, lo: u32, hi: u32) -> Result<u64> {
    let (range, step) = match item.split_once('/') {
        Some((r, s)) => {
            let step: u32 = s.parse().with_context(|| format!("step {s:?}"))?;
            if step == 0 {
                bail!("step must be >= 1");
            }
            (r, step)
        }
        None => (item, 1),
    };

    let (start, end) = if range == "*" {
        (lo, hi)
    } else if let Some((a, b)) = range.split_once('-') {
        let a: u32 = a.parse().with_context(|| format!("range start {a:?}"))?;
        let b: u32 = b.parse().with_context(|| format!("range end {b:?}"))?;
        (a, b)
    } else {
        let v: u32 = range.parse().with_context(|| format!("value {range:?}"))?;
        if item.contains('/') {
            // `a/step` means `a-hi/step`, matching classic cron.
            (v, hi)
        } else {
            (v, v)
        }
    };

    if start < lo || end > hi || start > end {
        bail!("{item:?} out of range {lo}..={hi}");
    }

    let mut mask = 0u64;
    let mut v = start;
    while v <= end {
        mask |= 1 << v;
        v += step;
    }
    Ok(mask)
}
