// SPDX-License-Identifier: Apache-2.0

//! Magic-variable templating over raw SQL and database/table name patterns.
//!
//! `@(YYYY) @(YY) @(MM) @(DD) @(hh) @(mm) @(ss)` are substituted from a
//! reference time. Plain rendering additionally accepts the non-padded
//! `M D h m s` forms; the positional [`MagicSpec`] used for history
//! comparison accepts only the padded ones, because comparison relies on
//! fixed-width fields.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::error::{Error, Result};

pub const SUPPORT_REMINDER: &str =
    "history magic only supports @(YYYY) @(YY) @(MM) @(DD) @(hh) @(mm) @(ss)";

const WILDCARD: char = '*';

/// Time units in comparison order, year first.
const UNITS: usize = 6;

fn convert_magic(magic: &str, now: &DateTime<Utc>) -> Option<String> {
    match magic {
        "YYYY" => Some(format!("{}", now.year())),
        "YY" => Some(format!("{:04}", now.year())[2..].to_string()),
        "MM" => Some(format!("{:02}", now.month())),
        "M" => Some(format!("{}", now.month())),
        "DD" => Some(format!("{:02}", now.day())),
        "D" => Some(format!("{}", now.day())),
        "hh" => Some(format!("{:02}", now.hour())),
        "h" => Some(format!("{}", now.hour())),
        "mm" => Some(format!("{:02}", now.minute())),
        "m" => Some(format!("{}", now.minute())),
        "ss" => Some(format!("{:02}", now.second())),
        "s" => Some(format!("{}", now.second())),
        _ => None,
    }
}

/// Padded variants only; returns the unit index for positional tracking.
fn convert_magic_index(magic: &str, now: &DateTime<Utc>) -> Option<(String, usize)> {
    match magic {
        "YYYY" => Some((format!("{}", now.year()), 0)),
        "YY" => Some((format!("{:04}", now.year())[2..].to_string(), 0)),
        "MM" => Some((format!("{:02}", now.month()), 1)),
        "DD" => Some((format!("{:02}", now.day()), 2)),
        "hh" => Some((format!("{:02}", now.hour()), 3)),
        "mm" => Some((format!("{:02}", now.minute()), 4)),
        "ss" => Some((format!("{:02}", now.second()), 5)),
        _ => None,
    }
}

/// Substitute every `@(...)` placeholder. An invalid placeholder (no
/// closing parenthesis or an unknown name) leaves the raw string unchanged.
pub fn render_magic(raw: &str, now: &DateTime<Utc>) -> String {
    let mut parts = raw.split("@(");
    let mut out = String::from(parts.next().unwrap_or_default());
    for part in parts {
        let Some(close) = part.find(')') else {
            return raw.to_string();
        };
        let Some(rendered) = convert_magic(&part[..close], now) else {
            return raw.to_string();
        };
        out.push_str(&rendered);
        out.push_str(&part[close + 1..]);
    }
    out
}

/// Split raw SQL statements on `;` and render each.
pub fn render_sqls(raw_sqls: &str, now: &DateTime<Utc>) -> Vec<String> {
    raw_sqls
        .split(';')
        .filter_map(|sql| {
            let rendered = render_magic(sql, now);
            let rendered = rendered.trim();
            if rendered.is_empty() {
                None
            } else {
                Some(rendered.to_string())
            }
        })
        .collect()
}

/// Whether `raw` uses only the placeholders the positional spec supports.
pub fn check_magic(raw: &str) -> bool {
    let now = Utc::now();
    let mut parts = raw.split("@(");
    let _ = parts.next();
    for part in parts {
        let Some(close) = part.find(')') else {
            return true;
        };
        let name = &part[..close];
        if name.len() < 2 || convert_magic_index(name, &now).is_none() {
            return false;
        }
    }
    true
}

/// A rendered pattern with the positions of its time fields and of the
/// literal remainder, used to order candidate names against the reference
/// time and against the last consumed record.
#[derive(Debug, Clone)]
pub struct MagicSpec {
    /// Start offset per unit within `rendered`; -1 when the unit is absent.
    time_start: [i64; UNITS],
    time_end: [usize; UNITS],
    /// `[start, end)` pairs of non-time segments, wildcard-trimmed.
    remain_index: Vec<usize>,
    pub rendered: String,
}

impl MagicSpec {
    pub fn compile(raw: &str, now: &DateTime<Utc>) -> Result<MagicSpec> {
        let mut spec = MagicSpec {
            time_start: [-1; UNITS],
            time_end: [0; UNITS],
            remain_index: vec![0],
            rendered: String::new(),
        };

        let mut parts = raw.split("@(");
        spec.rendered = parts.next().unwrap_or_default().to_string();
        let mut record_index = spec.rendered.len();

        let rest: Vec<&str> = parts.collect();
        if rest.is_empty() {
            // No magic at all, e.g. `mytest*`.
            let trimmed = remove_wildcards(&spec.rendered, record_index);
            spec.remain_index.push(trimmed);
            return Ok(spec);
        }

        spec.remain_index.push(record_index);
        for part in rest {
            let Some(close) = part.find(')') else {
                spec.rendered = raw.to_string();
                return Ok(spec);
            };
            let name = &part[..close];
            if name.len() < 2 {
                return Err(Error::Sql(SUPPORT_REMINDER.to_string()));
            }
            let Some((res, unit)) = convert_magic_index(name, now) else {
                return Err(Error::Sql(SUPPORT_REMINDER.to_string()));
            };

            spec.time_start[unit] = record_index as i64;
            spec.rendered.push_str(&res);
            record_index = spec.rendered.len();
            spec.time_end[unit] = record_index;

            if close + 1 < part.len() {
                let remain = &part[close + 1..];
                spec.rendered.push_str(remain);
                if remain == "*" {
                    record_index = spec.rendered.len();
                    continue;
                }
                spec.remain_index.push(record_index);
                spec.remain_index
                    .push(remove_wildcards(remain, spec.rendered.len()));
                record_index = spec.rendered.len();
            }
        }

        Ok(spec)
    }

    /// Compare `target`'s time fields against `against`'s. With `min` set,
    /// a smaller target passes (≤ semantics); otherwise a larger one does.
    pub fn compare_time(&self, target: &str, against: &str, min: bool) -> bool {
        for unit in 0..UNITS {
            if self.time_start[unit] < 0 {
                continue;
            }
            let start = self.time_start[unit] as usize;
            let end = self.time_end[unit];

            let Some(cur) = target.get(start..end).and_then(|s| s.parse::<i64>().ok()) else {
                return false;
            };
            let Some(m) = against.get(start..end).and_then(|s| s.parse::<i64>().ok()) else {
                return false;
            };
            if cur < m {
                return min;
            }
            if cur > m {
                return !min;
            }
        }
        true
    }

    /// Whether `target`'s time fields equal the rendered reference.
    pub fn equal_time(&self, target: &str) -> bool {
        for unit in 0..UNITS {
            if self.time_start[unit] < 0 {
                continue;
            }
            let start = self.time_start[unit] as usize;
            let end = self.time_end[unit];
            let Some(cur) = target.get(start..end).and_then(|s| s.parse::<i64>().ok()) else {
                return false;
            };
            let Some(m) = self
                .rendered
                .get(start..end)
                .and_then(|s| s.parse::<i64>().ok())
            else {
                return false;
            };
            if cur != m {
                return false;
            }
        }
        true
    }

    fn remain_str(&self, origin: &str) -> String {
        if self.remain_index.len() % 2 != 0 {
            return origin.to_string();
        }
        let mut out = String::new();
        for pair in self.remain_index.chunks(2) {
            if let Some(part) = origin.get(pair[0]..pair[1]) {
                out.push_str(part);
            }
        }
        out
    }

    /// Whether `target`'s literal (non-time) segments match the pattern's.
    pub fn matches_remainder(&self, target: &str) -> bool {
        if let Some(&last) = self.remain_index.last() {
            if target.len() < last {
                return false;
            }
        }
        let magic_remain = self.remain_str(&self.rendered);
        let mut target_remain = self.remain_str(target);
        if target_remain.len() < magic_remain.len() {
            return false;
        }
        if target_remain[..magic_remain.len()] != magic_remain {
            return false;
        }
        if self.rendered.ends_with(WILDCARD) {
            return true;
        }
        if target.len() > self.rendered.len() {
            target_remain.push_str(&target[self.rendered.len()..]);
            if target_remain != magic_remain {
                return false;
            }
        }
        true
    }
}

fn remove_wildcards(segment: &str, length: usize) -> usize {
    if segment.contains(WILDCARD) {
        length - 1
    } else {
        length
    }
}
