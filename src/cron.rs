//! Five-field cron expression parsing and minute matching for the trigger
//! schedules.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::types::{BrewError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronField {
    Any,
    Values(Vec<u32>),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Values(values) => values.contains(&value),
        }
    }
}

/// A `minute hour day-of-month month day-of-week` schedule. All restricted
/// fields must match for a minute to fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    pub day_of_week: CronField,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(BrewError::Config(format!(
                "cron expression needs 5 fields (minute hour day month day-of-week), got {:?}",
                expr
            )));
        }
        Ok(Self {
            minute: parse_field(parts[0], 0, 59)?,
            hour: parse_field(parts[1], 0, 23)?,
            day_of_month: parse_field(parts[2], 1, 31)?,
            month: parse_field(parts[3], 1, 12)?,
            // 0 and 7 both mean Sunday.
            day_of_week: parse_field(parts[4], 0, 7).map(fold_sunday)?,
        })
    }

    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day_of_month.matches(t.day())
            && self.month.matches(t.month())
            && self.day_of_week.matches(t.weekday().num_days_from_sunday())
    }
}

fn fold_sunday(field: CronField) -> CronField {
    match field {
        CronField::Values(values) => {
            let mut values: Vec<u32> = values.into_iter().map(|d| d % 7).collect();
            values.sort_unstable();
            values.dedup();
            CronField::Values(values)
        }
        any => any,
    }
}

fn parse_field(spec: &str, min: u32, max: u32) -> Result<CronField> {
    if spec == "*" {
        return Ok(CronField::Any);
    }
    if let Some(step) = spec.strip_prefix("*/") {
        let step: u32 = step
            .parse()
            .map_err(|_| BrewError::Config(format!("bad cron step {:?}", spec)))?;
        if step == 0 {
            return Err(BrewError::Config(format!("zero cron step {:?}", spec)));
        }
        return Ok(CronField::Values(
            (min..=max).step_by(step as usize).collect(),
        ));
    }

    let mut values = Vec::new();
    for part in spec.split(',') {
        if let Some((lo, hi)) = part.split_once('-') {
            let lo = parse_value(lo, min, max)?;
            let hi = parse_value(hi, min, max)?;
            if lo > hi {
                return Err(BrewError::Config(format!("inverted cron range {:?}", part)));
            }
            values.extend(lo..=hi);
        } else {
            values.push(parse_value(part, min, max)?);
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok(CronField::Values(values))
}

fn parse_value(raw: &str, min: u32, max: u32) -> Result<u32> {
    let value: u32 = raw
        .trim()
        .parse()
        .map_err(|_| BrewError::Config(format!("bad cron value {:?}", raw)))?;
    if value < min || value > max {
        return Err(BrewError::Config(format!(
            "cron value {} out of range {}-{}",
            value, min, max
        )));
    }
    Ok(value)
}
