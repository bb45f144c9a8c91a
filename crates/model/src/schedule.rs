use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// When an external scheduler should next call `start` for a job.
///
/// The orchestrator stores this alongside the job but never acts on it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Schedule {
    pub next_run_at: Option<DateTime<Utc>>,
    pub recurrence: Option<Recurrence>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    Once,
    Daily { at: NaiveTime },
    Weekly { weekday: Weekday, at: NaiveTime },
    /// `day` is clamped to the last day of shorter months.
    Monthly { day: u32, at: NaiveTime },
}

impl Schedule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.is_some_and(|at| at <= now)
    }

    /// Next run after `after` according to the recurrence; `None` for one-shot schedules.
    pub fn following(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.recurrence.and_then(|r| r.next_after(after))
    }
}

impl Recurrence {
    /// First occurrence strictly after `after` (UTC).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = after.date_naive();
        match *self {
            Recurrence::Once => None,
            Recurrence::Daily { at } => {
                let candidate = today.and_time(at).and_utc();
                if candidate > after {
                    Some(candidate)
                } else {
                    today
                        .checked_add_days(Days::new(1))
                        .map(|d| d.and_time(at).and_utc())
                }
            }
            Recurrence::Weekly { weekday, at } => {
                let ahead = (7 + weekday.num_days_from_monday()
                    - today.weekday().num_days_from_monday())
                    % 7;
                let date = today.checked_add_days(Days::new(ahead as u64))?;
                let candidate = date.and_time(at).and_utc();
                if candidate > after {
                    Some(candidate)
                } else {
                    date.checked_add_days(Days::new(7))
                        .map(|d| d.and_time(at).and_utc())
                }
            }
            Recurrence::Monthly { day, at } => {
                let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
                let this_month = clamp_day(first, day)?.and_time(at).and_utc();
                if this_month > after {
                    return Some(this_month);
                }
                let next_first = first.checked_add_months(Months::new(1))?;
                clamp_day(next_first, day).map(|d| d.and_time(at).and_utc())
            }
        }
    }
}

fn clamp_day(first_of_month: NaiveDate, day: u32) -> Option<NaiveDate> {
    let last = first_of_month
        .checked_add_months(Months::new(1))?
        .pred_opt()?
        .day();
    first_of_month.with_day(day.clamp(1, last))
}
