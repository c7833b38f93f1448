//! Tiered backup retention
//!
//! - age <= `keep_all_days`: kept
//! - `keep_all_days` < age <= `retention_days`: only the newest backup taken
//!   on each Sunday is kept
//! - age > `retention_days`: deleted
//!
//! Ages are whole local calendar days.

use crate::models::BackupInfo;
use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Weekday};
use std::collections::HashMap;

/// Result of applying the retention policy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionPlan {
    pub keep: Vec<BackupInfo>,
    pub evict: Vec<BackupInfo>,
}

/// Local calendar date a backup was taken on
pub fn backup_local_date(info: &BackupInfo) -> Option<NaiveDate> {
    let from_timestamp = i64::try_from(info.timestamp)
        .ok()
        .and_then(|ms| Local.timestamp_millis_opt(ms).single())
        .map(|at| at.date_naive());
    from_timestamp.or_else(|| NaiveDate::parse_from_str(&info.date, "%Y-%m-%d").ok())
}

/// Splits `backups` into kept and evicted, preserving input order in each
pub fn plan_retention(
    backups: &[BackupInfo],
    now: DateTime<Local>,
    keep_all_days: i64,
    retention_days: i64,
) -> RetentionPlan {
    let today = now.date_naive();

    // Newest backup per Sunday inside the weekly tier
    let mut sunday_winner: HashMap<NaiveDate, u64> = HashMap::new();
    for info in backups {
        let Some(date) = backup_local_date(info) else {
            continue;
        };
        let age = (today - date).num_days();
        if age > keep_all_days && age <= retention_days && date.weekday() == Weekday::Sun {
            let newest = sunday_winner.entry(date).or_insert(info.timestamp);
            *newest = (*newest).max(info.timestamp);
        }
    }

    let mut plan = RetentionPlan::default();
    let mut sunday_taken: HashMap<NaiveDate, bool> = HashMap::new();

    for info in backups {
        let keep = match backup_local_date(info) {
            // Undatable entries are left alone
            None => true,
            Some(date) => {
                let age = (today - date).num_days();
                if age <= keep_all_days {
                    true
                } else if age > retention_days {
                    false
                } else {
                    match sunday_winner.get(&date) {
                        Some(&newest) if newest == info.timestamp => {
                            let taken = sunday_taken.entry(date).or_insert(false);
                            !std::mem::replace(taken, true)
                        }
                        _ => false,
                    }
                }
            }
        };

        if keep {
            plan.keep.push(info.clone());
        } else {
            plan.evict.push(info.clone());
        }
    }

    plan
}
