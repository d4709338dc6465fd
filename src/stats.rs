use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;
use crate::mailchimp::{ListSnapshot, MemberStatus};

const SECONDS_PER_WEEK: f64 = 604_800.0;

/// The derived numbers for one analysis run. This is exactly what gets
/// persisted as a `list_stats` row (histogram serialized to JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListCalculations {
    pub subscribers: i64,
    pub open_rate: f64,
    pub frequency: f64,
    pub subscribed_pct: f64,
    pub unsubscribed_pct: f64,
    pub cleaned_pct: f64,
    pub pending_pct: f64,
    pub high_open_rt_pct: f64,
    pub cur_yr_inactive_pct: f64,
    pub hist_bin_counts: Vec<i64>,
}

/// Derive all summary statistics from a snapshot. Pure; `now` is passed in
/// so the trailing-window calculations are reproducible in tests.
pub fn calculate(
    snapshot: &ListSnapshot,
    now: DateTime<Utc>,
    config: &AnalysisConfig,
) -> ListCalculations {
    let (subscribed_pct, unsubscribed_pct, cleaned_pct, pending_pct) =
        calc_list_breakdown(snapshot);

    ListCalculations {
        // The API's own member + unsubscribe + cleaned sum is the
        // authoritative subscriber total; the roster can lag behind it.
        subscribers: snapshot.member_count + snapshot.unsubscribe_count + snapshot.cleaned_count,
        open_rate: snapshot.open_rate,
        frequency: calc_frequency(snapshot, now),
        subscribed_pct,
        unsubscribed_pct,
        cleaned_pct,
        pending_pct,
        high_open_rt_pct: calc_high_open_rate_pct(snapshot, config.high_open_rate_threshold),
        cur_yr_inactive_pct: calc_inactive_pct(snapshot, now, config.inactive_window_days),
        hist_bin_counts: calc_histogram(snapshot, config.histogram_bins),
    }
}

/// Share of each subscription status over the full roster. An empty roster
/// yields all zeros rather than a division by zero.
fn calc_list_breakdown(snapshot: &ListSnapshot) -> (f64, f64, f64, f64) {
    let total = snapshot.members.len();
    if total == 0 {
        return (0.0, 0.0, 0.0, 0.0);
    }

    let count_of = |status: MemberStatus| {
        snapshot.members.iter().filter(|m| m.status == status).count() as f64 / total as f64
    };

    (
        count_of(MemberStatus::Subscribed),
        count_of(MemberStatus::Unsubscribed),
        count_of(MemberStatus::Cleaned),
        count_of(MemberStatus::Pending),
    )
}

/// Campaigns per week since the list was created; 0 for a brand-new list.
fn calc_frequency(snapshot: &ListSnapshot, now: DateTime<Utc>) -> f64 {
    let elapsed = now - snapshot.creation_timestamp;
    let weeks = elapsed.num_seconds() as f64 / SECONDS_PER_WEEK;
    if weeks <= 0.0 {
        return 0.0;
    }
    snapshot.campaign_count as f64 / weeks
}

/// Fraction of subscribed members whose unique open rate exceeds the
/// threshold (0.80 by default).
fn calc_high_open_rate_pct(snapshot: &ListSnapshot, threshold: f64) -> f64 {
    let subscribed: Vec<_> = snapshot
        .members
        .iter()
        .filter(|m| m.status == MemberStatus::Subscribed)
        .collect();
    if subscribed.is_empty() {
        return 0.0;
    }
    subscribed.iter().filter(|m| m.open_rate > threshold).count() as f64 / subscribed.len() as f64
}

/// Fraction of subscribed members with no recorded open inside the trailing
/// window. A member with no open on record at all counts as inactive.
fn calc_inactive_pct(snapshot: &ListSnapshot, now: DateTime<Utc>, window_days: i64) -> f64 {
    let cutoff = now - Duration::days(window_days);
    let subscribed: Vec<_> = snapshot
        .members
        .iter()
        .filter(|m| m.status == MemberStatus::Subscribed)
        .collect();
    if subscribed.is_empty() {
        return 0.0;
    }
    let inactive = subscribed
        .iter()
        .filter(|m| match m.last_open {
            Some(ts) => ts < cutoff,
            None => true,
        })
        .count();
    inactive as f64 / subscribed.len() as f64
}

/// Equal-width histogram of subscribed members' unique open rates over
/// [0, 1]. A rate of exactly 1.0 lands in the last bin.
fn calc_histogram(snapshot: &ListSnapshot, bins: usize) -> Vec<i64> {
    let bins = bins.max(1);
    let mut counts = vec![0i64; bins];
    for member in &snapshot.members {
        if member.status != MemberStatus::Subscribed {
            continue;
        }
        let idx = ((member.open_rate * bins as f64) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    counts
}
