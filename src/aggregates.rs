use std::collections::BTreeMap;
use tracing::debug;

use crate::database::{self, DbPool, METRICS};
use crate::error::StorageError;

/// Metric name -> per-period values, index 0 = current period.
pub type MetricSeries = BTreeMap<String, Vec<f64>>;

/// Load the identified analyses for the subject list and the cross-list
/// aggregate history they compare against.
///
/// `list_stats` carries the subject's own values newest first (one or two
/// periods). `agg_stats` carries per-rank means over every list that granted
/// `store_aggregates`, aligned so index 0 is the current-period mean and
/// index 1 the prior-period mean when any sharing list has a prior row.
pub async fn generate_summary_stats(
    pool: &DbPool,
    analysis_ids: &[i64],
) -> Result<(MetricSeries, MetricSeries), StorageError> {
    let analyses = database::load_analyses(pool, analysis_ids).await?;

    let mut list_stats: MetricSeries = METRICS
        .iter()
        .map(|m| (m.to_string(), Vec::new()))
        .collect();
    for analysis in &analyses {
        for (metric, value) in analysis.metric_values() {
            list_stats
                .get_mut(metric)
                .expect("metric registered above")
                .push(value);
        }
    }

    let ranks = database::aggregate_means(pool, 2).await?;
    let mut agg_stats: MetricSeries = METRICS
        .iter()
        .map(|m| (m.to_string(), Vec::new()))
        .collect();
    for rank in &ranks {
        for (i, metric) in METRICS.iter().enumerate() {
            agg_stats
                .get_mut(*metric)
                .expect("metric registered above")
                .push(rank[i]);
        }
    }

    debug!(
        "Summary stats: {} subject period(s), {} aggregate rank(s)",
        analyses.len(),
        ranks.len()
    );
    Ok((list_stats, agg_stats))
}

/// Percent-change strings between the subject's values and the aggregate
/// baseline, position by position: `(list[i] - agg[i]) / agg[i]`, signed,
/// one decimal place, half-up. A zero baseline always reads `+0.0%`.
pub fn generate_diffs(
    list_stats: &MetricSeries,
    agg_stats: &MetricSeries,
) -> BTreeMap<String, Vec<String>> {
    let mut diffs = BTreeMap::new();
    for (metric, current_values) in list_stats {
        let baseline = match agg_stats.get(metric) {
            Some(values) => values,
            None => continue,
        };
        let formatted = current_values
            .iter()
            .zip(baseline.iter())
            .map(|(current, previous)| format_diff(*current, *previous))
            .collect();
        diffs.insert(metric.clone(), formatted);
    }
    diffs
}

fn format_diff(current: f64, previous: f64) -> String {
    if previous == 0.0 {
        return "+0.0%".to_string();
    }
    let change = (current - previous) / previous * 100.0;
    // Half-up to one decimal; normalize -0.0 so a flat diff reads "+0.0%".
    let mut rounded = (change * 10.0).round() / 10.0;
    if rounded == 0.0 {
        rounded = 0.0;
    }
    format!("{:+.1}%", rounded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::*;
    use crate::database::{insert_list_stats, upsert_email_list};
    use chrono::{Duration, Utc};

    fn series(pairs: &[(&str, &[f64])]) -> MetricSeries {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn doubling_reads_plus_one_hundred() {
        let diffs = generate_diffs(&series(&[("x", &[2.0])]), &series(&[("x", &[1.0])]));
        assert_eq!(diffs["x"], vec!["+100.0%"]);
    }

    #[test]
    fn rounding_is_half_up_to_one_decimal() {
        let diffs = generate_diffs(&series(&[("x", &[0.5])]), &series(&[("x", &[0.3])]));
        assert_eq!(diffs["x"], vec!["+66.7%"]);
    }

    #[test]
    fn shrinking_reads_negative() {
        let diffs = generate_diffs(&series(&[("x", &[1.0])]), &series(&[("x", &[2.0])]));
        assert_eq!(diffs["x"], vec!["-50.0%"]);
    }

    #[test]
    fn zero_baseline_reads_flat_instead_of_infinite() {
        let diffs = generate_diffs(&series(&[("x", &[0.5, 0.0])]), &series(&[("x", &[0.0, 0.0])]));
        assert_eq!(diffs["x"], vec!["+0.0%", "+0.0%"]);
    }

    #[test]
    fn diffs_cover_each_position() {
        let diffs = generate_diffs(
            &series(&[("x", &[2.0, 3.0])]),
            &series(&[("x", &[1.0, 2.0])]),
        );
        assert_eq!(diffs["x"], vec!["+100.0%", "+50.0%"]);
    }

    #[tokio::test]
    async fn single_row_single_sharing_list_yields_one_value_per_metric() {
        let (pool, _dir) = test_pool().await;
        upsert_email_list(&pool, &sample_list("subject", true, false))
            .await
            .unwrap();
        upsert_email_list(&pool, &sample_list("private", false, false))
            .await
            .unwrap();

        let id = insert_list_stats(&pool, "subject", Utc::now(), &sample_calculations(80, 0.4))
            .await
            .unwrap();
        insert_list_stats(&pool, "private", Utc::now(), &sample_calculations(999, 0.9))
            .await
            .unwrap();

        let (list_stats, agg_stats) = generate_summary_stats(&pool, &[id]).await.unwrap();

        for metric in crate::database::METRICS {
            assert_eq!(list_stats[metric].len(), 1, "list_stats[{}]", metric);
            assert_eq!(agg_stats[metric].len(), 1, "agg_stats[{}]", metric);
        }
        assert!((list_stats["subscribers"][0] - 80.0).abs() < 1e-9);
        // The private list is excluded from the aggregate entirely.
        assert!((agg_stats["subscribers"][0] - 80.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn two_periods_align_current_then_prior() {
        let (pool, _dir) = test_pool().await;
        upsert_email_list(&pool, &sample_list("subject", true, false))
            .await
            .unwrap();

        let prior = insert_list_stats(
            &pool,
            "subject",
            Utc::now() - Duration::days(31),
            &sample_calculations(50, 0.2),
        )
        .await
        .unwrap();
        let current = insert_list_stats(&pool, "subject", Utc::now(), &sample_calculations(100, 0.4))
            .await
            .unwrap();

        let (list_stats, agg_stats) =
            generate_summary_stats(&pool, &[current, prior]).await.unwrap();

        assert_eq!(list_stats["subscribers"], vec![100.0, 50.0]);
        assert_eq!(agg_stats["subscribers"], vec![100.0, 50.0]);

        let diffs = generate_diffs(&list_stats, &agg_stats);
        assert_eq!(diffs["subscribers"], vec!["+0.0%", "+0.0%"]);
    }
}
