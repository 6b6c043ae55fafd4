/// 部分成功の集計と、ジョブに残す注記の生成。
use std::collections::BTreeMap;

use crate::pipeline::adapter::BatchSummary;

/// アダプタ単位の累積結果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StageTotals {
    total: usize,
    failed: usize,
    circuit_open: usize,
    exhausted: usize,
}

/// バッチをまたいでアダプタごとの失敗を集計する。
#[derive(Debug, Clone, Default)]
pub struct PartialSuccessAnalysis {
    stages: BTreeMap<String, StageTotals>,
}

impl PartialSuccessAnalysis {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, summary: &BatchSummary) {
        let totals = self.stages.entry(summary.adapter.clone()).or_default();
        totals.total += summary.total;
        totals.failed += summary.failed;
        totals.circuit_open += summary.circuit_open;
        totals.exhausted += summary.exhausted;
    }

    /// 失敗が1件でもあったアダプタ名。
    #[must_use]
    pub fn degraded_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|(_, totals)| totals.failed > 0)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.stages.values().any(|totals| totals.failed > 0)
    }

    /// 人間向けの注記。失敗のないアダプタは含めない。
    #[must_use]
    pub fn notes(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|(_, totals)| totals.failed > 0)
            .map(|(name, totals)| {
                let other = totals.failed - totals.circuit_open - totals.exhausted;
                format!(
                    "{name}: {failed} of {total} records not screened \
                     (circuit open: {open}, retries exhausted: {exhausted}, other: {other})",
                    failed = totals.failed,
                    total = totals.total,
                    open = totals.circuit_open,
                    exhausted = totals.exhausted,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(adapter: &str, total: usize, failed: usize, open: usize) -> BatchSummary {
        BatchSummary {
            adapter: adapter.to_string(),
            total,
            succeeded: total - failed,
            failed,
            circuit_open: open,
            exhausted: failed - open,
        }
    }

    #[test]
    fn accumulates_across_batches() {
        let mut analysis = PartialSuccessAnalysis::new();
        analysis.record(&summary("dnc_screening", 200, 0, 0));
        analysis.record(&summary("litigator_screening", 200, 0, 0));
        analysis.record(&summary("dnc_screening", 200, 200, 195));

        assert!(analysis.is_partial());
        assert_eq!(analysis.degraded_stages(), vec!["dnc_screening"]);
        assert_eq!(
            analysis.notes(),
            vec![
                "dnc_screening: 200 of 400 records not screened \
                 (circuit open: 195, retries exhausted: 5, other: 0)"
                    .to_string()
            ]
        );
    }

    #[test]
    fn clean_run_has_no_notes() {
        let mut analysis = PartialSuccessAnalysis::new();
        analysis.record(&summary("person_lookup", 10, 0, 0));
        assert!(!analysis.is_partial());
        assert!(analysis.notes().is_empty());
    }
}
