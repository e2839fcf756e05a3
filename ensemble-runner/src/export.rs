//! Reporting and export: JSON, CSV, and Markdown artifacts for TEST runs.
//!
//! Every persisted manifest carries a `schema_version`; unknown versions are
//! rejected on load.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use ensemble_core::domain::{EnsembleDecision, RankingSnapshot};
use ensemble_core::tracker::ScoreBoard;

use crate::lifecycle::TestReport;

pub const SCHEMA_VERSION: u32 = 1;

/// Everything needed to reproduce and review one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationManifest {
    pub schema_version: u32,
    pub dataset_hash: String,
    pub has_synthetic: bool,
    pub snapshot: RankingSnapshot,
    pub report: TestReport,
}

impl EvaluationManifest {
    pub fn new(snapshot: RankingSnapshot, report: TestReport, dataset_hash: String, has_synthetic: bool) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            dataset_hash,
            has_synthetic,
            snapshot,
            report,
        }
    }
}

// ─── JSON ───────────────────────────────────────────────────────────

pub fn export_json(manifest: &EvaluationManifest) -> Result<String> {
    serde_json::to_string_pretty(manifest).context("failed to serialize evaluation manifest")
}

pub fn import_json(json: &str) -> Result<EvaluationManifest> {
    let manifest: EvaluationManifest =
        serde_json::from_str(json).context("failed to deserialize evaluation manifest")?;
    if manifest.schema_version > SCHEMA_VERSION {
        bail!(
            "unsupported schema version {} (max supported: {})",
            manifest.schema_version,
            SCHEMA_VERSION
        );
    }
    Ok(manifest)
}

pub fn export_snapshot_json(snapshot: &RankingSnapshot) -> Result<String> {
    serde_json::to_string_pretty(snapshot).context("failed to serialize snapshot")
}

// ─── CSV ────────────────────────────────────────────────────────────

/// Columns: instrument, timestamp, action, aggregate_score, buy, sell, hold,
/// sizing_hint, snapshot_version, contributors (`;`-separated ids)
pub fn export_decisions_csv(decisions: &[EnsembleDecision]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "instrument",
        "timestamp",
        "action",
        "aggregate_score",
        "buy",
        "sell",
        "hold",
        "sizing_hint",
        "snapshot_version",
        "contributors",
    ])?;
    for d in decisions {
        let contributors: Vec<&str> = d.contributors().map(|id| id.as_str()).collect();
        wtr.write_record([
            d.instrument.as_str(),
            &d.timestamp.to_rfc3339(),
            &d.action.to_string(),
            &format!("{:.6}", d.aggregate_score),
            &format!("{:.6}", d.scores.buy),
            &format!("{:.6}", d.scores.sell),
            &format!("{:.6}", d.scores.hold),
            &format!("{:.4}", d.sizing_hint),
            &d.snapshot_version.map(|v| v.0.to_string()).unwrap_or_default(),
            &contributors.join(";"),
        ])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// Columns: strategy, score, samples, hits, misses, neutral, hit_rate, last_update
pub fn export_scores_csv(board: &ScoreBoard) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["strategy", "score", "samples", "hits", "misses", "neutral", "hit_rate", "last_update"])?;
    for (id, s) in board {
        wtr.write_record([
            id.as_str(),
            &format!("{:.6}", s.score),
            &s.sample_count.to_string(),
            &s.hits.to_string(),
            &s.misses.to_string(),
            &s.neutral.to_string(),
            &s.hit_rate().map(|h| format!("{h:.4}")).unwrap_or_default(),
            &s.last_update.map(|t| t.to_rfc3339()).unwrap_or_default(),
        ])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

// ─── Markdown ───────────────────────────────────────────────────────

pub fn generate_report(manifest: &EvaluationManifest) -> String {
    let r = &manifest.report;
    let m = &r.metrics;
    let mut md = String::with_capacity(2048);

    md.push_str(&format!("# Evaluation Report: snapshot {}\n\n", manifest.snapshot.version));

    md.push_str("## Metadata\n\n");
    md.push_str("| Field | Value |\n");
    md.push_str("| --- | --- |\n");
    md.push_str(&format!("| Snapshot Created | {} |\n", manifest.snapshot.created_at));
    md.push_str(&format!("| Content Hash | {} |\n", manifest.snapshot.content_hash));
    md.push_str(&format!("| Dataset Hash | {} |\n", manifest.dataset_hash));
    if manifest.has_synthetic {
        md.push_str("| Data | **SYNTHETIC** |\n");
    }
    md.push_str(&format!("| Verdict | {} |\n", if r.passed { "PASSED" } else { "FAILED" }));
    md.push('\n');

    md.push_str("## Weights\n\n");
    md.push_str("| Rank | Strategy | Weight | Score |\n");
    md.push_str("| ---: | --- | ---: | ---: |\n");
    for (i, id) in manifest.snapshot.ranking_order.iter().enumerate() {
        md.push_str(&format!(
            "| {} | {} | {:.4} | {:.4} |\n",
            i + 1,
            id,
            manifest.snapshot.weight(id),
            manifest.snapshot.scores.get(id).copied().unwrap_or(0.0)
        ));
    }
    md.push('\n');

    md.push_str("## Performance Summary\n\n");
    md.push_str("| Metric | Value |\n");
    md.push_str("| --- | --- |\n");
    md.push_str(&format!("| Decisions | {} |\n", m.decisions));
    md.push_str(&format!("| Trades | {} |\n", m.trades));
    md.push_str(&format!("| Hit Rate | {:.1}% |\n", m.hit_rate * 100.0));
    md.push_str(&format!("| Total Return | {:.2}% |\n", m.total_return * 100.0));
    md.push_str(&format!("| Mean Return | {:.3}% |\n", m.mean_return * 100.0));
    md.push_str(&format!("| Sharpe (per trade) | {:.3} |\n", m.sharpe));
    md.push_str(&format!("| Max Drawdown | {:.2}% |\n", m.max_drawdown * 100.0));
    md.push_str(&format!("| Abstentions | {} |\n", r.abstentions));
    md.push('\n');

    md
}

// ─── Artifact bundle ────────────────────────────────────────────────

/// Write `manifest.json`, `decisions.csv`, `snapshot.json`, and `report.md`
/// into `{output_dir}/eval_v{N}_{timestamp}/`. Returns the directory.
pub fn save_artifacts(manifest: &EvaluationManifest, output_dir: &Path) -> Result<PathBuf> {
    let dirname = format!(
        "eval_v{}_{}",
        manifest.snapshot.version.0,
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    );
    let run_dir = output_dir.join(dirname);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create artifact dir: {}", run_dir.display()))?;

    std::fs::write(run_dir.join("manifest.json"), export_json(manifest)?)?;
    std::fs::write(run_dir.join("decisions.csv"), export_decisions_csv(&manifest.report.decisions)?)?;
    std::fs::write(run_dir.join("snapshot.json"), export_snapshot_json(&manifest.snapshot)?)?;
    std::fs::write(run_dir.join("report.md"), generate_report(manifest))?;

    Ok(run_dir)
}

pub fn load_artifacts(dir: &Path) -> Result<EvaluationManifest> {
    let manifest_path = dir.join("manifest.json");
    let json = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    import_json(&json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Mode;
    use chrono::{TimeZone, Utc};
    use ensemble_core::domain::{
        Action, ActionScores, Contribution, SnapshotCandidate, SnapshotVersion, WeightTransform,
    };
    use ensemble_core::evaluation::EvaluationMetrics;
    use ensemble_core::tracker::ScoreState;

    fn sample_snapshot() -> RankingSnapshot {
        let candidate = SnapshotCandidate {
            weights: [("a".into(), 0.7), ("b".into(), 0.3)].into_iter().collect(),
            ranking_order: vec!["a".into(), "b".into()],
            scores: [("a".into(), 1.2), ("b".into(), -0.4)].into_iter().collect(),
            transform: WeightTransform::default(),
        };
        RankingSnapshot::from_candidate(
            candidate,
            SnapshotVersion(3),
            Utc.with_ymd_and_hms(2024, 4, 1, 21, 0, 0).unwrap(),
        )
    }

    fn sample_decision() -> EnsembleDecision {
        EnsembleDecision {
            instrument: "SPY".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 4, 2, 21, 0, 0).unwrap(),
            action: Action::Buy,
            aggregate_score: 0.42,
            scores: ActionScores {
                buy: 0.42,
                sell: 0.1,
                hold: 0.0,
            },
            contributing_strategies: vec![
                Contribution {
                    strategy_id: "a".into(),
                    weight: 0.7,
                    confidence: 0.6,
                },
                Contribution {
                    strategy_id: "b".into(),
                    weight: 0.3,
                    confidence: 0.0,
                },
            ],
            sizing_hint: 0.8077,
            snapshot_version: Some(SnapshotVersion(3)),
        }
    }

    fn sample_manifest() -> EvaluationManifest {
        let report = TestReport {
            mode: Mode::Test,
            version: SnapshotVersion(3),
            metrics: EvaluationMetrics {
                decisions: 1,
                trades: 1,
                hits: 1,
                hit_rate: 1.0,
                total_return: 0.02,
                mean_return: 0.02,
                ..EvaluationMetrics::default()
            },
            passed: false,
            abstentions: 2,
            decisions: vec![sample_decision()],
            trade_returns: vec![0.02],
        };
        EvaluationManifest::new(sample_snapshot(), report, "abc123".into(), true)
    }

    #[test]
    fn json_roundtrip() {
        let manifest = sample_manifest();
        let json = export_json(&manifest).unwrap();
        assert_eq!(import_json(&json).unwrap(), manifest);
    }

    #[test]
    fn json_rejects_unknown_version() {
        let mut manifest = sample_manifest();
        manifest.schema_version = SCHEMA_VERSION + 1;
        let json = export_json(&manifest).unwrap();
        assert!(import_json(&json).is_err());
    }

    #[test]
    fn decisions_csv_lists_contributors() {
        let csv = export_decisions_csv(&[sample_decision()]).unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("instrument,timestamp,action"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("SPY,"));
        assert!(row.contains(",BUY,"));
        assert!(row.ends_with("a;b"));
    }

    #[test]
    fn scores_csv_has_row_per_strategy() {
        let mut board = ScoreBoard::new();
        board.insert(
            "a".into(),
            ScoreState {
                score: 0.5,
                sample_count: 4,
                hits: 3,
                misses: 1,
                ..ScoreState::default()
            },
        );
        board.insert("b".into(), ScoreState::default());
        let csv = export_scores_csv(&board).unwrap();
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.contains("a,0.500000,4,3,1,0,0.7500,"));
    }

    #[test]
    fn report_has_sections() {
        let md = generate_report(&sample_manifest());
        assert!(md.contains("# Evaluation Report: snapshot v3"));
        assert!(md.contains("## Weights"));
        assert!(md.contains("## Performance Summary"));
        assert!(md.contains("**SYNTHETIC**"));
        assert!(md.contains("FAILED"));
    }

    #[test]
    fn save_load_artifacts_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = sample_manifest();
        let run_dir = save_artifacts(&manifest, dir.path()).unwrap();
        for name in ["manifest.json", "decisions.csv", "snapshot.json", "report.md"] {
            assert!(run_dir.join(name).exists(), "missing {name}");
        }
        assert_eq!(load_artifacts(&run_dir).unwrap(), manifest);
    }
}
