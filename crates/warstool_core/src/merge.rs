use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::capture::{
    CaptureParams, CaptureUnit, UNCONSTRAINED, meaningful, read_capture, write_capture,
};
use crate::model::MatchRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeInputStats {
    pub total: usize,
    pub added: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub unit: CaptureUnit,
    pub per_input: Vec<MergeInputStats>,
    pub duplicates: usize,
}

/// First occurrence of a match id wins; the result is ordered newest first.
pub fn merge(units: &[CaptureUnit]) -> MergeReport {
    let mut seen = HashSet::new();
    let mut matches = Vec::new();
    let mut per_input = Vec::with_capacity(units.len());

    for unit in units {
        let mut stats = MergeInputStats {
            total: unit.matches.len(),
            ..MergeInputStats::default()
        };
        for record in &unit.matches {
            if seen.insert(record.match_id.clone()) {
                matches.push(record.clone());
                stats.added += 1;
            } else {
                stats.duplicates += 1;
            }
        }
        per_input.push(stats);
    }

    sort_newest_first(&mut matches);
    MergeReport {
        duplicates: per_input.iter().map(|stats| stats.duplicates).sum(),
        unit: CaptureUnit {
            params: merged_params(units),
            matches,
        },
        per_input,
    }
}

pub fn merge_units(units: &[CaptureUnit]) -> CaptureUnit {
    merge(units).unit
}

/// Dated records descend by time, ties by id; undated records follow in
/// their accumulated order.
fn sort_newest_first(matches: &mut [MatchRecord]) {
    matches.sort_by(|left, right| match (left.played_at, right.played_at) {
        (Some(a), Some(b)) => b.cmp(&a).then_with(|| left.match_id.cmp(&right.match_id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

/// Account, month and opponent carry forward from the first input that
/// names them; every variant field becomes unconstrained.
fn merged_params(units: &[CaptureUnit]) -> CaptureParams {
    let first_meaningful = |field: fn(&CaptureParams) -> &str| {
        units
            .iter()
            .find_map(|unit| meaningful(field(&unit.params)))
            .map(ToString::to_string)
    };

    CaptureParams {
        user: first_meaningful(|params| &params.user).unwrap_or_default(),
        opponent: first_meaningful(|params| &params.opponent)
            .unwrap_or_else(|| UNCONSTRAINED.to_string()),
        month: first_meaningful(|params| &params.month).unwrap_or_default(),
        gtype: UNCONSTRAINED.to_string(),
        opponent_type: UNCONSTRAINED.to_string(),
        init_pos_type: UNCONSTRAINED.to_string(),
        limit: UNCONSTRAINED.to_string(),
        extra: Default::default(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeFilesOutcome {
    pub report: MergeReport,
    pub merged_inputs: Vec<PathBuf>,
    pub skipped_inputs: Vec<PathBuf>,
}

/// Reads every existing input, merges them in argument order and writes the
/// result to `output`. Missing inputs are skipped with a warning.
pub fn merge_files(inputs: &[PathBuf], output: &Path) -> Result<MergeFilesOutcome> {
    let mut units = Vec::with_capacity(inputs.len());
    let mut merged_inputs = Vec::new();
    let mut skipped_inputs = Vec::new();

    for input in inputs {
        if !input.is_file() {
            warn!(path = %input.display(), "merge input not found; skipping");
            skipped_inputs.push(input.clone());
            continue;
        }
        units.push(read_capture(input)?);
        merged_inputs.push(input.clone());
    }
    if units.is_empty() {
        anyhow::bail!("no readable merge inputs");
    }

    let report = merge(&units);
    write_capture(output, &report.unit)?;
    info!(
        output = %output.display(),
        inputs = merged_inputs.len(),
        matches = report.unit.matches.len(),
        duplicates = report.duplicates,
        "merged captures"
    );
    Ok(MergeFilesOutcome {
        report,
        merged_inputs,
        skipped_inputs,
    })
}

/// Moves merged inputs into `backup_dir`, leaving `keep` in place when it is
/// one of them.
pub fn archive_inputs(inputs: &[PathBuf], backup_dir: &Path, keep: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(backup_dir)
        .with_context(|| format!("failed to create {}", backup_dir.display()))?;

    let mut moved = Vec::new();
    for input in inputs {
        if same_file(input, keep) {
            continue;
        }
        let Some(name) = input.file_name() else {
            continue;
        };
        let target = backup_dir.join(name);
        fs::rename(input, &target).with_context(|| {
            format!("failed to move {} to {}", input.display(), target.display())
        })?;
        moved.push(target);
    }
    Ok(moved)
}

fn same_file(left: &Path, right: &Path) -> bool {
    match (fs::canonicalize(left), fs::canonicalize(right)) {
        (Ok(left), Ok(right)) => left == right,
        _ => left == right,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tempfile::tempdir;

    use super::{archive_inputs, merge, merge_files, merge_units};
    use crate::capture::{CaptureParams, CaptureUnit, read_capture, write_capture};
    use crate::model::{MatchIdentity, MatchRecord, Winner};

    fn record(id: &str) -> MatchRecord {
        let identity = MatchIdentity::parse(id).expect("valid identity");
        MatchRecord::new(identity, format!("https://shogiwars.heroz.jp/games/{id}"), Winner::First)
    }

    fn unit(user: &str, opponent: &str, ids: &[&str]) -> CaptureUnit {
        CaptureUnit {
            params: CaptureParams {
                user: user.to_string(),
                opponent: opponent.to_string(),
                month: "2024-01".to_string(),
                gtype: "10min".to_string(),
                opponent_type: "normal".to_string(),
                init_pos_type: "normal".to_string(),
                limit: "3".to_string(),
                extra: Default::default(),
            },
            matches: ids.iter().map(|id| record(id)).collect(),
        }
    }

    fn ids(unit: &CaptureUnit) -> Vec<&str> {
        unit.matches
            .iter()
            .map(|record| record.match_id.as_str())
            .collect()
    }

    #[test]
    fn overlapping_units_merge_newest_first() {
        let a = unit("me", "(all)", &["x-y-20240101_100000", "p-q-20240102_110000"]);
        let b = unit("me", "(all)", &["p-q-20240102_110000", "m-n-20240103_120000"]);
        let report = merge(&[a, b]);
        assert_eq!(
            ids(&report.unit),
            vec![
                "m-n-20240103_120000",
                "p-q-20240102_110000",
                "x-y-20240101_100000"
            ]
        );
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.per_input[0].added, 2);
        assert_eq!(report.per_input[1].total, 2);
        assert_eq!(report.per_input[1].duplicates, 1);
    }

    #[test]
    fn first_occurrence_wins() {
        let mut a = unit("me", "", &["p-q-20240102_110000"]);
        a.matches[0].tags.push("from-a".to_string());
        let b = unit("me", "", &["p-q-20240102_110000"]);
        let merged = merge_units(&[a, b]);
        assert_eq!(merged.matches.len(), 1);
        assert_eq!(merged.matches[0].tags, vec!["from-a".to_string()]);
    }

    #[test]
    fn merging_with_itself_is_idempotent() {
        let a = unit("me", "", &["x-y-20240101_100000", "p-q-20240102_110000"]);
        let once = merge_units(std::slice::from_ref(&a));
        let twice = merge_units(&[a.clone(), a]);
        assert_eq!(once.matches, twice.matches);
        assert_eq!(merge_units(&[once.clone(), once.clone()]).matches, once.matches);
    }

    #[test]
    fn merge_is_associative_over_overlapping_units() {
        let a = unit("me", "", &["a-b-20240105_100000", "c-d-20240103_100000"]);
        let b = unit("me", "", &["c-d-20240103_100000", "e-f-20240104_100000"]);
        let c = unit("me", "", &["e-f-20240104_100000", "g-h-20240101_100000", "a-b-20240105_100000"]);

        let left = merge_units(&[merge_units(&[a.clone(), b.clone()]), c.clone()]);
        let right = merge_units(&[a.clone(), merge_units(&[b.clone(), c.clone()])]);
        assert_eq!(left.matches, right.matches);

        let distinct: BTreeSet<&str> = [&a, &b, &c]
            .iter()
            .flat_map(|unit| unit.matches.iter().map(|record| record.match_id.as_str()))
            .collect();
        assert_eq!(left.matches.len(), distinct.len());
    }

    #[test]
    fn undated_records_follow_dated_ones_in_input_order() {
        let mut a = unit("me", "", &["z-z-20241399_000000", "x-y-20240101_100000"]);
        a.matches.push(record("a-a-20240230_000000"));
        let merged = merge_units(&[a]);
        assert_eq!(
            ids(&merged),
            vec![
                "x-y-20240101_100000",
                "z-z-20241399_000000",
                "a-a-20240230_000000"
            ]
        );
    }

    #[test]
    fn merged_params_use_sentinels_for_variant_fields() {
        let a = unit("", "(all)", &[]);
        let b = unit("me", "rival", &[]);
        let c = unit("other", "third", &[]);
        let params = merge_units(&[a, b, c]).params;
        assert_eq!(params.user, "me");
        assert_eq!(params.opponent, "rival");
        assert_eq!(params.month, "2024-01");
        assert_eq!(params.gtype, "(all)");
        assert_eq!(params.opponent_type, "(all)");
        assert_eq!(params.init_pos_type, "(all)");
        assert_eq!(params.limit, "(all)");

        let unfiltered = merge_units(&[unit("me", "", &[])]).params;
        assert_eq!(unfiltered.opponent, "(all)");
    }

    #[test]
    fn merge_files_skips_missing_inputs_and_archives() {
        let temp = tempdir().expect("tempdir");
        let result_dir = temp.path().join("result");
        let first = result_dir.join("a.json");
        let second = result_dir.join("b.json");
        write_capture(&first, &unit("me", "", &["x-y-20240101_100000"])).expect("write a");
        write_capture(&second, &unit("me", "", &["m-n-20240103_120000", "x-y-20240101_100000"]))
            .expect("write b");

        let output = result_dir.join("merged.json");
        let outcome = merge_files(
            &[first.clone(), result_dir.join("missing.json"), second.clone()],
            &output,
        )
        .expect("merge files");
        assert_eq!(outcome.skipped_inputs.len(), 1);
        assert_eq!(outcome.merged_inputs, vec![first.clone(), second.clone()]);
        assert_eq!(outcome.report.duplicates, 1);

        let merged = read_capture(&output).expect("read merged");
        assert_eq!(ids(&merged), vec!["m-n-20240103_120000", "x-y-20240101_100000"]);

        let backup = result_dir.join("backup");
        let moved = archive_inputs(&outcome.merged_inputs, &backup, &output).expect("archive");
        assert_eq!(moved.len(), 2);
        assert!(!first.exists());
        assert!(backup.join("a.json").exists());
        assert!(output.exists());
    }

    #[test]
    fn merge_files_fails_without_any_input() {
        let temp = tempdir().expect("tempdir");
        let error = merge_files(&[temp.path().join("nope.json")], &temp.path().join("out.json"))
            .expect_err("must fail");
        assert!(error.to_string().contains("no readable merge inputs"));
    }
}
