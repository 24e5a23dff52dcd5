use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use neuroflow_core::config::RunRecord;
use neuroflow_core::error::{FlowError, Result};

/// One row of the event table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    /// Subject label; numeric labels may be written as numbers.
    #[serde(deserialize_with = "string_or_number")]
    pub subject: String,
    pub run: u32,
    pub condition: String,
    pub onset: f64,
    pub duration: f64,
    pub amplitude: f64,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Label {
        Text(String),
        Number(serde_json::Number),
    }
    Ok(match Label::deserialize(deserializer)? {
        Label::Text(s) => s,
        Label::Number(n) => n.to_string(),
    })
}

/// Per-run model input: onsets, durations and amplitudes per condition.
///
/// All four lists are parallel and ordered by condition name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionBundle {
    pub conditions: Vec<String>,
    pub onsets: Vec<Vec<f64>>,
    pub durations: Vec<Vec<f64>>,
    pub amplitudes: Vec<Vec<f64>>,
}

/// Everything the model needs for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectData {
    /// Functional run paths, ordered by run number.
    pub func: Vec<String>,
    pub mask: String,
    /// One bundle per run, parallel to `func`.
    pub bunches: Vec<ConditionBundle>,
}

/// Load the event table from a JSON array of rows.
pub fn load_events(path: &Path) -> Result<Vec<EventRow>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        FlowError::Ingestion(format!("cannot read events file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        FlowError::Ingestion(format!("malformed events file {}: {}", path.display(), e))
    })
}

/// Whether two subject labels name the same subject.
///
/// Labels that both parse as integers compare numerically, so `"01"`
/// matches `1`.
pub fn same_subject(a: &str, b: &str) -> bool {
    match (a.trim().parse::<u64>(), b.trim().parse::<u64>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

/// Select one subject's runs and group its events into per-run bundles.
pub fn collect_subject_data(
    data_root: &Path,
    subject_id: &str,
    runs: &[RunRecord],
    events: &[EventRow],
) -> Result<SubjectData> {
    let mut subject_runs: Vec<&RunRecord> = runs
        .iter()
        .filter(|r| same_subject(&r.subject, subject_id))
        .collect();
    if subject_runs.is_empty() {
        return Err(FlowError::Ingestion(format!(
            "subject '{}' has no runs in the manifest",
            subject_id
        )));
    }
    subject_runs.sort_by_key(|r| r.number);

    let mut masks: Vec<&str> = subject_runs.iter().map(|r| r.mask_path.as_str()).collect();
    masks.sort_unstable();
    masks.dedup();
    if masks.len() > 1 {
        return Err(FlowError::Ingestion(format!(
            "subject '{}' has {} distinct brain masks: {}",
            subject_id,
            masks.len(),
            masks.join(", ")
        )));
    }
    let mask = data_root.join(masks[0]).to_string_lossy().into_owned();

    // run -> condition -> rows, both ordered
    let mut grouped: BTreeMap<u32, BTreeMap<&str, Vec<&EventRow>>> = BTreeMap::new();
    for row in events.iter().filter(|e| same_subject(&e.subject, subject_id)) {
        grouped
            .entry(row.run)
            .or_default()
            .entry(row.condition.as_str())
            .or_default()
            .push(row);
    }

    let mut func = Vec::with_capacity(subject_runs.len());
    let mut bunches = Vec::with_capacity(subject_runs.len());
    for run in &subject_runs {
        let Some(conditions) = grouped.get(&run.number) else {
            return Err(FlowError::Ingestion(format!(
                "run {} of subject '{}' has no events",
                run.number, subject_id
            )));
        };
        let mut bundle = ConditionBundle::default();
        for (condition, rows) in conditions {
            bundle.conditions.push(condition.to_string());
            bundle.onsets.push(rows.iter().map(|r| r.onset).collect());
            bundle.durations.push(rows.iter().map(|r| r.duration).collect());
            bundle.amplitudes.push(rows.iter().map(|r| r.amplitude).collect());
        }
        func.push(data_root.join(&run.func_path).to_string_lossy().into_owned());
        bunches.push(bundle);
    }

    debug!(
        subject_id = %subject_id,
        runs = func.len(),
        "Collected subject data"
    );
    Ok(SubjectData {
        func,
        mask,
        bunches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn run(subject: &str, number: u32, mask: &str) -> RunRecord {
        RunRecord {
            subject: subject.into(),
            number,
            func_path: format!("sub-{}/func/run-{}_bold.nii.gz", subject, number),
            mask_path: mask.into(),
        }
    }

    fn event(subject: &str, run: u32, condition: &str, onset: f64) -> EventRow {
        EventRow {
            subject: subject.into(),
            run,
            condition: condition.into(),
            onset,
            duration: 1.5,
            amplitude: 1.0,
        }
    }

    #[test]
    fn test_groups_by_run_then_condition() {
        let runs = vec![
            run("01", 2, "sub-01/mask.nii.gz"),
            run("01", 1, "sub-01/mask.nii.gz"),
            run("02", 1, "sub-02/mask.nii.gz"),
        ];
        let events = vec![
            event("1", 2, "word", 4.0),
            event("1", 1, "word", 2.0),
            event("1", 1, "face", 10.0),
            event("1", 1, "word", 8.0),
            event("2", 1, "face", 3.0),
        ];

        let data = collect_subject_data(Path::new("/bids"), "01", &runs, &events).unwrap();
        assert_eq!(
            data.func,
            vec![
                "/bids/sub-01/func/run-1_bold.nii.gz",
                "/bids/sub-01/func/run-2_bold.nii.gz"
            ]
        );
        assert_eq!(data.mask, "/bids/sub-01/mask.nii.gz");
        assert_eq!(data.bunches.len(), 2);
        assert_eq!(data.bunches[0].conditions, vec!["face", "word"]);
        assert_eq!(data.bunches[0].onsets, vec![vec![10.0], vec![2.0, 8.0]]);
        assert_eq!(data.bunches[1].conditions, vec!["word"]);
    }

    #[test]
    fn test_only_manifest_runs_selected() {
        let runs = vec![run("01", 1, "m.nii.gz")];
        let events = vec![event("01", 1, "a", 0.0), event("01", 3, "a", 0.0)];
        let data = collect_subject_data(Path::new("/bids"), "01", &runs, &events).unwrap();
        assert_eq!(data.bunches.len(), 1);
    }

    #[test]
    fn test_distinct_masks_rejected() {
        let runs = vec![run("01", 1, "a.nii.gz"), run("01", 2, "b.nii.gz")];
        let events = vec![event("01", 1, "x", 0.0), event("01", 2, "x", 0.0)];
        let err = collect_subject_data(Path::new("/bids"), "01", &runs, &events).unwrap_err();
        assert!(matches!(err, FlowError::Ingestion(_)));
        assert!(err.to_string().contains("2 distinct brain masks"));
    }

    #[test]
    fn test_run_without_events_rejected() {
        let runs = vec![run("01", 1, "m.nii.gz"), run("01", 2, "m.nii.gz")];
        let events = vec![event("01", 1, "x", 0.0)];
        let err = collect_subject_data(Path::new("/bids"), "01", &runs, &events).unwrap_err();
        assert!(err.to_string().contains("run 2"));
    }

    #[test]
    fn test_same_subject() {
        assert!(same_subject("01", "1"));
        assert!(same_subject("ctrl", "ctrl"));
        assert!(!same_subject("01", "02"));
        assert!(!same_subject("01a", "1"));
    }

    #[test]
    fn test_load_events_numeric_subject() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"subject": 1, "run": 1, "condition": "word", "onset": 0.5, "duration": 2, "amplitude": 1}}]"#
        )
        .unwrap();
        let rows = load_events(file.path()).unwrap();
        assert_eq!(rows[0].subject, "1");
        assert_eq!(rows[0].duration, 2.0);
    }
}
