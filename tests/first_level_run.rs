use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use neuroflow_core::config::AppConfig;
use neuroflow_core::error::FlowError;
use neuroflow_engine::{Executor, ExecutorConfig, FsSink, MemorySink, NodeStatus};
use neuroflow_firstlevel::{create_first_level, load_study_events, FirstLevelUnits};

const PUBLISHED_STATS: &[&str] = &[
    "copes/cope01.nii.gz",
    "res4d/res4d01.nii.gz",
    "tstats/tstat01.nii.gz",
    "varcopes/varcope01.nii.gz",
    "zstats/zstat01.nii.gz",
];

/// Two subjects with two runs each and a single contrast.
fn write_study(root: &Path, mask_02_run_2: &str) -> AppConfig {
    let mut events = vec![];
    for subject in [1, 2] {
        for run in [1, 2] {
            for (condition, onset) in [("congruent", 2.0), ("incongruent", 6.0), ("congruent", 10.0)] {
                events.push(json!({
                    "subject": subject,
                    "run": run,
                    "condition": condition,
                    "onset": onset,
                    "duration": 1.5,
                    "amplitude": 1.0,
                }));
            }
        }
    }
    let events_file = root.join("events.json");
    std::fs::write(&events_file, serde_json::to_string(&events).unwrap()).unwrap();

    let toml_content = format!(
        r#"
[study]
data_root = "{root}/bids"
task = "stroop"
subjects = ["01", "02"]
events_file = "{events}"

[[study.runs]]
subject = "01"
number = 1
func_path = "sub-01/func/run-1_bold.nii.gz"
mask_path = "sub-01/func/brainmask.nii.gz"

[[study.runs]]
subject = "01"
number = 2
func_path = "sub-01/func/run-2_bold.nii.gz"
mask_path = "sub-01/func/brainmask.nii.gz"

[[study.runs]]
subject = "02"
number = 1
func_path = "sub-02/func/run-1_bold.nii.gz"
mask_path = "sub-02/func/brainmask.nii.gz"

[[study.runs]]
subject = "02"
number = 2
func_path = "sub-02/func/run-2_bold.nii.gz"
mask_path = "{mask_02_run_2}"

[[study.contrasts]]
name = "incongruent_vs_congruent"
conditions = ["incongruent", "congruent"]
weights = [1.0, -1.0]

[engine]
work_dir = "{root}/work"
max_parallel = 2
"#,
        root = root.display(),
        events = events_file.display(),
        mask_02_run_2 = mask_02_run_2,
    );
    let config = AppConfig::from_toml_str(&toml_content).expect("parse config");
    config.validate().expect("valid config");
    config
}

fn executor_for(config: &AppConfig, sink: Arc<dyn neuroflow_core::Sink>) -> Executor {
    Executor::new(ExecutorConfig::from(&config.engine), sink)
}

#[tokio::test]
async fn test_two_subjects_publish_separate_containers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_study(dir.path(), "sub-02/func/brainmask.nii.gz");
    let events = load_study_events(&config).expect("events");

    let workflow = create_first_level(&config, Arc::new(events), &FirstLevelUnits::placeholders())
        .expect("build workflow");
    let expanded = workflow.expand().expect("expand");

    let sink = Arc::new(MemorySink::new());
    let report = executor_for(&config, sink.clone())
        .run(&expanded)
        .await
        .expect("run");

    assert!(report.succeeded);
    assert_eq!(report.count(NodeStatus::Failed), 0);
    assert_eq!(sink.containers(), vec!["01", "02"]);

    for subject in ["01", "02"] {
        let paths = sink.paths_in(subject);
        let stats: Vec<&str> = paths
            .iter()
            .map(String::as_str)
            .filter(|p| !p.starts_with("qa/"))
            .collect();
        assert_eq!(stats, PUBLISHED_STATS, "subject {}", subject);
        assert_eq!(
            paths.iter().filter(|p| p.starts_with("qa/model/")).count(),
            6,
            "three design files per run"
        );
        assert!(paths.iter().all(|p| !p.contains("_subject_id_")));
    }

    // Each subject's outputs come from its own replica
    let zstat_01 = report
        .publications
        .iter()
        .find(|p| p.container == "01" && p.path == "zstats/zstat01.nii.gz")
        .expect("zstat for 01");
    let source = zstat_01.value.as_str().expect("file path");
    assert!(source.contains("_subject_id_01"));
    assert!(source.ends_with("_flameo0/stats/zstat1.nii.gz"));

    // Per-run estimates were regrouped before fixed effects
    let flameo_input = std::fs::read_to_string(source).expect("descriptor");
    let descriptor: serde_json::Value = serde_json::from_str(&flameo_input).unwrap();
    assert_eq!(descriptor["copes"].as_array().map(Vec::len), Some(2));
    assert!(descriptor["mask_file"]
        .as_str()
        .unwrap()
        .ends_with("sub-01/func/brainmask.nii.gz"));
}

#[tokio::test]
async fn test_filesystem_sink_layout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_study(dir.path(), "sub-02/func/brainmask.nii.gz");
    let events = load_study_events(&config).expect("events");
    let expanded = create_first_level(&config, Arc::new(events), &FirstLevelUnits::placeholders())
        .expect("build workflow")
        .expand()
        .expect("expand");

    let out = dir.path().join("out");
    executor_for(&config, Arc::new(FsSink::new(&out)))
        .run(&expanded)
        .await
        .expect("run");

    for subject in ["01", "02"] {
        for path in PUBLISHED_STATS {
            assert!(out.join(subject).join(path).is_file(), "{}/{}", subject, path);
        }
    }
    let cope = std::fs::read_to_string(out.join("02/copes/cope01.nii.gz")).unwrap();
    assert!(cope.contains("\"stat\": \"cope\""));
}

#[tokio::test]
async fn test_ambiguous_mask_aborts_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_study(dir.path(), "sub-02/anat/other_mask.nii.gz");
    let events = load_study_events(&config).expect("events");
    let expanded = create_first_level(&config, Arc::new(events), &FirstLevelUnits::placeholders())
        .expect("build workflow")
        .expand()
        .expect("expand");

    let err = executor_for(&config, Arc::new(MemorySink::new()))
        .run(&expanded)
        .await
        .expect_err("distinct masks");

    match &err {
        FlowError::NodeFailed { node, iteration, .. } => {
            assert_eq!(node, "_subject_id_02/datasource");
            assert_eq!(iteration.as_deref(), Some("subject_id=02"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(err.root_cause(), FlowError::Ingestion(_)));
}
