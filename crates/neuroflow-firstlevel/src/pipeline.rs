use std::sync::Arc;

use serde_json::json;
use tracing::info;

use neuroflow_core::config::{AppConfig, ContrastSpec};
use neuroflow_core::error::Result;
use neuroflow_core::types::Value;
use neuroflow_engine::graph::{PortSpec, Workflow, SINK_CONTAINER, SINK_SUBSTITUTIONS};
use neuroflow_engine::units::IdentityUnit;

use crate::events::{load_events, EventRow};
use crate::fixedfx::create_fixed_effects_flow;
use crate::modelfit::create_modelfit_workflow;
use crate::units::{CopeSorter, DataSource, FirstLevelUnits, SpecifyModel, SubsGen};

pub const WORKFLOW_NAME: &str = "first_level";

/// Destinations the sink publishes, in wiring order.
pub const SINK_DESTINATIONS: &[&str] = &[
    "qa.model",
    "qa.model.@matrix_image",
    "qa.model.@matrix",
    "res4d",
    "copes",
    "varcopes",
    "zstats",
    "tstats",
];

/// Contrasts in the `[name, stat, conditions, weights]` form the model
/// stages consume.
pub fn contrast_values(contrasts: &[ContrastSpec]) -> Value {
    Value::Array(
        contrasts
            .iter()
            .map(|c| json!([c.name, c.kind, c.conditions, c.weights]))
            .collect(),
    )
}

/// Load the study's event table, or an empty one when none is configured.
pub fn load_study_events(config: &AppConfig) -> Result<Vec<EventRow>> {
    match &config.study.events_file {
        Some(path) => load_events(path),
        None => Ok(vec![]),
    }
}

/// Assemble the first-level workflow for every configured subject.
///
/// `infosource` iterates over the subjects; everything downstream of it is
/// replicated per subject. Each subject's outputs are published into a
/// container named after the subject, renamed by the substitution table
/// from `subsgen`.
pub fn create_first_level(
    config: &AppConfig,
    events: Arc<Vec<EventRow>>,
    units: &FirstLevelUnits,
) -> Result<Workflow> {
    let study = &config.study;
    let contrasts = contrast_values(&study.contrasts);
    let mut wf = Workflow::new(WORKFLOW_NAME);

    let infosource = wf.add_unit(
        "infosource",
        PortSpec::new().input("subject_id").output("subject_id"),
        Arc::new(IdentityUnit),
    )?;
    wf.iterate(
        &infosource.input("subject_id"),
        study.subjects.iter().map(|s| json!(s)).collect(),
    )?;

    let datasource = wf.add_unit(
        "datasource",
        PortSpec::new()
            .input("subject_id")
            .outputs(&["func", "brainmask", "subject_info"]),
        Arc::new(DataSource::new(
            study.data_root.clone(),
            study.runs.clone(),
            events,
        )),
    )?;
    wf.connect(&infosource.output("subject_id"), &datasource.input("subject_id"))?;

    let modelspec = wf.add_unit(
        "modelspec",
        PortSpec::new()
            .inputs(&[
                "subject_info",
                "functional_runs",
                "input_units",
                "time_repetition",
                "high_pass_filter_cutoff",
            ])
            .output("session_info"),
        Arc::new(SpecifyModel),
    )?;
    wf.set_input(&modelspec.input("input_units"), json!("secs"))?;
    wf.set_input(&modelspec.input("time_repetition"), json!(study.tr))?;
    wf.set_input(
        &modelspec.input("high_pass_filter_cutoff"),
        json!(study.high_pass_cutoff),
    )?;
    wf.connect_ports(
        &datasource,
        &modelspec,
        &[("subject_info", "subject_info"), ("func", "functional_runs")],
    )?;

    let modelfit = wf.add_composite("modelfit", create_modelfit_workflow(units)?)?;
    wf.set_input(&modelfit.input("inputspec.contrasts"), contrasts.clone())?;
    wf.set_input(&modelfit.input("inputspec.interscan_interval"), json!(study.tr))?;
    wf.set_input(
        &modelfit.input("inputspec.model_serial_correlations"),
        json!(true),
    )?;
    wf.set_input(
        &modelfit.input("inputspec.bases"),
        json!({"gamma": {"derivs": true}}),
    )?;
    wf.connect(&modelspec.output("session_info"), &modelfit.input("inputspec.session_info"))?;
    wf.connect(&datasource.output("func"), &modelfit.input("inputspec.functional_data"))?;

    let fixedfx = wf.add_composite("fixedfx", create_fixed_effects_flow(units)?)?;
    wf.connect(&datasource.output("brainmask"), &fixedfx.input("flameo.mask_file"))?;

    let cope_sorter = wf.add_unit(
        "cope_sorter",
        PortSpec::new()
            .inputs(&["copes", "varcopes", "contrasts"])
            .outputs(&["copes", "varcopes", "n_runs"]),
        Arc::new(CopeSorter),
    )?;
    wf.set_input(&cope_sorter.input("contrasts"), contrasts)?;
    wf.connect_ports(
        &modelfit,
        &cope_sorter,
        &[("outputspec.copes", "copes"), ("outputspec.varcopes", "varcopes")],
    )?;
    wf.connect_ports(
        &cope_sorter,
        &fixedfx,
        &[
            ("copes", "inputspec.copes"),
            ("varcopes", "inputspec.varcopes"),
            ("n_runs", "l2model.num_copes"),
        ],
    )?;
    wf.connect(&modelfit.output("outputspec.dof_file"), &fixedfx.input("inputspec.dof_files"))?;

    let subsgen = wf.add_unit(
        "subsgen",
        PortSpec::new()
            .inputs(&["subject_id", "conds"])
            .output("substitutions"),
        Arc::new(SubsGen),
    )?;
    wf.set_input(&subsgen.input("conds"), json!(config.contrast_names()))?;

    let datasink = wf.add_sink("datasink", SINK_DESTINATIONS)?;
    wf.connect(&infosource.output("subject_id"), &datasink.input(SINK_CONTAINER))?;
    wf.connect(&infosource.output("subject_id"), &subsgen.input("subject_id"))?;
    wf.connect(&subsgen.output("substitutions"), &datasink.input(SINK_SUBSTITUTIONS))?;
    wf.connect_ports(
        &modelfit,
        &datasink,
        &[
            ("modelgen.design_cov", "qa.model"),
            ("modelgen.design_image", "qa.model.@matrix_image"),
            ("modelgen.design_file", "qa.model.@matrix"),
        ],
    )?;
    wf.connect_ports(
        &fixedfx,
        &datasink,
        &[
            ("outputspec.res4d", "res4d"),
            ("outputspec.copes", "copes"),
            ("outputspec.varcopes", "varcopes"),
            ("outputspec.zstats", "zstats"),
            ("outputspec.tstats", "tstats"),
        ],
    )?;

    info!(
        workflow = WORKFLOW_NAME,
        task = %study.task,
        subjects = study.subjects.len(),
        contrasts = study.contrasts.len(),
        nodes = wf.nodes().len(),
        "Built first-level workflow"
    );
    Ok(wf)
}
