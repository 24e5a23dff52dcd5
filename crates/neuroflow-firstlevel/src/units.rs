//! Processing units of the first-level pipeline.
//!
//! Data handling units (`DataSource`, `SpecifyModel`, `CopeSorter`,
//! `SubsGen`) are complete. The statistical stages are opaque numerical
//! routines; the placeholder implementations here write deterministic JSON
//! descriptors at the paths the real tools would produce, so the pipeline
//! can be assembled, run and published end to end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use neuroflow_core::config::RunRecord;
use neuroflow_core::error::{FlowError, Result};
use neuroflow_core::traits::Unit;
use neuroflow_core::types::{render_value, PortValues, UnitContext, Value};

use crate::events::{collect_subject_data, ConditionBundle, EventRow};
use crate::reshape::sort_copes;
use crate::substitutions::first_level_substitutions;

fn required<'a>(unit: &str, inputs: &'a PortValues, port: &str) -> Result<&'a Value> {
    inputs
        .get(port)
        .filter(|v| !v.is_null())
        .ok_or_else(|| FlowError::MissingInput {
            unit: unit.to_string(),
            port: port.to_string(),
        })
}

fn parse<T: DeserializeOwned>(unit: &str, inputs: &PortValues, port: &str) -> Result<T> {
    let value = required(unit, inputs, port)?;
    serde_json::from_value(value.clone())
        .map_err(|e| FlowError::unit(unit, format!("input '{}': {}", port, e)))
}

fn outputs<const N: usize>(pairs: [(&str, Value); N]) -> PortValues {
    pairs
        .into_iter()
        .map(|(port, value)| (port.to_string(), value))
        .collect()
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

/// Write a JSON descriptor standing in for a tool output.
async fn write_descriptor(path: &Path, body: &Value) -> Result<Value> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_vec_pretty(body)?).await?;
    Ok(path_value(path))
}

/// Condition names come from the event table; keep them to one path component.
fn file_safe(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if safe.is_empty() {
        "condition".to_string()
    } else {
        safe
    }
}

fn file_stem(path: &str) -> String {
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.split('.').next().unwrap_or_default().to_string()
}

// ── DataSource ──────────────────────────────────────────────────

/// Selects one subject's functional runs, brain mask and event bundles.
pub struct DataSource {
    data_root: PathBuf,
    runs: Vec<RunRecord>,
    events: Arc<Vec<EventRow>>,
}

impl DataSource {
    pub fn new(data_root: impl Into<PathBuf>, runs: Vec<RunRecord>, events: Arc<Vec<EventRow>>) -> Self {
        Self {
            data_root: data_root.into(),
            runs,
            events,
        }
    }
}

impl Unit for DataSource {
    fn name(&self) -> &str {
        "datasource"
    }

    fn run(&self, _ctx: UnitContext, inputs: PortValues) -> BoxFuture<'_, Result<PortValues>> {
        Box::pin(async move {
            let subject_id = render_value(required(self.name(), &inputs, "subject_id")?);
            let data = collect_subject_data(&self.data_root, &subject_id, &self.runs, &self.events)?;
            Ok(outputs([
                ("func", json!(data.func)),
                ("brainmask", json!(data.mask)),
                ("subject_info", serde_json::to_value(&data.bunches)?),
            ]))
        })
    }
}

// ── SpecifyModel ────────────────────────────────────────────────

/// One condition of a run's session info, timed in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCondition {
    pub name: String,
    pub onset: Vec<f64>,
    pub duration: Vec<f64>,
    pub amplitudes: Vec<f64>,
}

/// Model input for one functional run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub scans: String,
    pub conditions: Vec<SessionCondition>,
    /// High-pass filter cutoff in seconds.
    pub hpf: f64,
}

/// Pairs each functional run with its condition bundle.
pub struct SpecifyModel;

impl Unit for SpecifyModel {
    fn name(&self) -> &str {
        "specify_model"
    }

    fn run(&self, _ctx: UnitContext, inputs: PortValues) -> BoxFuture<'_, Result<PortValues>> {
        Box::pin(async move {
            let unit = self.name();
            let bunches: Vec<ConditionBundle> = parse(unit, &inputs, "subject_info")?;
            let runs: Vec<String> = parse(unit, &inputs, "functional_runs")?;
            let units: String = parse(unit, &inputs, "input_units")?;
            let tr: f64 = parse(unit, &inputs, "time_repetition")?;
            let hpf: f64 = parse(unit, &inputs, "high_pass_filter_cutoff")?;

            let scale = match units.as_str() {
                "secs" => 1.0,
                "scans" => tr,
                other => {
                    return Err(FlowError::unit(
                        unit,
                        format!("input_units must be 'secs' or 'scans', got '{}'", other),
                    ))
                }
            };
            if bunches.len() != runs.len() {
                return Err(FlowError::unit(
                    unit,
                    format!(
                        "{} functional runs but {} event bundles",
                        runs.len(),
                        bunches.len()
                    ),
                ));
            }

            let sessions: Vec<SessionInfo> = runs
                .into_iter()
                .zip(bunches)
                .map(|(scans, bundle)| SessionInfo {
                    scans,
                    conditions: bundle
                        .conditions
                        .into_iter()
                        .zip(bundle.onsets)
                        .zip(bundle.durations)
                        .zip(bundle.amplitudes)
                        .map(|(((name, onset), duration), amplitudes)| SessionCondition {
                            name,
                            onset: onset.into_iter().map(|t| t * scale).collect(),
                            duration: duration.into_iter().map(|t| t * scale).collect(),
                            amplitudes,
                        })
                        .collect(),
                    hpf,
                })
                .collect();
            Ok(outputs([("session_info", serde_json::to_value(sessions)?)]))
        })
    }
}

// ── CopeSorter ──────────────────────────────────────────────────

/// Regroups per-run contrast estimates into per-contrast lists.
pub struct CopeSorter;

impl Unit for CopeSorter {
    fn name(&self) -> &str {
        "sort_copes"
    }

    fn run(&self, _ctx: UnitContext, inputs: PortValues) -> BoxFuture<'_, Result<PortValues>> {
        Box::pin(async move {
            let copes = required(self.name(), &inputs, "copes")?;
            let varcopes = required(self.name(), &inputs, "varcopes")?;
            let contrasts: Vec<Value> = parse(self.name(), &inputs, "contrasts")?;
            let sorted = sort_copes(copes, varcopes, contrasts.len())?;
            Ok(outputs([
                ("copes", json!(sorted.copes)),
                ("varcopes", json!(sorted.varcopes)),
                ("n_runs", json!(sorted.n_runs)),
            ]))
        })
    }
}

// ── SubsGen ─────────────────────────────────────────────────────

/// Produces the sink substitution table for one subject.
pub struct SubsGen;

impl Unit for SubsGen {
    fn name(&self) -> &str {
        "get_subs"
    }

    fn run(&self, _ctx: UnitContext, inputs: PortValues) -> BoxFuture<'_, Result<PortValues>> {
        Box::pin(async move {
            let subject_id = render_value(required(self.name(), &inputs, "subject_id")?);
            let conds: Vec<String> = parse(self.name(), &inputs, "conds")?;
            let table = first_level_substitutions(&subject_id, &conds);
            Ok(outputs([("substitutions", json!(table))]))
        })
    }
}

// ── Model stages ────────────────────────────────────────────────

/// Writes per-run design descriptors and three-column EV files.
pub struct Level1Design;

impl Unit for Level1Design {
    fn name(&self) -> &str {
        "level1design"
    }

    fn run(&self, ctx: UnitContext, inputs: PortValues) -> BoxFuture<'_, Result<PortValues>> {
        Box::pin(async move {
            let sessions: Vec<SessionInfo> = parse(self.name(), &inputs, "session_info")?;
            let contrasts = required(self.name(), &inputs, "contrasts")?;
            let tr = required(self.name(), &inputs, "interscan_interval")?;
            let bases = required(self.name(), &inputs, "bases")?;
            let serial = required(self.name(), &inputs, "model_serial_correlations")?;

            let mut fsf_files = vec![];
            let mut ev_files = vec![];
            for (run, session) in sessions.iter().enumerate() {
                let mut evs = vec![];
                for (k, condition) in session.conditions.iter().enumerate() {
                    let path = ctx
                        .work_dir
                        .join(format!("ev_{}_{}_{}.txt", file_safe(&condition.name), run, k + 1));
                    let mut body = String::new();
                    for ((onset, duration), amplitude) in condition
                        .onset
                        .iter()
                        .zip(&condition.duration)
                        .zip(&condition.amplitudes)
                    {
                        body.push_str(&format!("{:.6}\t{:.6}\t{:.6}\n", onset, duration, amplitude));
                    }
                    tokio::fs::write(&path, body).await?;
                    evs.push(path_value(&path));
                }
                let fsf = write_descriptor(
                    &ctx.work_dir.join(format!("run{}.fsf", run)),
                    &json!({
                        "session": session,
                        "contrasts": contrasts,
                        "interscan_interval": tr,
                        "bases": bases,
                        "model_serial_correlations": serial,
                    }),
                )
                .await?;
                fsf_files.push(fsf);
                ev_files.push(Value::Array(evs));
            }
            debug!(node_id = %ctx.node_id, runs = fsf_files.len(), "Wrote run designs");
            Ok(outputs([
                ("fsf_files", Value::Array(fsf_files)),
                ("ev_files", Value::Array(ev_files)),
            ]))
        })
    }
}

/// Generates the design matrix files of one run.
pub struct FeatModel;

impl Unit for FeatModel {
    fn name(&self) -> &str {
        "feat_model"
    }

    fn run(&self, ctx: UnitContext, inputs: PortValues) -> BoxFuture<'_, Result<PortValues>> {
        Box::pin(async move {
            let fsf: String = parse(self.name(), &inputs, "fsf_file")?;
            let evs = required(self.name(), &inputs, "ev_files")?;
            let stem = file_stem(&fsf);
            let body = json!({ "fsf_file": fsf, "ev_files": evs });
            let dir = &ctx.work_dir;
            Ok(outputs([
                ("design_file", write_descriptor(&dir.join(format!("{}.mat", stem)), &body).await?),
                ("design_image", write_descriptor(&dir.join(format!("{}.png", stem)), &body).await?),
                ("design_cov", write_descriptor(&dir.join(format!("{}_cov.png", stem)), &body).await?),
                ("con_file", write_descriptor(&dir.join(format!("{}.con", stem)), &body).await?),
            ]))
        })
    }
}

/// Estimates the first-level model of one run.
pub struct FilmGls;

impl Unit for FilmGls {
    fn name(&self) -> &str {
        "film_gls"
    }

    fn run(&self, ctx: UnitContext, inputs: PortValues) -> BoxFuture<'_, Result<PortValues>> {
        Box::pin(async move {
            let design: String = parse(self.name(), &inputs, "design_file")?;
            let func: String = parse(self.name(), &inputs, "in_file")?;
            let tcon: String = parse(self.name(), &inputs, "tcon_file")?;
            let contrasts: Vec<Value> = parse(self.name(), &inputs, "contrasts")?;

            let results = ctx.work_dir.join("results");
            let mut copes = vec![];
            let mut varcopes = vec![];
            for (k, contrast) in contrasts.iter().enumerate() {
                let body = json!({
                    "in_file": func,
                    "design_file": design,
                    "tcon_file": tcon,
                    "contrast": contrast,
                });
                copes.push(write_descriptor(&results.join(format!("cope{}.nii.gz", k + 1)), &body).await?);
                varcopes.push(
                    write_descriptor(&results.join(format!("varcope{}.nii.gz", k + 1)), &body).await?,
                );
            }
            let dof = write_descriptor(&results.join("dof"), &json!({ "in_file": func })).await?;
            Ok(outputs([
                ("copes", Value::Array(copes)),
                ("varcopes", Value::Array(varcopes)),
                ("dof_file", dof),
            ]))
        })
    }
}

/// Second-level fixed-effects design over `num_copes` runs.
pub struct L2Model;

impl Unit for L2Model {
    fn name(&self) -> &str {
        "l2_model"
    }

    fn run(&self, ctx: UnitContext, inputs: PortValues) -> BoxFuture<'_, Result<PortValues>> {
        Box::pin(async move {
            let num_copes: usize = parse(self.name(), &inputs, "num_copes")?;
            if num_copes == 0 {
                return Err(FlowError::unit(self.name(), "num_copes must be at least 1"));
            }
            let regressors = vec![1.0; num_copes];
            let body = json!({ "num_copes": num_copes, "regressors": regressors });
            let dir = &ctx.work_dir;
            Ok(outputs([
                ("design_mat", write_descriptor(&dir.join("design.mat"), &body).await?),
                ("design_con", write_descriptor(&dir.join("design.con"), &body).await?),
                ("design_grp", write_descriptor(&dir.join("design.grp"), &body).await?),
            ]))
        })
    }
}

/// Fixed-effects combination of one contrast across runs.
pub struct Flameo;

impl Unit for Flameo {
    fn name(&self) -> &str {
        "flameo"
    }

    fn run(&self, ctx: UnitContext, inputs: PortValues) -> BoxFuture<'_, Result<PortValues>> {
        Box::pin(async move {
            let copes: Vec<String> = parse(self.name(), &inputs, "cope_file")?;
            let varcopes: Vec<String> = parse(self.name(), &inputs, "var_cope_file")?;
            let mask: String = parse(self.name(), &inputs, "mask_file")?;
            let design = required(self.name(), &inputs, "design_file")?;
            let dofs = required(self.name(), &inputs, "dof_files")?;
            if copes.len() != varcopes.len() {
                return Err(FlowError::unit(
                    self.name(),
                    format!("{} copes but {} varcopes", copes.len(), varcopes.len()),
                ));
            }

            let stats = ctx.work_dir.join("stats");
            let body = |stat: &str| {
                json!({
                    "stat": stat,
                    "copes": copes,
                    "varcopes": varcopes,
                    "mask_file": mask,
                    "design_file": design,
                    "dof_files": dofs,
                })
            };
            Ok(outputs([
                ("copes", write_descriptor(&stats.join("cope1.nii.gz"), &body("cope")).await?),
                ("var_copes", write_descriptor(&stats.join("varcope1.nii.gz"), &body("varcope")).await?),
                ("zstats", write_descriptor(&stats.join("zstat1.nii.gz"), &body("zstat")).await?),
                ("tstats", write_descriptor(&stats.join("tstat1.nii.gz"), &body("tstat")).await?),
                ("res4d", write_descriptor(&stats.join("res4d.nii.gz"), &body("res4d")).await?),
            ]))
        })
    }
}

/// The numerical stages used to build the pipeline.
#[derive(Clone)]
pub struct FirstLevelUnits {
    pub level1design: Arc<dyn Unit>,
    pub modelgen: Arc<dyn Unit>,
    pub modelestimate: Arc<dyn Unit>,
    pub l2model: Arc<dyn Unit>,
    pub flameo: Arc<dyn Unit>,
}

impl FirstLevelUnits {
    /// Stages that write descriptor files instead of running the tools.
    pub fn placeholders() -> Self {
        Self {
            level1design: Arc::new(Level1Design),
            modelgen: Arc::new(FeatModel),
            modelestimate: Arc::new(FilmGls),
            l2model: Arc::new(L2Model),
            flameo: Arc::new(Flameo),
        }
    }
}
