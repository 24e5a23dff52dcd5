use std::sync::Arc;

use neuroflow_core::error::Result;
use neuroflow_core::types::PortRef;
use neuroflow_engine::graph::{Composite, NodeOptions, PortSpec, Workflow, INPUTSPEC, OUTPUTSPEC};
use neuroflow_engine::units::IdentityUnit;

use crate::units::FirstLevelUnits;

const OUTPUTS: &[&str] = &["res4d", "copes", "varcopes", "zstats", "tstats"];

/// Fixed-effects combination across runs as a composite node.
///
/// Takes per-contrast lists of run estimates on `inputspec.copes` and
/// `inputspec.varcopes`, the run degrees of freedom on
/// `inputspec.dof_files`, the brain mask on `flameo.mask_file` and the run
/// count on `l2model.num_copes`. `flameo` runs once per contrast in
/// `_flameo<i>`; `outputspec` lists one file per contrast.
pub fn create_fixed_effects_flow(units: &FirstLevelUnits) -> Result<Composite> {
    let mut wf = Workflow::new("fixedfx");

    let inputs = ["copes", "varcopes", "dof_files"];
    let inputspec = wf.add_unit(
        INPUTSPEC,
        PortSpec::new().inputs(&inputs).outputs(&inputs),
        Arc::new(IdentityUnit),
    )?;
    let l2model = wf.add_unit(
        "l2model",
        PortSpec::new()
            .input("num_copes")
            .outputs(&["design_mat", "design_con", "design_grp"]),
        units.l2model.clone(),
    )?;
    let flameo = wf.add_unit(
        "flameo",
        PortSpec::new()
            .inputs(&[
                "cope_file",
                "var_cope_file",
                "dof_files",
                "mask_file",
                "design_file",
                "t_con_file",
                "cov_split_file",
                "run_mode",
            ])
            .outputs(&["copes", "var_copes", "zstats", "tstats", "res4d"]),
        units.flameo.clone(),
    )?;
    wf.set_options("flameo", NodeOptions::default().map_over(&["cope_file", "var_cope_file"]))?;
    wf.set_input(&flameo.input("run_mode"), "fe".into())?;
    let outputspec = wf.add_unit(
        OUTPUTSPEC,
        PortSpec::new().inputs(OUTPUTS).outputs(OUTPUTS),
        Arc::new(IdentityUnit),
    )?;

    wf.connect_ports(
        &inputspec,
        &flameo,
        &[
            ("copes", "cope_file"),
            ("varcopes", "var_cope_file"),
            ("dof_files", "dof_files"),
        ],
    )?;
    wf.connect_ports(
        &l2model,
        &flameo,
        &[
            ("design_mat", "design_file"),
            ("design_con", "t_con_file"),
            ("design_grp", "cov_split_file"),
        ],
    )?;
    wf.connect_ports(
        &flameo,
        &outputspec,
        &[
            ("res4d", "res4d"),
            ("copes", "copes"),
            ("var_copes", "varcopes"),
            ("zstats", "zstats"),
            ("tstats", "tstats"),
        ],
    )?;

    Composite::with_specs(wf)?
        .expose_input("flameo.mask_file", PortRef::new(flameo.id(), "mask_file"))?
        .expose_input("l2model.num_copes", PortRef::new(l2model.id(), "num_copes"))
}
