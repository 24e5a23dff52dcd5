use std::sync::Arc;

use neuroflow_core::error::Result;
use neuroflow_core::types::PortRef;
use neuroflow_engine::graph::{Composite, NodeOptions, PortSpec, Workflow, INPUTSPEC, OUTPUTSPEC};
use neuroflow_engine::units::IdentityUnit;

use crate::units::FirstLevelUnits;

const INPUTS: &[&str] = &[
    "session_info",
    "functional_data",
    "contrasts",
    "interscan_interval",
    "model_serial_correlations",
    "bases",
];

const OUTPUTS: &[&str] = &["copes", "varcopes", "dof_file"];

/// Per-run model fitting as a composite node.
///
/// Boundary: `inputspec.{session_info, functional_data, contrasts,
/// interscan_interval, model_serial_correlations, bases}` in,
/// `outputspec.{copes, varcopes, dof_file}` out, where each output holds
/// one entry per run. The design files of every run are also exposed as
/// `modelgen.design_{file, image, cov}` for quality assurance.
pub fn create_modelfit_workflow(units: &FirstLevelUnits) -> Result<Composite> {
    let mut wf = Workflow::new("modelfit");

    let inputspec = wf.add_unit(
        INPUTSPEC,
        PortSpec::new().inputs(INPUTS).outputs(INPUTS),
        Arc::new(IdentityUnit),
    )?;
    let level1design = wf.add_unit(
        "level1design",
        PortSpec::new()
            .inputs(&[
                "session_info",
                "contrasts",
                "interscan_interval",
                "bases",
                "model_serial_correlations",
            ])
            .outputs(&["fsf_files", "ev_files"]),
        units.level1design.clone(),
    )?;
    let modelgen = wf.add_unit(
        "modelgen",
        PortSpec::new()
            .inputs(&["fsf_file", "ev_files"])
            .outputs(&["design_file", "design_image", "design_cov", "con_file"]),
        units.modelgen.clone(),
    )?;
    wf.set_options("modelgen", NodeOptions::default().map_over(&["fsf_file", "ev_files"]))?;
    let modelestimate = wf.add_unit(
        "modelestimate",
        PortSpec::new()
            .inputs(&["design_file", "in_file", "tcon_file", "contrasts"])
            .outputs(OUTPUTS),
        units.modelestimate.clone(),
    )?;
    wf.set_options(
        "modelestimate",
        NodeOptions::default().map_over(&["design_file", "in_file", "tcon_file"]),
    )?;
    let outputspec = wf.add_unit(
        OUTPUTSPEC,
        PortSpec::new().inputs(OUTPUTS).outputs(OUTPUTS),
        Arc::new(IdentityUnit),
    )?;

    wf.connect_ports(
        &inputspec,
        &level1design,
        &[
            ("session_info", "session_info"),
            ("contrasts", "contrasts"),
            ("interscan_interval", "interscan_interval"),
            ("bases", "bases"),
            ("model_serial_correlations", "model_serial_correlations"),
        ],
    )?;
    wf.connect_ports(
        &level1design,
        &modelgen,
        &[("fsf_files", "fsf_file"), ("ev_files", "ev_files")],
    )?;
    wf.connect_ports(
        &modelgen,
        &modelestimate,
        &[("design_file", "design_file"), ("con_file", "tcon_file")],
    )?;
    wf.connect_ports(
        &inputspec,
        &modelestimate,
        &[("functional_data", "in_file"), ("contrasts", "contrasts")],
    )?;
    wf.connect_ports(
        &modelestimate,
        &outputspec,
        &[
            ("copes", "copes"),
            ("varcopes", "varcopes"),
            ("dof_file", "dof_file"),
        ],
    )?;

    let mut composite = Composite::with_specs(wf)?;
    for port in ["design_file", "design_image", "design_cov"] {
        composite = composite.expose_output(
            format!("modelgen.{}", port),
            PortRef::new(modelgen.id(), port),
        )?;
    }
    Ok(composite)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary() {
        let composite = create_modelfit_workflow(&FirstLevelUnits::placeholders()).unwrap();
        let spec = composite.port_spec();
        for port in INPUTS {
            assert!(spec.has_input(&format!("inputspec.{}", port)));
        }
        for port in OUTPUTS {
            assert!(spec.has_output(&format!("outputspec.{}", port)));
        }
        assert!(spec.has_output("modelgen.design_cov"));
        assert!(!spec.has_input("modelgen.fsf_file"));
        assert!(composite.graph().expand().is_ok());
    }
}
