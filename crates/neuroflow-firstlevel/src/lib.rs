//! fMRI first-level analysis on the neuroflow engine.
//!
//! Per subject: select the runs and events, specify and fit the run-level
//! model, regroup the contrast estimates, combine runs with fixed effects
//! and publish the results under the subject's container.

pub mod events;
pub mod fixedfx;
pub mod modelfit;
pub mod pipeline;
pub mod reshape;
pub mod substitutions;
pub mod units;

pub use events::{collect_subject_data, load_events, ConditionBundle, EventRow, SubjectData};
pub use pipeline::{create_first_level, load_study_events, WORKFLOW_NAME};
pub use reshape::{sort_copes, SortedCopes};
pub use substitutions::{first_level_substitutions, warp_offsets, SubstitutionTable};
pub use units::FirstLevelUnits;
