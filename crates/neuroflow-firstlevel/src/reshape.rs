use serde::Serialize;

use neuroflow_core::error::{FlowError, Result};
use neuroflow_core::types::Value;

/// Per-contrast lists of run-level estimates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortedCopes {
    /// `copes[c][r]` is the estimate of contrast `c` in run `r`.
    pub copes: Vec<Vec<Value>>,
    pub varcopes: Vec<Vec<Value>>,
    pub n_runs: usize,
}

/// Shape of a cope collection after normalisation.
#[derive(Debug, PartialEq, Eq)]
enum Shape {
    Flat(usize),
    Rows(Vec<usize>),
}

/// Regroup run-major estimates into contrast-major lists.
///
/// Inputs are a scalar, a flat list of `R * C` values, or `R` rows of
/// `C` values each, in run-major order. The output holds `C` lists of `R`
/// values (the transpose of the `R x C` matrix) plus `R`.
pub fn sort_copes(copes: &Value, varcopes: &Value, num_contrasts: usize) -> Result<SortedCopes> {
    if num_contrasts == 0 {
        return Err(FlowError::ShapeMismatch(
            "at least one contrast is required".into(),
        ));
    }

    let (cope_shape, cope_values) = flatten("copes", copes)?;
    let (varcope_shape, varcope_values) = flatten("varcopes", varcopes)?;
    if cope_shape != varcope_shape {
        return Err(FlowError::ShapeMismatch(format!(
            "copes have shape {:?} but varcopes have shape {:?}",
            cope_shape, varcope_shape
        )));
    }
    if let Shape::Rows(lengths) = &cope_shape {
        if let Some(bad) = lengths.iter().find(|&&len| len != num_contrasts) {
            return Err(FlowError::ShapeMismatch(format!(
                "run rows must hold {} contrast estimates, found a row of {}",
                num_contrasts, bad
            )));
        }
    }

    let total = cope_values.len();
    if total == 0 || total % num_contrasts != 0 {
        return Err(FlowError::ShapeMismatch(format!(
            "{} estimates cannot be split across {} contrasts",
            total, num_contrasts
        )));
    }
    let n_runs = total / num_contrasts;

    Ok(SortedCopes {
        copes: transpose(&cope_values, n_runs, num_contrasts),
        varcopes: transpose(&varcope_values, n_runs, num_contrasts),
        n_runs,
    })
}

fn flatten(label: &str, value: &Value) -> Result<(Shape, Vec<Value>)> {
    let items = match value {
        Value::Array(items) => items,
        scalar => return Ok((Shape::Flat(1), vec![scalar.clone()])),
    };

    if items.iter().all(|item| !item.is_array()) {
        return Ok((Shape::Flat(items.len()), items.clone()));
    }

    let mut lengths = Vec::with_capacity(items.len());
    let mut flat = vec![];
    for row in items {
        let Value::Array(cells) = row else {
            return Err(FlowError::ShapeMismatch(format!(
                "{} mix rows and single values",
                label
            )));
        };
        if cells.iter().any(Value::is_array) {
            return Err(FlowError::ShapeMismatch(format!(
                "{} are nested deeper than runs x contrasts",
                label
            )));
        }
        lengths.push(cells.len());
        flat.extend(cells.iter().cloned());
    }
    Ok((Shape::Rows(lengths), flat))
}

fn transpose(values: &[Value], rows: usize, cols: usize) -> Vec<Vec<Value>> {
    (0..cols)
        .map(|c| (0..rows).map(|r| values[r * cols + c].clone()).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transposes_runs_by_contrasts() {
        let copes = json!([["c00", "c01"], ["c10", "c11"], ["c20", "c21"]]);
        let varcopes = json!([["v00", "v01"], ["v10", "v11"], ["v20", "v21"]]);
        let sorted = sort_copes(&copes, &varcopes, 2).unwrap();
        assert_eq!(sorted.n_runs, 3);
        assert_eq!(
            sorted.copes,
            vec![
                vec![json!("c00"), json!("c10"), json!("c20")],
                vec![json!("c01"), json!("c11"), json!("c21")],
            ]
        );
        assert_eq!(sorted.varcopes[1], vec![json!("v01"), json!("v11"), json!("v21")]);
    }

    #[test]
    fn test_scalar_is_wrapped() {
        let sorted = sort_copes(&json!(5), &json!(6), 1).unwrap();
        assert_eq!(sorted.copes, vec![vec![json!(5)]]);
        assert_eq!(sorted.varcopes, vec![vec![json!(6)]]);
        assert_eq!(sorted.n_runs, 1);
    }

    #[test]
    fn test_flat_list_is_run_major() {
        let sorted = sort_copes(&json!([1, 2, 3, 4]), &json!([1, 2, 3, 4]), 2).unwrap();
        assert_eq!(sorted.n_runs, 2);
        assert_eq!(sorted.copes, vec![vec![json!(1), json!(3)], vec![json!(2), json!(4)]]);

        let single_run = sort_copes(&json!(["a", "b"]), &json!(["va", "vb"]), 2).unwrap();
        assert_eq!(single_run.n_runs, 1);
        assert_eq!(single_run.copes, vec![vec![json!("a")], vec![json!("b")]]);
    }

    #[test]
    fn test_indivisible_length() {
        let err = sort_copes(&json!([1, 2, 3]), &json!([1, 2, 3]), 2).unwrap_err();
        assert!(matches!(err, FlowError::ShapeMismatch(_)));
    }

    #[test]
    fn test_cope_varcope_shapes_must_match() {
        let err = sort_copes(&json!([1, 2]), &json!([1, 2, 3, 4]), 2).unwrap_err();
        assert!(matches!(err, FlowError::ShapeMismatch(_)));

        let err = sort_copes(&json!([[1, 2], [3, 4]]), &json!([1, 2, 3, 4]), 2).unwrap_err();
        assert!(matches!(err, FlowError::ShapeMismatch(_)));
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let ragged = json!([[1, 2], [3]]);
        assert!(sort_copes(&ragged, &ragged, 2).is_err());
        let wide = json!([[1, 2, 3], [4, 5, 6]]);
        assert!(sort_copes(&wide, &wide, 2).is_err());
    }

    #[test]
    fn test_zero_contrasts_rejected() {
        assert!(sort_copes(&json!([1]), &json!([1]), 0).is_err());
    }
}
