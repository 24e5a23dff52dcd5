/// Ordered (pattern, replacement) pairs that turn work-directory paths into
/// published names.
pub type SubstitutionTable = Vec<(String, String)>;

/// Build the substitution table for one subject.
///
/// The first entry strips the subject's iteration directory. Each contrast
/// then gets five entries for the fixed-effects outputs of its
/// `_flameo<i>` directory and six for warped outputs. Warp directories are
/// numbered across all three warped images, so varcopes sit `C` and zstats
/// `2C` places after the copes.
pub fn first_level_substitutions(subject_id: &str, contrasts: &[String]) -> SubstitutionTable {
    let count = contrasts.len();
    let mut table = Vec::with_capacity(1 + 11 * count);
    table.push((format!("_subject_id_{}", subject_id), String::new()));

    for i in 0..count {
        let n = i + 1;
        let (cope, varcope, zstat) = warp_offsets(i, count);
        let mut add = |pattern: String, replacement: String| table.push((pattern, replacement));

        add(format!("_flameo{}/cope1.", i), format!("cope{:02}.", n));
        add(format!("_flameo{}/varcope1.", i), format!("varcope{:02}.", n));
        add(format!("_flameo{}/zstat1.", i), format!("zstat{:02}.", n));
        add(format!("_flameo{}/tstat1.", i), format!("tstat{:02}.", n));
        add(format!("_flameo{}/res4d.", i), format!("res4d{:02}.", n));
        add(format!("_warpall{}/cope1_warp.", cope), format!("cope{:02}.", n));
        add(format!("_warpall{}/varcope1_warp.", varcope), format!("varcope{:02}.", n));
        add(format!("_warpall{}/zstat1_warp.", zstat), format!("zstat{:02}.", n));
        add(format!("_warpall{}/cope1_trans.", cope), format!("cope{:02}.", n));
        add(format!("_warpall{}/varcope1_trans.", varcope), format!("varcope{:02}.", n));
        add(format!("_warpall{}/zstat1_trans.", zstat), format!("zstat{:02}.", n));
    }
    table
}

/// Warp directory indices of the cope, varcope and zstat of contrast `i`
/// out of `count`.
pub fn warp_offsets(i: usize, count: usize) -> (usize, usize, usize) {
    (i, count + i, 2 * count + i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuroflow_engine::sink::apply_substitutions;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn pair(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    #[test]
    fn test_two_contrasts_exhaustive() {
        let table = first_level_substitutions("01", &labels(&["taskA", "taskB"]));
        let expected = vec![
            pair("_subject_id_01", ""),
            pair("_flameo0/cope1.", "cope01."),
            pair("_flameo0/varcope1.", "varcope01."),
            pair("_flameo0/zstat1.", "zstat01."),
            pair("_flameo0/tstat1.", "tstat01."),
            pair("_flameo0/res4d.", "res4d01."),
            pair("_warpall0/cope1_warp.", "cope01."),
            pair("_warpall2/varcope1_warp.", "varcope01."),
            pair("_warpall4/zstat1_warp.", "zstat01."),
            pair("_warpall0/cope1_trans.", "cope01."),
            pair("_warpall2/varcope1_trans.", "varcope01."),
            pair("_warpall4/zstat1_trans.", "zstat01."),
            pair("_flameo1/cope1.", "cope02."),
            pair("_flameo1/varcope1.", "varcope02."),
            pair("_flameo1/zstat1.", "zstat02."),
            pair("_flameo1/tstat1.", "tstat02."),
            pair("_flameo1/res4d.", "res4d02."),
            pair("_warpall1/cope1_warp.", "cope02."),
            pair("_warpall3/varcope1_warp.", "varcope02."),
            pair("_warpall5/zstat1_warp.", "zstat02."),
            pair("_warpall1/cope1_trans.", "cope02."),
            pair("_warpall3/varcope1_trans.", "varcope02."),
            pair("_warpall5/zstat1_trans.", "zstat02."),
        ];
        assert_eq!(table, expected);
    }

    #[test]
    fn test_no_contrasts() {
        let table = first_level_substitutions("03", &[]);
        assert_eq!(table, vec![pair("_subject_id_03", "")]);
    }

    #[test]
    fn test_warp_offsets() {
        assert_eq!(warp_offsets(0, 3), (0, 3, 6));
        assert_eq!(warp_offsets(2, 3), (2, 5, 8));
    }

    #[test]
    fn test_two_digit_suffix() {
        let names: Vec<String> = (0..12).map(|i| format!("c{}", i)).collect();
        let table = first_level_substitutions("01", &names);
        assert_eq!(table.len(), 1 + 11 * 12);
        assert!(table.contains(&pair("_flameo11/zstat1.", "zstat12.")));
        assert!(table.contains(&pair("_warpall35/zstat1_trans.", "zstat12.")));
    }

    #[test]
    fn test_replacements_never_rematched() {
        let names = labels(&["a", "b", "c"]);
        let table = first_level_substitutions("01", &names);
        for (i, (_, replacement)) in table.iter().enumerate() {
            for (pattern, _) in &table[i + 1..] {
                assert!(
                    !replacement.contains(pattern.as_str()),
                    "{:?} would rewrite output {:?}",
                    pattern,
                    replacement
                );
            }
        }
    }

    #[test]
    fn test_applied_to_work_paths() {
        let table = first_level_substitutions("01", &labels(&["a", "b"]));
        assert_eq!(
            apply_substitutions("zstats/_subject_id_01/_flameo1/zstat1.nii.gz", &table),
            "zstats/zstat02.nii.gz"
        );
        assert_eq!(
            apply_substitutions("varcopes/_warpall2/varcope1_warp.nii.gz", &table),
            "varcopes/varcope01.nii.gz"
        );
    }
}
