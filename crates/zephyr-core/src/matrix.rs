//! Matrix expansion: turns one job definition into many concrete jobs.

use regex::Regex;
use std::collections::BTreeMap;

use crate::Result;
use crate::pipeline::JobDef;

/// A concrete job produced by matrix expansion.
#[derive(Debug, Clone)]
pub struct ExpandedJob {
    /// The cloned, interpolated definition. `matrix` is cleared.
    pub def: JobDef,
    /// Name of the job definition this came from.
    pub base: String,
    /// The axis values for this member; empty for non-matrix jobs.
    pub combination: BTreeMap<String, String>,
}

/// Expand a job definition into its concrete members.
///
/// Non-matrix jobs expand to a single member. For matrix jobs the product of
/// `values` is taken, combinations matching an `exclude` row are removed,
/// `include` rows are appended, and each member's fields undergo
/// `${{ matrix.axis }}` substitution. Emitted names are
/// `base(k1=v1,k2=v2)` with axis keys in lexicographic order.
pub fn expand(job: &JobDef) -> Result<Vec<ExpandedJob>> {
    let Some(matrix) = &job.matrix else {
        return Ok(vec![ExpandedJob {
            def: job.clone(),
            base: job.name.clone(),
            combination: BTreeMap::new(),
        }]);
    };

    let mut combinations = if matrix.values.is_empty() {
        Vec::new()
    } else {
        cartesian_product(&matrix.values)
    };
    combinations.retain(|combo| !matrix.exclude.iter().any(|row| row_matches(row, combo)));
    combinations.extend(matrix.include.iter().cloned());

    let pattern = Regex::new(r"\$\{\{\s*matrix\.([A-Za-z0-9_-]+)\s*\}\}")
        .map_err(|e| crate::Error::Internal(e.to_string()))?;

    let members = combinations
        .into_iter()
        .map(|combo| {
            let mut def = job.clone();
            def.matrix = None;
            def.name = member_name(&job.name, &combo);
            def.runner.image = interpolate(&pattern, &def.runner.image, &combo);
            for value in def.env.values_mut() {
                *value = interpolate(&pattern, value, &combo);
            }
            for step in &mut def.steps {
                step.run = interpolate(&pattern, &step.run, &combo);
                for arg in &mut step.args {
                    *arg = interpolate(&pattern, arg, &combo);
                }
                for value in step.env.values_mut() {
                    *value = interpolate(&pattern, value, &combo);
                }
                if let Some(cwd) = &step.cwd {
                    step.cwd = Some(interpolate(&pattern, cwd, &combo));
                }
            }
            ExpandedJob {
                def,
                base: job.name.clone(),
                combination: combo,
            }
        })
        .collect();

    Ok(members)
}

/// Render the stable member name for a combination.
pub fn member_name(base: &str, combination: &BTreeMap<String, String>) -> String {
    if combination.is_empty() {
        return base.to_string();
    }
    let axes: Vec<String> = combination
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    format!("{base}({})", axes.join(","))
}

fn cartesian_product(values: &BTreeMap<String, Vec<String>>) -> Vec<BTreeMap<String, String>> {
    let mut combos: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
    for (axis, axis_values) in values {
        let mut next = Vec::with_capacity(combos.len() * axis_values.len());
        for combo in &combos {
            for value in axis_values {
                let mut extended = combo.clone();
                extended.insert(axis.clone(), value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}

/// An exclude row matches when every entry equals the combination's value.
fn row_matches(row: &BTreeMap<String, String>, combo: &BTreeMap<String, String>) -> bool {
    !row.is_empty() && row.iter().all(|(k, v)| combo.get(k) == Some(v))
}

fn interpolate(pattern: &Regex, input: &str, combo: &BTreeMap<String, String>) -> String {
    pattern
        .replace_all(input, |caps: &regex::Captures<'_>| {
            combo
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
