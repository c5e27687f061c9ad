//! Pipeline configuration parsing.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use zephyr_core::pipeline::{
    JobDef, MatrixSpec, PipelineDef, RetrySpec, RunnerSpec, StepDef, TriggerRule,
};

use crate::condition::{self, RunContext};
use crate::{ConfigError, ConfigResult};

/// Load and resolve a pipeline definition from a file.
pub fn load_pipeline(path: impl AsRef<Path>, ctx: &RunContext) -> ConfigResult<PipelineDef> {
    let text = std::fs::read_to_string(path)?;
    parse_pipeline(&text, ctx)
}

/// Parse a pipeline definition from YAML text and resolve all condition
/// expressions against the run context.
pub fn parse_pipeline(yaml: &str, ctx: &RunContext) -> ConfigResult<PipelineDef> {
    let raw: RawPipeline = serde_yaml::from_str(yaml)?;
    raw.resolve(ctx)
}

#[derive(Debug, Deserialize)]
struct RawPipeline {
    name: String,
    #[serde(default)]
    triggers: Vec<TriggerRule>,
    #[serde(default)]
    env: HashMap<String, String>,
    jobs: BTreeMap<String, RawJob>,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    #[serde(default)]
    runner: Option<RawRunner>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    steps: Vec<RawStep>,
    #[serde(default)]
    matrix: Option<RawMatrix>,
    #[serde(default)]
    retry: Option<RetrySpec>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default, rename = "if")]
    condition: Option<String>,
}

/// A runner is either an image name or a full spec.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRunner {
    Image(String),
    Spec(RunnerSpec),
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    name: Option<String>,
    run: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    continue_on_error: bool,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default, rename = "if")]
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMatrix {
    values: BTreeMap<String, Vec<serde_yaml::Value>>,
    #[serde(default)]
    include: Vec<BTreeMap<String, serde_yaml::Value>>,
    #[serde(default)]
    exclude: Vec<BTreeMap<String, serde_yaml::Value>>,
    #[serde(default)]
    max_parallel: Option<usize>,
    #[serde(default)]
    fail_fast: bool,
}

impl RawPipeline {
    fn resolve(self, ctx: &RunContext) -> ConfigResult<PipelineDef> {
        if self.jobs.is_empty() {
            return Err(ConfigError::MissingField("jobs".to_string()));
        }

        for (name, job) in &self.jobs {
            for dep in &job.depends_on {
                if !self.jobs.contains_key(dep) {
                    return Err(ConfigError::InvalidReference(format!(
                        "job '{name}' depends on unknown job '{dep}'"
                    )));
                }
            }
            if job.steps.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("jobs.{name}.steps"),
                    message: "a job needs at least one step".to_string(),
                });
            }
        }

        let jobs = self
            .jobs
            .into_iter()
            .map(|(name, job)| job.resolve(name, ctx))
            .collect::<ConfigResult<Vec<_>>>()?;

        Ok(PipelineDef {
            name: self.name,
            triggers: self.triggers,
            env: self.env,
            jobs,
        })
    }
}

impl RawJob {
    fn resolve(self, name: String, ctx: &RunContext) -> ConfigResult<JobDef> {
        let runner = match self.runner {
            Some(RawRunner::Image(image)) => RunnerSpec {
                image,
                ..Default::default()
            },
            Some(RawRunner::Spec(spec)) => spec,
            None => RunnerSpec::default(),
        };

        let condition = self
            .condition
            .as_deref()
            .map(|expr| condition::resolve(expr, ctx))
            .transpose()?;

        let steps = self
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| step.resolve(index, ctx))
            .collect::<ConfigResult<Vec<_>>>()?;

        Ok(JobDef {
            name,
            runner,
            depends_on: self.depends_on,
            env: self.env,
            steps,
            matrix: self.matrix.map(RawMatrix::resolve).transpose()?,
            retry: self.retry,
            timeout_secs: self.timeout_secs,
            condition,
        })
    }
}

impl RawStep {
    fn resolve(self, index: usize, ctx: &RunContext) -> ConfigResult<StepDef> {
        let condition = self
            .condition
            .as_deref()
            .map(|expr| condition::resolve(expr, ctx))
            .transpose()?;

        Ok(StepDef {
            name: self.name.unwrap_or_else(|| format!("step-{index}")),
            run: self.run,
            args: self.args,
            env: self.env,
            cwd: self.cwd,
            continue_on_error: self.continue_on_error,
            timeout_secs: self.timeout_secs,
            condition,
        })
    }
}

impl RawMatrix {
    fn resolve(self) -> ConfigResult<MatrixSpec> {
        Ok(MatrixSpec {
            values: self
                .values
                .into_iter()
                .map(|(axis, values)| {
                    let rendered = values
                        .into_iter()
                        .map(|v| scalar_to_string(&axis, v))
                        .collect::<ConfigResult<Vec<_>>>()?;
                    Ok((axis, rendered))
                })
                .collect::<ConfigResult<BTreeMap<_, _>>>()?,
            include: rows_to_strings(self.include)?,
            exclude: rows_to_strings(self.exclude)?,
            max_parallel: self.max_parallel,
            fail_fast: self.fail_fast,
        })
    }
}

fn rows_to_strings(
    rows: Vec<BTreeMap<String, serde_yaml::Value>>,
) -> ConfigResult<Vec<BTreeMap<String, String>>> {
    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(axis, value)| Ok((axis.clone(), scalar_to_string(&axis, value)?)))
                .collect()
        })
        .collect()
}

/// Matrix axis values may be written as bare YAML scalars (`18`, `true`).
fn scalar_to_string(axis: &str, value: serde_yaml::Value) -> ConfigResult<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        other => Err(ConfigError::InvalidValue {
            field: format!("matrix.{axis}"),
            message: format!("expected a scalar, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name: ci
triggers:
  - type: push
    branches: [main, develop]
    paths: ["src/**"]
    paths_ignore: ["**/*.md"]
env:
  CI: "true"
jobs:
  build:
    runner: alpine
    steps:
      - name: compile
        run: make build
  test:
    runner:
      image: node:20
      vcpus: 2
      memory_mib: 1024
    depends_on: [build]
    matrix:
      values:
        node: [18, 20]
    steps:
      - run: npm test
        if: branch == 'main'
        continue_on_error: true
"#;

    fn ctx() -> RunContext {
        RunContext {
            branch: Some("main".to_string()),
            trigger_type: "push".to_string(),
        }
    }

    #[test]
    fn parses_full_pipeline() {
        let pipeline = parse_pipeline(SAMPLE, &ctx()).unwrap();
        assert_eq!(pipeline.name, "ci");
        assert_eq!(pipeline.jobs.len(), 2);
        assert_eq!(pipeline.triggers.len(), 1);

        let build = pipeline.job("build").unwrap();
        assert_eq!(build.runner.image, "alpine");
        assert_eq!(build.runner.vcpus, 1);
        assert_eq!(build.steps[0].name, "compile");

        let test = pipeline.job("test").unwrap();
        assert_eq!(test.runner.vcpus, 2);
        assert_eq!(test.depends_on, vec!["build".to_string()]);
        let matrix = test.matrix.as_ref().unwrap();
        assert_eq!(matrix.values["node"], vec!["18", "20"]);
    }

    #[test]
    fn conditions_are_resolved_to_booleans() {
        let pipeline = parse_pipeline(SAMPLE, &ctx()).unwrap();
        let step = &pipeline.job("test").unwrap().steps[0];
        assert_eq!(step.condition, Some(true));

        let other = RunContext {
            branch: Some("develop".to_string()),
            trigger_type: "push".to_string(),
        };
        let pipeline = parse_pipeline(SAMPLE, &other).unwrap();
        let step = &pipeline.job("test").unwrap().steps[0];
        assert_eq!(step.condition, Some(false));
    }

    #[test]
    fn unnamed_steps_get_positional_names() {
        let pipeline = parse_pipeline(SAMPLE, &ctx()).unwrap();
        assert_eq!(pipeline.job("test").unwrap().steps[0].name, "step-0");
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let yaml = r#"
name: ci
jobs:
  build:
    depends_on: [missing]
    steps:
      - run: make
"#;
        let err = parse_pipeline(yaml, &ctx()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidReference(_)));
    }

    #[test]
    fn empty_steps_are_rejected() {
        let yaml = r#"
name: ci
jobs:
  build:
    steps: []
"#;
        let err = parse_pipeline(yaml, &ctx()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
