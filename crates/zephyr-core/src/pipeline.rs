//! Pipeline, job, step and trigger definitions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A pipeline definition as handed to the scheduler.
///
/// Condition fields (`JobDef::condition`, `StepDef::condition`) are already
/// resolved to booleans by the configuration loader; the core never
/// evaluates user expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDef {
    /// Pipeline name (e.g., "ci").
    pub name: String,
    /// Triggers that can start this pipeline.
    #[serde(default)]
    pub triggers: Vec<TriggerRule>,
    /// Global environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Jobs, in declaration order.
    pub jobs: Vec<JobDef>,
}

impl PipelineDef {
    pub fn job(&self, name: &str) -> Option<&JobDef> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// One job: a node in the run's DAG, executed inside exactly one microVM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDef {
    /// Job name, unique within the pipeline.
    pub name: String,
    /// MicroVM runner to execute on.
    #[serde(default)]
    pub runner: RunnerSpec,
    /// Names of jobs that must succeed before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Job-level environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Steps, executed in strict order.
    pub steps: Vec<StepDef>,
    /// Matrix expansion, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixSpec>,
    /// Retry policy applied inside the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    /// Whole-job timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Resolved condition; `Some(false)` means skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<bool>,
}

/// One command issued to the in-VM agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    /// Step name.
    pub name: String,
    /// Command. Run through `sh -c` when `args` is empty.
    pub run: String,
    /// Explicit argv; when non-empty, `run` is the program and these its args.
    #[serde(default)]
    pub args: Vec<String>,
    /// Step-level environment, merged over the job environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory inside the guest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Keep going when this step fails.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Per-step timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Resolved condition; `Some(false)` means skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<bool>,
}

/// MicroVM resources and images for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSpec {
    /// Root filesystem image name (e.g., "alpine").
    pub image: String,
    /// Virtual CPU count.
    #[serde(default = "default_vcpus")]
    pub vcpus: u8,
    /// Guest memory in MiB.
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,
}

fn default_vcpus() -> u8 {
    1
}

fn default_memory_mib() -> u32 {
    512
}

impl Default for RunnerSpec {
    fn default() -> Self {
        Self {
            image: "alpine".to_string(),
            vcpus: default_vcpus(),
            memory_mib: default_memory_mib(),
        }
    }
}

/// Retry policy for a job. The delay between attempts is fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Seconds to wait between attempts.
    #[serde(default)]
    pub delay_secs: u64,
    /// Only retry when the failing exit code is in this list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exit_codes: Option<Vec<i32>>,
}

impl RetrySpec {
    /// Whether a failure with `exit_code` is eligible for another attempt.
    pub fn retries(&self, exit_code: Option<i32>) -> bool {
        match (&self.on_exit_codes, exit_code) {
            (Some(codes), Some(code)) => codes.contains(&code),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// A matrix expansion spec: axes, include/exclude rows and scheduler hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixSpec {
    /// Axis name to its values. Ordered so emitted names are stable.
    pub values: BTreeMap<String, Vec<String>>,
    /// Extra combinations appended after the product.
    #[serde(default)]
    pub include: Vec<BTreeMap<String, String>>,
    /// Combinations removed from the product.
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, String>>,
    /// Cap on concurrently running members of this matrix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    /// Cancel remaining members once one fails.
    #[serde(default)]
    pub fail_fast: bool,
}

/// What kind of event a trigger rule reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Push,
    PullRequest,
    Tag,
    Schedule,
    Manual,
}

/// One trigger rule from a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRule {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Branch globs that must match.
    #[serde(default)]
    pub branches: Vec<String>,
    /// Branch globs that veto a match.
    #[serde(default)]
    pub branches_ignore: Vec<String>,
    /// Changed-file globs that must match.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Changed-file globs that veto a file from counting.
    #[serde(default)]
    pub paths_ignore: Vec<String>,
    /// Tag globs for tag events.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Pull request actions this rule reacts to.
    #[serde(default = "default_pr_events")]
    pub pr_events: Vec<String>,
}

pub fn default_pr_events() -> Vec<String> {
    vec![
        "opened".to_string(),
        "synchronize".to_string(),
        "reopened".to_string(),
    ]
}

/// A concrete event to match against trigger rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerEvent {
    Push {
        branch: String,
        changed_paths: Vec<String>,
    },
    PullRequest {
        action: String,
        branch: String,
        changed_paths: Vec<String>,
    },
    Tag {
        name: String,
    },
    Schedule,
    Manual,
}
