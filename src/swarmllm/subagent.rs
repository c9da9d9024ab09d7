//! Stateless sub-agent executor.
//!
//! A sub-agent is a single scoped model invocation with a role, a prompt, and
//! a bounded parent context.  The executor composes the chat message list,
//! calls the provider client once (retries are the gateway's concern, not
//! ours), and records deterministic step labels in `actions` plus short
//! human-readable annotations in `thoughts`.  No model reasoning is ever
//! persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::swarmllm::client_wrapper::{
    CallParams, ChatMessage, ProviderClient, TokenUsage,
};
use crate::swarmllm::covenant::{Constraints, StoredMessage};

/// Role a sub-agent plays inside a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubAgentRole {
    /// Analyses the request's domain and facets.
    Classifier,
    /// Decomposes the request into independent work items.
    Router,
    /// Produces one branch of the substantive answer.
    Executor,
    /// Scores the assembled results, ending with a `SCORE:` line.
    Evaluator,
    /// Synthesizes the authoritative final answer.
    Coordinator,
    /// Announces a rainbow swarm; runs locally without a model call.
    Spawner,
    /// Verifies rainbow ordering and concatenates; runs locally.
    Aggregator,
    ColorRed,
    ColorOrange,
    ColorYellow,
    ColorGreen,
    ColorBlue,
    ColorIndigo,
    ColorViolet,
}

impl SubAgentRole {
    /// The seven color roles in ROYGBIV order.
    pub const RAINBOW: [SubAgentRole; 7] = [
        SubAgentRole::ColorRed,
        SubAgentRole::ColorOrange,
        SubAgentRole::ColorYellow,
        SubAgentRole::ColorGreen,
        SubAgentRole::ColorBlue,
        SubAgentRole::ColorIndigo,
        SubAgentRole::ColorViolet,
    ];

    /// The color name for a color role, uppercased.
    pub fn color_name(self) -> Option<&'static str> {
        match self {
            SubAgentRole::ColorRed => Some("RED"),
            SubAgentRole::ColorOrange => Some("ORANGE"),
            SubAgentRole::ColorYellow => Some("YELLOW"),
            SubAgentRole::ColorGreen => Some("GREEN"),
            SubAgentRole::ColorBlue => Some("BLUE"),
            SubAgentRole::ColorIndigo => Some("INDIGO"),
            SubAgentRole::ColorViolet => Some("VIOLET"),
            _ => None,
        }
    }

    /// Analytic roles sample at 0.3, generative ones at 0.7.
    pub fn temperature(self) -> f32 {
        match self {
            SubAgentRole::Classifier | SubAgentRole::Router | SubAgentRole::Evaluator => 0.3,
            _ => 0.7,
        }
    }

    /// Whether this role resolves locally instead of calling a model.
    pub fn is_local(self) -> bool {
        matches!(self, SubAgentRole::Spawner | SubAgentRole::Aggregator)
    }

    /// Role-specific system instruction.
    pub fn system_prompt(self) -> String {
        match self {
            SubAgentRole::Classifier => {
                "You are the classifier of an agent swarm. Identify the request's domain, \
                 the expertise it needs, and its key facets. Reply in a few short lines."
                    .to_string()
            }
            SubAgentRole::Router => {
                "You are the router of an agent swarm. Split the request into independent \
                 work items that executors can tackle in parallel. List one item per line."
                    .to_string()
            }
            SubAgentRole::Executor => {
                "You are an executor in an agent swarm. Produce your branch of the answer \
                 thoroughly and concretely. Other branches are handled by your peers."
                    .to_string()
            }
            SubAgentRole::Evaluator => {
                "You are the evaluator of an agent swarm. Assess the assembled branch \
                 results for correctness and completeness, note gaps, and end your reply \
                 with a line of the form 'SCORE: <value between 0.0 and 1.0>'."
                    .to_string()
            }
            SubAgentRole::Coordinator => {
                "You are the coordinator of an agent swarm. Synthesize the branch results \
                 into one coherent final answer for the user. Resolve overlaps and drop \
                 anything the evaluator flagged as wrong."
                    .to_string()
            }
            SubAgentRole::Spawner | SubAgentRole::Aggregator => String::new(),
            color => format!(
                "You are the {} sub-agent of a rainbow swarm. Reply with exactly the \
                 single word {} and nothing else.",
                color.color_name().unwrap_or("COLOR"),
                color.color_name().unwrap_or("COLOR"),
            ),
        }
    }
}

impl fmt::Display for SubAgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            SubAgentRole::Classifier => "classifier",
            SubAgentRole::Router => "router",
            SubAgentRole::Executor => "executor",
            SubAgentRole::Evaluator => "evaluator",
            SubAgentRole::Coordinator => "coordinator",
            SubAgentRole::Spawner => "spawner",
            SubAgentRole::Aggregator => "aggregator",
            SubAgentRole::ColorRed => "color-red",
            SubAgentRole::ColorOrange => "color-orange",
            SubAgentRole::ColorYellow => "color-yellow",
            SubAgentRole::ColorGreen => "color-green",
            SubAgentRole::ColorBlue => "color-blue",
            SubAgentRole::ColorIndigo => "color-indigo",
            SubAgentRole::ColorViolet => "color-violet",
        };
        write!(f, "{}", tag)
    }
}

/// Execution status of a sub-agent task.  Monotonic; `completed` and `failed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SubAgentStatus {
    fn rank(self) -> u8 {
        match self {
            SubAgentStatus::Pending => 0,
            SubAgentStatus::Running => 1,
            SubAgentStatus::Completed | SubAgentStatus::Failed => 2,
        }
    }
}

/// Terminal output of a sub-agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentOutput {
    /// The model's content on success.
    Content(String),
    /// Structured failure carried into the evaluator's view.
    Error { kind: String, detail: String },
}

impl SubAgentOutput {
    /// The content, or an inline error placeholder for failed branches.
    pub fn as_text(&self) -> String {
        match self {
            SubAgentOutput::Content(c) => c.clone(),
            SubAgentOutput::Error { kind, detail } => {
                format!("[branch error: {} - {}]", kind, detail)
            }
        }
    }
}

/// Context snapshot supplied to a sub-agent by its orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct ParentContext {
    /// The covenant intent.
    pub intent: String,
    /// The covenant constraints.
    pub constraints: Constraints,
    /// Trailing mediator conversation turns.
    pub recent_messages: Vec<StoredMessage>,
    /// Index among parallel peers, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_index: Option<u32>,
    /// Ordered outputs of completed earlier siblings, for sequential stages.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub previous_results: Vec<String>,
}

/// One sub-agent task row.  Forms a DAG through `parent_id` within a single
/// orchestrator's scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentTask {
    pub id: String,
    pub covenant_id: String,
    pub role: SubAgentRole,
    pub input_prompt: String,
    pub model_id: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub parent_id: Option<String>,
    pub status: SubAgentStatus,
    /// 0..=100.
    pub progress: u8,
    /// Short human-readable annotations, append-only.
    pub thoughts: Vec<String>,
    /// Deterministic step labels, append-only.
    pub actions: Vec<String>,
    pub output: Option<SubAgentOutput>,
    /// Token accounting from the provider call, when one happened.
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubAgentTask {
    /// Create a pending task.
    pub fn new(
        covenant_id: impl Into<String>,
        role: SubAgentRole,
        input_prompt: impl Into<String>,
        model_id: impl Into<String>,
        max_tokens: u32,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            covenant_id: covenant_id.into(),
            role,
            input_prompt: input_prompt.into(),
            model_id: model_id.into(),
            temperature: role.temperature(),
            max_tokens,
            parent_id,
            status: SubAgentStatus::Pending,
            progress: 0,
            thoughts: Vec::new(),
            actions: Vec::new(),
            output: None,
            usage: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Monotonic status setter; backward moves are ignored.
    pub fn set_status(&mut self, next: SubAgentStatus) {
        if next.rank() >= self.status.rank() && self.status.rank() < 2 {
            self.status = next;
        }
    }

    fn record(&mut self, action: &str, thought: impl Into<String>) {
        self.actions.push(action.to_string());
        self.thoughts.push(thought.into());
    }

    /// Whether the task reached a terminal status with an output attached.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            SubAgentStatus::Completed | SubAgentStatus::Failed
        )
    }
}

/// Execute one sub-agent task to termination.
///
/// Composes `[system, user]` from the role instruction, the input prompt, and
/// the serialized parent context, then performs a single provider call.  On
/// success the task completes with the model content; on failure it fails
/// with a structured error output.  Either way the task ends terminal with an
/// output present.
pub async fn run(
    task: &mut SubAgentTask,
    client: &dyn ProviderClient,
    context: &ParentContext,
    timeout_ms: u64,
) {
    task.set_status(SubAgentStatus::Running);
    task.started_at = Some(Utc::now());
    task.progress = 5;
    task.record("initializing", format!("{} starting", task.role));

    let context_json = serde_json::to_string_pretty(context)
        .unwrap_or_else(|_| "{}".to_string());
    task.progress = 20;
    task.record(
        "loading_context",
        format!(
            "{} prior results, {} context turns",
            context.previous_results.len(),
            context.recent_messages.len()
        ),
    );

    let mut body = String::with_capacity(task.input_prompt.len() + context_json.len() + 64);
    body.push_str(&task.input_prompt);
    body.push_str("\n\nShared context:\n");
    body.push_str(&context_json);
    if !context.previous_results.is_empty() {
        body.push_str("\n\nResults from earlier stages, in order:\n");
        for (i, prev) in context.previous_results.iter().enumerate() {
            body.push_str(&format!("{}. {}\n", i + 1, prev));
        }
    }

    let messages = [
        ChatMessage::system(task.role.system_prompt()),
        ChatMessage::user(body),
    ];
    let params = CallParams {
        temperature: task.temperature,
        max_tokens: task.max_tokens,
        top_p: None,
        timeout_ms,
    };

    task.progress = 40;
    task.record("calling_model", format!("calling {}", task.model_id));

    match client.call(&task.model_id, &messages, &params).await {
        Ok(response) => {
            task.record(
                "postprocessing",
                format!("{} chars in {} ms", response.content.len(), response.latency_ms),
            );
            task.usage = Some(response.usage);
            task.output = Some(SubAgentOutput::Content(response.content));
            task.progress = 100;
            task.set_status(SubAgentStatus::Completed);
        }
        Err(e) => {
            task.record("postprocessing", format!("call failed: {}", e.kind()));
            task.output = Some(SubAgentOutput::Error {
                kind: e.kind().to_string(),
                detail: e.to_string(),
            });
            task.progress = 100;
            task.set_status(SubAgentStatus::Failed);
        }
    }
    task.completed_at = Some(Utc::now());
}

/// Resolve a local (non-model) role deterministically.
pub fn complete_locally(task: &mut SubAgentTask, content: String, success: bool) {
    task.set_status(SubAgentStatus::Running);
    task.started_at = Some(Utc::now());
    task.record("initializing", format!("{} starting", task.role));
    task.record("postprocessing", "resolved locally");
    task.output = Some(if success {
        SubAgentOutput::Content(content)
    } else {
        SubAgentOutput::Error {
            kind: "aggregation".to_string(),
            detail: content,
        }
    });
    task.progress = 100;
    task.set_status(if success {
        SubAgentStatus::Completed
    } else {
        SubAgentStatus::Failed
    });
    task.completed_at = Some(Utc::now());
}
