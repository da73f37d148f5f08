//! Runs one agent role against one context.
//!
//! The loop per turn:
//! 1. Ask the model for the next reply
//! 2. If it holds a tool call, execute it and feed the result back
//! 3. If it holds the final JSON report, stop
//! 4. Otherwise remind the agent of the report format
//!
//! Running out of turns yields a `timeout` result. Provider failures and
//! configuration problems yield an `error` result. [`AgentExecutor::execute`]
//! never returns an error itself.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::AgentError;
use super::roles::AgentRole;
use super::tools::{parse_tool_call, NoTools, ToolCall, ToolResult, ToolSurface, WorktreeTools};
use super::types::{AgentContext, AgentReport, AgentResult, ExecutionMetadata};
use crate::llm::{GenerationRequest, LlmProvider, Message, ModelResolution, ProviderRegistry};
use crate::metrics;

const OUTPUT_CONTRACT: &str = r#"When you are done, reply with only this JSON object and no tool call:
{"status": "passed" | "failed", "summary": "<one paragraph>", "findings": [
  {"severity": "critical" | "high" | "medium" | "low" | "info",
   "description": "<what is wrong>", "file": "<path>", "line": <number>,
   "fix_applied": <true if you already fixed it>}
]}"#;

const REPORT_REMINDER: &str =
    "Your reply contained neither a tool call nor the final JSON report. Continue with a tool call, or reply with the report.";

/// Side-channel progress of a run. The final [`AgentResult`] is the contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepEvent {
    AssistantText { turn: usize, text: String },
    ToolCall { turn: usize, call: ToolCall },
    ToolResult { turn: usize, tool: String, result: ToolResult },
}

/// Receives [`StepEvent`]s synchronously from inside the loop.
pub type StepCallback = Arc<dyn Fn(StepEvent) + Send + Sync>;

/// Sampling settings shared by every run of an executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 4096,
        }
    }
}

enum LoopOutcome {
    Report(AgentReport),
    TurnsExhausted,
}

/// Drives agent roles through the model-execution capability.
///
/// Cheap to clone; the quality pipeline gives every agent its own clone with
/// its own step callback.
#[derive(Clone)]
pub struct AgentExecutor {
    providers: ProviderRegistry,
    resolution: ModelResolution,
    config: ExecutorConfig,
    on_step: Option<StepCallback>,
    tools_override: Option<Arc<dyn ToolSurface>>,
}

impl AgentExecutor {
    pub fn new(providers: ProviderRegistry, resolution: ModelResolution) -> Self {
        Self {
            providers,
            resolution,
            config: ExecutorConfig::default(),
            on_step: None,
            tools_override: None,
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the step callback.
    pub fn with_step_callback(mut self, callback: StepCallback) -> Self {
        self.on_step = Some(callback);
        self
    }

    /// Uses `tools` for every run instead of worktree tools built per role.
    pub fn with_tools(mut self, tools: Arc<dyn ToolSurface>) -> Self {
        self.tools_override = Some(tools);
        self
    }

    pub fn resolution(&self) -> &ModelResolution {
        &self.resolution
    }

    /// Runs `role` against `ctx` until it reports, runs out of turns, fails,
    /// or `cancel` fires.
    pub async fn execute(
        &self,
        role: &AgentRole,
        ctx: &AgentContext,
        cancel: &CancellationToken,
    ) -> AgentResult {
        let started = Instant::now();
        let resolved = self.resolution.resolve(&role.name, &role.model_choice());
        let mut metadata = ExecutionMetadata {
            model: resolved.model.clone(),
            provider: resolved.provider.clone(),
            ..ExecutionMetadata::default()
        };

        info!(
            agent = %role.name,
            correlation_id = %ctx.correlation_id,
            model = %resolved.model,
            provider = %resolved.provider,
            "Agent run started"
        );

        let outcome = match self.providers.get(&resolved.provider) {
            Ok(provider) => {
                self.run_loop(role, ctx, provider, &resolved.model, cancel, &mut metadata)
                    .await
            }
            Err(err) => Err(err.into()),
        };
        metadata.duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(LoopOutcome::Report(report)) => {
                AgentResult::from_report(&role.name, report, metadata)
            }
            Ok(LoopOutcome::TurnsExhausted) => {
                warn!(agent = %role.name, max_turns = role.max_turns, "Agent ran out of turns");
                AgentResult::timeout(&role.name, role.max_turns, metadata)
            }
            Err(err) => {
                warn!(agent = %role.name, error = %err, "Agent run failed");
                AgentResult::error(&role.name, err.to_string(), metadata)
            }
        };

        metrics::record_agent_run(
            &role.name,
            result.status.as_str(),
            result.metadata.duration_ms as f64 / 1000.0,
        );
        info!(
            agent = %role.name,
            status = %result.status,
            findings = result.findings.len(),
            turns = result.metadata.turns_used,
            duration_ms = result.metadata.duration_ms,
            "Agent run finished"
        );
        result
    }

    fn tools_for(&self, role: &AgentRole, ctx: &AgentContext) -> Arc<dyn ToolSurface> {
        if let Some(tools) = &self.tools_override {
            return Arc::clone(tools);
        }
        if role.tools.is_empty() {
            Arc::new(NoTools)
        } else {
            Arc::new(WorktreeTools::new(&ctx.worktree_path).restricted_to(&role.tools))
        }
    }

    fn emit(&self, event: StepEvent) {
        if let Some(callback) = &self.on_step {
            callback(event);
        }
    }

    async fn run_loop(
        &self,
        role: &AgentRole,
        ctx: &AgentContext,
        provider: Arc<dyn LlmProvider>,
        model: &str,
        cancel: &CancellationToken,
        metadata: &mut ExecutionMetadata,
    ) -> Result<LoopOutcome, AgentError> {
        let tools = self.tools_for(role, ctx);
        let mut conversation = vec![
            Message::system(build_system_prompt(role, tools.as_ref())),
            Message::user(build_task_message(ctx)),
        ];

        for turn in 1..=role.max_turns {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            metadata.turns_used = turn;

            let request = GenerationRequest::new(model, conversation.clone())
                .with_temperature(self.config.temperature)
                .with_max_tokens(self.config.max_tokens);

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                response = provider.generate(request) => response?,
            };
            metadata.input_tokens += u64::from(response.usage.prompt_tokens);
            metadata.output_tokens += u64::from(response.usage.completion_tokens);

            let text = response.first_content().unwrap_or_default().to_string();
            conversation.push(Message::assistant(&text));
            self.emit(StepEvent::AssistantText {
                turn,
                text: text.clone(),
            });

            if let Some(call) = parse_tool_call(&text) {
                debug!(agent = %role.name, turn, tool = %call.name, "Tool call");
                self.emit(StepEvent::ToolCall {
                    turn,
                    call: call.clone(),
                });
                let result = tools.invoke(&call).await;
                conversation.push(Message::user(result.to_message(&call.name)));
                self.emit(StepEvent::ToolResult {
                    turn,
                    tool: call.name,
                    result,
                });
                continue;
            }

            if let Some(report) = AgentReport::parse(&text) {
                return Ok(LoopOutcome::Report(report));
            }

            conversation.push(Message::user(REPORT_REMINDER));
        }

        Ok(LoopOutcome::TurnsExhausted)
    }
}

fn build_system_prompt(role: &AgentRole, tools: &dyn ToolSurface) -> String {
    let mut prompt = role.system_prompt.trim().to_string();
    if !tools.tool_names().is_empty() {
        prompt.push_str(
            "\n\nYou have access to the following tools. To use a tool, reply with a JSON \
             object containing 'tool' and 'arguments' keys, one tool per reply.\n\nTools:\n",
        );
        prompt.push_str(&serde_json::to_string_pretty(&tools.describe()).unwrap_or_default());
    }
    prompt.push_str("\n\n");
    prompt.push_str(OUTPUT_CONTRACT);
    prompt
}

fn build_task_message(ctx: &AgentContext) -> String {
    let mut message = ctx.task.trim().to_string();
    if !ctx.branch.is_empty() {
        message.push_str(&format!(
            "\n\nBranch: {} (base: {})",
            ctx.branch, ctx.base_branch
        ));
    }
    if let Some(tier) = ctx.tier {
        message.push_str(&format!("\nChange size: {}", tier));
    }
    if let Some(stats) = &ctx.diff_stats {
        message.push_str(&format!(
            "\nChanged files ({}; +{} -{}):\n",
            stats.files_changed, stats.insertions, stats.deletions
        ));
        for file in &stats.changed_files {
            message.push_str("- ");
            message.push_str(file);
            message.push('\n');
        }
    }
    if !ctx.prior_results.is_empty() {
        message.push_str("\n\nEarlier results:\n");
        for prior in &ctx.prior_results {
            message.push_str(&format!("- {} ({}): {}\n", prior.agent, prior.status, prior.summary.trim()));
            for finding in &prior.findings {
                message.push_str(&format!("  - [{}] {}\n", finding.severity, finding.description));
            }
        }
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::types::{AgentStatus, DiffStats};
    use crate::error::LlmError;
    use crate::llm::{Choice, GenerationResponse, Usage};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays scripted replies in order, repeating the last one.
    struct MockLlmProvider {
        replies: Mutex<Vec<String>>,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl MockLlmProvider {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().rev().map(|r| r.to_string()).collect()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlmProvider {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            let mut replies = self.replies.lock().unwrap();
            let content = if replies.len() > 1 {
                replies.pop().unwrap()
            } else {
                replies.last().cloned().unwrap_or_default()
            };
            Ok(GenerationResponse {
                id: "mock".to_string(),
                model: "mock-model".to_string(),
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(content),
                    finish_reason: "stop".to_string(),
                }],
                usage: Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
            })
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl LlmProvider for FailingProvider {
        async fn generate(&self, _r: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            Err(LlmError::ApiError {
                code: 502,
                message: "bad gateway".to_string(),
            })
        }
    }

    fn executor(provider: Arc<dyn LlmProvider>) -> AgentExecutor {
        AgentExecutor::new(
            ProviderRegistry::single("mock", provider),
            ModelResolution::new("mock", "mock-model"),
        )
    }

    fn role(max_turns: usize) -> AgentRole {
        AgentRole::new("security", "Review for vulnerabilities.").with_max_turns(max_turns)
    }

    fn context(dir: &std::path::Path) -> AgentContext {
        AgentContext::new("req-1", dir, "Review the change.")
            .with_branches("feature/x", "main")
            .with_diff_stats(DiffStats {
                files_changed: 1,
                insertions: 3,
                deletions: 1,
                changed_files: vec!["src/lib.rs".to_string()],
            })
    }

    #[tokio::test]
    async fn test_report_on_first_turn() {
        let provider = Arc::new(MockLlmProvider::new(&[
            r#"{"status": "passed", "summary": "clean", "findings": []}"#,
        ]));
        let dir = tempfile::tempdir().unwrap();
        let result = executor(provider.clone())
            .execute(&role(5), &context(dir.path()), &CancellationToken::new())
            .await;

        assert_eq!(result.status, AgentStatus::Passed);
        assert_eq!(result.summary, "clean");
        assert_eq!(result.metadata.turns_used, 1);
        assert_eq!(result.metadata.input_tokens, 10);
        assert_eq!(result.metadata.model, "mock-model");
        assert_eq!(result.metadata.provider, "mock");

        let requests = provider.requests.lock().unwrap();
        let user = &requests[0].messages[1].content;
        assert!(user.contains("src/lib.rs"));
        assert!(user.contains("feature/x"));
    }

    #[tokio::test]
    async fn test_task_message_carries_tier_and_prior_results() {
        let provider = Arc::new(MockLlmProvider::new(&[
            r#"{"status": "passed", "summary": "done", "findings": []}"#,
        ]));
        let dir = tempfile::tempdir().unwrap();
        let plan = AgentResult::from_report(
            "planner",
            AgentReport {
                status: Some(AgentStatus::Passed),
                summary: "Touch only src/login.rs".to_string(),
                findings: vec![crate::agents::Finding::new(
                    crate::agents::Severity::Info,
                    "empty password path is untested",
                )],
            },
            ExecutionMetadata::default(),
        );
        let ctx = context(dir.path())
            .with_tier(crate::pipeline::Tier::Medium)
            .with_prior_results([plan]);

        executor(provider.clone())
            .execute(&role(2), &ctx, &CancellationToken::new())
            .await;

        let requests = provider.requests.lock().unwrap();
        let user = &requests[0].messages[1].content;
        assert!(user.contains("Change size: medium"));
        assert!(user.contains("- planner (passed): Touch only src/login.rs"));
        assert!(user.contains("[info] empty password path is untested"));
    }

    #[tokio::test]
    async fn test_tool_call_then_report_with_step_events() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "secret=1").unwrap();
        let provider = Arc::new(MockLlmProvider::new(&[
            r#"{"tool": "read_file", "arguments": {"path": "a.txt"}}"#,
            r#"{"summary": "found a secret", "findings": [{"severity": "critical", "description": "hardcoded secret", "file": "a.txt"}]}"#,
        ]));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let mut role = role(5);
        role.tools = vec!["read_file".to_string()];

        let result = executor(provider.clone())
            .with_step_callback(Arc::new(move |e| sink.lock().unwrap().push(e)))
            .execute(&role, &context(dir.path()), &CancellationToken::new())
            .await;

        assert_eq!(result.status, AgentStatus::Failed);
        assert_eq!(result.metadata.turns_used, 2);

        let events = events.lock().unwrap();
        assert!(matches!(events[0], StepEvent::AssistantText { turn: 1, .. }));
        assert!(matches!(&events[1], StepEvent::ToolCall { call, .. } if call.name == "read_file"));
        assert!(matches!(
            &events[2],
            StepEvent::ToolResult { result, .. } if result.success && result.output == "secret=1"
        ));

        let requests = provider.requests.lock().unwrap();
        assert!(requests[1].messages.last().unwrap().content.contains("secret=1"));
    }

    #[tokio::test]
    async fn test_turn_budget_exhaustion_is_timeout() {
        let provider = Arc::new(MockLlmProvider::new(&["still thinking..."]));
        let dir = tempfile::tempdir().unwrap();
        let result = executor(provider)
            .execute(&role(3), &context(dir.path()), &CancellationToken::new())
            .await;

        assert_eq!(result.status, AgentStatus::Timeout);
        assert_eq!(result.metadata.turns_used, 3);
    }

    #[tokio::test]
    async fn test_provider_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = executor(Arc::new(FailingProvider))
            .execute(&role(3), &context(dir.path()), &CancellationToken::new())
            .await;

        assert_eq!(result.status, AgentStatus::Error);
        assert!(result.error.unwrap().contains("bad gateway"));
    }

    #[tokio::test]
    async fn test_unknown_provider_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = AgentExecutor::new(
            ProviderRegistry::single("mock", Arc::new(FailingProvider)),
            ModelResolution::new("elsewhere", "m"),
        );
        let result = exec
            .execute(&role(3), &context(dir.path()), &CancellationToken::new())
            .await;
        assert_eq!(result.status, AgentStatus::Error);
        assert!(result.error.unwrap().contains("elsewhere"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let provider = Arc::new(MockLlmProvider::new(&["{}"]));
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor(provider.clone())
            .execute(&role(3), &context(dir.path()), &cancel)
            .await;
        assert_eq!(result.status, AgentStatus::Error);
        assert!(provider.requests.lock().unwrap().is_empty());
    }
}
