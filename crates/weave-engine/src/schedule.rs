use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use weave_core::ids::{RunId, ThreadId};
use weave_core::tools::ToolContext;
use weave_core::turns::{Invocation, ToolOutcome};

use crate::registry::ToolRegistry;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// One resolved execution.
#[derive(Clone, Debug)]
pub struct CompletedTool {
    pub invocation: Invocation,
    pub outcome: ToolOutcome,
    pub duration_ms: u64,
}

/// Runs completed invocations as independent concurrent tasks.
///
/// Each submitted task is supervised: a thrown error, panic, or timeout
/// inside one execution becomes a failed outcome and never aborts
/// siblings. Outcomes arrive in completion order; each carries its
/// invocation id, so attachment to the owning assistant turn never
/// depends on that order.
pub struct ToolScheduler {
    registry: Arc<ToolRegistry>,
    thread_id: ThreadId,
    run_id: RunId,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<CompletedTool>,
    rx: mpsc::UnboundedReceiver<CompletedTool>,
    in_flight: usize,
    timeout: Duration,
}

impl ToolScheduler {
    pub fn new(
        registry: Arc<ToolRegistry>,
        thread_id: ThreadId,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            registry,
            thread_id,
            run_id,
            cancel,
            tx,
            rx,
            in_flight: 0,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Spawn execution of a completed invocation immediately — tools run
    /// concurrently with continued token generation.
    pub fn submit(&mut self, invocation: Invocation) {
        self.in_flight += 1;

        let Some(tool) = self.registry.get(&invocation.tool_name) else {
            warn!(tool = %invocation.tool_name, "unknown tool requested");
            let outcome = ToolOutcome::failed(
                invocation.id.clone(),
                format!("unknown tool: {}", invocation.tool_name),
            );
            let _ = self.tx.send(CompletedTool {
                invocation,
                outcome,
                duration_ms: 0,
            });
            return;
        };

        let ctx = ToolContext {
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            cancel: self.cancel.clone(),
        };
        let tx = self.tx.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            let start = Instant::now();
            let result = tokio::time::timeout(
                timeout,
                std::panic::AssertUnwindSafe(tool.execute(invocation.arguments.clone(), &ctx))
                    .catch_unwind(),
            )
            .await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let outcome = match result {
                Ok(Ok(Ok(r))) => {
                    if r.is_error {
                        ToolOutcome {
                            invocation_id: invocation.id.clone(),
                            success: false,
                            output: r.content.clone(),
                            error: Some(content_as_string(&r.content)),
                        }
                    } else {
                        ToolOutcome::ok(invocation.id.clone(), r.content)
                    }
                }
                Ok(Ok(Err(e))) => ToolOutcome::failed(invocation.id.clone(), e.to_string()),
                Ok(Err(panic)) => {
                    error!(
                        tool = %invocation.tool_name,
                        panic = %panic_message(&panic),
                        "tool panicked during execution"
                    );
                    ToolOutcome::failed(invocation.id.clone(), "internal error: tool crashed")
                }
                Err(_) => {
                    warn!(
                        tool = %invocation.tool_name,
                        timeout_secs = timeout.as_secs(),
                        "tool timed out"
                    );
                    ToolOutcome::failed(
                        invocation.id.clone(),
                        format!("tool timed out after {}s", timeout.as_secs()),
                    )
                }
            };

            if tx
                .send(CompletedTool {
                    invocation,
                    outcome,
                    duration_ms,
                })
                .is_err()
            {
                warn!("scheduler dropped before outcome delivery");
            }
        });
    }

    /// Wait for every submitted execution to resolve.
    pub async fn drain(&mut self) -> Vec<CompletedTool> {
        let mut completed = Vec::with_capacity(self.in_flight);
        while self.in_flight > 0 {
            match self.rx.recv().await {
                Some(item) => {
                    self.in_flight -= 1;
                    completed.push(item);
                }
                None => break,
            }
        }
        completed
    }

    /// Collect only the executions that have already resolved. The
    /// cancellation path: in-flight tasks are not killed, but their late
    /// outcomes are no longer awaited.
    pub fn drain_completed(&mut self) -> Vec<CompletedTool> {
        let mut completed = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            self.in_flight -= 1;
            completed.push(item);
        }
        completed
    }
}

fn content_as_string(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
