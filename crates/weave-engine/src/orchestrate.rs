use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use weave_core::errors::ProviderError;
use weave_core::events::RunEvent;
use weave_core::ids::{RunId, ThreadId, TurnId};
use weave_core::stream::{FinishReason, StreamChunk};
use weave_core::turns::{Invocation, Turn};
use weave_llm::{ChatProvider, ProviderRequest, StreamOptions};
use weave_store::{Database, TurnRepo};
use weave_telemetry::{AnomalyKind, AnomalyRecorder};

use crate::accumulate::{Completion, ToolCallAccumulator};
use crate::compress::{CompressorConfig, ContextCompressor};
use crate::error::EngineError;
use crate::filter::{CompatibilityFilter, FilterReport};
use crate::pack::{CacheBlockPacker, PackerConfig};
use crate::registry::ToolRegistry;
use crate::schedule::ToolScheduler;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Orchestrator lifecycle. Auto-continue re-enters `Idle` as an explicit
/// loop transition, never a recursive call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Streaming,
    Draining,
    Completed,
    Cancelled,
}

/// Configuration for a run.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Follow-up requests allowed after `length`/`tool_calls` finishes.
    pub max_auto_continues: u32,
    /// Token budget handed to the compressor.
    pub token_budget: usize,
    pub stream_options: StreamOptions,
    pub tool_timeout: Duration,
    pub compressor: CompressorConfig,
    pub packer: PackerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_auto_continues: 25,
            token_budget: 100_000,
            stream_options: StreamOptions::default(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            compressor: CompressorConfig::default(),
            packer: PackerConfig::default(),
        }
    }
}

/// What a run did, for the caller.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub run_id: RunId,
    pub state: RunState,
    pub steps: u32,
    pub appended_turns: Vec<TurnId>,
    pub dropped_turns: usize,
    pub finish_reason: Option<FinishReason>,
}

/// Drives one model stream into consistent, persisted conversation state:
/// pipeline assembly, chunk accumulation, concurrent tool execution, and
/// ordered appends back to the log.
pub struct StreamOrchestrator {
    provider: Arc<dyn ChatProvider>,
    registry: Arc<ToolRegistry>,
    turn_repo: Arc<TurnRepo>,
    compressor: ContextCompressor,
    packer: CacheBlockPacker,
    event_tx: broadcast::Sender<RunEvent>,
    anomalies: Option<Arc<AnomalyRecorder>>,
    config: OrchestratorConfig,
}

impl StreamOrchestrator {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        registry: Arc<ToolRegistry>,
        db: Database,
        event_tx: broadcast::Sender<RunEvent>,
    ) -> Self {
        Self::with_config(provider, registry, db, event_tx, OrchestratorConfig::default())
    }

    pub fn with_config(
        provider: Arc<dyn ChatProvider>,
        registry: Arc<ToolRegistry>,
        db: Database,
        event_tx: broadcast::Sender<RunEvent>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            turn_repo: Arc::new(TurnRepo::new(db)),
            compressor: ContextCompressor::new(config.compressor.clone()),
            packer: CacheBlockPacker::new(config.packer.clone()),
            event_tx,
            anomalies: None,
            config,
        }
    }

    pub fn with_anomaly_recorder(mut self, recorder: Arc<AnomalyRecorder>) -> Self {
        self.anomalies = Some(recorder);
        self
    }

    fn transition(state: &mut RunState, next: RunState) {
        debug!(from = ?state, to = ?next, "run state transition");
        *state = next;
    }

    fn send_event(&self, event: RunEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("no event receivers — event dropped");
        }
    }

    fn record_report(&self, thread_id: &ThreadId, report: &FilterReport, stage: &str) {
        let Some(recorder) = &self.anomalies else {
            return;
        };
        for drop in &report.dropped {
            recorder.record(
                thread_id,
                AnomalyKind::TurnDropped,
                Some(&drop.turn_id),
                drop.invocation_id.as_ref(),
                &format!("{stage}: {:?}", drop.reason),
            );
        }
        for turn_id in &report.flagged {
            recorder.record(
                thread_id,
                AnomalyKind::TurnFlagged,
                Some(turn_id),
                None,
                &format!("{stage}: tool-shaped user turn without metadata"),
            );
        }
        if report.degraded {
            recorder.record(
                thread_id,
                AnomalyKind::FilterDegraded,
                None,
                None,
                &format!("{stage}: unfiltered sequence sent"),
            );
        }
    }

    /// Append outcomes that resolve after cancellation from a detached
    /// task. The run has already returned; the shared repo serializes
    /// these appends with any newer run on the same thread.
    fn spawn_late_drain(&self, mut scheduler: ToolScheduler, thread_id: ThreadId, run_id: RunId) {
        let repo = Arc::clone(&self.turn_repo);
        let recorder = self.anomalies.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let late = scheduler.drain().await;
            for item in late {
                let _ = event_tx.send(RunEvent::ToolCompleted {
                    run_id: run_id.clone(),
                    invocation_id: item.outcome.invocation_id.clone(),
                    success: item.outcome.success,
                    duration_ms: item.duration_ms,
                });
                let tool_turn = Turn::tool_outcome(&item.outcome);
                match repo.append_tool_turn(&thread_id, tool_turn) {
                    Ok((stored, resolved)) => {
                        if !resolved {
                            if let Some(rec) = &recorder {
                                rec.record(
                                    &thread_id,
                                    AnomalyKind::UnlinkedToolTurn,
                                    Some(&stored.id),
                                    stored.invocation_id.as_ref(),
                                    "late outcome with no owning assistant turn",
                                );
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to append late tool outcome"),
                }
            }
        });
    }

    /// Assemble the outgoing sequence for one step: pre-filter →
    /// compress → pack → post-filter.
    fn assemble(&self, thread_id: &ThreadId, dropped: &mut usize) -> Result<Vec<Turn>, EngineError> {
        let turns = self.turn_repo.list(thread_id)?;

        let pre = CompatibilityFilter::filter(&turns);
        self.record_report(thread_id, &pre, "pre-compression");
        *dropped += pre.dropped.len();

        let compressed = self.compressor.compress(&pre.turns, self.config.token_budget);
        let packed = self.packer.pack(&compressed);

        let post = CompatibilityFilter::filter(&packed);
        self.record_report(thread_id, &post, "post-packing");
        *dropped += post.dropped.len();

        Ok(post.turns)
    }

    /// Execute a run against the thread: stream, accumulate, schedule,
    /// persist, and auto-continue while the finish reason warrants it.
    #[instrument(skip(self, system, cancel), fields(thread_id = %thread_id))]
    pub async fn run(
        &self,
        thread_id: &ThreadId,
        system: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        let run_id = RunId::new();
        self.send_event(RunEvent::RunStart {
            thread_id: thread_id.clone(),
            run_id: run_id.clone(),
        });

        let mut state = RunState::Idle;
        let mut steps = 0u32;
        let mut continues = 0u32;
        let mut appended_turns: Vec<TurnId> = Vec::new();
        let mut dropped_turns = 0usize;
        let mut finish_reason: Option<FinishReason> = None;

        loop {
            if cancel.is_cancelled() {
                Self::transition(&mut state, RunState::Cancelled);
                break;
            }
            steps += 1;

            let outgoing = self.assemble(thread_id, &mut dropped_turns)?;
            let request = ProviderRequest {
                system: system.clone(),
                turns: outgoing,
                tools: self.registry.definitions(),
            };

            // A provider rejection here is a hard failure of this step;
            // retrying blind would resend the same structural issue.
            let mut stream = self
                .provider
                .stream(&request, &self.config.stream_options)
                .await?;

            Self::transition(&mut state, RunState::Streaming);
            let mut text = String::new();
            let mut accumulator = ToolCallAccumulator::new();
            let mut scheduler = ToolScheduler::new(
                Arc::clone(&self.registry),
                thread_id.clone(),
                run_id.clone(),
                cancel.clone(),
            )
            .with_timeout(self.config.tool_timeout);
            let mut submitted: Vec<Invocation> = Vec::new();
            let mut step_finish: Option<FinishReason> = None;
            let mut stream_error: Option<ProviderError> = None;

            while let Some(item) = stream.next().await {
                // Cancellation is cooperative, checked at chunk boundaries.
                if cancel.is_cancelled() {
                    Self::transition(&mut state, RunState::Cancelled);
                    break;
                }

                match item {
                    Ok(StreamChunk::Delta(delta)) => {
                        if let Some(fragment) = delta.text {
                            text.push_str(&fragment);
                            self.send_event(RunEvent::ContentChunk {
                                run_id: run_id.clone(),
                                delta: fragment,
                            });
                        }
                        for fragment in &delta.tool_calls {
                            self.send_event(RunEvent::ToolCallChunk {
                                run_id: run_id.clone(),
                                index: fragment.index,
                                arguments_delta: fragment.arguments.clone(),
                            });
                            if let Completion::Complete(invocation) =
                                accumulator.observe(fragment)
                            {
                                // Execute immediately; generation keeps
                                // streaming while the tool runs.
                                self.send_event(RunEvent::ToolStarted {
                                    run_id: run_id.clone(),
                                    invocation_id: invocation.id.clone(),
                                    tool_name: invocation.tool_name.clone(),
                                });
                                submitted.push(invocation.clone());
                                scheduler.submit(invocation);
                            }
                        }
                    }
                    Ok(StreamChunk::Finish { reason }) => {
                        step_finish = Some(reason);
                    }
                    Err(e) => {
                        stream_error = Some(e);
                        break;
                    }
                }
            }

            if !accumulator.unfinished().is_empty() {
                warn!(
                    indices = ?accumulator.unfinished(),
                    "stream ended with incomplete tool calls; they will not execute"
                );
            }

            // Drain: wait for pending executions, or collect only the
            // already-resolved ones after cancellation.
            let cancelled = state == RunState::Cancelled || cancel.is_cancelled();
            if !cancelled {
                Self::transition(&mut state, RunState::Draining);
            }
            let completed = if cancelled {
                scheduler.drain_completed()
            } else {
                scheduler.drain().await
            };

            // An empty or cancelled step appends no phantom assistant
            // turn; the absence of the turn is meaningful downstream.
            if !text.is_empty() || !submitted.is_empty() {
                let assistant = Turn::assistant(text.clone(), submitted.clone());
                self.turn_repo.append(thread_id, &assistant)?;
                appended_turns.push(assistant.id.clone());
            } else {
                debug!("step produced no content; assistant turn skipped");
            }

            // Tool turns append in drain order; linkage is by invocation
            // id, so the order is stable.
            let tools_executed = !completed.is_empty();
            for item in completed {
                self.send_event(RunEvent::ToolCompleted {
                    run_id: run_id.clone(),
                    invocation_id: item.outcome.invocation_id.clone(),
                    success: item.outcome.success,
                    duration_ms: item.duration_ms,
                });
                let tool_turn = Turn::tool_outcome(&item.outcome);
                let (stored, resolved) = self.turn_repo.append_tool_turn(thread_id, tool_turn)?;
                if !resolved {
                    if let Some(recorder) = &self.anomalies {
                        recorder.record(
                            thread_id,
                            AnomalyKind::UnlinkedToolTurn,
                            Some(&stored.id),
                            stored.invocation_id.as_ref(),
                            "no owning assistant turn at append time",
                        );
                    }
                }
                appended_turns.push(stored.id);
            }

            // Tasks still in flight at cancellation are not killed;
            // their outcomes append when they arrive, so a completed
            // tool result is never silently lost.
            if cancelled && scheduler.in_flight() > 0 {
                self.spawn_late_drain(scheduler, thread_id.clone(), run_id.clone());
            }

            if let Some(e) = stream_error {
                self.send_event(RunEvent::RunEnd {
                    run_id: run_id.clone(),
                    finish_reason: None,
                    steps,
                });
                return Err(e.into());
            }

            if cancelled {
                Self::transition(&mut state, RunState::Cancelled);
                break;
            }

            finish_reason = step_finish;
            let auto_continue = match step_finish {
                Some(FinishReason::Length) => true,
                Some(FinishReason::ToolCalls) => tools_executed,
                _ => false,
            };

            if auto_continue && continues < self.config.max_auto_continues {
                continues += 1;
                Self::transition(&mut state, RunState::Idle);
                continue;
            }
            if auto_continue {
                warn!(
                    max = self.config.max_auto_continues,
                    "auto-continue limit reached"
                );
            }
            Self::transition(&mut state, RunState::Completed);
            break;
        }

        self.send_event(RunEvent::RunEnd {
            run_id: run_id.clone(),
            finish_reason,
            steps,
        });

        Ok(RunSummary {
            run_id,
            state,
            steps,
            appended_turns,
            dropped_turns,
            finish_reason,
        })
    }
}
