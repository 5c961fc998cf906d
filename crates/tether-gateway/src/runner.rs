//! Turn runner — drives one prompt through a live agent process until it
//! produces exactly one outcome.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_types::config::ConfigError;
use tether_types::protocol::AgentEvent;
use tether_types::turn::CompletionReason;
use tether_types::usage::Usage;

use crate::process::{AgentProcess, ProcessError, ProcessEvent};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Everything a finished turn reports, minus the bookkeeping the session adds.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub text: String,
    pub usage: Usage,
    pub cost_usd: f64,
    pub completion: CompletionReason,
    pub agent_session_id: Option<String>,
    pub diagnostic: Option<String>,
}

#[derive(Default)]
struct Transcript {
    deltas: Vec<String>,
    diagnostic: Option<String>,
}

impl Transcript {
    /// Streamed text wins when it says more than the closing result.
    fn final_text(&self, result_text: &str) -> String {
        let streamed = self.deltas.join("\n\n");
        if streamed.len() > result_text.len() {
            streamed
        } else {
            result_text.to_string()
        }
    }

    fn finish(self, completion: CompletionReason, diagnostic: Option<String>) -> TurnOutcome {
        TurnOutcome {
            text: self.final_text(""),
            usage: Usage::default(),
            cost_usd: 0.0,
            completion,
            agent_session_id: None,
            diagnostic: diagnostic.or(self.diagnostic),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnRunner {
    interrupt_grace: Duration,
}

impl TurnRunner {
    pub fn new(interrupt_grace: Duration) -> Result<Self, ConfigError> {
        if interrupt_grace.is_zero() {
            return Err(ConfigError::ZeroGrace);
        }
        Ok(Self { interrupt_grace })
    }

    /// Send `prompt` and pump events until a result, exit, timeout or cancel.
    ///
    /// Text and tool notices reach `on_event` in emission order. When `cancel`
    /// fires the agent is interrupted and given the grace period to wind down
    /// before it is terminated. A timeout terminates immediately.
    pub async fn run(
        &self,
        process: &mut dyn AgentProcess,
        prompt: &str,
        on_event: &mut (dyn FnMut(&AgentEvent) + Send),
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<TurnOutcome, RunError> {
        if timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout.into());
        }

        let deadline = Instant::now() + timeout;
        let mut transcript = Transcript::default();

        // An agent that stops reading stdin must not hold the turn past its deadline.
        tokio::select! {
            biased;

            sent = process.send(prompt) => {
                if let Err(e) = sent {
                    warn!("Failed to write prompt to agent (pid: {:?}): {}", process.pid(), e);
                    process.terminate().await;
                    return Err(e.into());
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                warn!("Agent did not accept the prompt within {:?}, terminating (pid: {:?})", timeout, process.pid());
                process.terminate().await;
                return Ok(transcript.finish(CompletionReason::TimedOut, None));
            }

            _ = cancel.cancelled() => {
                info!("Stop requested while the prompt was being written, terminating agent (pid: {:?})", process.pid());
                process.terminate().await;
                return Ok(transcript.finish(CompletionReason::Interrupted, None));
            }
        }

        let mut grace_until: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Turn timed out after {:?}, terminating agent (pid: {:?})", timeout, process.pid());
                    process.terminate().await;
                    return Ok(transcript.finish(CompletionReason::TimedOut, None));
                }

                _ = cancel.cancelled(), if grace_until.is_none() => {
                    info!("Stop requested, interrupting agent (pid: {:?})", process.pid());
                    process.interrupt();
                    grace_until = Some(Instant::now() + self.interrupt_grace);
                }

                _ = tokio::time::sleep_until(grace_until.unwrap_or(deadline)), if grace_until.is_some() => {
                    warn!("Agent ignored interrupt for {:?}, terminating", self.interrupt_grace);
                    process.terminate().await;
                    return Ok(transcript.finish(CompletionReason::Interrupted, None));
                }

                event = process.next_event() => {
                    let interrupting = grace_until.is_some();
                    match event {
                        Ok(ProcessEvent::Agent(event)) => match event {
                            AgentEvent::TextDelta { ref text } => {
                                transcript.deltas.push(text.clone());
                                on_event(&event);
                            }
                            AgentEvent::ToolNotice { .. } => on_event(&event),
                            AgentEvent::StreamError { message } => {
                                warn!("Agent reported an error: {}", message);
                                transcript.diagnostic = Some(message);
                            }
                            AgentEvent::Result { .. } => {
                                return Ok(Self::conclude(transcript, event, interrupting));
                            }
                        },
                        Ok(ProcessEvent::Exited(exit)) => {
                            process.terminate().await;
                            let completion = if interrupting {
                                CompletionReason::Interrupted
                            } else {
                                warn!("Agent exited mid-turn: {}", exit);
                                CompletionReason::Errored
                            };
                            return Ok(transcript.finish(completion, Some(exit.to_string())));
                        }
                        Err(e) => {
                            warn!("Agent pipe failed mid-turn: {}", e);
                            process.terminate().await;
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    fn conclude(transcript: Transcript, result: AgentEvent, interrupting: bool) -> TurnOutcome {
        let budget_stop = result.is_budget_stop();
        let AgentEvent::Result {
            text,
            usage,
            cost_usd,
            is_error,
            subtype,
            agent_session_id,
        } = result
        else {
            return transcript.finish(CompletionReason::Errored, None);
        };

        let completion = if interrupting {
            CompletionReason::Interrupted
        } else if budget_stop {
            CompletionReason::BudgetExceeded
        } else if is_error {
            CompletionReason::Errored
        } else {
            CompletionReason::Completed
        };
        debug!("Turn result: {} (subtype: {}, cost: {})", completion, subtype, cost_usd);

        let diagnostic = match completion {
            CompletionReason::Errored => Some(if text.is_empty() {
                format!("agent result: {subtype}")
            } else {
                text.clone()
            }),
            _ => transcript.diagnostic.clone(),
        };
        let text = if is_error && completion != CompletionReason::Completed {
            transcript.final_text("")
        } else {
            transcript.final_text(&text)
        };

        TurnOutcome {
            text,
            usage,
            cost_usd,
            completion,
            agent_session_id,
            diagnostic,
        }
    }
}
