//! Scripted stand-ins for the agent process, shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tether_types::protocol::AgentEvent;

use crate::codec;
use crate::process::{
    AgentProcess, ExitInfo, LaunchSpec, ProcessError, ProcessEvent, ProcessLauncher,
};

#[derive(Debug, Clone)]
pub enum Step {
    /// One raw stdout line, decoded through the real codec.
    Line(String),
    Delay(Duration),
    Exit(Option<i32>),
}

/// How the fake reacts to SIGINT.
#[derive(Debug, Clone, Copy)]
pub enum OnInterrupt {
    /// Emit an error result after the delay.
    Ack(Duration),
    /// Exit after the delay.
    Exit(Duration),
    Ignore,
}

/// How the fake's stdin behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnSend {
    Accept,
    /// Accept this many prompts, then fail every write with a broken pipe
    /// while the process itself stays up.
    BreakAfter(usize),
    /// Never finish the write, like an agent that stopped reading stdin.
    Block,
}

/// What one launched process does: a script per turn, then `fallback`.
#[derive(Debug, Clone)]
pub struct FakeScript {
    pub turns: VecDeque<Vec<Step>>,
    pub fallback: Fallback,
    pub on_interrupt: OnInterrupt,
    pub on_send: OnSend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Reply `echo: <prompt>` after a short delay.
    Echo(Duration),
    /// Never answer.
    Hang,
}

impl FakeScript {
    pub fn echo() -> Self {
        Self::echo_after(Duration::from_millis(5))
    }

    pub fn echo_after(delay: Duration) -> Self {
        Self {
            turns: VecDeque::new(),
            fallback: Fallback::Echo(delay),
            on_interrupt: OnInterrupt::Ack(Duration::from_millis(5)),
            on_send: OnSend::Accept,
        }
    }

    pub fn hang() -> Self {
        Self {
            turns: VecDeque::new(),
            fallback: Fallback::Hang,
            on_interrupt: OnInterrupt::Ack(Duration::from_millis(5)),
            on_send: OnSend::Accept,
        }
    }

    pub fn turns(turns: Vec<Vec<Step>>) -> Self {
        Self {
            turns: turns.into(),
            fallback: Fallback::Hang,
            on_interrupt: OnInterrupt::Ack(Duration::from_millis(5)),
            on_send: OnSend::Accept,
        }
    }

    pub fn on_interrupt(mut self, on_interrupt: OnInterrupt) -> Self {
        self.on_interrupt = on_interrupt;
        self
    }

    pub fn on_send(mut self, on_send: OnSend) -> Self {
        self.on_send = on_send;
        self
    }
}

pub fn text_line(text: &str) -> Step {
    Step::Line(
        serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": text}]}
        })
        .to_string(),
    )
}

pub fn tool_line(name: &str, command: &str) -> Step {
    Step::Line(
        serde_json::json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "id": "tool-1", "name": name, "input": {"command": command}}
            ]}
        })
        .to_string(),
    )
}

pub fn result_line(text: &str, cost_usd: f64) -> Step {
    Step::Line(
        serde_json::json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "result": text,
            "session_id": "fake-session",
            "total_cost_usd": cost_usd,
            "usage": {"input_tokens": 10, "output_tokens": 5}
        })
        .to_string(),
    )
}

pub fn budget_result_line(cost_usd: f64) -> Step {
    Step::Line(
        serde_json::json!({
            "type": "result",
            "subtype": "error_max_budget_usd",
            "is_error": true,
            "session_id": "fake-session",
            "total_cost_usd": cost_usd
        })
        .to_string(),
    )
}

fn interrupted_result_line() -> Step {
    Step::Line(
        serde_json::json!({
            "type": "result",
            "subtype": "error_during_execution",
            "is_error": true,
            "session_id": "fake-session"
        })
        .to_string(),
    )
}

/// Counters shared by every process one launcher starts.
#[derive(Debug, Default)]
pub struct FakeStats {
    pub launches: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub terminations: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub sends: AtomicUsize,
    pub active_turns: AtomicUsize,
    pub max_active_turns: AtomicUsize,
}

impl FakeStats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn raise(current: &AtomicUsize, max: &AtomicUsize) {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
    }
}

pub struct FakeProcess {
    script: FakeScript,
    current: VecDeque<Step>,
    pending: VecDeque<ProcessEvent>,
    in_turn: bool,
    interrupted: bool,
    accepted: usize,
    exit: Option<ExitInfo>,
    stats: Arc<FakeStats>,
    pid: u32,
}

impl FakeProcess {
    fn new(script: FakeScript, stats: Arc<FakeStats>, pid: u32) -> Self {
        FakeStats::raise(&stats.live, &stats.max_live);
        Self {
            script,
            current: VecDeque::new(),
            pending: VecDeque::new(),
            in_turn: false,
            interrupted: false,
            accepted: 0,
            exit: None,
            stats,
            pid,
        }
    }

    fn end_turn(&mut self) {
        if self.in_turn {
            self.in_turn = false;
            self.stats.active_turns.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn mark_dead(&mut self, code: Option<i32>) -> ExitInfo {
        if self.exit.is_none() {
            self.end_turn();
            self.stats.live.fetch_sub(1, Ordering::SeqCst);
            self.exit = Some(ExitInfo {
                code,
                stderr_tail: vec![format!("fake agent exited with {code:?}")],
            });
        }
        self.exit.clone().unwrap_or_default()
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.mark_dead(None);
    }
}

#[async_trait]
impl AgentProcess for FakeProcess {
    async fn send(&mut self, prompt: &str) -> Result<(), ProcessError> {
        if self.exit.is_some() {
            return Err(ProcessError::Write(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "fake agent has exited",
            )));
        }
        match self.script.on_send {
            OnSend::Accept => {}
            OnSend::BreakAfter(n) if self.accepted < n => {}
            OnSend::BreakAfter(_) => {
                return Err(ProcessError::Write(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "fake agent closed its stdin",
                )))
            }
            OnSend::Block => std::future::pending::<()>().await,
        }
        self.accepted += 1;
        self.stats.sends.fetch_add(1, Ordering::SeqCst);
        FakeStats::raise(&self.stats.active_turns, &self.stats.max_active_turns);
        self.in_turn = true;
        self.interrupted = false;
        self.current = match self.script.turns.pop_front() {
            Some(steps) => steps.into(),
            None => match self.script.fallback {
                Fallback::Echo(delay) => vec![
                    Step::Delay(delay),
                    text_line(&format!("echo: {prompt}")),
                    result_line(&format!("echo: {prompt}"), 0.01),
                ]
                .into(),
                Fallback::Hang => VecDeque::new(),
            },
        };
        Ok(())
    }

    async fn next_event(&mut self) -> Result<ProcessEvent, ProcessError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if matches!(event, ProcessEvent::Agent(AgentEvent::Result { .. })) {
                    self.end_turn();
                }
                return Ok(event);
            }
            if let Some(exit) = &self.exit {
                return Ok(ProcessEvent::Exited(exit.clone()));
            }
            let Some(step) = self.current.front().cloned() else {
                std::future::pending::<()>().await;
                continue;
            };
            match step {
                Step::Delay(d) => {
                    tokio::time::sleep(d).await;
                    self.current.pop_front();
                }
                Step::Line(line) => {
                    self.current.pop_front();
                    match codec::decode_line(&line) {
                        Ok(events) => self
                            .pending
                            .extend(events.into_iter().map(ProcessEvent::Agent)),
                        Err(e) => tracing::warn!("Dropping agent output line: {}", e),
                    }
                }
                Step::Exit(code) => {
                    self.current.clear();
                    let exit = self.mark_dead(code);
                    return Ok(ProcessEvent::Exited(exit));
                }
            }
        }
    }

    fn interrupt(&mut self) {
        if self.interrupted || self.exit.is_some() {
            return;
        }
        self.interrupted = true;
        self.stats.interrupts.fetch_add(1, Ordering::SeqCst);
        self.current = match self.script.on_interrupt {
            OnInterrupt::Ack(delay) => vec![Step::Delay(delay), interrupted_result_line()].into(),
            OnInterrupt::Exit(delay) => vec![Step::Delay(delay), Step::Exit(Some(130))].into(),
            OnInterrupt::Ignore => return,
        };
    }

    async fn terminate(&mut self) {
        if self.exit.is_some() {
            return;
        }
        self.stats.terminations.fetch_add(1, Ordering::SeqCst);
        self.mark_dead(None);
    }

    fn is_alive(&mut self) -> bool {
        self.exit.is_none()
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}

/// Hands out fake processes, one script per launch, then `default`.
pub struct FakeLauncher {
    pub stats: Arc<FakeStats>,
    scripts: Mutex<VecDeque<FakeScript>>,
    default: FakeScript,
    failures: AtomicUsize,
    specs: Mutex<Vec<LaunchSpec>>,
}

impl FakeLauncher {
    pub fn new(default: FakeScript) -> Self {
        Self {
            stats: Arc::new(FakeStats::default()),
            scripts: Mutex::new(VecDeque::new()),
            default,
            failures: AtomicUsize::new(0),
            specs: Mutex::new(Vec::new()),
        }
    }

    pub fn echo() -> Self {
        Self::new(FakeScript::echo())
    }

    pub fn with_scripts(self, scripts: Vec<FakeScript>) -> Self {
        self.scripts.lock().unwrap().extend(scripts);
        self
    }

    /// Make the next `n` launches fail as if the executable were missing.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn launched_specs(&self) -> Vec<LaunchSpec> {
        self.specs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn AgentProcess>, ProcessError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProcessError::ExecutableNotFound("fake-claude".into()));
        }
        self.specs.lock().unwrap().push(spec.clone());
        let n = self.stats.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        Ok(Box::new(FakeProcess::new(
            script,
            Arc::clone(&self.stats),
            1000 + n as u32,
        )))
    }
}
