//! Routes inbound chat messages: slash commands go to the gateway's admin
//! operations, everything else becomes a turn streamed into a live reply.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tether_types::config::BusyPolicy;
use tether_types::model::Model;
use tether_types::protocol::AgentEvent;
use tether_types::session::{ConversationId, SessionState};
use tether_types::usage::format_usd;

use super::commands::{self, Command, WorkspaceArg, HELP_TEXT};
use super::live::{render_final, split_message, LiveMessage, MAX_MESSAGE_CHARS};
use super::telegram::{spawn_typing_loop, InboundMessage};
use super::ChatApi;
use crate::session::SessionError;
use crate::Gateway;

/// A prompt waiting in a conversation's queue.
struct QueuedPrompt {
    text: String,
    done: oneshot::Sender<()>,
}

pub struct Dispatcher {
    gateway: Arc<Gateway>,
    api: Arc<dyn ChatApi>,
    edit_interval: Duration,
    busy_policy: BusyPolicy,
    queues: Mutex<HashMap<i64, mpsc::UnboundedSender<QueuedPrompt>>>,
}

impl Dispatcher {
    pub fn new(gateway: Arc<Gateway>, api: Arc<dyn ChatApi>) -> Self {
        let edit_interval = gateway.config().gateway.edit_interval();
        let busy_policy = gateway.config().gateway.busy_policy;
        Self {
            gateway,
            api,
            edit_interval,
            busy_policy,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a message without blocking the poll loop. Commands run on their
    /// own task so `/stop` is never stuck behind the turn it is meant to stop.
    /// Under [`BusyPolicy::Queue`] prompts go through a per-conversation queue
    /// drained by a single worker, so they run in arrival order.
    ///
    /// The returned handle completes once the message has been answered.
    pub fn spawn(self: &Arc<Self>, msg: InboundMessage) -> JoinHandle<()> {
        if self.busy_policy == BusyPolicy::Reject || commands::parse(&msg.text).is_some() {
            let this = Arc::clone(self);
            return tokio::spawn(async move { this.handle(msg.chat_id, &msg.text).await });
        }

        let (done, answered) = oneshot::channel();
        self.enqueue(msg.chat_id, QueuedPrompt { text: msg.text, done });
        tokio::spawn(async move {
            let _ = answered.await;
        })
    }

    fn enqueue(self: &Arc<Self>, chat_id: i64, prompt: QueuedPrompt) {
        let mut queues = self.queues.lock().unwrap();
        let prompt = match queues.get(&chat_id) {
            Some(tx) => match tx.send(prompt) {
                Ok(()) => return,
                Err(mpsc::error::SendError(prompt)) => prompt,
            },
            None => prompt,
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedPrompt>();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(prompt) = rx.recv().await {
                this.run_prompt(chat_id, &prompt.text).await;
                let _ = prompt.done.send(());
            }
        });
        // The worker was just created, so its receiver is open.
        let _ = tx.send(prompt);
        queues.insert(chat_id, tx);
    }

    pub async fn handle(&self, chat_id: i64, text: &str) {
        match commands::parse(text) {
            Some(command) => self.run_command(chat_id, command).await,
            None => self.run_prompt(chat_id, text).await,
        }
    }

    async fn run_command(&self, chat_id: i64, command: Command) {
        let id = ConversationId(chat_id);
        info!("Command from {}: {:?}", id, command);
        let reply = match command {
            Command::Stop => {
                if self.gateway.interrupt(id) {
                    "Stopping...".to_string()
                } else {
                    "Nothing to stop.".to_string()
                }
            }
            Command::New => match self.gateway.reset(id).await {
                Ok(()) => "Session cleared. Starting fresh.".to_string(),
                Err(e) => e.user_message(),
            },
            Command::Model(None) => match self.gateway.status(id) {
                Ok(status) => format!("Model: {}", status.model),
                Err(e) => e.user_message(),
            },
            Command::Model(Some(name)) => match name.parse::<Model>() {
                Ok(model) => match self.gateway.switch_model(id, model).await {
                    Ok(()) => format!("Model set to {model}. Session restarted."),
                    Err(e) => e.user_message(),
                },
                Err(_) => "Choose: opus, sonnet, or haiku".to_string(),
            },
            Command::Workspace(arg) => self.workspace_command(id, arg).await,
            Command::Workspaces => self.list_workspaces(id),
            Command::Stats => match self.gateway.status(id) {
                Ok(status) => {
                    let session = status
                        .agent_session_id
                        .as_deref()
                        .map(|s| s.chars().take(8).collect::<String>() + "...")
                        .unwrap_or_else(|| "none".to_string());
                    let last_used = status
                        .last_activity_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                        .unwrap_or_else(|| "never".to_string());
                    let mut lines = vec![
                        format!("Session: {session}"),
                        format!("Model: {}", status.model),
                        format!("Workspace: {}", self.gateway.workspace_label(&status.workspace)),
                        format!("Turns: {}", status.turn_count),
                        format!("Last used: {last_used}"),
                        format!(
                            "Total cost: {} of {}",
                            format_usd(status.cumulative_spend_usd),
                            format_usd(status.spend_cap_usd)
                        ),
                        format!("Process alive: {}", status.process_alive),
                    ];
                    if status.state != SessionState::Idle {
                        lines.push("Working on a response.".to_string());
                    }
                    if status.over_cap() {
                        lines.push("Spending cap reached. Use /new to start over.".to_string());
                    }
                    lines.join("\n")
                }
                Err(e) => e.user_message(),
            },
            Command::Help => HELP_TEXT.to_string(),
            Command::Unknown(name) => {
                format!("Unknown command: {name}\nTry /help for available commands.")
            }
        };
        self.reply(chat_id, &reply).await;
    }

    async fn workspace_command(&self, id: ConversationId, arg: WorkspaceArg) -> String {
        match arg {
            WorkspaceArg::Show => match self.gateway.status(id) {
                Ok(status) => format!(
                    "Workspace: {}\n{}",
                    self.gateway.workspace_label(&status.workspace),
                    status.workspace.display()
                ),
                Err(e) => e.user_message(),
            },
            WorkspaceArg::New(None) => "Usage: /workspace new <name>".to_string(),
            WorkspaceArg::New(Some(name)) => match self.gateway.create_workspace(id, &name).await {
                Ok(path) => format!("Created and switched to: {}\nSession cleared.", path.display()),
                Err(e) => e.user_message(),
            },
            WorkspaceArg::Home => match self.gateway.switch_workspace(id, "home").await {
                Ok(_) => "Switched to home workspace. Session cleared.".to_string(),
                Err(e) => e.user_message(),
            },
            WorkspaceArg::Switch(target) => {
                match self.gateway.switch_workspace(id, &target).await {
                    Ok(path) => format!(
                        "Workspace: {}\n{}\nSession cleared.",
                        self.gateway.workspace_label(&path),
                        path.display()
                    ),
                    Err(e) => e.user_message(),
                }
            }
        }
    }

    fn list_workspaces(&self, id: ConversationId) -> String {
        let (current, recent) = match (self.gateway.status(id), self.gateway.recent_workspaces(id)) {
            (Ok(status), Ok(recent)) => (status.workspace, recent),
            (Err(e), _) | (_, Err(e)) => return e.user_message(),
        };
        let home = self.gateway.config().workspace.home.clone();
        if recent.is_empty() && current == home {
            return "No workspace history yet.\nUse /workspace new <name> to create one.".to_string();
        }
        let mark = |path: &Path| if *path == current { " (current)" } else { "" };
        let mut lines = vec!["Workspaces:".to_string(), format!("- Home{}", mark(home.as_path()))];
        lines.extend(
            recent
                .iter()
                .map(|path| format!("- {}{}", self.gateway.workspace_label(path), mark(path.as_path()))),
        );
        lines.push("Switch with /workspace <name>".to_string());
        lines.join("\n")
    }

    async fn run_prompt(&self, chat_id: i64, prompt: &str) {
        let id = ConversationId(chat_id);
        let typing = spawn_typing_loop(Arc::clone(&self.api), chat_id);

        let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();
        let mut live = LiveMessage::new(Arc::clone(&self.api), chat_id, self.edit_interval);
        let streamer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                live.push(&event).await;
            }
            live
        });

        let result = self
            .gateway
            .invoke(id, prompt, &mut |event| {
                let _ = tx.send(event.clone());
            })
            .await;
        drop(tx);
        let live = match streamer.await {
            Ok(live) => Some(live),
            Err(e) => {
                warn!("Live reply task for {} failed: {}", id, e);
                None
            }
        };
        drop(typing);

        let text = match &result {
            Ok(result) => render_final(result),
            Err(e) => {
                if !matches!(e, SessionError::Busy) {
                    warn!("Turn for {} failed: {}", id, e);
                }
                e.user_message()
            }
        };
        match (live, result.is_ok()) {
            (Some(live), true) => live.finish(&text).await,
            _ => self.reply(chat_id, &text).await,
        }
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            if let Err(e) = self.api.send_text(chat_id, &chunk).await {
                warn!("Failed to reply to {}: {:#}", chat_id, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::live::tests::{RecordingApi, Sent};
    use crate::db::Database;
    use crate::testing::*;
    use tether_types::config::TetherConfig;

    struct Harness {
        _dir: tempfile::TempDir,
        api: Arc<RecordingApi>,
        gateway: Arc<Gateway>,
        dispatcher: Arc<Dispatcher>,
    }

    fn harness(launcher: FakeLauncher) -> Harness {
        harness_with(launcher, BusyPolicy::Reject)
    }

    fn harness_with(launcher: FakeLauncher, busy_policy: BusyPolicy) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TetherConfig::default();
        config.gateway.busy_policy = busy_policy;
        config.workspace.home = dir.path().join("home");
        config.workspace.base = Some(dir.path().to_path_buf());
        config.agent.interrupt_grace_ms = 100;
        config.gateway.edit_interval_ms = 1;
        std::fs::create_dir_all(&config.workspace.home).unwrap();

        let db = Arc::new(Database::open_in_memory().unwrap());
        let gateway =
            Arc::new(Gateway::with_launcher(config, db, Arc::new(launcher)).unwrap());
        let api = Arc::new(RecordingApi::default());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&gateway), api.clone()));
        Harness {
            _dir: dir,
            api,
            gateway,
            dispatcher,
        }
    }

    async fn wait_for_running(gateway: &Gateway, id: ConversationId) {
        for _ in 0..200 {
            if gateway.status(id).unwrap().state == SessionState::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("turn never started");
    }

    #[tokio::test]
    async fn prompt_streams_into_a_single_reply() {
        let h = harness(FakeLauncher::echo());
        h.dispatcher.handle(10, "hi").await;
        assert_eq!(h.api.texts(), vec!["echo: hi"]);
    }

    #[tokio::test]
    async fn tool_notices_show_up_in_the_live_view() {
        let h = harness(FakeLauncher::new(FakeScript::echo()).with_scripts(vec![
            FakeScript::turns(vec![vec![
                tool_line("Bash", "ls"),
                text_line("Two files."),
                result_line("Two files.", 0.01),
            ]]),
        ]));
        h.dispatcher.handle(10, "what's here?").await;
        let sent = h.api.sent();
        let texts = h.api.texts();
        assert_eq!(texts.first().map(String::as_str), Some("[Bash] ls"));
        // The final answer replaces the live view in place.
        assert_eq!(sent.last(), Some(&Sent::Edit(1, "Two files.".into())));
    }

    #[tokio::test]
    async fn stop_interrupts_a_running_prompt() {
        let h = harness(FakeLauncher::new(FakeScript::hang()));
        let id = ConversationId(10);
        let turn = h.dispatcher.spawn(InboundMessage {
            chat_id: 10,
            user_id: 1,
            text: "long job".into(),
            message_id: 1,
        });
        wait_for_running(&h.gateway, id).await;

        h.dispatcher.handle(10, "/stop").await;
        turn.await.unwrap();
        assert_eq!(h.api.texts(), vec!["Stopping...", "(stopped)"]);

        h.dispatcher.handle(10, "/stop").await;
        assert_eq!(h.api.texts().last().map(String::as_str), Some("Nothing to stop."));
    }

    #[tokio::test]
    async fn second_prompt_while_busy_is_refused() {
        let h = harness(FakeLauncher::new(FakeScript::hang()));
        let id = ConversationId(10);
        let turn = h.dispatcher.spawn(InboundMessage {
            chat_id: 10,
            user_id: 1,
            text: "first".into(),
            message_id: 1,
        });
        wait_for_running(&h.gateway, id).await;

        h.dispatcher.handle(10, "second").await;
        assert_eq!(h.api.texts(), vec![SessionError::Busy.user_message()]);

        h.gateway.interrupt(id);
        turn.await.unwrap();
    }

    fn inbound(text: &str) -> InboundMessage {
        InboundMessage {
            chat_id: 10,
            user_id: 1,
            text: text.into(),
            message_id: 1,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queued_prompts_run_in_arrival_order() {
        let h = harness_with(
            FakeLauncher::new(FakeScript::echo_after(Duration::from_millis(20))),
            BusyPolicy::Queue,
        );
        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|text| h.dispatcher.spawn(inbound(text)))
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(h.api.texts(), vec!["echo: a", "echo: b", "echo: c"]);
    }

    #[tokio::test]
    async fn stop_skips_the_prompt_queue() {
        let h = harness_with(FakeLauncher::new(FakeScript::hang()), BusyPolicy::Queue);
        let id = ConversationId(10);
        let first = h.dispatcher.spawn(inbound("long job"));
        wait_for_running(&h.gateway, id).await;

        h.dispatcher.spawn(inbound("/stop")).await.unwrap();
        first.await.unwrap();
        assert_eq!(h.api.texts(), vec!["Stopping...", "(stopped)"]);
    }

    #[tokio::test]
    async fn model_commands() {
        let h = harness(FakeLauncher::echo());
        h.dispatcher.handle(10, "/model").await;
        h.dispatcher.handle(10, "/model opus").await;
        h.dispatcher.handle(10, "/model gpt").await;
        assert_eq!(
            h.api.texts(),
            vec![
                "Model: sonnet",
                "Model set to opus. Session restarted.",
                "Choose: opus, sonnet, or haiku",
            ]
        );
        assert_eq!(h.gateway.status(ConversationId(10)).unwrap().model, Model::Opus);
    }

    #[tokio::test]
    async fn workspace_commands() {
        let h = harness(FakeLauncher::echo());
        h.dispatcher.handle(10, "/workspace new demo").await;
        h.dispatcher.handle(10, "/workspace").await;
        h.dispatcher.handle(10, "/workspace /etc").await;
        h.dispatcher.handle(10, "/workspace home").await;

        let texts = h.api.texts();
        assert!(texts[0].starts_with("Created and switched to: "));
        assert!(texts[1].starts_with("Workspace: demo\n"));
        assert_eq!(texts[2], "absolute paths are not allowed, use a workspace name");
        assert_eq!(texts[3], "Switched to home workspace. Session cleared.");
    }

    #[tokio::test]
    async fn workspaces_lists_recent_history() {
        let h = harness(FakeLauncher::echo());
        h.dispatcher.handle(10, "/workspaces").await;
        h.dispatcher.handle(10, "/workspace new alpha").await;
        h.dispatcher.handle(10, "/workspace new beta").await;
        h.dispatcher.handle(10, "/workspace alpha").await;
        h.dispatcher.handle(10, "/workspaces").await;

        let texts = h.api.texts();
        assert_eq!(
            texts[0],
            "No workspace history yet.\nUse /workspace new <name> to create one."
        );
        assert_eq!(
            texts[4],
            "Workspaces:\n- Home\n- alpha (current)\n- beta\nSwitch with /workspace <name>"
        );
    }

    #[tokio::test]
    async fn stats_new_and_unknown() {
        let h = harness(FakeLauncher::echo());
        h.dispatcher.handle(10, "hello").await;
        h.dispatcher.handle(10, "/stats").await;
        h.dispatcher.handle(10, "/new").await;
        h.dispatcher.handle(10, "/jobs").await;

        let texts = h.api.texts();
        let stats = &texts[1];
        assert!(stats.contains("Session: fake-ses..."), "{stats}");
        assert!(stats.contains("Turns: 1"));
        assert!(stats.contains("Total cost: $0.01 of $"));
        assert!(stats.contains("Process alive: true"));
        assert_eq!(texts[2], "Session cleared. Starting fresh.");
        assert_eq!(texts[3], "Unknown command: /jobs\nTry /help for available commands.");
    }
}
