//! Line-oriented interactive chat over the factory's streaming output.

use std::collections::HashMap;
use std::io::Write;

use futures::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::{AgentEvent, AgentFactory, ChatHistory, HistoryReducer};
use crate::config::{AppConfig, ChatHistorySettings};
use crate::error::InvocationError;
use crate::mcp::CallContext;
use crate::model::ChatMessage;

pub const PROMPT: &str = "> ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Agents,
    Use(String),
    Clear,
    Help,
    Quit,
    Say(String),
    Unknown(String),
    Empty,
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Say(line.to_string());
    };
    let (cmd, arg) = match rest.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim()),
        None => (rest, ""),
    };
    match cmd {
        "agents" => Command::Agents,
        "use" if !arg.is_empty() => Command::Use(arg.to_string()),
        "clear" => Command::Clear,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    }
}

/// Numbered agent names, from 1, in declaration order.
pub fn format_agent_list(names: &[String]) -> String {
    names
        .iter()
        .enumerate()
        .map(|(i, n)| format!("{}. {n}\n", i + 1))
        .collect()
}

/// `list` output straight from configuration.
pub fn list_configured_agents(config: &AppConfig) -> String {
    let names: Vec<String> = config.agent_factory.agents.keys().cloned().collect();
    format_agent_list(&names)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Console<'a, W: Write> {
    factory: &'a AgentFactory,
    history_limits: ChatHistorySettings,
    current: String,
    histories: HashMap<String, ChatHistory>,
    out: W,
}

impl<'a, W: Write> Console<'a, W> {
    /// Starts on the first declared agent. Returns `None` when no agents exist.
    pub fn new(factory: &'a AgentFactory, history_limits: ChatHistorySettings, out: W) -> Option<Self> {
        let current = factory.agent_names().into_iter().next()?;
        Some(Self {
            factory,
            history_limits,
            current,
            histories: HashMap::new(),
            out,
        })
    }

    pub fn current_agent(&self) -> &str {
        &self.current
    }

    pub fn history(&self, agent: &str) -> Option<&ChatHistory> {
        self.histories.get(agent)
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Read lines until EOF or `/quit`. Ctrl-C cancels a running turn and
    /// ends the session at the prompt.
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, input: R) -> std::io::Result<()> {
        self.run_with_interrupt(input, || async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                debug!("ctrl-c unavailable: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// `run` with the interrupt source supplied by the caller. Each call of
    /// `interrupt` yields a future that resolves on the next interrupt.
    pub async fn run_with_interrupt<R, F, Fut>(&mut self, input: R, interrupt: F) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        F: Fn() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut lines = input.lines();
        writeln!(self.out, "chatting with {} (/help for commands)", self.current)?;
        loop {
            write!(self.out, "{PROMPT}")?;
            self.out.flush()?;
            let line = tokio::select! {
                line = lines.next_line() => line?,
                () = interrupt() => {
                    writeln!(self.out)?;
                    break;
                }
            };
            let Some(line) = line else {
                break;
            };
            let cancel = CancellationToken::new();
            let handled = self.handle_line(&line, cancel.clone());
            tokio::pin!(handled);
            let flow = loop {
                tokio::select! {
                    flow = &mut handled => break flow,
                    () = interrupt(), if !cancel.is_cancelled() => cancel.cancel(),
                }
            };
            if flow? == Flow::Quit {
                break;
            }
        }
        Ok(())
    }

    pub async fn handle_line(&mut self, line: &str, cancel: CancellationToken) -> std::io::Result<Flow> {
        match parse_command(line) {
            Command::Empty => {}
            Command::Quit => return Ok(Flow::Quit),
            Command::Help => {
                writeln!(
                    self.out,
                    "/agents  list agents\n/use <name>  switch agent\n/clear  forget this agent's history\n/quit  exit (Ctrl-C at the prompt also exits)"
                )?;
            }
            Command::Agents => {
                for (i, name) in self.factory.agent_names().iter().enumerate() {
                    let marker = if *name == self.current { "*" } else { " " };
                    writeln!(self.out, "{marker}{}. {name}", i + 1)?;
                }
            }
            Command::Use(name) => match self.factory.get_agent(&name) {
                Ok(_) => {
                    self.current = name;
                    writeln!(self.out, "now chatting with {}", self.current)?;
                }
                Err(e) => writeln!(self.out, "{e}")?,
            },
            Command::Clear => {
                self.histories.remove(&self.current);
                writeln!(self.out, "history cleared")?;
            }
            Command::Unknown(cmd) => writeln!(self.out, "unknown command: {cmd}")?,
            Command::Say(text) => self.turn(text, cancel).await?,
        }
        Ok(Flow::Continue)
    }

    async fn turn(&mut self, text: String, cancel: CancellationToken) -> std::io::Result<()> {
        let agent = match self.factory.get_agent(&self.current) {
            Ok(a) => a,
            Err(e) => {
                writeln!(self.out, "{e}")?;
                return Ok(());
            }
        };
        let history = self.histories.entry(self.current.clone()).or_default();
        let user = ChatMessage::user(text);
        let mut messages = history.messages().to_vec();
        messages.push(user.clone());

        let mut events = agent.invoke_stream(messages, CallContext::default(), cancel);
        while let Some(event) = events.next().await {
            match event {
                AgentEvent::TextDelta(delta) => {
                    write!(self.out, "{delta}")?;
                    self.out.flush()?;
                }
                AgentEvent::FunctionCall(call) => {
                    writeln!(self.out, "\n{}", pretty(&call.to_json()))?;
                }
                AgentEvent::FunctionResult(result) => {
                    writeln!(self.out, "{}", pretty(&result.to_json()))?;
                }
                AgentEvent::Completed(out) => {
                    writeln!(self.out)?;
                    history.push(user.clone());
                    history.extend(out.messages);
                    if let Some(limits) = self.history_limits.limits_for(&self.current)
                        && HistoryReducer::from(limits).reduce(history)
                    {
                        debug!(agent = %self.current, kept = history.len(), "history trimmed");
                    }
                }
                AgentEvent::Failed(InvocationError::Cancelled) => {
                    writeln!(self.out, "\n[cancelled]")?;
                }
                AgentEvent::Failed(e) => {
                    writeln!(self.out, "\nerror: {e}")?;
                }
            }
        }
        Ok(())
    }
}

fn pretty(v: &serde_json::Value) -> String {
    serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
}
