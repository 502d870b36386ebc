//! Runs agent turns for one service: per-context histories, task tracking
//! and cancellation.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::protocol::{
    Artifact, INVALID_PARAMS, Message, MessageSendParams, Part, RpcError, StreamEvent,
    TASK_NOT_CANCELABLE, Task, TaskArtifactUpdateEvent, TaskState, TaskStatus,
    TaskStatusUpdateEvent,
};
use crate::agent::{Agent, AgentEvent, ChatHistory, HistoryReducer};
use crate::error::InvocationError;
use crate::mcp::CallContext;
use crate::model::ChatMessage;

/// Finished tasks kept for `tasks/get` before the oldest are dropped.
const MAX_RETAINED_TASKS: usize = 1024;
/// Conversation histories kept before the least recently used idle ones are dropped.
pub const MAX_RETAINED_CONTEXTS: usize = 1024;
const STREAM_BUFFER: usize = 64;

type HistorySlot = Arc<tokio::sync::Mutex<ChatHistory>>;

struct TaskEntry {
    task: Task,
    cancel: CancellationToken,
}

pub struct AgentExecutor {
    agent: Arc<Agent>,
    reducer: HistoryReducer,
    token_streaming: bool,
    contexts: Mutex<IndexMap<String, HistorySlot>>,
    max_contexts: usize,
    tasks: Mutex<IndexMap<String, TaskEntry>>,
}

impl AgentExecutor {
    pub fn new(agent: Arc<Agent>, reducer: HistoryReducer, token_streaming: bool) -> Self {
        Self {
            agent,
            reducer,
            token_streaming,
            contexts: Mutex::new(IndexMap::new()),
            max_contexts: MAX_RETAINED_CONTEXTS,
            tasks: Mutex::new(IndexMap::new()),
        }
    }

    pub fn with_context_limit(mut self, max_contexts: usize) -> Self {
        self.max_contexts = max_contexts.max(1);
        self
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Run a turn to completion and return the finished task.
    pub async fn send(
        self: &Arc<Self>,
        params: MessageSendParams,
        ctx: CallContext,
    ) -> Result<Task, RpcError> {
        let (task_id, mut events) = self.start(params, ctx)?;
        while events.next().await.is_some() {}
        self.get_task(&task_id)
    }

    /// Run a turn and stream its task, status and artifact events.
    pub fn stream(
        self: &Arc<Self>,
        params: MessageSendParams,
        ctx: CallContext,
    ) -> Result<ReceiverStream<StreamEvent>, RpcError> {
        self.start(params, ctx).map(|(_, events)| events)
    }

    pub fn get_task(&self, id: &str) -> Result<Task, RpcError> {
        self.lock_tasks()
            .get(id)
            .map(|e| e.task.clone())
            .ok_or_else(|| RpcError::task_not_found(id))
    }

    /// Cancel a running task. Finished tasks cannot be cancelled.
    pub fn cancel(&self, id: &str) -> Result<Task, RpcError> {
        let mut tasks = self.lock_tasks();
        let entry = tasks.get_mut(id).ok_or_else(|| RpcError::task_not_found(id))?;
        if entry.task.status.state.is_terminal() {
            return Err(RpcError::new(
                TASK_NOT_CANCELABLE,
                format!("task '{id}' is already {}", entry.task.status.state.as_str()),
            ));
        }
        entry.cancel.cancel();
        entry.task.status = TaskStatus {
            state: TaskState::Canceled,
            message: None,
        };
        info!(agent = %self.agent.name(), task = %id, "task cancelled");
        Ok(entry.task.clone())
    }

    /// Copy of the history kept for `context_id`.
    pub async fn history(&self, context_id: &str) -> Option<ChatHistory> {
        let slot = self.lock_contexts().get(context_id).cloned()?;
        let history = slot.lock().await;
        Some(history.clone())
    }

    fn start(
        self: &Arc<Self>,
        params: MessageSendParams,
        ctx: CallContext,
    ) -> Result<(String, ReceiverStream<StreamEvent>), RpcError> {
        let text = params.message.text();
        if text.trim().is_empty() {
            return Err(RpcError::new(INVALID_PARAMS, "message has no text parts"));
        }
        let context_id = params
            .message
            .context_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let task = Task::new(
            &uuid::Uuid::new_v4().to_string(),
            &context_id,
            TaskState::Submitted,
        );
        let cancel = CancellationToken::new();
        self.lock_tasks().insert(
            task.id.clone(),
            TaskEntry {
                task: task.clone(),
                cancel: cancel.clone(),
            },
        );

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let this = Arc::clone(self);
        let task_id = task.id.clone();
        tokio::spawn(async move {
            this.drive(task, text, ctx, cancel, tx).await;
        });
        Ok((task_id, ReceiverStream::new(rx)))
    }

    async fn drive(
        &self,
        task: Task,
        text: String,
        ctx: CallContext,
        cancel: CancellationToken,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let slot = self.history_slot(&task.context_id);
        // Turns within one context run one at a time.
        let mut history = slot.lock().await;

        let _ = tx.send(StreamEvent::Task(task.clone())).await;
        self.update(&task.id, TaskState::Working, None, None);
        let _ = tx
            .send(status_event(&task, TaskState::Working, None, false))
            .await;

        let before = history.len();
        history.push(ChatMessage::user(text));
        let mut events = self
            .agent
            .invoke_stream(history.messages().to_vec(), ctx, cancel);

        let artifact_id = uuid::Uuid::new_v4().to_string();
        let mut streamed = false;
        let mut outcome = None;
        while let Some(event) = events.next().await {
            match event {
                AgentEvent::TextDelta(delta) if self.token_streaming => {
                    let chunk = artifact_event(&task, &artifact_id, delta, streamed, false);
                    streamed = true;
                    let _ = tx.send(chunk).await;
                }
                AgentEvent::TextDelta(_) => {}
                AgentEvent::FunctionCall(call) => {
                    let msg = Message::agent(
                        vec![Part::Data { data: call.to_json() }],
                        &task.context_id,
                        &task.id,
                    );
                    let _ = tx
                        .send(status_event(&task, TaskState::Working, Some(msg), false))
                        .await;
                }
                AgentEvent::FunctionResult(result) => {
                    let msg = Message::agent(
                        vec![Part::Data {
                            data: result.to_json(),
                        }],
                        &task.context_id,
                        &task.id,
                    );
                    let _ = tx
                        .send(status_event(&task, TaskState::Working, Some(msg), false))
                        .await;
                }
                AgentEvent::Completed(out) => outcome = Some(Ok(out)),
                AgentEvent::Failed(e) => outcome = Some(Err(e)),
            }
        }

        let (state, message, artifact) = match outcome {
            Some(Ok(out)) => {
                history.extend(out.messages);
                if self.reducer.reduce(&mut history) {
                    debug!(context = %task.context_id, kept = history.len(), "history trimmed");
                }
                let last = if streamed {
                    artifact_event(&task, &artifact_id, String::new(), true, true)
                } else {
                    artifact_event(&task, &artifact_id, out.text.clone(), false, true)
                };
                let _ = tx.send(last).await;
                let artifact = Artifact {
                    artifact_id,
                    name: Some("response".to_string()),
                    parts: vec![Part::Text { text: out.text }],
                };
                (TaskState::Completed, None, Some(artifact))
            }
            Some(Err(InvocationError::Cancelled)) => {
                history.truncate(before);
                (TaskState::Canceled, None, None)
            }
            Some(Err(e)) => {
                history.truncate(before);
                let msg = Message::agent(
                    vec![Part::Text {
                        text: e.to_string(),
                    }],
                    &task.context_id,
                    &task.id,
                );
                (TaskState::Failed, Some(msg), None)
            }
            None => {
                history.truncate(before);
                (TaskState::Failed, None, None)
            }
        };
        drop(history);

        let final_state = self.update(&task.id, state, message.clone(), artifact);
        debug!(agent = %self.agent.name(), task = %task.id, state = ?final_state, "task finished");
        let _ = tx.send(status_event(&task, final_state, message, true)).await;
        self.prune_tasks();
    }

    /// Record a state change and return the state now stored. A task that
    /// was already cancelled stays cancelled.
    fn update(
        &self,
        id: &str,
        state: TaskState,
        message: Option<Message>,
        artifact: Option<Artifact>,
    ) -> TaskState {
        let mut tasks = self.lock_tasks();
        let Some(entry) = tasks.get_mut(id) else {
            return state;
        };
        if entry.task.status.state.is_terminal() {
            return entry.task.status.state;
        }
        entry.task.status = TaskStatus { state, message };
        entry.task.artifacts.extend(artifact);
        state
    }

    fn prune_tasks(&self) {
        let mut tasks = self.lock_tasks();
        while tasks.len() > MAX_RETAINED_TASKS {
            let Some(idx) = tasks
                .values()
                .position(|e| e.task.status.state.is_terminal())
            else {
                break;
            };
            tasks.shift_remove_index(idx);
        }
    }

    /// Slot for `context_id`, marked most recently used. Inserting past the
    /// limit drops the least recently used contexts that no turn holds.
    fn history_slot(&self, context_id: &str) -> HistorySlot {
        let mut contexts = self.lock_contexts();
        if let Some(idx) = contexts.get_index_of(context_id) {
            let last = contexts.len() - 1;
            contexts.move_index(idx, last);
            return contexts[last].clone();
        }
        let slot = HistorySlot::default();
        contexts.insert(context_id.to_string(), slot.clone());
        while contexts.len() > self.max_contexts {
            let Some(idx) = contexts.values().position(|s| Arc::strong_count(s) == 1) else {
                break;
            };
            if let Some((evicted, _)) = contexts.shift_remove_index(idx) {
                debug!(agent = %self.agent.name(), context = %evicted, "context history evicted");
            }
        }
        slot
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, IndexMap<String, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_contexts(
        &self,
    ) -> std::sync::MutexGuard<'_, IndexMap<String, HistorySlot>> {
        self.contexts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn status_event(
    task: &Task,
    state: TaskState,
    message: Option<Message>,
    is_final: bool,
) -> StreamEvent {
    StreamEvent::Status(TaskStatusUpdateEvent::new(
        task,
        TaskStatus { state, message },
        is_final,
    ))
}

fn artifact_event(
    task: &Task,
    artifact_id: &str,
    text: String,
    append: bool,
    last_chunk: bool,
) -> StreamEvent {
    StreamEvent::Artifact(TaskArtifactUpdateEvent {
        task_id: task.id.clone(),
        context_id: task.context_id.clone(),
        artifact: Artifact {
            artifact_id: artifact_id.to_string(),
            name: Some("response".to_string()),
            parts: vec![Part::Text { text }],
        },
        append,
        last_chunk,
        kind: "artifact-update",
    })
}
