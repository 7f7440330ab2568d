use crate::environment::StaticModeProvider;
use crate::events::{TaskEvent, TaskEventEnvelope};
use crate::hooks::TaskHooks;
use crate::llm::{
    ApiChunk, ApiRequest, ApiStream, ModelInfo, ModelTransport, ProviderError, UsageChunk,
};
use crate::messages::{AskKind, AskReply, UiMessage};
use crate::stores::InMemoryTaskStore;
use crate::tools::{ToolOutput, ToolPresenter, ToolUseRequest};
use crate::types::{TaskConfig, TaskId, TaskSettings};
use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{Task, TaskResource};

const POLL: Duration = Duration::from_millis(10);
const MAX_POLLS: usize = 60_000;

// ===================
// Scripted transport
// ===================

pub enum ScriptedResponse {
    Chunks(Vec<ApiChunk>),
    /// Deliver the chunks, then never finish.
    ChunksThenHang(Vec<ApiChunk>),
    /// Fail before the first chunk.
    Fail(ProviderError),
    /// Deliver the chunks, then fail.
    FailAfter(Vec<ApiChunk>, String),
}

pub fn text(text: &str) -> ApiChunk {
    ApiChunk::Text(text.to_string())
}

pub fn usage(input_tokens: u64, output_tokens: u64, total_cost: Option<f64>) -> ApiChunk {
    ApiChunk::Usage(UsageChunk {
        input_tokens,
        output_tokens,
        total_cost,
        ..UsageChunk::default()
    })
}

pub fn tool_call(name: &str, path: &str) -> String {
    format!("<{name}>\n<path>{path}</path>\n</{name}>")
}

pub struct ScriptedTransport {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<(Instant, ApiRequest)>>,
    model: ModelInfo,
}

impl ScriptedTransport {
    /// Once the script runs out every request hangs.
    pub fn new(responses: Vec<ScriptedResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            model: ModelInfo {
                id: "scripted".to_string(),
                context_window: 200_000,
                max_tokens: Some(8_192),
                ..ModelInfo::default()
            },
        })
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn request_times(&self) -> Vec<Instant> {
        self.requests
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("lock poisoned").len()
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    fn create_message(&self, request: ApiRequest) -> ApiStream<'_> {
        self.requests
            .lock()
            .expect("lock poisoned")
            .push((Instant::now(), request));
        let response = self
            .responses
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or(ScriptedResponse::ChunksThenHang(Vec::new()));

        match response {
            ScriptedResponse::Chunks(chunks) => futures::stream::iter(chunks.into_iter().map(Ok)).boxed(),
            ScriptedResponse::ChunksThenHang(chunks) => futures::stream::iter(chunks.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed(),
            ScriptedResponse::Fail(error) => {
                futures::stream::iter([Err(anyhow::Error::new(error))]).boxed()
            }
            ScriptedResponse::FailAfter(chunks, message) => futures::stream::iter(chunks.into_iter().map(Ok))
                .chain(futures::stream::iter([Err(anyhow::anyhow!(message))]))
                .boxed(),
        }
    }

    fn model_info(&self) -> ModelInfo {
        self.model.clone()
    }
}

// ===================
// Scripted presenter
// ===================

/// Executes every tool with an `ok` result. `ask_followup_question` asks
/// the user and returns the answer.
#[derive(Default)]
pub struct ScriptedPresenter {
    previews: Mutex<Vec<ToolUseRequest>>,
    executions: Mutex<Vec<ToolUseRequest>>,
    reject: AtomicBool,
}

impl ScriptedPresenter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rejecting() -> Arc<Self> {
        let presenter = Self::default();
        presenter.reject.store(true, Ordering::SeqCst);
        Arc::new(presenter)
    }

    pub fn previews(&self) -> Vec<ToolUseRequest> {
        self.previews.lock().expect("lock poisoned").clone()
    }

    pub fn executions(&self) -> Vec<ToolUseRequest> {
        self.executions.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl ToolPresenter for ScriptedPresenter {
    async fn preview(&self, _task: &Task, request: &ToolUseRequest) -> Result<()> {
        self.previews
            .lock()
            .expect("lock poisoned")
            .push(request.clone());
        Ok(())
    }

    async fn execute(&self, task: &Task, request: &ToolUseRequest) -> Result<ToolOutput> {
        self.executions
            .lock()
            .expect("lock poisoned")
            .push(request.clone());

        if self.reject.load(Ordering::SeqCst) {
            return Ok(ToolOutput::rejected("The user denied this operation."));
        }
        if request.name == "ask_followup_question" {
            let question = request.param("question").map(str::to_string);
            let reply = task.ask(AskKind::Followup, question, None).await?;
            return Ok(ToolOutput::text(reply.text.unwrap_or_default()));
        }
        Ok(ToolOutput::text("ok"))
    }
}

// ===================
// Resources and hooks
// ===================

pub struct CountingResource {
    pub released: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskResource for CountingResource {
    fn name(&self) -> &str {
        "counting"
    }

    async fn release(&self) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingHooks {
    pub restarts: AtomicUsize,
    pub reverts: AtomicUsize,
    pub checkpoints: AtomicUsize,
}

#[async_trait]
impl TaskHooks for RecordingHooks {
    async fn save_checkpoint(&self, _task_id: &TaskId) -> Result<()> {
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn revert_pending_edits(&self, _task_id: &TaskId) -> Result<()> {
        self.reverts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restart_from_history(&self, _task_id: &TaskId) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ===================
// Harness
// ===================

type Answer = Box<dyn Fn(AskKind) -> Option<AskReply> + Send + Sync>;

pub struct Harness {
    pub task: Arc<Task>,
    pub transport: Arc<ScriptedTransport>,
    pub condensing: Option<Arc<ScriptedTransport>>,
    pub presenter: Arc<ScriptedPresenter>,
    pub modes: Arc<StaticModeProvider>,
    pub hooks: Arc<RecordingHooks>,
    pub events: Arc<Mutex<Vec<TaskEvent>>>,
}

pub struct HarnessBuilder {
    responses: Vec<ScriptedResponse>,
    condensing: Option<Vec<ScriptedResponse>>,
    settings: TaskSettings,
    config: TaskConfig,
    presenter: Arc<ScriptedPresenter>,
    store: Arc<InMemoryTaskStore>,
    task_id: Option<TaskId>,
    answer: Option<Answer>,
}

impl Harness {
    pub fn builder(responses: Vec<ScriptedResponse>) -> HarnessBuilder {
        HarnessBuilder {
            responses,
            condensing: None,
            settings: TaskSettings::default(),
            config: TaskConfig::default().with_tool_names([
                "list_files",
                "read_file",
                "ask_followup_question",
            ]),
            presenter: ScriptedPresenter::new(),
            store: Arc::new(InMemoryTaskStore::new()),
            task_id: None,
            answer: None,
        }
    }

    /// Run `start_task` in the background.
    pub fn start(&self, prompt: &str) -> tokio::task::JoinHandle<Result<bool, crate::types::TaskError>> {
        let task = Arc::clone(&self.task);
        let prompt = prompt.to_string();
        tokio::spawn(async move { task.start_task(&prompt, Vec::new()).await })
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().expect("lock poisoned").clone()
    }
}

impl HarnessBuilder {
    pub fn settings(mut self, settings: TaskSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn config(mut self, change: impl FnOnce(TaskConfig) -> TaskConfig) -> Self {
        self.config = change(self.config);
        self
    }

    /// Route summary requests to a second scripted transport.
    pub fn condensing(mut self, responses: Vec<ScriptedResponse>) -> Self {
        self.condensing = Some(responses);
        self
    }

    pub fn presenter(mut self, presenter: Arc<ScriptedPresenter>) -> Self {
        self.presenter = presenter;
        self
    }

    pub fn store(mut self, store: Arc<InMemoryTaskStore>) -> Self {
        self.store = store;
        self
    }

    pub fn task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Answer blocking asks of this task as they arrive.
    pub fn answer(
        mut self,
        answer: impl Fn(AskKind) -> Option<AskReply> + Send + Sync + 'static,
    ) -> Self {
        self.answer = Some(Box::new(answer));
        self
    }

    pub fn build(self) -> Result<Harness> {
        let transport = ScriptedTransport::new(self.responses);
        let condensing = self.condensing.map(ScriptedTransport::new);
        let modes = Arc::new(StaticModeProvider::new(self.settings));
        let hooks = Arc::new(RecordingHooks::default());
        let (tx, rx) = mpsc::channel(1024);

        let mut builder = Task::builder()
            .config(self.config)
            .transport(transport.clone())
            .presenter(self.presenter.clone())
            .modes(modes.clone())
            .persistence(self.store.clone())
            .hooks(hooks.clone())
            .event_channel(tx);
        if let Some(task_id) = self.task_id {
            builder = builder.task_id(task_id);
        }
        if let Some(condensing) = &condensing {
            builder = builder.condensing_transport(condensing.clone());
        }
        let task = builder.build()?;

        let events = spawn_responder(Arc::downgrade(&task), rx, self.answer);

        Ok(Harness {
            task,
            transport,
            condensing,
            presenter: self.presenter,
            modes,
            hooks,
            events,
        })
    }
}

/// Collect every event and answer idle asks of `task` with `answer`.
fn spawn_responder(
    task: Weak<Task>,
    mut rx: mpsc::Receiver<TaskEventEnvelope>,
    answer: Option<Answer>,
) -> Arc<Mutex<Vec<TaskEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);

    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let (TaskEvent::Idle { task_id, ask }, Some(answer)) = (&envelope.event, &answer) {
                if let Some(task) = task.upgrade().filter(|t| t.id() == task_id) {
                    if let Some(reply) = answer(*ask) {
                        task.handle_response(reply);
                    }
                }
            }
            sink.lock().expect("lock poisoned").push(envelope.event);
        }
    });

    events
}

// ===================
// Polling helpers
// ===================

pub async fn wait_for_ui(
    task: &Task,
    condition: impl Fn(&[UiMessage]) -> bool,
) -> Result<Vec<UiMessage>> {
    for _ in 0..MAX_POLLS {
        let messages = task.ui_messages().await;
        if condition(&messages) {
            return Ok(messages);
        }
        tokio::time::sleep(POLL).await;
    }
    bail!("UI log never reached the expected state")
}

pub async fn wait_for_requests(transport: &ScriptedTransport, count: usize) -> Result<()> {
    for _ in 0..MAX_POLLS {
        if transport.request_count() >= count {
            return Ok(());
        }
        tokio::time::sleep(POLL).await;
    }
    bail!(
        "expected {count} requests, saw {}",
        transport.request_count()
    )
}

pub async fn wait_for_blocking_ask(task: &Task, kind: Option<AskKind>) -> Result<()> {
    for _ in 0..MAX_POLLS {
        if task.blocking_ask() == kind {
            return Ok(());
        }
        tokio::time::sleep(POLL).await;
    }
    bail!("blocking ask never became {kind:?}")
}

pub async fn wait_until(condition: impl Fn() -> bool) -> Result<()> {
    for _ in 0..MAX_POLLS {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(POLL).await;
    }
    bail!("condition never held")
}
