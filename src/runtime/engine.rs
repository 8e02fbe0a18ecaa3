use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::actions::builtin::default_activities;
use crate::actions::{ActivityContext, TaskActivity};
use crate::compiler::core::Compiler;
use crate::dsl::NetDefinition;
use crate::error::{EngineError, EntityKind, Result};
use crate::runtime::context::Context;
use crate::runtime::events::StateChange;
use crate::runtime::id::{IdGenerator, UuidGenerator};
use crate::runtime::net::{NetModel, TaskDef};
use crate::runtime::storage::{
    InMemoryStateStore, ParentRef, StateStore, TaskState, WorkItemRecord, WorkItemState,
    WorkflowSnapshot, WorkflowState,
};
use crate::runtime::syscall::{Request, Syscall};
use crate::runtime::workflow::Workflow;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Basis markings an OR-join coverability search may add before it is declared divergent.
    pub or_join_search_limit: usize,
    /// Requests a single external call may drain.
    pub drain_limit: usize,
    /// Buffer of the state-change feed.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            or_join_search_limit: 10_000,
            drain_limit: 100_000,
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn with_or_join_search_limit(mut self, limit: usize) -> Self {
        self.or_join_search_limit = limit;
        self
    }

    pub fn with_drain_limit(mut self, limit: usize) -> Self {
        self.drain_limit = limit;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

struct EngineSyscall {
    workflow_id: String,
    pending: Vec<Request>,
}

impl EngineSyscall {
    fn new(workflow_id: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            pending: Vec::new(),
        }
    }
}

impl Syscall for EngineSyscall {
    fn request(&mut self, request: Request) {
        self.pending.push(request);
    }

    fn workflow_id(&self) -> &str {
        &self.workflow_id
    }
}

#[derive(Clone, Copy)]
enum Hook {
    Fire,
    Complete,
}

/// Public entry point. Every call turns into one queued request and drains the queue
/// to a fixpoint before returning.
pub struct Engine {
    // Compiled nets, shared by all their instances
    nets: DashMap<String, Arc<NetModel>>,
    activities: DashMap<String, Arc<dyn TaskActivity>>,
    store: Arc<dyn StateStore>,
    ids: Arc<dyn IdGenerator>,
    events: broadcast::Sender<StateChange>,
    // One lock per root instance; nested instances share their root's lock
    locks: DashMap<String, Arc<Mutex<()>>>,
    config: EngineConfig,
}

impl Engine {
    pub fn new() -> Self {
        Self::new_with_storage(Arc::new(InMemoryStateStore::new()))
    }

    pub fn new_with_storage(store: Arc<dyn StateStore>) -> Self {
        let config = EngineConfig::default();
        let (events, _) = broadcast::channel(config.event_capacity);
        let engine = Self {
            nets: DashMap::new(),
            activities: DashMap::new(),
            store,
            ids: Arc::new(UuidGenerator),
            events,
            locks: DashMap::new(),
            config,
        };
        for activity in default_activities() {
            engine.register_activity(activity);
        }
        engine
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        self.events = events;
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    pub fn register_net(&self, net: NetModel) {
        info!(net = %net.id, tasks = net.tasks.len(), conditions = net.conditions.len(), "net registered");
        self.nets.insert(net.id.clone(), Arc::new(net));
    }

    pub fn register_definition(&self, definition: NetDefinition) -> Result<()> {
        let net = Compiler::new().compile(definition)?;
        self.register_net(net);
        Ok(())
    }

    pub fn register_activity(&self, activity: Arc<dyn TaskActivity>) {
        self.activities.insert(activity.name().to_string(), activity);
    }

    pub fn net(&self, id: &str) -> Result<Arc<NetModel>> {
        self.nets
            .get(id)
            .map(|n| n.value().clone())
            .ok_or_else(|| EngineError::not_found(EntityKind::Net, id))
    }

    /// Net the given instance runs.
    pub async fn net_of(&self, workflow_id: &str) -> Result<Arc<NetModel>> {
        let record = self.store.load_workflow(workflow_id).await?;
        self.net(&record.name)
    }

    /// State-change feed; one event per committed mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    // --- Lifecycle ---

    pub async fn start_workflow(&self, net_id: &str, vars: Map<String, Value>) -> Result<String> {
        let net = self.net(net_id)?;
        let workflow_id = self.ids.next_id();
        {
            let lock = self.lock_for(&workflow_id);
            let _guard = lock.lock().await;
            Workflow::initialize(self.context(workflow_id.clone(), net), None, vars).await?;
        }
        info!(workflow_id = %workflow_id, net = %net_id, "workflow started");
        self.dispatch(Request::StartWorkflow { workflow_id: workflow_id.clone() }).await?;
        Ok(workflow_id)
    }

    /// Restores an instance tree captured by `snapshot`.
    pub async fn resume(&self, snapshot: WorkflowSnapshot) -> Result<String> {
        let workflow_id = snapshot.workflow.id.clone();
        let lock = self.lock_for(&workflow_id);
        let _guard = lock.lock().await;
        let restored = self.restore(&snapshot).await;
        self.release_lock(root_of(&workflow_id)).await;
        restored?;
        info!(workflow_id = %workflow_id, "workflow resumed");
        Ok(workflow_id)
    }

    async fn restore(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        let workflow_id = &snapshot.workflow.id;
        if self.store.load_workflow(workflow_id).await.is_ok() {
            return Err(anyhow::anyhow!("workflow {} already exists", workflow_id).into());
        }
        let mut nets = HashMap::new();
        let mut nested = vec![snapshot];
        while let Some(snap) = nested.pop() {
            nets.insert(snap.workflow.id.clone(), self.net(&snap.workflow.name)?);
            nested.extend(snap.children.iter());
        }
        let net = self.net(&snapshot.workflow.name)?;
        Workflow::resume(self.context(workflow_id.clone(), net), snapshot, &nets).await?;
        Ok(())
    }

    pub async fn snapshot(&self, workflow_id: &str) -> Result<WorkflowSnapshot> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;
        let snapshot = self.store.snapshot(workflow_id).await;
        self.release_lock(root_of(workflow_id)).await;
        snapshot
    }

    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        self.dispatch(Request::CancelWorkflow { workflow_id: workflow_id.to_string() })
            .await
            .map(|_| ())
    }

    /// Returns the new work item id, or the nested instance id for a composite task.
    pub async fn fire_task(&self, workflow_id: &str, task: &str) -> Result<String> {
        let id = self
            .dispatch(Request::FireTask {
                workflow_id: workflow_id.to_string(),
                task: task.to_string(),
            })
            .await?;
        id.ok_or_else(|| EngineError::not_found(EntityKind::WorkItem, task))
    }

    pub async fn complete_task(&self, workflow_id: &str, task: &str) -> Result<()> {
        self.dispatch(Request::CompleteTask {
            workflow_id: workflow_id.to_string(),
            task: task.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn cancel_task(&self, workflow_id: &str, task: &str) -> Result<()> {
        self.dispatch(Request::CancelTask {
            workflow_id: workflow_id.to_string(),
            task: task.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn fail_task(&self, workflow_id: &str, task: &str, reason: &str) -> Result<()> {
        self.dispatch(Request::FailTask {
            workflow_id: workflow_id.to_string(),
            task: task.to_string(),
            reason: reason.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn start_work_item(&self, workflow_id: &str, work_item_id: &str) -> Result<()> {
        self.dispatch(Request::StartWorkItem {
            workflow_id: workflow_id.to_string(),
            work_item_id: work_item_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// An object payload is merged into the workflow variables.
    pub async fn complete_work_item(&self, workflow_id: &str, work_item_id: &str, payload: Option<Value>) -> Result<()> {
        self.dispatch(Request::CompleteWorkItem {
            workflow_id: workflow_id.to_string(),
            work_item_id: work_item_id.to_string(),
            payload,
        })
        .await
        .map(|_| ())
    }

    pub async fn cancel_work_item(&self, workflow_id: &str, work_item_id: &str) -> Result<()> {
        self.dispatch(Request::CancelWorkItem {
            workflow_id: workflow_id.to_string(),
            work_item_id: work_item_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn fail_work_item(&self, workflow_id: &str, work_item_id: &str, reason: &str) -> Result<()> {
        self.dispatch(Request::FailWorkItem {
            workflow_id: workflow_id.to_string(),
            work_item_id: work_item_id.to_string(),
            reason: reason.to_string(),
        })
        .await
        .map(|_| ())
    }

    // --- Queries ---

    pub async fn workflow_state(&self, workflow_id: &str) -> Result<WorkflowState> {
        Ok(self.store.load_workflow(workflow_id).await?.state)
    }

    pub async fn task_state(&self, workflow_id: &str, task: &str) -> Result<TaskState> {
        Ok(self.store.load_task(workflow_id, task).await?.state)
    }

    pub async fn marking(&self, workflow_id: &str, condition: &str) -> Result<u32> {
        self.store.marking(workflow_id, condition).await
    }

    pub async fn get_vars(&self, workflow_id: &str) -> Result<Map<String, Value>> {
        self.store.get_vars(workflow_id).await
    }

    pub async fn enabled_tasks(&self, workflow_id: &str) -> Result<Vec<String>> {
        self.workflow(workflow_id).await?.enabled_tasks().await
    }

    /// Enabled tasks of a running instance and all of its running nested instances.
    pub async fn enabled_tasks_deep(&self, workflow_id: &str) -> Result<Vec<(String, String)>> {
        let mut found = Vec::new();
        let mut pending = VecDeque::from([workflow_id.to_string()]);
        while let Some(id) = pending.pop_front() {
            if self.workflow_state(&id).await? != WorkflowState::Running {
                continue;
            }
            for task in self.enabled_tasks(&id).await? {
                found.push((id.clone(), task));
            }
            for child in self.store.list_children(&id).await? {
                pending.push_back(child.id);
            }
        }
        Ok(found)
    }

    pub async fn work_items(&self, workflow_id: &str, task: &str) -> Result<Vec<WorkItemRecord>> {
        self.store.work_items_for_task(workflow_id, task).await
    }

    pub async fn children(&self, workflow_id: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .list_children(workflow_id)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect())
    }

    // --- Queue ---

    fn lock_for(&self, workflow_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(root_of(workflow_id).to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the root's lock entry once the root is final or was never created.
    /// Called with the root's lock held.
    async fn release_lock(&self, root: &str) {
        let finished = match self.store.load_workflow(root).await {
            Ok(record) => record.state.is_final(),
            Err(e) => e.is_not_found(),
        };
        if finished {
            self.locks.remove(root);
            trace!(workflow_id = %root, "request lock released");
        }
    }

    /// Root instances that currently hold a request lock entry.
    pub fn tracked_roots(&self) -> usize {
        self.locks.len()
    }

    fn context(&self, workflow_id: String, net: Arc<NetModel>) -> Context {
        Context::new(
            workflow_id,
            net,
            self.store.clone(),
            self.events.clone(),
            self.config.or_join_search_limit,
        )
    }

    async fn workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let net = self.net_of(workflow_id).await?;
        Ok(Workflow::new(self.context(workflow_id.to_string(), net)))
    }

    async fn dispatch(&self, request: Request) -> Result<Option<String>> {
        let root = root_of(request.workflow_id()).to_string();
        let lock = self.lock_for(&root);
        let _guard = lock.lock().await;
        let result = self.drain(request).await;
        self.release_lock(&root).await;
        result
    }

    /// Drains the queue FIFO. Returns the id produced by the first request, if any.
    async fn drain(&self, request: Request) -> Result<Option<String>> {
        debug!(?request, "drain started");
        let mut queue = VecDeque::from([request]);
        let mut produced = None;
        let mut steps = 0usize;

        while let Some(request) = queue.pop_front() {
            steps += 1;
            if steps > self.config.drain_limit {
                return Err(EngineError::DrainLimitExceeded(self.config.drain_limit));
            }

            let workflow_id = request.workflow_id().to_string();
            let mut syscall = EngineSyscall::new(&workflow_id);
            match self.apply(request, &mut syscall).await {
                Ok(id) => {
                    if steps == 1 {
                        produced = id;
                    }
                }
                Err(e @ EngineError::Activity { .. }) => {
                    error!(workflow_id = %workflow_id, error = %e, "activity failed");
                    self.fail_chain(&workflow_id).await?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }

            if self.workflow_state(&workflow_id).await? == WorkflowState::Failed {
                if !queue.is_empty() {
                    warn!(workflow_id = %workflow_id, dropped = queue.len(), "workflow failed; queued requests dropped");
                }
                break;
            }

            self.settle(&workflow_id, &mut syscall).await?;
            queue.extend(syscall.pending);
        }

        debug!(steps, "drain finished");
        Ok(produced)
    }

    async fn apply(&self, request: Request, syscall: &mut EngineSyscall) -> Result<Option<String>> {
        match request {
            Request::StartWorkflow { workflow_id } => {
                self.workflow(&workflow_id).await?.start().await?;
                Ok(None)
            }
            Request::CancelWorkflow { workflow_id } => {
                let wf = self.running(&workflow_id).await?;
                let active = wf.cancel().await?;
                self.cancel_nested(&workflow_id, &active).await?;
                self.notify_parent(&wf, WorkflowState::Canceled, syscall).await?;
                info!(workflow_id = %workflow_id, "workflow cancelled");
                Ok(None)
            }
            Request::FireTask { workflow_id, task } => self.fire(&workflow_id, &task, syscall).await.map(Some),
            Request::CompleteTask { workflow_id, task } => {
                let wf = self.running(&workflow_id).await?;
                self.complete(&wf, &task, syscall).await?;
                Ok(None)
            }
            Request::CancelTask { workflow_id, task } => {
                let wf = self.running(&workflow_id).await?;
                wf.task(&task)?.cancel().await?;
                self.cancel_nested(&workflow_id, std::slice::from_ref(&task)).await?;
                Ok(None)
            }
            Request::FailTask { workflow_id, task, reason } => {
                let wf = self.running(&workflow_id).await?;
                wf.task(&task)?.fail().await?;
                warn!(workflow_id = %workflow_id, task = %task, reason = %reason, "task failed");
                self.fail_chain(&workflow_id).await?;
                Ok(None)
            }
            Request::StartWorkItem { workflow_id, work_item_id } => {
                let wf = self.running(&workflow_id).await?;
                self.transition_work_item(&wf, &work_item_id, WorkItemState::Started).await?;
                Ok(None)
            }
            Request::CompleteWorkItem { workflow_id, work_item_id, payload } => {
                let wf = self.running(&workflow_id).await?;
                let item = self
                    .transition_work_item(&wf, &work_item_id, WorkItemState::Completed)
                    .await?;
                if let Some(payload) = payload {
                    if let Value::Object(fields) = &payload {
                        let mut vars = wf.context().get_all_vars().await?;
                        vars.extend(fields.clone());
                        wf.context().set_all_vars(vars).await?;
                    }
                    self.store
                        .set_work_item_payload(&workflow_id, &work_item_id, payload)
                        .await?;
                }
                if self.firing_settled(&wf, &item).await? {
                    self.complete(&wf, &item.task_name, syscall).await?;
                }
                Ok(None)
            }
            Request::CancelWorkItem { workflow_id, work_item_id } => {
                let wf = self.running(&workflow_id).await?;
                let item = self
                    .transition_work_item(&wf, &work_item_id, WorkItemState::Canceled)
                    .await?;
                if self.firing_settled(&wf, &item).await? {
                    let siblings = self.store.work_items_for_task(&workflow_id, &item.task_name).await?;
                    let any_completed = siblings
                        .iter()
                        .any(|i| i.generation == item.generation && i.state == WorkItemState::Completed);
                    if any_completed {
                        self.complete(&wf, &item.task_name, syscall).await?;
                    } else {
                        wf.task(&item.task_name)?.cancel().await?;
                    }
                }
                Ok(None)
            }
            Request::FailWorkItem { workflow_id, work_item_id, reason } => {
                let wf = self.running(&workflow_id).await?;
                let item = self
                    .transition_work_item(&wf, &work_item_id, WorkItemState::Failed)
                    .await?;
                let task = wf.task(&item.task_name)?;
                if task.state().await? == TaskState::Active {
                    task.fail().await?;
                }
                warn!(workflow_id = %workflow_id, work_item_id = %work_item_id, reason = %reason, "work item failed");
                self.fail_chain(&workflow_id).await?;
                Ok(None)
            }
            Request::ChildFinished { workflow_id, task, child_id, outcome } => {
                let wf = self.workflow(&workflow_id).await?;
                if wf.state().await? != WorkflowState::Running
                    || wf.task(&task)?.state().await? != TaskState::Active
                {
                    debug!(workflow_id = %workflow_id, task = %task, child_id = %child_id, "nested result ignored");
                    return Ok(None);
                }
                match outcome {
                    WorkflowState::Completed => {
                        let child_vars = self.store.get_vars(&child_id).await?;
                        let mut vars = wf.context().get_all_vars().await?;
                        vars.extend(child_vars);
                        wf.context().set_all_vars(vars).await?;
                        self.complete(&wf, &task, syscall).await?;
                    }
                    WorkflowState::Canceled => wf.task(&task)?.cancel().await?,
                    WorkflowState::Failed => {
                        wf.task(&task)?.fail().await?;
                        self.fail_chain(&workflow_id).await?;
                    }
                    WorkflowState::Running => {}
                }
                Ok(None)
            }
        }
    }

    async fn running(&self, workflow_id: &str) -> Result<Workflow> {
        let wf = self.workflow(workflow_id).await?;
        let state = wf.state().await?;
        if state != WorkflowState::Running {
            return Err(EngineError::invalid_transition(
                EntityKind::Workflow,
                workflow_id,
                state,
                WorkflowState::Running,
            ));
        }
        Ok(wf)
    }

    async fn fire(&self, workflow_id: &str, name: &str, syscall: &mut EngineSyscall) -> Result<String> {
        let wf = self.running(workflow_id).await?;
        let task = wf.task(name)?;
        let def = task.def();
        // Resolve collaborators before touching state.
        let subnet = def.subnet.as_deref().map(|id| self.net(id)).transpose()?;
        let activity = self.activity_for(def)?;

        let generation = task.activate().await?;

        let (id, work_item) = match subnet {
            Some(net) => {
                let child_id = format!("{}.{}.{}", workflow_id, name, self.ids.next_id());
                let vars = wf.context().get_all_vars().await?;
                let parent = ParentRef {
                    workflow_id: workflow_id.to_string(),
                    task: name.to_string(),
                };
                Workflow::initialize(wf.context().for_instance(child_id.clone(), net), Some(parent), vars).await?;
                syscall.request(Request::StartWorkflow { workflow_id: child_id.clone() });
                debug!(workflow_id = %workflow_id, task = %name, child_id = %child_id, "nested workflow spawned");
                (child_id, false)
            }
            None => {
                let record = WorkItemRecord {
                    id: self.ids.next_id(),
                    task_name: name.to_string(),
                    generation,
                    state: WorkItemState::Initialized,
                    payload: Value::Null,
                };
                self.store.create_work_item(workflow_id, record.clone()).await?;
                wf.context().emit(StateChange::WorkItemState {
                    workflow_id: workflow_id.to_string(),
                    work_item_id: record.id.clone(),
                    task: record.task_name,
                    state: record.state,
                });
                (record.id, true)
            }
        };

        if let Some(activity) = activity {
            let work_item_id = work_item.then_some(id.as_str());
            self.run_activity(&wf, def, activity, generation, work_item_id, Hook::Fire, syscall)
                .await?;
        }
        Ok(id)
    }

    async fn complete(&self, wf: &Workflow, name: &str, syscall: &mut EngineSyscall) -> Result<()> {
        let task = wf.task(name)?;
        let def = task.def();
        let record = task.record().await?;
        if !record.state.can_transition_to(TaskState::Completed) {
            return Err(EngineError::invalid_transition(
                EntityKind::Task,
                name,
                record.state,
                TaskState::Completed,
            ));
        }
        if let Some(activity) = self.activity_for(def)? {
            self.run_activity(wf, def, activity, record.generation, None, Hook::Complete, syscall)
                .await?;
        }

        let mut cancelled = task.complete().await?;
        if def.is_composite() {
            cancelled.push(name.to_string());
        }
        self.cancel_nested(wf.id(), &cancelled).await
    }

    fn activity_for(&self, def: &TaskDef) -> Result<Option<Arc<dyn TaskActivity>>> {
        def.activity
            .as_deref()
            .map(|name| {
                self.activities
                    .get(name)
                    .map(|a| a.value().clone())
                    .ok_or_else(|| EngineError::not_found(EntityKind::Activity, name))
            })
            .transpose()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_activity(
        &self,
        wf: &Workflow,
        def: &TaskDef,
        activity: Arc<dyn TaskActivity>,
        generation: u32,
        work_item_id: Option<&str>,
        hook: Hook,
        syscall: &mut EngineSyscall,
    ) -> Result<()> {
        let activity_ctx = ActivityContext {
            ctx: wf.context(),
            task: &def.name,
            generation,
            params: &def.params,
            work_item_id,
        };
        let result = match hook {
            Hook::Fire => activity.on_fire(&activity_ctx, syscall).await,
            Hook::Complete => activity.on_complete(&activity_ctx, syscall).await,
        };
        result.map_err(|e| EngineError::Activity {
            task: def.name.clone(),
            message: format!("{:#}", e),
        })
    }

    async fn transition_work_item(&self, wf: &Workflow, id: &str, state: WorkItemState) -> Result<WorkItemRecord> {
        let record = self.store.update_work_item_state(wf.id(), id, state).await?;
        wf.context().emit(StateChange::WorkItemState {
            workflow_id: wf.id().to_string(),
            work_item_id: record.id.clone(),
            task: record.task_name.clone(),
            state: record.state,
        });
        Ok(record)
    }

    /// True when the task is still active and every work item of this firing is final.
    async fn firing_settled(&self, wf: &Workflow, item: &WorkItemRecord) -> Result<bool> {
        if wf.task(&item.task_name)?.state().await? != TaskState::Active {
            return Ok(false);
        }
        let items = self.store.work_items_for_task(wf.id(), &item.task_name).await?;
        Ok(items
            .iter()
            .filter(|i| i.generation == item.generation)
            .all(|i| i.state.is_final()))
    }

    /// Completion detection and the OR-join sweep, after every drained request.
    async fn settle(&self, workflow_id: &str, syscall: &mut EngineSyscall) -> Result<()> {
        let wf = self.workflow(workflow_id).await?;
        if wf.state().await? != WorkflowState::Running {
            return Ok(());
        }
        if wf.is_end_reached().await? {
            let leftovers = wf.complete().await?;
            self.cancel_nested(workflow_id, &leftovers).await?;
            self.notify_parent(&wf, WorkflowState::Completed, syscall).await?;
            info!(workflow_id = %workflow_id, "workflow completed");
            return Ok(());
        }
        wf.reevaluate_or_joins().await
    }

    async fn notify_parent(&self, wf: &Workflow, outcome: WorkflowState, syscall: &mut EngineSyscall) -> Result<()> {
        if let Some(parent) = wf.record().await?.parent {
            syscall.request(Request::ChildFinished {
                workflow_id: parent.workflow_id,
                task: parent.task,
                child_id: wf.id().to_string(),
                outcome,
            });
        }
        Ok(())
    }

    /// Cancels running nested instances spawned by `tasks`, and theirs, depth first.
    async fn cancel_nested(&self, workflow_id: &str, tasks: &[String]) -> Result<()> {
        let mut pending = self.running_children(workflow_id, tasks).await?;
        while let Some(child_id) = pending.pop() {
            let child = self.workflow(&child_id).await?;
            if child.state().await? != WorkflowState::Running {
                continue;
            }
            let active = child.cancel().await?;
            debug!(workflow_id = %child_id, "nested workflow cancelled");
            pending.extend(self.running_children(&child_id, &active).await?);
        }
        Ok(())
    }

    async fn running_children(&self, workflow_id: &str, tasks: &[String]) -> Result<Vec<String>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .store
            .list_children(workflow_id)
            .await?
            .into_iter()
            .filter(|c| c.state == WorkflowState::Running)
            .filter(|c| c.parent.as_ref().is_some_and(|p| tasks.contains(&p.task)))
            .map(|c| c.id)
            .collect())
    }

    /// Fails the instance and every running ancestor. Runs inline: once an instance
    /// fails, nothing else queued in this drain is executed.
    async fn fail_chain(&self, workflow_id: &str) -> Result<()> {
        let mut current = Some(workflow_id.to_string());
        while let Some(id) = current.take() {
            let wf = self.workflow(&id).await?;
            if wf.state().await? != WorkflowState::Running {
                break;
            }
            let active = wf.fail().await?;
            self.cancel_nested(&id, &active).await?;
            error!(workflow_id = %id, "workflow failed");

            if let Some(parent) = wf.record().await?.parent {
                let parent_wf = self.workflow(&parent.workflow_id).await?;
                let task = parent_wf.task(&parent.task)?;
                if task.state().await? == TaskState::Active {
                    task.fail().await?;
                }
                current = Some(parent.workflow_id);
            }
        }
        Ok(())
    }
}

/// Nested instance ids are `{parent}.{task}.{n}`; the root is the leading segment.
fn root_of(workflow_id: &str) -> &str {
    workflow_id.split('.').next().unwrap_or(workflow_id)
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
