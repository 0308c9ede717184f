use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::resolver::CoordinateResolver;
use crate::state::{Coordinates, Plan, Screenshot, SessionState};

// ========================= Core Types =========================

#[derive(Clone, Debug)]
pub struct PlanRequest {
    pub goal: String,
    pub screenshot: Screenshot,
    pub step_history: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct LocateRequest {
    pub step: String,
    pub description: String,
    pub screenshot: Screenshot,
}

/// Every way a locate call can end. The raw text is kept even when the
/// structured result decoded cleanly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocateOutcome {
    Structured {
        coordinates: Coordinates,
        raw: Option<String>,
    },
    Decoding {
        error: String,
        raw: Option<String>,
    },
    CallFailed {
        error: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Planning,
    Locating,
    AwaitingScreenshot,
    Complete,
}

/// A stored session. Absence from the store is the uninitialized state.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: String,
    pub phase: SessionPhase,
    pub state: SessionState,
    pub created_at_ms: u128,
    pub updated_at_ms: u128,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResponse {
    pub session_id: String,
    pub step: String,
    pub description: String,
    pub coordinates: Option<Coordinates>,
    pub is_complete: bool,
}

impl StepResponse {
    fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            step: session.state.current_step.clone().unwrap_or_default(),
            description: session.state.step_description.clone().unwrap_or_default(),
            coordinates: session.state.coordinates,
            is_complete: session.state.is_complete,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub phase: SessionPhase,
    pub goal: String,
    pub current_step: Option<String>,
    pub step_description: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub is_complete: bool,
    pub step_history_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    NoSession,
    Active(SessionSnapshot),
}

// ========================= Errors =========================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlannerError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("planner response could not be decoded: {0}")]
    Decoding(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("no active session {0}")]
    SessionNotFound(String),
    #[error("session {0} is already complete")]
    SessionComplete(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("planning failed: {0}")]
    Planner(#[from] PlannerError),
    #[error("store error: {0}")]
    Store(String),
}

// ========================= Pluggable Subsystems =========================

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan, PlannerError>;
}

#[async_trait]
pub trait Locator: Send + Sync {
    /// Infallible by signature: failures come back as [`LocateOutcome::CallFailed`].
    async fn locate(&self, request: &LocateRequest) -> LocateOutcome;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, DriverError>;
    async fn put(&self, session: Session) -> Result<(), DriverError>;
    async fn remove(&self, session_id: &str) -> Result<bool, DriverError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(
        &self,
        session_id: &str,
        step: Option<usize>,
        screenshot: &Screenshot,
    ) -> Result<(), DriverError>;
}

#[async_trait]
impl<T: Planner + ?Sized> Planner for Arc<T> {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan, PlannerError> {
        (**self).plan(request).await
    }
}

#[async_trait]
impl<T: Locator + ?Sized> Locator for Arc<T> {
    async fn locate(&self, request: &LocateRequest) -> LocateOutcome {
        (**self).locate(request).await
    }
}

#[async_trait]
impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, DriverError> {
        (**self).get(session_id).await
    }

    async fn put(&self, session: Session) -> Result<(), DriverError> {
        (**self).put(session).await
    }

    async fn remove(&self, session_id: &str) -> Result<bool, DriverError> {
        (**self).remove(session_id).await
    }
}

// ========================= Session Driver =========================

pub struct SessionDriver<P, L, S = InMemorySessionStore>
where
    P: Planner,
    L: Locator,
    S: SessionStore,
{
    planner: P,
    resolver: CoordinateResolver<L>,
    store: S,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<P, L, S> SessionDriver<P, L, S>
where
    P: Planner,
    L: Locator,
    S: SessionStore,
{
    pub fn new(planner: P, locator: L, store: S) -> Self {
        Self {
            planner,
            resolver: CoordinateResolver::new(locator),
            store,
            snapshot_store: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    /// Starts a session under a fresh id and produces its first step.
    pub async fn initialize(
        &self,
        goal: &str,
        screenshot: Screenshot,
    ) -> Result<StepResponse, DriverError> {
        let session_id = nanoid!();
        self.initialize_with_id(&session_id, goal, screenshot).await
    }

    /// Like [`initialize`](Self::initialize), replacing whatever session was
    /// stored under `session_id`.
    pub async fn initialize_with_id(
        &self,
        session_id: &str,
        goal: &str,
        screenshot: Screenshot,
    ) -> Result<StepResponse, DriverError> {
        if goal.trim().is_empty() {
            return Err(DriverError::InvalidInput("goal must not be empty".into()));
        }
        let lock = self.session_lock(session_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.initialize_locked(session_id, goal, screenshot).await
        };
        self.release_lock(session_id, lock).await;
        result
    }

    /// Feeds the screenshot taken after the pending step was performed and
    /// produces the next step. Nothing is stored if planning fails.
    pub async fn advance(
        &self,
        session_id: &str,
        screenshot: Screenshot,
    ) -> Result<StepResponse, DriverError> {
        let lock = self.session_lock(session_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.advance_locked(session_id, screenshot).await
        };
        self.release_lock(session_id, lock).await;
        result
    }

    async fn initialize_locked(
        &self,
        session_id: &str,
        goal: &str,
        screenshot: Screenshot,
    ) -> Result<StepResponse, DriverError> {
        info!(session_id, goal, screenshot_bytes = screenshot.len(), "session initializing");
        let state = SessionState::new(screenshot, goal);
        let now = now_ms();
        let session = self.cycle(session_id, state, now).await?;
        self.store.put(session.clone()).await?;
        self.save_snapshot(session_id, None, &session.state.screenshot).await;
        Ok(StepResponse::from_session(&session))
    }

    async fn advance_locked(
        &self,
        session_id: &str,
        screenshot: Screenshot,
    ) -> Result<StepResponse, DriverError> {
        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| DriverError::SessionNotFound(session_id.to_string()))?;
        if session.phase == SessionPhase::Complete {
            return Err(DriverError::SessionComplete(session_id.to_string()));
        }

        let state = session.state.with_screenshot(screenshot);
        info!(
            session_id,
            history = state.step_history.len(),
            screenshot_bytes = state.screenshot.len(),
            "session advancing"
        );
        let next = self.cycle(session_id, state, session.created_at_ms).await?;
        self.store.put(next.clone()).await?;
        self.save_snapshot(
            session_id,
            Some(next.state.step_history.len()),
            &next.state.screenshot,
        )
        .await;
        Ok(StepResponse::from_session(&next))
    }

    pub async fn status(&self, session_id: &str) -> Result<SessionStatus, DriverError> {
        let status = match self.store.get(session_id).await? {
            None => SessionStatus::NoSession,
            Some(session) => SessionStatus::Active(SessionSnapshot {
                session_id: session.id,
                phase: session.phase,
                goal: session.state.goal,
                current_step: session.state.current_step,
                step_description: session.state.step_description,
                coordinates: session.state.coordinates,
                is_complete: session.state.is_complete,
                step_history_count: session.state.step_history.len(),
            }),
        };
        Ok(status)
    }

    /// Returns whether a session was discarded.
    pub async fn reset(&self, session_id: &str) -> Result<bool, DriverError> {
        let lock = self.session_lock(session_id).await;
        let removed = {
            let _guard = lock.lock().await;
            self.store.remove(session_id).await
        };
        self.release_lock(session_id, lock).await;
        let removed = removed?;
        info!(session_id, removed, "session reset");
        Ok(removed)
    }

    /// One plan-and-locate pass that is never stored.
    pub async fn probe(
        &self,
        goal: &str,
        screenshot: Screenshot,
    ) -> Result<StepResponse, DriverError> {
        if goal.trim().is_empty() {
            return Err(DriverError::InvalidInput("goal must not be empty".into()));
        }
        let probe_id = nanoid!();
        let state = SessionState::new(screenshot, goal);
        let session = self.cycle(&probe_id, state, now_ms()).await?;
        Ok(StepResponse::from_session(&session))
    }

    async fn cycle(
        &self,
        session_id: &str,
        state: SessionState,
        created_at_ms: u128,
    ) -> Result<Session, DriverError> {
        debug!(session_id, phase = ?SessionPhase::Planning, "planning");
        let request = PlanRequest {
            goal: state.goal.clone(),
            screenshot: state.screenshot.clone(),
            step_history: state.step_history.clone(),
        };
        let plan = match self.planner.plan(&request).await {
            Ok(plan) => plan,
            Err(err) => {
                warn!(session_id, "planning failed: {}", err);
                return Err(err.into());
            }
        };
        info!(session_id, step = %plan.step, is_complete = plan.is_complete, "plan received");
        let state = state.with_plan(&plan);

        if plan.is_complete {
            info!(session_id, phase = ?SessionPhase::Complete, "goal reported complete");
            return Ok(Session {
                id: session_id.to_string(),
                phase: SessionPhase::Complete,
                state,
                created_at_ms,
                updated_at_ms: now_ms(),
            });
        }

        debug!(session_id, phase = ?SessionPhase::Locating, "locating");
        let resolution = self
            .resolver
            .resolve_step(&state.screenshot, &plan.step, &plan.description)
            .await;
        info!(
            session_id,
            coordinates = %resolution.coordinates,
            source = ?resolution.source,
            phase = ?SessionPhase::AwaitingScreenshot,
            "step located"
        );
        Ok(Session {
            id: session_id.to_string(),
            phase: SessionPhase::AwaitingScreenshot,
            state: state.with_coordinates(resolution.coordinates),
            created_at_ms,
            updated_at_ms: now_ms(),
        })
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the map entry once no other call holds or waits on it, so the
    /// map only ever contains ids with a call in flight.
    async fn release_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().await;
        if locks.get(session_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(session_id);
        }
    }

    async fn save_snapshot(&self, session_id: &str, step: Option<usize>, screenshot: &Screenshot) {
        if let Some(store) = &self.snapshot_store {
            if let Err(err) = store.save(session_id, step, screenshot).await {
                warn!(session_id, "snapshot not saved: {}", err);
            }
        }
    }
}

impl<P: Planner, L: Locator> SessionDriver<P, L, InMemorySessionStore> {
    pub fn with_defaults(planner: P, locator: L) -> Self {
        Self::new(planner, locator, InMemorySessionStore::default())
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

// ========================= Defaults & Helpers =========================

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, DriverError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn put(&self, session: Session) -> Result<(), DriverError> {
        self.sessions.write().await.insert(session.id.clone(), session);
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<bool, DriverError> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }
}

/// Writes every screenshot a session receives under `<base>/<session_id>/`.
pub struct DiskSnapshotStore {
    base_dir: PathBuf,
}

impl DiskSnapshotStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }

    pub fn path_for(&self, session_id: &str, step: Option<usize>) -> PathBuf {
        let name = match step {
            Some(s) => format!("step_{:03}.png", s),
            None => "start.png".to_string(),
        };
        self.base_dir.join(session_id).join(name)
    }
}

#[async_trait]
impl SnapshotStore for DiskSnapshotStore {
    async fn save(
        &self,
        session_id: &str,
        step: Option<usize>,
        screenshot: &Screenshot,
    ) -> Result<(), DriverError> {
        if screenshot.is_empty() {
            return Ok(());
        }
        let dir = self.base_dir.join(session_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| DriverError::Store(format!("create_dir: {}", e)))?;
        let path = self.path_for(session_id, step);
        async_fs::write(&path, screenshot.as_bytes())
            .await
            .map_err(|e| DriverError::Store(format!("write: {}", e)))?;
        debug!(path = %path.display(), "snapshot saved");
        Ok(())
    }
}
