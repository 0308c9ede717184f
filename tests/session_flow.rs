use async_trait::async_trait;
use screen_copilot::agent::{SessionSnapshot, SnapshotStore};
use screen_copilot::{
    Coordinates, DriverError, InMemorySessionStore, LocateOutcome, LocateRequest, Locator, Plan,
    PlanRequest, Planner, PlannerError, Screenshot, SessionDriver, SessionPhase, SessionStatus,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Plans handed out in order, keyed by goal so concurrent sessions stay apart.
#[derive(Default)]
struct ScriptedPlanner {
    scripts: Mutex<HashMap<String, VecDeque<Result<Plan, PlannerError>>>>,
    calls: AtomicUsize,
}

impl ScriptedPlanner {
    fn script(&self, goal: &str, plans: Vec<Result<Plan, PlannerError>>) {
        self.scripts.lock().unwrap().insert(goal.to_string(), plans.into());
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan, PlannerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&request.goal)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Err(PlannerError::Provider("no plan scripted".into())))
    }
}

#[derive(Default)]
struct ScriptedLocator {
    outcomes: Mutex<VecDeque<LocateOutcome>>,
    requests: Mutex<Vec<LocateRequest>>,
}

impl ScriptedLocator {
    fn push(&self, outcome: LocateOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Locator for ScriptedLocator {
    async fn locate(&self, request: &LocateRequest) -> LocateOutcome {
        self.requests.lock().unwrap().push(request.clone());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(LocateOutcome::CallFailed { error: "no outcome scripted".into() })
    }
}

#[derive(Default)]
struct RecordingSnapshots {
    saved: Mutex<Vec<(String, Option<usize>, usize)>>,
}

#[async_trait]
impl SnapshotStore for RecordingSnapshots {
    async fn save(
        &self,
        session_id: &str,
        step: Option<usize>,
        screenshot: &Screenshot,
    ) -> Result<(), DriverError> {
        self.saved.lock().unwrap().push((session_id.to_string(), step, screenshot.len()));
        Ok(())
    }
}

fn plan(step: &str, description: &str, is_complete: bool) -> Result<Plan, PlannerError> {
    Ok(Plan { step: step.into(), description: description.into(), is_complete })
}

fn shot(bytes: &[u8]) -> Screenshot {
    Screenshot::from(bytes)
}

type Driver = SessionDriver<Arc<ScriptedPlanner>, Arc<ScriptedLocator>, Arc<InMemorySessionStore>>;

fn driver() -> (Driver, Arc<ScriptedPlanner>, Arc<ScriptedLocator>, Arc<InMemorySessionStore>) {
    let planner = Arc::new(ScriptedPlanner::default());
    let locator = Arc::new(ScriptedLocator::default());
    let store = Arc::new(InMemorySessionStore::default());
    let driver = SessionDriver::new(planner.clone(), locator.clone(), store.clone());
    (driver, planner, locator, store)
}

fn active(status: SessionStatus) -> SessionSnapshot {
    match status {
        SessionStatus::Active(snapshot) => snapshot,
        SessionStatus::NoSession => panic!("expected an active session"),
    }
}

#[tokio::test]
async fn degraded_locate_is_recovered_from_prose() {
    let (driver, planner, locator, _) = driver();
    planner.script("open settings", vec![plan("click gear icon", "home screen shown", false)]);
    locator.push(LocateOutcome::Decoding {
        error: "tool input missing".into(),
        raw: Some("The gear icon is at approximately 940, 30".into()),
    });

    let resp = driver.initialize("open settings", shot(b"home")).await.unwrap();

    assert_eq!(resp.step, "click gear icon");
    assert_eq!(resp.description, "home screen shown");
    assert_eq!(resp.coordinates, Some(Coordinates::new(940, 30)));
    assert!(!resp.is_complete);

    let snap = active(driver.status(&resp.session_id).await.unwrap());
    assert_eq!(snap.current_step.as_deref(), Some("click gear icon"));
    assert_eq!(snap.coordinates, Some(Coordinates::new(940, 30)));
    assert_eq!(snap.phase, SessionPhase::AwaitingScreenshot);
    assert!(!snap.is_complete);
}

#[tokio::test]
async fn completion_on_advance_skips_locate() {
    let (driver, planner, locator, _) = driver();
    planner.script(
        "open settings",
        vec![
            plan("click gear icon", "home screen shown", false),
            plan("done", "settings are open", true),
        ],
    );
    locator.push(LocateOutcome::Structured { coordinates: Coordinates::new(940, 30), raw: None });

    let first = driver.initialize("open settings", shot(b"home")).await.unwrap();
    let last = driver.advance(&first.session_id, shot(b"settings")).await.unwrap();

    assert!(last.is_complete);
    assert_eq!(last.coordinates, None);
    assert_eq!(locator.calls(), 1);

    let snap = active(driver.status(&first.session_id).await.unwrap());
    assert_eq!(snap.phase, SessionPhase::Complete);
    assert_eq!(snap.step_history_count, 1);
}

#[tokio::test]
async fn completed_session_rejects_further_screenshots() {
    let (driver, planner, _, _) = driver();
    planner.script("nothing to do", vec![plan("done", "already there", true)]);

    let resp = driver.initialize("nothing to do", shot(b"screen")).await.unwrap();
    assert!(resp.is_complete);

    let err = driver.advance(&resp.session_id, shot(b"again")).await.unwrap_err();
    assert_eq!(err, DriverError::SessionComplete(resp.session_id.clone()));
    assert_eq!(planner.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn advancing_unknown_session_is_a_precondition_failure() {
    let (driver, planner, _, store) = driver();

    let err = driver.advance("missing", shot(b"x")).await.unwrap_err();

    assert_eq!(err, DriverError::SessionNotFound("missing".into()));
    assert_eq!(planner.calls.load(Ordering::SeqCst), 0);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn history_grows_once_per_cycle_and_coordinates_follow_the_screenshot() {
    let (driver, planner, locator, _) = driver();
    planner.script(
        "send email",
        vec![
            plan("click compose", "inbox", false),
            plan("type address", "compose window", false),
            plan("click send", "draft ready", false),
        ],
    );
    locator.push(LocateOutcome::Structured { coordinates: Coordinates::new(50, 60), raw: None });
    locator.push(LocateOutcome::CallFailed { error: "timeout after 60s".into() });
    locator.push(LocateOutcome::Decoding { error: "bad".into(), raw: None });

    let first = driver.initialize("send email", shot(b"one")).await.unwrap();
    let second = driver.advance(&first.session_id, shot(b"two")).await.unwrap();
    let third = driver.advance(&first.session_id, shot(b"three")).await.unwrap();

    assert_eq!(first.coordinates, Some(Coordinates::new(50, 60)));
    assert_eq!(second.coordinates, Some(Coordinates::FALLBACK));
    assert_eq!(third.coordinates, Some(Coordinates::FALLBACK));
    assert_eq!(active(driver.status(&first.session_id).await.unwrap()).step_history_count, 2);

    let requests = locator.requests.lock().unwrap();
    assert_eq!(requests[1].step, "type address");
    assert_eq!(requests[1].screenshot.as_bytes(), b"two");
    assert_eq!(requests[2].description, "draft ready");
}

#[tokio::test]
async fn reset_discards_the_session() {
    let (driver, planner, locator, _) = driver();
    planner.script("goal", vec![plan("click", "screen", false)]);
    locator.push(LocateOutcome::Structured { coordinates: Coordinates::new(1, 1), raw: None });

    let resp = driver.initialize("goal", shot(b"s")).await.unwrap();
    assert!(driver.reset(&resp.session_id).await.unwrap());
    assert!(!driver.reset(&resp.session_id).await.unwrap());

    assert_eq!(driver.status(&resp.session_id).await.unwrap(), SessionStatus::NoSession);
    assert!(matches!(
        driver.advance(&resp.session_id, shot(b"t")).await,
        Err(DriverError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn initialize_with_same_id_replaces_the_session() {
    let (driver, planner, locator, store) = driver();
    planner.script("first goal", vec![plan("a", "x", false)]);
    planner.script("second goal", vec![plan("b", "y", false)]);
    locator.push(LocateOutcome::Structured { coordinates: Coordinates::new(1, 2), raw: None });
    locator.push(LocateOutcome::Structured { coordinates: Coordinates::new(3, 4), raw: None });

    driver.initialize_with_id("main", "first goal", shot(b"1")).await.unwrap();
    let resp = driver.initialize_with_id("main", "second goal", shot(b"2")).await.unwrap();

    assert_eq!(resp.session_id, "main");
    let snap = active(driver.status("main").await.unwrap());
    assert_eq!(snap.goal, "second goal");
    assert_eq!(snap.coordinates, Some(Coordinates::new(3, 4)));
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn concurrent_sessions_stay_isolated() {
    let (driver, planner, locator, store) = driver();
    for i in 0..4 {
        planner.script(&format!("goal {}", i), vec![plan(&format!("step {}", i), "screen", false)]);
        locator.push(LocateOutcome::Structured { coordinates: Coordinates::new(i, i), raw: None });
    }

    let driver = &driver;
    let responses = futures::future::join_all((0..4).map(|i| async move {
        let id = format!("s{}", i);
        let goal = format!("goal {}", i);
        driver.initialize_with_id(&id, &goal, shot(b"screen")).await
    }))
    .await;

    assert_eq!(store.len().await, 4);
    for (i, resp) in responses.into_iter().enumerate() {
        let resp = resp.unwrap();
        assert_eq!(resp.session_id, format!("s{}", i));
        assert_eq!(resp.step, format!("step {}", i));
        let snap = active(driver.status(&resp.session_id).await.unwrap());
        assert_eq!(snap.goal, format!("goal {}", i));
    }
}

#[tokio::test]
async fn screenshots_go_to_the_snapshot_sink() {
    let planner = Arc::new(ScriptedPlanner::default());
    let locator = Arc::new(ScriptedLocator::default());
    let sink = Arc::new(RecordingSnapshots::default());
    let driver = SessionDriver::with_defaults(planner.clone(), locator.clone())
        .with_snapshot_store(sink.clone());
    planner.script("goal", vec![plan("a", "x", false), plan("b", "y", false)]);
    locator.push(LocateOutcome::Structured { coordinates: Coordinates::new(1, 2), raw: None });
    locator.push(LocateOutcome::Structured { coordinates: Coordinates::new(3, 4), raw: None });

    let resp = driver.initialize("goal", shot(b"first")).await.unwrap();
    driver.advance(&resp.session_id, shot(b"second!")).await.unwrap();

    let saved = sink.saved.lock().unwrap().clone();
    assert_eq!(
        saved,
        vec![(resp.session_id.clone(), None, 5), (resp.session_id.clone(), Some(1), 7)]
    );
}

/// Sleeps inside `plan` and records how many calls overlapped.
#[derive(Default)]
struct SlowPlanner {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl Planner for SlowPlanner {
    async fn plan(&self, _request: &PlanRequest) -> Result<Plan, PlannerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        plan(&format!("step {}", n), "screen", false)
    }
}

#[tokio::test]
async fn same_session_calls_run_one_at_a_time() {
    let planner = Arc::new(SlowPlanner::default());
    let locator = Arc::new(ScriptedLocator::default());
    for i in 0..3 {
        locator.push(LocateOutcome::Structured { coordinates: Coordinates::new(i, i), raw: None });
    }
    let driver = SessionDriver::with_defaults(planner.clone(), locator.clone());

    let first = driver.initialize("goal", shot(b"start")).await.unwrap();
    let (a, b) = tokio::join!(
        driver.advance(&first.session_id, shot(b"a")),
        driver.advance(&first.session_id, shot(b"b")),
    );

    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(planner.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(active(driver.status(&first.session_id).await.unwrap()).step_history_count, 2);
}
