//! End-to-end tests of the deduplication hooks.
//!
//! Tests: JobClient → schedule hook → InMemoryJobStore → JobExecutor →
//! perform hook → handler
//!
//! Verifies:
//! - Duplicates are dropped while the owner holds the key
//! - The key is always released, whatever the handler does
//! - Follow-up runs, TTL bounds, WAL propagation and fail-open behavior

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use dupguard_core::{Clock, ManualClock, WalLocations};

use crate::config::DedupConfig;
use crate::coordination::{CoordinationStore, InMemoryCoordinationStore, StoreError};
use crate::dedup::{DedupMiddleware, DedupOptions, IdempotencyKey, ScheduleOutcome};
use crate::jobs::{
    ExecutionContext, InMemoryJobStore, Job, JobClient, JobError, JobExecutor, JobResult,
    JobStatus, JobStore,
};
use crate::lock::LockRetryPolicy;
use crate::test_support::{t0, FailingStore, RecordingStore};

struct Harness {
    clock: Arc<ManualClock>,
    jobs: Arc<InMemoryJobStore>,
    client: JobClient<Arc<InMemoryJobStore>>,
    executor: JobExecutor<Arc<InMemoryJobStore>>,
}

impl Harness {
    fn with_store(
        clock: Arc<ManualClock>,
        coordination: Arc<dyn CoordinationStore>,
        config: DedupConfig,
        registrations: Vec<(&str, DedupOptions)>,
    ) -> Self {
        let mut middleware = DedupMiddleware::new(coordination, clock.clone(), config);
        for (job_type, options) in registrations {
            middleware.register(job_type, options).unwrap();
        }
        let middleware = Arc::new(middleware);

        let jobs = InMemoryJobStore::arc();
        Self {
            clock,
            client: JobClient::new(jobs.clone(), middleware.clone()),
            executor: JobExecutor::new(jobs.clone(), middleware),
            jobs,
        }
    }

    fn new(registrations: Vec<(&str, DedupOptions)>) -> (Self, Arc<InMemoryCoordinationStore>) {
        Self::with_config(DedupConfig::default(), registrations)
    }

    fn with_config(
        config: DedupConfig,
        registrations: Vec<(&str, DedupOptions)>,
    ) -> (Self, Arc<InMemoryCoordinationStore>) {
        let clock = ManualClock::arc(t0());
        let coordination = Arc::new(InMemoryCoordinationStore::with_clock(clock.clone()));
        let harness = Self::with_store(clock, coordination.clone(), config, registrations);
        (harness, coordination)
    }

    fn job(&self, job_type: &str, args: Value) -> Job {
        Job::new_at(job_type, args, self.clock.now())
    }

    /// Claim the next ready job and run it.
    fn run_next(&self) -> (Job, Result<(), JobError>) {
        let mut job = self
            .jobs
            .claim_next(self.clock.now())
            .unwrap()
            .expect("a ready job");
        let result = self.executor.execute_one(&mut job);
        (job, result)
    }
}

fn storage_key(job_type: &str, args: &Value) -> String {
    IdempotencyKey::derive(job_type, args, None).storage_key("dupguard")
}

#[test]
fn unique_jobs_pass_through_and_release_their_key() {
    let (mut h, coordination) = Harness::new(vec![("SyncAccount", DedupOptions::until_executed())]);
    let calls = Arc::new(Mutex::new(0));
    let seen = calls.clone();
    h.executor.register_handler("SyncAccount", move |_job, _ctx| {
        *seen.lock().unwrap() += 1;
        JobResult::Success
    });

    let job = h.job("SyncAccount", json!({"account": 1}));
    assert_eq!(h.client.push(job.clone()).unwrap(), ScheduleOutcome::Enqueued(job.id));

    let (ran, result) = h.run_next();
    assert!(result.is_ok());
    assert_eq!(ran.status, JobStatus::Completed);
    assert_eq!(*calls.lock().unwrap(), 1);
    assert!(coordination.is_empty());
}

#[test]
fn until_executed_drops_duplicates_until_the_owner_finishes() {
    let (mut h, _) = Harness::new(vec![("SyncAccount", DedupOptions::until_executed())]);
    h.executor.register_handler("SyncAccount", |_job, _ctx| JobResult::Success);
    let args = json!({"account": 1});

    let owner = h.job("SyncAccount", args.clone());
    h.client.push(owner.clone()).unwrap();

    match h.client.push(h.job("SyncAccount", args.clone())).unwrap() {
        ScheduleOutcome::Dropped { job, duplicate_of } => {
            assert_eq!(duplicate_of, owner.id.to_string());
            assert_eq!(job.duplicate_of.as_deref(), Some(duplicate_of.as_str()));
        }
        other => panic!("expected drop, got {other:?}"),
    }

    // Other arguments are a different key.
    assert!(!h.client.push(h.job("SyncAccount", json!({"account": 2}))).unwrap().is_dropped());

    let ran: Vec<_> = (0..2).map(|_| h.run_next().0.id).collect();
    assert!(ran.contains(&owner.id));

    // Owner done: the same arguments are accepted again.
    assert!(!h.client.push(h.job("SyncAccount", args)).unwrap().is_dropped());
    assert_eq!(h.jobs.list_by_type("SyncAccount").len(), 3);
}

#[test]
fn key_is_released_when_the_handler_fails() {
    let (mut h, coordination) = Harness::new(vec![("SyncAccount", DedupOptions::until_executed())]);
    h.executor
        .register_handler("SyncAccount", |_job, _ctx| JobResult::Failure("upstream timeout".into()));
    let args = json!({"account": 1});

    h.client.push(h.job("SyncAccount", args.clone())).unwrap();
    let (ran, result) = h.run_next();

    assert_eq!(result, Err(JobError::Failed("upstream timeout".into())));
    assert!(matches!(ran.status, JobStatus::Failed { .. }));
    assert!(coordination.is_empty());
    assert!(!h.client.push(h.job("SyncAccount", args)).unwrap().is_dropped());
}

#[test]
fn key_is_released_when_the_handler_panics() {
    let (mut h, coordination) = Harness::new(vec![("SyncAccount", DedupOptions::until_executed())]);
    h.executor
        .register_handler("SyncAccount", |_job, _ctx| panic!("handler exploded"));

    h.client.push(h.job("SyncAccount", json!({"account": 1}))).unwrap();
    let (_, result) = h.run_next();

    assert_eq!(result, Err(JobError::Panicked));
    assert!(coordination.is_empty());
}

#[test]
fn key_is_released_when_no_handler_is_registered() {
    let (h, coordination) = Harness::new(vec![("Orphan", DedupOptions::until_executed())]);
    let args = json!({"account": 1});

    h.client.push(h.job("Orphan", args.clone())).unwrap();
    let (ran, result) = h.run_next();

    assert_eq!(result, Err(JobError::NoHandler("Orphan".into())));
    assert!(matches!(ran.status, JobStatus::Failed { .. }));
    assert!(coordination.is_empty());
    assert!(!h.client.push(h.job("Orphan", args)).unwrap().is_dropped());
    assert_eq!(h.jobs.pending_count().unwrap(), 1);
}

#[test]
fn dropped_duplicate_triggers_exactly_one_follow_up_run() {
    let (mut h, coordination) = Harness::new(vec![(
        "RefreshCache",
        DedupOptions::until_executed().reschedule_once(),
    )]);
    h.executor.register_handler("RefreshCache", |_job, _ctx| JobResult::Success);
    let args = json!({"cache": "pricing"});

    let owner = h.job("RefreshCache", args.clone());
    h.client.push(owner.clone()).unwrap();
    assert!(h.client.push(h.job("RefreshCache", args.clone())).unwrap().is_dropped());
    assert!(h.client.push(h.job("RefreshCache", args.clone())).unwrap().is_dropped());

    let (ran, result) = h.run_next();
    assert_eq!(ran.id, owner.id);
    assert!(result.is_ok());

    // One follow-up, queued under the released key rather than dropped.
    let queued = h.jobs.list_by_type("RefreshCache");
    assert_eq!(queued.len(), 2);
    let follow_up = queued.iter().find(|j| j.id != owner.id).unwrap();
    assert_eq!(follow_up.args, args);
    assert_eq!(follow_up.status, JobStatus::Pending);
    assert_eq!(
        coordination.get(&storage_key("RefreshCache", &args)).unwrap(),
        Some(follow_up.id.to_string())
    );

    // Nothing was dropped meanwhile, so the follow-up does not reschedule.
    let (ran, result) = h.run_next();
    assert_eq!(ran.id, follow_up.id);
    assert!(result.is_ok());
    assert_eq!(h.jobs.list_by_type("RefreshCache").len(), 2);
    assert_eq!(h.jobs.pending_count().unwrap(), 0);
    assert!(coordination.is_empty());
}

#[test]
fn plain_drop_does_not_reschedule() {
    let (mut h, _) = Harness::new(vec![("SyncAccount", DedupOptions::until_executed())]);
    h.executor.register_handler("SyncAccount", |_job, _ctx| JobResult::Success);
    let args = json!({"account": 1});

    h.client.push(h.job("SyncAccount", args.clone())).unwrap();
    assert!(h.client.push(h.job("SyncAccount", args)).unwrap().is_dropped());
    h.run_next();

    assert_eq!(h.jobs.pending_count().unwrap(), 0);
    assert_eq!(h.jobs.list_by_type("SyncAccount").len(), 1);
}

#[test]
fn failed_owner_does_not_reschedule() {
    let (mut h, _) = Harness::new(vec![(
        "RefreshCache",
        DedupOptions::until_executed().reschedule_once(),
    )]);
    h.executor
        .register_handler("RefreshCache", |_job, _ctx| JobResult::Failure("nope".into()));
    let args = json!({"cache": "pricing"});

    h.client.push(h.job("RefreshCache", args.clone())).unwrap();
    assert!(h.client.push(h.job("RefreshCache", args)).unwrap().is_dropped());
    h.run_next();

    assert_eq!(h.jobs.pending_count().unwrap(), 0);
}

#[test]
fn scheduled_job_claims_key_until_its_run_time() {
    let clock = ManualClock::arc(t0());
    let inner = Arc::new(InMemoryCoordinationStore::with_clock(clock.clone()));
    let recording = Arc::new(RecordingStore::new(inner.clone()));
    let h = Harness::with_store(
        clock.clone(),
        recording.clone(),
        DedupConfig::default(),
        vec![("SendReport", DedupOptions::until_executed().including_scheduled())],
    );
    let args = json!({"report": "weekly"});
    let key = storage_key("SendReport", &args);

    let at = t0() + chrono::Duration::minutes(10);
    let job = h.job("SendReport", args.clone()).scheduled_at(at);
    h.client.push(job).unwrap();

    assert_eq!(recording.claims(), vec![(key.clone(), Duration::from_secs(600))]);
    assert_eq!(inner.ttl(&key).unwrap(), Some(Duration::from_secs(600)));

    // Duplicate scheduled for the same run is dropped.
    let again = h.job("SendReport", args.clone()).scheduled_at(at);
    assert!(h.client.push(again).unwrap().is_dropped());

    // Past the run time the claim lapses by itself.
    clock.advance(Duration::from_secs(601));
    assert!(inner.get(&key).unwrap().is_none());
}

#[test]
fn immediate_job_claims_key_for_the_configured_ttl() {
    let clock = ManualClock::arc(t0());
    let inner = Arc::new(InMemoryCoordinationStore::with_clock(clock.clone()));
    let recording = Arc::new(RecordingStore::new(inner));
    let h = Harness::with_store(
        clock,
        recording.clone(),
        DedupConfig::default(),
        vec![
            ("SyncAccount", DedupOptions::until_executed()),
            ("Ping", DedupOptions::until_executed().with_ttl(Duration::from_secs(30))),
        ],
    );

    h.client.push(h.job("SyncAccount", json!([1]))).unwrap();
    h.client.push(h.job("Ping", json!([1]))).unwrap();

    let ttls: Vec<_> = recording.claims().into_iter().map(|(_, ttl)| ttl).collect();
    assert_eq!(ttls, vec![Duration::from_secs(6 * 60 * 60), Duration::from_secs(30)]);
}

#[test]
fn scheduled_jobs_are_not_deduplicated_by_default() {
    let (h, coordination) = Harness::new(vec![("SendReport", DedupOptions::until_executed())]);
    let at = t0() + chrono::Duration::minutes(10);

    for _ in 0..2 {
        let job = h.job("SendReport", json!({"report": "weekly"})).scheduled_at(at);
        assert!(!h.client.push(job).unwrap().is_dropped());
    }
    assert!(coordination.is_empty());
}

#[test]
fn store_failure_fails_open() {
    let clock = ManualClock::arc(t0());
    let failing = Arc::new(FailingStore::new(StoreError::Connection("connection refused".into())));
    let mut h = Harness::with_store(
        clock,
        failing.clone(),
        DedupConfig::default(),
        vec![("SyncAccount", DedupOptions::until_executed().reschedule_once())],
    );
    h.executor.register_handler("SyncAccount", |_job, _ctx| JobResult::Success);
    let args = json!({"account": 1});

    assert!(!h.client.push(h.job("SyncAccount", args.clone())).unwrap().is_dropped());
    assert!(!h.client.push(h.job("SyncAccount", args)).unwrap().is_dropped());
    assert_eq!(h.jobs.pending_count().unwrap(), 2);

    assert!(h.run_next().1.is_ok());
    assert!(h.run_next().1.is_ok());
    assert!(failing.calls() > 0);
}

#[test]
fn send_welcome_email_until_executing() {
    let (mut h, coordination) =
        Harness::new(vec![("SendWelcomeEmail", DedupOptions::until_executing())]);
    let args = json!({"user": 42});
    let key = storage_key("SendWelcomeEmail", &args);

    // Job A claims the key; job B arrives 50ms later, before A runs.
    let a = h.job("SendWelcomeEmail", args.clone());
    h.client.push(a.clone()).unwrap();
    h.clock.advance(Duration::from_millis(50));
    let b = h.job("SendWelcomeEmail", args.clone());
    match h.client.push(b).unwrap() {
        ScheduleOutcome::Dropped { duplicate_of, .. } => assert_eq!(duplicate_of, a.id.to_string()),
        other => panic!("expected drop, got {other:?}"),
    }

    // By the time A's handler runs the key is already gone.
    let held_during_run = Arc::new(Mutex::new(None));
    let seen = held_during_run.clone();
    let observed = coordination.clone();
    let probe_key = key.clone();
    h.executor.register_handler("SendWelcomeEmail", move |_job, _ctx| {
        *seen.lock().unwrap() = Some(observed.get(&probe_key).unwrap());
        JobResult::Success
    });

    let (ran, result) = h.run_next();
    assert_eq!(ran.id, a.id);
    assert!(result.is_ok());
    assert_eq!(*held_during_run.lock().unwrap(), Some(None));
    assert_eq!(h.jobs.list_by_type("SendWelcomeEmail").len(), 1);
}

#[test]
fn until_executing_accepts_a_duplicate_while_the_owner_runs() {
    let clock = ManualClock::arc(t0());
    let coordination = Arc::new(InMemoryCoordinationStore::with_clock(clock.clone()));
    let mut middleware = DedupMiddleware::new(coordination, clock.clone(), DedupConfig::default());
    middleware
        .register("SendWelcomeEmail", DedupOptions::until_executing())
        .unwrap();
    let middleware = Arc::new(middleware);
    let jobs = InMemoryJobStore::arc();
    let client = JobClient::new(jobs.clone(), middleware.clone());
    let mut executor = JobExecutor::new(jobs.clone(), middleware);

    let args = json!({"user": 42});
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let record = outcomes.clone();
    let inner_client = client.clone();
    let inner_args = args.clone();
    let inner_clock = clock.clone();
    executor.register_handler("SendWelcomeEmail", move |_job, _ctx| {
        let job = Job::new_at("SendWelcomeEmail", inner_args.clone(), inner_clock.now());
        record.lock().unwrap().push(inner_client.push(job).unwrap().is_dropped());
        JobResult::Success
    });

    client.push(Job::new_at("SendWelcomeEmail", args, t0())).unwrap();
    let mut job = jobs.claim_next(t0()).unwrap().unwrap();
    executor.execute_one(&mut job).unwrap();

    assert_eq!(*outcomes.lock().unwrap(), vec![false]);
    assert_eq!(jobs.pending_count().unwrap(), 1);
}

#[test]
fn wal_locations_of_dropped_duplicates_reach_the_owner() {
    let (mut h, _) = Harness::new(vec![("SyncAccount", DedupOptions::until_executed())]);
    let seen = Arc::new(Mutex::new(WalLocations::new()));
    let record = seen.clone();
    h.executor.register_handler("SyncAccount", move |_job, ctx: &ExecutionContext| {
        *record.lock().unwrap() = ctx.wal_locations().clone();
        JobResult::Success
    });
    let args = json!({"account": 1});

    let owner = h
        .job("SyncAccount", args.clone())
        .with_wal_locations(WalLocations::new().with("main", "0/10"));
    h.client.push(owner).unwrap();

    let duplicate = h
        .job("SyncAccount", args.clone())
        .with_wal_locations(WalLocations::new().with("main", "0/20").with("ci", "0/5"));
    assert!(h.client.push(duplicate).unwrap().is_dropped());

    let stale = h
        .job("SyncAccount", args)
        .with_wal_locations(WalLocations::new().with("main", "0/15"));
    assert!(h.client.push(stale).unwrap().is_dropped());

    let (ran, _) = h.run_next();
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.get("main"), Some("0/20"));
    assert_eq!(seen.get("ci"), Some("0/5"));
    assert_eq!(ran.dedup_wal_locations, seen);
}

#[test]
fn serialization_lock_contention_fails_open() {
    let config = DedupConfig::default()
        .with_serialization_lock(true)
        .with_lock_retry(LockRetryPolicy::fixed(2, Duration::from_millis(50)));
    let (mut h, coordination) = Harness::with_config(
        config,
        vec![("RefreshCache", DedupOptions::until_executed().reschedule_once())],
    );
    let ran = Arc::new(Mutex::new(false));
    let flag = ran.clone();
    h.executor.register_handler("RefreshCache", move |_job, _ctx| {
        *flag.lock().unwrap() = true;
        JobResult::Success
    });
    let args = json!({"cache": "pricing"});
    let lock_key = format!("{}:perform:lock", storage_key("RefreshCache", &args));

    coordination
        .set_if_absent(&lock_key, "another-worker", Duration::from_secs(60))
        .unwrap();
    h.client.push(h.job("RefreshCache", args)).unwrap();

    let (_, result) = h.run_next();

    assert!(result.is_ok());
    assert!(*ran.lock().unwrap());
    assert_eq!(h.clock.sleeps(), vec![Duration::from_millis(50); 2]);
    // Only the foreign lock is left behind.
    assert_eq!(coordination.len(), 1);
}

#[test]
fn serialization_lock_is_released_after_perform() {
    let config = DedupConfig::default().with_serialization_lock(true);
    let (mut h, coordination) = Harness::with_config(
        config,
        vec![("RefreshCache", DedupOptions::until_executed().reschedule_once())],
    );
    h.executor.register_handler("RefreshCache", |_job, _ctx| JobResult::Success);

    h.client.push(h.job("RefreshCache", json!({"cache": "pricing"}))).unwrap();
    assert!(h.run_next().1.is_ok());
    assert!(coordination.is_empty());
    assert!(h.clock.sleeps().is_empty());
}

#[test]
fn none_strategy_never_touches_the_store() {
    let (mut h, coordination) = Harness::new(vec![("Heartbeat", DedupOptions::none())]);
    h.executor.register_handler("Heartbeat", |_job, _ctx| JobResult::Success);

    for _ in 0..3 {
        assert!(!h.client.push(h.job("Heartbeat", json!([]))).unwrap().is_dropped());
    }
    assert!(coordination.is_empty());
    assert!(h.run_next().1.is_ok());
    assert_eq!(h.jobs.pending_count().unwrap(), 2);
}

#[test]
fn non_idempotent_duplicates_are_still_dropped() {
    let (h, _) = Harness::new(vec![(
        "ChargeCard",
        DedupOptions::until_executed().non_idempotent(),
    )]);
    let args = json!({"order": 9});

    h.client.push(h.job("ChargeCard", args.clone())).unwrap();
    assert!(h.client.push(h.job("ChargeCard", args)).unwrap().is_dropped());
}
