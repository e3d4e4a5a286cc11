use async_trait::async_trait;
use sqlflow_core::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Connection that sleeps on every statement and records peak parallelism.
struct SlowDatabase {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowDatabase {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Connection for SlowDatabase {
    async fn execute(&self, _statement: &str) -> Result<u64, DbError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(1)
    }

    async fn query(&self, _statement: &str) -> Result<Vec<Row>, DbError> {
        Ok(Vec::new())
    }

    async fn insert_rows(&self, _table: &str, rows: &[Row]) -> Result<u64, DbError> {
        Ok(rows.len() as u64)
    }
}

struct SlowProvider(Arc<SlowDatabase>);

#[async_trait]
impl ConnectionProvider for SlowProvider {
    async fn get_connection(
        &self,
        _target: &ConnectionTarget,
    ) -> Result<Arc<dyn Connection>, DbError> {
        Ok(self.0.clone() as Arc<dyn Connection>)
    }
}

fn slow(id: &str) -> Task {
    Task::statement(id, ConnectionTarget::new("slow"), "DELETE FROM t")
}

fn executor(db: Arc<SlowDatabase>, config: ExecutorConfig) -> Executor {
    Executor::new(Arc::new(SlowProvider(db)), config)
}

#[tokio::test(start_paused = true)]
async fn test_wave_respects_max_concurrency() {
    let db = SlowDatabase::new(Duration::from_millis(100));
    let mut graph = WorkflowGraph::new("fan_out");
    graph.add_task(Task::empty("start")).unwrap();
    let workers: Vec<String> = (0..6).map(|i| format!("w{i}")).collect();
    for id in &workers {
        graph.add_task(slow(id)).unwrap();
    }
    graph.add_edges("start", workers.iter().map(String::as_str)).unwrap();

    let run = executor(db.clone(), ExecutorConfig::default().with_max_concurrency(2))
        .run(&graph, RunContext::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(db.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_node_and_skips_successors() {
    let db = SlowDatabase::new(Duration::from_secs(60));
    let mut graph = WorkflowGraph::new("timeout");
    graph.add_task(slow("load").with_timeout(Duration::from_secs(1))).unwrap();
    graph.add_task(Task::empty("end")).unwrap();
    graph.add_edge("load", "end").unwrap();

    let run = executor(db, ExecutorConfig::default()).run(&graph, RunContext::new()).await.unwrap();

    let load = run.node("load").unwrap();
    assert_eq!(load.state, NodeState::Failed);
    assert_eq!(load.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(run.state_of("end"), Some(NodeState::Skipped));
}

#[tokio::test(start_paused = true)]
async fn test_sub_second_timeout_reports_milliseconds() {
    let db = SlowDatabase::new(Duration::from_secs(60));
    let mut graph = WorkflowGraph::new("short_timeout");
    graph
        .add_task(slow("load").with_timeout(Duration::from_millis(250)))
        .unwrap();

    let run = executor(db, ExecutorConfig::default())
        .run(&graph, RunContext::new())
        .await
        .unwrap();

    let error = run.node("load").unwrap().error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(error.message, "task timed out after 250ms");
}

#[tokio::test(start_paused = true)]
async fn test_executor_default_timeout_applies() {
    let db = SlowDatabase::new(Duration::from_secs(60));
    let mut graph = WorkflowGraph::new("default_timeout");
    graph.add_task(slow("load")).unwrap();

    let config = ExecutorConfig::default().with_node_timeout(Duration::from_secs(5));
    let run = executor(db, config).run(&graph, RunContext::new()).await.unwrap();
    assert_eq!(run.node("load").unwrap().error.as_ref().unwrap().kind, ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_running_and_skips_the_rest() {
    let db = SlowDatabase::new(Duration::from_secs(600));
    let mut graph = WorkflowGraph::new("cancel");
    graph.add_task(slow("a")).unwrap();
    graph.add_task(slow("b")).unwrap();
    graph.add_task(Task::empty("end")).unwrap();
    graph.add_edges_from(["a", "b"], "end").unwrap();

    let config = ExecutorConfig::default()
        .with_max_concurrency(1)
        .with_cancel_grace(Duration::from_secs(1));
    let executor = Arc::new(executor(db, config));
    let run_id = RunId::new();

    let handle = {
        let executor = executor.clone();
        let graph = graph.clone();
        tokio::spawn(async move { executor.run_with_id(run_id, &graph, RunContext::new()).await })
    };

    // Wait until one of the two nodes holds the only slot.
    loop {
        if let Some(run) = executor.get_run(run_id).await {
            if run.count_in(NodeState::Running) == 1 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(executor.cancel(run_id).await);

    let run = handle.await.unwrap().unwrap();
    assert!(run.cancelled);
    assert_eq!(run.status, RunStatus::Failed);

    let kinds: Vec<Option<ErrorKind>> = ["a", "b"]
        .iter()
        .map(|id| run.node(id).unwrap().error.as_ref().map(|e| e.kind))
        .collect();
    assert!(kinds.contains(&Some(ErrorKind::Cancelled)));
    assert!(kinds.contains(&None));
    assert_eq!(run.count_in(NodeState::Skipped), 2);
    assert_eq!(run.state_of("end"), Some(NodeState::Skipped));

    assert!(executor.get_run(run_id).await.is_none());
    assert!(!executor.cancel(run_id).await);
}

#[tokio::test]
async fn test_one_success_takes_alternative_path() {
    let db = MemoryDatabase::new("db")
        .unwrap()
        .with_table("t", &["a"], vec![])
        .unwrap();
    let db = Arc::new(db);
    let provider = MemoryConnectionProvider::new().with_database("db", db);
    let executor = Executor::new(Arc::new(provider), ExecutorConfig::default());

    let mut graph = WorkflowGraph::new("fallback");
    graph
        .add_task(Task::statement("primary", ConnectionTarget::new("db"), "DELETE FROM missing"))
        .unwrap();
    graph
        .add_task(Task::statement("fallback", ConnectionTarget::new("db"), "DELETE FROM t"))
        .unwrap();
    graph
        .add_task(Task::empty("either").with_trigger_rule(TriggerRule::OneSuccess))
        .unwrap();
    graph.add_task(Task::empty("both")).unwrap();
    graph.add_edges_from(["primary", "fallback"], "either").unwrap();
    graph.add_edges_from(["primary", "fallback"], "both").unwrap();

    let run = executor.run(&graph, RunContext::new()).await.unwrap();
    assert_eq!(run.state_of("primary"), Some(NodeState::Failed));
    assert_eq!(run.state_of("either"), Some(NodeState::Succeeded));
    assert_eq!(run.state_of("both"), Some(NodeState::Skipped));
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_failure_does_not_abort_siblings() {
    let db = MemoryDatabase::new("db")
        .unwrap()
        .with_table("t", &["a"], vec![])
        .unwrap();
    let db = Arc::new(db);
    let provider = MemoryConnectionProvider::new().with_database("db", db.clone());
    let executor = Executor::new(Arc::new(provider), ExecutorConfig::default());

    let mut graph = WorkflowGraph::new("siblings");
    graph
        .add_task(Task::statement(
            "bad",
            ConnectionTarget::new("db"),
            "INSERT INTO {{ table }} (a) VALUES (1)",
        ))
        .unwrap();
    graph
        .add_task(Task::statement(
            "good",
            ConnectionTarget::new("db"),
            "INSERT INTO t (a) VALUES (1)",
        ))
        .unwrap();

    let run = executor.run(&graph, RunContext::new()).await.unwrap();
    let bad = run.node("bad").unwrap();
    assert_eq!(bad.state, NodeState::Failed);
    assert_eq!(bad.error.as_ref().unwrap().kind, ErrorKind::UnboundParameter);
    assert_eq!(run.state_of("good"), Some(NodeState::Succeeded));
    assert_eq!(db.row_count("t"), Some(1));
}

#[tokio::test]
async fn test_runtime_parameters_fill_unbound_keys() {
    let db = Arc::new(MemoryDatabase::new("db").unwrap());
    let provider = MemoryConnectionProvider::new().with_database("db", db.clone());
    let executor = Executor::new(Arc::new(provider), ExecutorConfig::default());

    let mut graph = WorkflowGraph::new("runtime");
    graph
        .add_task(Task::statement(
            "create",
            ConnectionTarget::new("db"),
            "CREATE TABLE {{ table }} (a int)",
        ))
        .unwrap();

    let ctx = RunContext::new().with_parameters(ParameterSet::new().with("table", "nightly"));
    let run = executor.run(&graph, ctx).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(db.has_table("nightly"));
}

#[tokio::test]
async fn test_cycle_runs_nothing() {
    let db = Arc::new(MemoryDatabase::new("db").unwrap());
    let provider = MemoryConnectionProvider::new().with_database("db", db.clone());
    let executor = Executor::new(Arc::new(provider), ExecutorConfig::default());

    let mut graph = WorkflowGraph::new("cycle");
    for id in ["a", "b", "c"] {
        graph
            .add_task(Task::statement(id, ConnectionTarget::new("db"), "CREATE TABLE t (a int)"))
            .unwrap();
    }
    graph.chain(&["a", "b", "c", "a"]).unwrap();

    let err = executor.run(&graph, RunContext::new()).await.unwrap_err();
    assert!(matches!(err, GraphError::Cycle { .. }));
    assert!(db.statements().is_empty());
}
