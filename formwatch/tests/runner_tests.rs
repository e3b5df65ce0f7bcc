//! Full-run orchestration: sequencing, skipping, stop and reset.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{email_config, message, BatchQueue, MemorySink, MockEngine, MockTransport};
use formwatch::delay::Pacing;
use formwatch::runner::{EngineFactory, TransportFactory};
use formwatch::{
    BrowserEngine, EmailConfig, MailTransport, RunConfig, RunStatus, Runner, WatchPolicy,
};

fn engine_factory(engine: Arc<MockEngine>, invocations: Arc<AtomicUsize>) -> EngineFactory {
    Arc::new(move |_options| {
        invocations.fetch_add(1, Ordering::SeqCst);
        let engine = engine.clone();
        Box::pin(async move { Ok(engine as Arc<dyn BrowserEngine>) })
    })
}

fn transport_factory(queue: BatchQueue) -> TransportFactory {
    Arc::new(move || Box::new(MockTransport::with_queue(queue.clone())) as Box<dyn MailTransport>)
}

struct Harness {
    runner: Arc<Runner>,
    sink: Arc<MemorySink>,
    engine: Arc<MockEngine>,
    factory_calls: Arc<AtomicUsize>,
    queue: BatchQueue,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new(policy: WatchPolicy) -> Self {
        let sink = Arc::new(MemorySink::default());
        let engine = Arc::new(MockEngine::new());
        let factory_calls = Arc::new(AtomicUsize::new(0));
        let queue: BatchQueue = Arc::default();
        let runner = Arc::new(
            Runner::new(sink.clone())
                .with_engine_factory(engine_factory(engine.clone(), factory_calls.clone()))
                .with_transport_factory(transport_factory(queue.clone()))
                .with_pacing(Pacing::zero())
                .with_watch_policy(policy),
        );
        Self {
            runner,
            sink,
            engine,
            factory_calls,
            queue,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self, input_lines: &str, email: EmailConfig) -> RunConfig {
        let input_path = self.dir.path().join("input.txt");
        std::fs::write(&input_path, input_lines).unwrap();
        RunConfig {
            target_url: "https://example.com/signup".into(),
            button1_selector: None,
            button2_selector: None,
            input_field1_selector: None,
            input_field2_selector: None,
            submit_button_selector: Some("#submit".into()),
            email_config: email,
            input_file_path: Some(input_path),
            output_log_path: Some(self.dir.path().join("logs").join("output.log")),
        }
    }

    fn output_log(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("logs").join("output.log")).unwrap()
    }
}

fn fast_policy() -> WatchPolicy {
    WatchPolicy {
        window: Duration::from_millis(150),
        poll_interval: Duration::from_millis(100),
        ..WatchPolicy::default()
    }
}

#[tokio::test]
async fn run_processes_valid_lines_and_skips_invalid_ones() {
    let h = Harness::new(fast_policy());
    let config = h.config(
        "alice@example.com:pw1\nnot-a-record\nbob@example.com:pw2\n\n",
        email_config(None, None, Some(r"code(\d+)")),
    );
    {
        let mut q = h.queue.lock().unwrap();
        q.push_back(Ok(vec![message("r1", "code111", Duration::from_secs(5))]));
        q.push_back(Ok(vec![message("r2", "code222", Duration::from_secs(5))]));
    }

    h.runner.start(config).await.unwrap();

    // Blank lines are dropped; the invalid line counts toward progress but
    // never reaches the pipeline.
    assert_eq!(h.sink.progress_updates(), vec![1, 2, 3]);
    assert_eq!(h.engine.contexts_created.load(Ordering::SeqCst), 2);
    assert_eq!(h.engine.shutdowns.load(Ordering::SeqCst), 1);

    let log = h.output_log();
    assert!(log.contains("Input: alice@example.com:pw1 | EmailData: 111"));
    assert!(log.contains("Skipping invalid line: not-a-record"));
    assert!(log.contains("Input: bob@example.com:pw2 | EmailData: 222"));

    let snapshot = h.runner.status();
    assert!(!snapshot.running);
    assert_eq!(snapshot.current_line, 3);
    assert_eq!(snapshot.total_lines, 3);

    let statuses = h.sink.statuses();
    let (message, status) = statuses.last().unwrap();
    assert_eq!(*status, RunStatus::Idle);
    assert_eq!(message, "Run finished processing");
}

#[tokio::test]
async fn stop_halts_between_records() {
    let policy = WatchPolicy {
        window: Duration::from_millis(300),
        poll_interval: Duration::from_millis(100),
        ..WatchPolicy::default()
    };
    let h = Harness::new(policy);
    let config = h.config(
        "a@x.com:p1\nb@x.com:p2\nc@x.com:p3\n",
        email_config(None, None, Some(r"code(\d+)")),
    );

    let runner = h.runner.clone();
    let handle = tokio::spawn(async move { runner.start(config).await });
    tokio::time::sleep(Duration::from_millis(120)).await;
    h.runner.stop();
    handle.await.unwrap().unwrap();

    // The in-flight record finished its watch window; later records never ran.
    assert!(h.engine.contexts_created.load(Ordering::SeqCst) < 3);
    assert!(h.output_log().contains("Stop was requested"));
    assert!(h
        .sink
        .statuses()
        .iter()
        .any(|(_, s)| *s == RunStatus::Stopping));
    assert_eq!(h.sink.statuses().last().unwrap().1, RunStatus::Idle);
    assert!(!h.runner.status().running);
}

#[tokio::test]
async fn stop_without_a_run_reports_idle() {
    let h = Harness::new(fast_policy());
    h.runner.stop();
    let statuses = h.sink.statuses();
    let (message, status) = statuses.last().unwrap();
    assert_eq!(*status, RunStatus::Idle);
    assert_eq!(message, "No run in progress");
}

#[tokio::test]
async fn second_start_while_running_is_a_noop() {
    let policy = WatchPolicy {
        window: Duration::from_millis(300),
        poll_interval: Duration::from_millis(100),
        ..WatchPolicy::default()
    };
    let h = Harness::new(policy);
    let config = h.config(
        "a@x.com:p1\nb@x.com:p2\n",
        email_config(None, None, Some(r"code(\d+)")),
    );

    let runner = h.runner.clone();
    let first = config.clone();
    let handle = tokio::spawn(async move { runner.start(first).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.runner.start(config).await.unwrap();
    assert!(h
        .sink
        .statuses()
        .iter()
        .any(|(m, s)| m == "Run is already in progress" && *s == RunStatus::Running));

    h.runner.stop();
    handle.await.unwrap().unwrap();
    // Only the first start built an engine.
    assert_eq!(h.factory_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_config_halts_before_the_engine_starts() {
    let h = Harness::new(fast_policy());
    let mut email = email_config(None, None, Some(r"code(\d+)"));
    email.imap_host.clear();
    let config = h.config("a@x.com:p1\n", email);

    assert!(h.runner.start(config).await.is_err());
    assert_eq!(h.factory_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.sink.statuses().last().unwrap().1, RunStatus::Error);
    assert!(!h.runner.status().running);
}

#[tokio::test]
async fn missing_input_file_is_a_config_error() {
    let h = Harness::new(fast_policy());
    let mut config = h.config("unused\n", email_config(None, None, Some(r"(\d+)")));
    config.input_file_path = Some(h.dir.path().join("no-such-file.txt"));

    assert!(h.runner.start(config).await.is_err());
    assert_eq!(h.factory_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.sink.statuses().last().unwrap().1, RunStatus::Error);
}

#[tokio::test]
async fn reset_truncates_the_log_and_zeroes_state() {
    let h = Harness::new(fast_policy());
    let config = h.config(
        "alice@example.com:pw1\n",
        email_config(None, None, Some(r"code(\d+)")),
    );
    h.queue
        .lock()
        .unwrap()
        .push_back(Ok(vec![message("r1", "code111", Duration::from_secs(5))]));

    h.runner.start(config).await.unwrap();
    assert!(!h.output_log().is_empty());

    h.runner.reset().await;
    assert!(h.output_log().is_empty());
    let snapshot = h.runner.status();
    assert!(!snapshot.running);
    assert_eq!(snapshot.current_line, 0);
    assert_eq!(snapshot.total_lines, 0);
    assert!(!snapshot.configured);
    assert!(h
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, formwatch::UpdateEvent::LogReset { .. })));

    // Reset with nothing running is the same reset.
    h.runner.reset().await;
    assert!(h.output_log().is_empty());
}
