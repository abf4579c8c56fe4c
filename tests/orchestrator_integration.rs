//! Request lifecycle properties of the orchestrator, driven through the
//! in-memory worker spawner.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use whisper_bridge::correlator::MALFORMED_PLACEHOLDER;
use whisper_bridge::gate::Outcome;
use whisper_bridge::subprocess::MockWorkerSpawner;
use whisper_bridge::supervisor::SupervisorState;
use whisper_bridge::{BridgeConfig, Orchestrator, RecognitionService, RecognizeError};

fn start(spawner: &MockWorkerSpawner) -> RecognitionService {
    let (service, _task) =
        Orchestrator::spawn(&BridgeConfig::default(), Arc::new(spawner.clone()));
    service
}

fn submit(service: &RecognitionService, path: &str) -> JoinHandle<Outcome> {
    let service = service.clone();
    let path = path.to_string();
    tokio::spawn(async move { service.recognize(path).await })
}

#[tokio::test]
async fn test_round_trip() {
    let spawner = MockWorkerSpawner::new();
    let service = start(&spawner);
    let mut worker = spawner.next_worker().await;

    let pending = submit(&service, "/tmp/a.wav");
    assert_eq!(worker.read_line().await.as_deref(), Some("/tmp/a.wav"));
    worker
        .emit("whisper_init: loading model\nResult: hello world\n")
        .await
        .unwrap();

    let recognition = pending.await.unwrap().unwrap();
    assert_eq!(recognition.file_path, "/tmp/a.wav");
    assert_eq!(recognition.recognition, "hello world");
}

#[tokio::test(start_paused = true)]
async fn test_result_line_split_across_writes() {
    let spawner = MockWorkerSpawner::new();
    let service = start(&spawner);
    let mut worker = spawner.next_worker().await;

    let pending = submit(&service, "/tmp/a.wav");
    worker.read_line().await;
    worker.emit("Resu").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    worker.emit("lt: split ").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    worker.emit("line\n").await.unwrap();

    assert_eq!(pending.await.unwrap().unwrap().recognition, "split line");
}

#[tokio::test]
async fn test_second_request_is_busy_and_first_completes() {
    let spawner = MockWorkerSpawner::new();
    let service = start(&spawner);
    let mut worker = spawner.next_worker().await;

    let first = submit(&service, "/tmp/a.wav");
    assert_eq!(worker.read_line().await.as_deref(), Some("/tmp/a.wav"));

    assert_eq!(
        service.recognize("/tmp/b.wav").await,
        Err(RecognizeError::Busy)
    );
    // The rejected path never reaches the worker
    assert!(
        tokio::time::timeout(Duration::from_millis(50), worker.read_line())
            .await
            .is_err()
    );

    worker.emit("Result: first\n").await.unwrap();
    let recognition = first.await.unwrap().unwrap();
    assert_eq!(recognition.file_path, "/tmp/a.wav");
    assert_eq!(recognition.recognition, "first");

    let second = submit(&service, "/tmp/b.wav");
    assert_eq!(worker.read_line().await.as_deref(), Some("/tmp/b.wav"));
    worker.emit("Result: second\n").await.unwrap();
    assert_eq!(second.await.unwrap().unwrap().recognition, "second");
}

#[tokio::test(start_paused = true)]
async fn test_timeout_frees_the_gate() {
    let spawner = MockWorkerSpawner::new();
    let service = start(&spawner);
    let mut worker = spawner.next_worker().await;

    let admitted_at = Instant::now();
    let pending = submit(&service, "/tmp/a.wav");
    worker.read_line().await;

    assert_eq!(
        pending.await.unwrap(),
        Err(RecognizeError::Timeout(Duration::from_millis(120_000)))
    );
    assert!(admitted_at.elapsed() >= Duration::from_millis(120_000));

    let status = service.status().await.unwrap();
    assert!(!status.busy);
    assert_eq!(status.worker.state, SupervisorState::Running);
    assert_eq!(status.worker.restarts, 0);

    let next = submit(&service, "/tmp/b.wav");
    assert_eq!(worker.read_line().await.as_deref(), Some("/tmp/b.wav"));
    worker.emit("Result: after timeout\n").await.unwrap();
    assert_eq!(next.await.unwrap().unwrap().recognition, "after timeout");
}

#[tokio::test(start_paused = true)]
async fn test_crash_fails_pending_request_and_restarts() {
    let spawner = MockWorkerSpawner::new();
    let service = start(&spawner);
    let mut worker = spawner.next_worker().await;

    let pending = submit(&service, "/tmp/a.wav");
    worker.read_line().await;
    worker.emit("loading model\n").await.unwrap();
    worker.exit(1);

    assert_eq!(
        pending.await.unwrap(),
        Err(RecognizeError::ProcessLost("exit code 1".to_string()))
    );
    let crashed_at = Instant::now();

    let mut replacement = spawner.next_worker().await;
    let waited = crashed_at.elapsed();
    assert!(waited >= Duration::from_millis(1000), "restarted after {:?}", waited);
    assert!(waited < Duration::from_millis(1100), "restarted after {:?}", waited);
    assert_eq!(spawner.spawn_count(), 2);

    let status = service.status().await.unwrap();
    assert_eq!(status.worker.state, SupervisorState::Running);
    assert_eq!(status.worker.restarts, 1);
    assert_eq!(status.worker.pid, Some(replacement.pid));

    let fresh = submit(&service, "/tmp/b.wav");
    assert_eq!(replacement.read_line().await.as_deref(), Some("/tmp/b.wav"));
    replacement.emit("Result: back online\n").await.unwrap();
    assert_eq!(fresh.await.unwrap().unwrap().recognition, "back online");
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_while_no_worker_runs() {
    let spawner = MockWorkerSpawner::new();
    spawner.fail_next(1);
    let service = start(&spawner);

    assert_eq!(
        service.recognize("/tmp/a.wav").await,
        Err(RecognizeError::ProcessUnavailable)
    );
    let status = service.status().await.unwrap();
    assert!(!status.busy);
    assert_eq!(status.worker.state, SupervisorState::Restarting);
    assert_eq!(status.worker.spawn_failures, 1);

    // The failed spawn is retried after the restart delay
    let mut worker = spawner.next_worker().await;
    let pending = submit(&service, "/tmp/a.wav");
    worker.read_line().await;
    worker.emit("Result: ready\n").await.unwrap();
    assert_eq!(pending.await.unwrap().unwrap().recognition, "ready");
}

#[tokio::test(start_paused = true)]
async fn test_repeated_spawn_failures_keep_retrying() {
    let spawner = MockWorkerSpawner::new();
    spawner.fail_next(3);
    let started = Instant::now();
    let service = start(&spawner);

    let _worker = spawner.next_worker().await;
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(3000), "started after {:?}", waited);
    assert!(waited < Duration::from_millis(3100), "started after {:?}", waited);
    assert_eq!(spawner.spawn_count(), 4);
    assert_eq!(service.status().await.unwrap().worker.spawn_failures, 3);
}

#[tokio::test]
async fn test_malformed_result_yields_placeholder() {
    let spawner = MockWorkerSpawner::new();
    let service = start(&spawner);
    let mut worker = spawner.next_worker().await;

    let pending = submit(&service, "/tmp/a.wav");
    worker.read_line().await;
    worker.emit("Result:\n").await.unwrap();

    let recognition = pending.await.unwrap().unwrap();
    assert_eq!(recognition.file_path, "/tmp/a.wav");
    assert_eq!(recognition.recognition, MALFORMED_PLACEHOLDER);
}

#[tokio::test(start_paused = true)]
async fn test_output_is_reset_before_each_request() {
    let spawner = MockWorkerSpawner::new();
    let service = start(&spawner);
    let mut worker = spawner.next_worker().await;

    // An unterminated fragment left over from a timed out request
    let first = submit(&service, "/tmp/a.wav");
    worker.read_line().await;
    worker.emit("partial Res").await.unwrap();
    assert!(matches!(
        first.await.unwrap(),
        Err(RecognizeError::Timeout(_))
    ));

    let second = submit(&service, "/tmp/b.wav");
    worker.read_line().await;
    worker.emit("ult: stale\nResult: fresh\n").await.unwrap();
    assert_eq!(second.await.unwrap().unwrap().recognition, "fresh");
}

#[tokio::test(start_paused = true)]
async fn test_late_result_after_timeout_is_attributed_to_next_request() {
    let spawner = MockWorkerSpawner::new();
    let service = start(&spawner);
    let mut worker = spawner.next_worker().await;

    let first = submit(&service, "/tmp/a.wav");
    worker.read_line().await;
    assert!(matches!(
        first.await.unwrap(),
        Err(RecognizeError::Timeout(_))
    ));

    // The worker has no request ids: the first request's result arriving
    // after the second was admitted completes the second one
    let second = submit(&service, "/tmp/b.wav");
    worker.read_line().await;
    worker.emit("Result: words from a\n").await.unwrap();

    let recognition = second.await.unwrap().unwrap();
    assert_eq!(recognition.file_path, "/tmp/b.wav");
    assert_eq!(recognition.recognition, "words from a");
}

#[tokio::test(start_paused = true)]
async fn test_stderr_never_completes_a_request() {
    let spawner = MockWorkerSpawner::new();
    let service = start(&spawner);
    let mut worker = spawner.next_worker().await;

    let pending = submit(&service, "/tmp/a.wav");
    worker.read_line().await;
    worker.emit_stderr("Result: from stderr\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(service.status().await.unwrap().busy);

    worker.emit("Result: from stdout\n").await.unwrap();
    assert_eq!(pending.await.unwrap().unwrap().recognition, "from stdout");
}

#[tokio::test]
async fn test_dropping_all_handles_stops_the_worker() {
    let spawner = MockWorkerSpawner::new();
    let (service, task) =
        Orchestrator::spawn(&BridgeConfig::default(), Arc::new(spawner.clone()));
    let _worker = spawner.next_worker().await;

    drop(service);
    task.await.unwrap();
    assert_eq!(spawner.spawn_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_worker_that_stops_reading_cannot_stall_the_service() {
    let spawner = MockWorkerSpawner::new();
    let mut config = BridgeConfig::default();
    config.timing.request_timeout = Duration::from_millis(300);
    let (service, _task) = Orchestrator::spawn(&config, Arc::new(spawner.clone()));
    // Alive, but never reads its stdin
    let _worker = spawner.next_worker().await;

    // Larger than the pipe buffer, so the write can never finish
    let path = format!("/tmp/{}.wav", "a".repeat(100 * 1024));
    let outcome = tokio::time::timeout(Duration::from_secs(5), service.recognize(path))
        .await
        .expect("recognize stalled");
    assert_eq!(
        outcome,
        Err(RecognizeError::Timeout(Duration::from_millis(300)))
    );

    let status = tokio::time::timeout(Duration::from_secs(1), service.status())
        .await
        .expect("status stalled")
        .unwrap();
    assert!(!status.busy);
    assert_eq!(status.worker.state, SupervisorState::Running);
}

#[tokio::test]
async fn test_closed_stdin_resolves_request_as_unavailable() {
    let spawner = MockWorkerSpawner::new();
    let service = start(&spawner);
    let mut worker = spawner.next_worker().await;
    worker.close_stdin();

    assert_eq!(
        service.recognize("/tmp/a.wav").await,
        Err(RecognizeError::ProcessUnavailable)
    );
    assert!(!service.status().await.unwrap().busy);
    assert_eq!(
        service.recognize("/tmp/b.wav").await,
        Err(RecognizeError::ProcessUnavailable)
    );
}

#[tokio::test]
async fn test_result_cut_off_by_exit_is_delivered() {
    let spawner = MockWorkerSpawner::new();
    let service = start(&spawner);
    let mut worker = spawner.next_worker().await;

    let pending = submit(&service, "/tmp/a.wav");
    worker.read_line().await;
    worker.emit("decoding\nResult: last words").await.unwrap();
    worker.exit(0);

    let recognition = pending.await.unwrap().unwrap();
    assert_eq!(recognition.file_path, "/tmp/a.wav");
    assert_eq!(recognition.recognition, "last words");
    assert_eq!(service.status().await.unwrap().worker.restarts, 1);
}
