mod common;

use common::{harness, harness_with, pytorch_request, test_config, wait_for_status, ContainerScript};
use modelforge_engine::executor::FailureKind;
use modelforge_engine::gpu::StaticGpuProbe;
use modelforge_engine::io_models::{ListJobsQuery, LogStreamEvent, StopJobRequest, SubmitJobRequest};
use modelforge_engine::models::job::{Framework, JobStatus};
use modelforge_engine::models::metric::MetricKind;
use modelforge_engine::log_store::LogStore;
use modelforge_engine::repository::{JobRepository, MetricRepository};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_happy_path_completes_and_records_metrics() {
    let harness = harness();
    harness.runtime.push_script(
        ContainerScript::exiting(0).with_stdout_lines(&["Epoch 1/3 loss: 0.5", "saving checkpoint"]),
    );

    let job = harness.service.submit(Uuid::new_v4(), pytorch_request()).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let status = wait_for_status(&harness.job_repository, job.id, JobStatus::Completed, WAIT).await;
    assert_eq!(status, JobStatus::Completed);

    let series = harness.metric_repository.series(job.id).await.unwrap();
    assert!(series
        .iter()
        .any(|record| record.metric_type == MetricKind::Loss && record.value == 0.5 && record.epoch == Some(1)));

    let (entries, _) = harness.log_store.range(job.id, 0, usize::MAX).await.unwrap();
    let messages: Vec<&str> = entries.iter().map(|entry| entry.message.as_str()).collect();
    assert!(messages.iter().any(|message| message.contains("Training completed successfully")));
    assert!(messages.iter().any(|message| message.contains("[METRICS] Epoch 1/3 loss: 0.5")));

    // the container is gone, the in-memory handle too
    assert!(!harness.executor.is_running(job.id));
    let completed = harness.job_repository.get(job.id).await.unwrap();
    assert!(completed.started_at.is_some());
    assert!(completed.completed_at.is_some());
    assert!(completed.queued_at.unwrap() <= completed.started_at.unwrap());
    assert!(completed.started_at.unwrap() <= completed.completed_at.unwrap());
}

#[tokio::test]
async fn test_oom_exit_fails_without_retry() {
    let harness = harness();
    harness.runtime.push_script(
        ContainerScript::exiting(137).with_stderr_lines(&["RuntimeError: CUDA out of memory"]),
    );

    let job = harness.service.submit(Uuid::new_v4(), pytorch_request()).await.unwrap();
    let status = wait_for_status(&harness.job_repository, job.id, JobStatus::Failed, WAIT).await;
    assert_eq!(status, JobStatus::Failed);

    let failed = harness.job_repository.get(job.id).await.unwrap();
    assert!(failed.status_message.unwrap().contains("Out of Memory"));

    let finished = harness.executor.finished_run(job.id).unwrap();
    let classification = finished.classification.unwrap();
    assert!(classification.is_oom);
    assert_eq!(classification.kind, FailureKind::Oom);
    assert!(!classification.recoverable);

    // OOM is not recoverable: exactly one container was ever created
    assert_eq!(harness.runtime.created_count(), 1);
}

#[tokio::test]
async fn test_transient_network_failure_is_retried_to_success() {
    let harness = harness();
    harness.runtime.push_script(
        ContainerScript::exiting(1).with_stderr_lines(&["ConnectionError: connection refused by data server"]),
    );
    harness
        .runtime
        .push_script(ContainerScript::exiting(0).with_stdout_lines(&["Epoch 1/1 loss: 0.1"]));

    let job = harness.service.submit(Uuid::new_v4(), pytorch_request()).await.unwrap();
    let status = wait_for_status(&harness.job_repository, job.id, JobStatus::Completed, WAIT).await;
    assert_eq!(status, JobStatus::Completed);

    assert_eq!(harness.runtime.created_count(), 2);

    let (entries, _) = harness.log_store.range(job.id, 0, usize::MAX).await.unwrap();
    let retry_line = entries
        .iter()
        .find(|entry| entry.message.contains("Retry attempt 1"))
        .expect("retry system log line missing");
    assert!(retry_line.message.contains("exit code 1"));
}

#[tokio::test]
async fn test_operator_stop_cancels_the_job() {
    let harness = harness();
    harness
        .runtime
        .push_script(ContainerScript::exiting(0).running_for(Duration::from_secs(60)));

    let job = harness.service.submit(Uuid::new_v4(), pytorch_request()).await.unwrap();
    wait_for_status(&harness.job_repository, job.id, JobStatus::Running, WAIT).await;

    // let the container actually run for a moment
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stopped = harness.service.stop(job.id, StopJobRequest { force: false }).await.unwrap();
    assert_eq!(stopped.status, JobStatus::Cancelled);

    // the in-memory job map holds no entry after stop returns
    assert!(!harness.executor.is_running(job.id));

    let (entries, _) = harness.log_store.range(job.id, 0, usize::MAX).await.unwrap();
    assert!(entries.iter().any(|entry| entry.message.contains("Stopped by user")));

    // stop is idempotent while terminal states refuse it
    let again = harness.service.stop(job.id, StopJobRequest { force: false }).await;
    assert!(again.is_err());
}

#[tokio::test]
async fn test_slow_subscriber_is_evicted_but_metrics_persist() {
    let mut config = test_config();
    config.subscriber_buffer_size = 256;
    let harness = harness_with(config, Arc::new(StaticGpuProbe::disabled()));

    let lines: Vec<String> = (0..300).map(|i| format!("step {i} loss: 0.25")).collect();
    let line_refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    harness.runtime.push_script(
        ContainerScript::exiting(0)
            .with_stdout_lines(&line_refs)
            // hold the log stream back until the subscriber is registered
            .logs_opening_after(Duration::from_millis(250))
            .running_for(Duration::from_millis(600)),
    );

    let job = harness.service.submit(Uuid::new_v4(), pytorch_request()).await.unwrap();
    wait_for_status(&harness.job_repository, job.id, JobStatus::Running, WAIT).await;

    // subscribe but never read
    let _subscription = harness.service.subscribe_metrics(job.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = wait_for_status(&harness.job_repository, job.id, JobStatus::Completed, WAIT).await;
    assert_eq!(status, JobStatus::Completed);

    // every point was persisted even though the subscriber fell behind
    let series = harness.metric_repository.series(job.id).await.unwrap();
    assert_eq!(series.len(), 300);

    // the slow subscriber was deregistered once its buffer filled
    assert_eq!(harness.hub.subscriber_count(job.id), 0);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_gpu_requested_but_unavailable_degrades_to_cpu() {
    let harness = harness(); // disabled GPU probe
    harness.runtime.push_script(ContainerScript::exiting(0));

    let mut request = pytorch_request();
    request.gpu_count = 2;
    let job = harness.service.submit(Uuid::new_v4(), request).await.unwrap();

    let status = wait_for_status(&harness.job_repository, job.id, JobStatus::Completed, WAIT).await;
    assert_eq!(status, JobStatus::Completed);

    // no device request was attached
    let spec = harness.runtime.spec_at(0);
    assert!(spec.device_requests.is_empty());
    assert!(!spec.env.iter().any(|(key, _)| key == "NVIDIA_VISIBLE_DEVICES"));

    let (entries, _) = harness.log_store.range(job.id, 0, usize::MAX).await.unwrap();
    assert!(entries.iter().any(|entry| entry.message.contains("GPU requested but not available")));

    // the degradation is also visible to operators
    assert!(logs_contain("but none are available"));
}

#[tokio::test]
async fn test_submit_round_trip_preserves_normalized_fields() {
    let harness = harness();
    harness.runtime.push_script(ContainerScript::exiting(0).running_for(Duration::from_secs(60)));

    let request = SubmitJobRequest {
        name: "bert-finetune".to_string(),
        project_id: Some(Uuid::new_v4()),
        model_name: "bert-base".to_string(),
        dataset_path: "/datasets/squad".to_string(),
        output_path: "/outputs/bert".to_string(),
        framework: Framework::Tensorflow,
        image: String::new(), // derived from framework
        ..Default::default()
    };

    let submitted = harness.service.submit(Uuid::new_v4(), request).await.unwrap();
    let fetched = harness.service.get(submitted.id).await.unwrap();

    assert_eq!(fetched.image, "tensorflow:latest-gpu");
    assert_eq!(fetched.resources.cpu_count, 4);
    assert_eq!(fetched.resources.memory_gb, 16);
    assert_eq!(fetched.timeout_hours, 24);
    assert_eq!(fetched.name, submitted.name);
    assert_eq!(fetched.environment.get("DATASET_PATH").map(String::as_str), Some("/data"));
    assert_eq!(fetched.environment.get("JOB_ID").map(String::as_str), Some(fetched.id.to_string().as_str()));
}

#[tokio::test]
async fn test_container_spec_carries_resources_env_and_labels() {
    let harness = harness();
    harness.runtime.push_script(ContainerScript::exiting(0));

    let mut request = pytorch_request();
    request.gpu_count = 0;
    request.hyperparameters = maplit::btreemap! {
        "learning_rate".to_string() => serde_json::json!(0.001),
        "epochs".to_string() => serde_json::json!(3),
    };

    let job = harness.service.submit(Uuid::new_v4(), request).await.unwrap();
    wait_for_status(&harness.job_repository, job.id, JobStatus::Completed, WAIT).await;

    let spec = harness.runtime.spec_at(0);
    assert!(spec.name.starts_with("mljob-"));
    assert_eq!(spec.limits.nano_cpus, 4_000_000_000);
    assert_eq!(spec.limits.memory_bytes, 16 * 1024 * 1024 * 1024);
    assert_eq!(spec.limits.memory_swap_bytes, spec.limits.memory_bytes);
    assert_eq!(spec.limits.shm_size_bytes, 2 * 1024 * 1024 * 1024);
    assert!(spec.auto_remove);

    assert!(spec.env.iter().any(|(key, value)| key == "HP_LEARNING_RATE" && value == "0.001"));
    assert!(spec.env.iter().any(|(key, value)| key == "HP_EPOCHS" && value == "3"));
    assert!(spec.env.iter().any(|(key, _)| key == "HYPERPARAMETERS"));

    assert_eq!(spec.labels.get("modelforge.io/job-id").map(String::as_str), Some(job.id.to_string().as_str()));
    assert_eq!(spec.labels.get("modelforge.io/framework").map(String::as_str), Some("pytorch"));

    assert_eq!(spec.mounts[0].container_path, "/data");
    assert!(spec.mounts[0].read_only);
    assert_eq!(spec.mounts[1].container_path, "/output");
    assert!(!spec.mounts[1].read_only);
    assert_eq!(spec.mounts[2].container_path, "/workspace");

    // the image was pulled (or at least attempted) before create
    assert_eq!(harness.runtime.pulled_images(), vec!["pytorch/pytorch:2.0.0".to_string()]);
}

#[tokio::test]
async fn test_failed_image_pull_is_a_warning_not_an_error() {
    let harness = harness();
    harness.runtime.fail_pulls.store(true, std::sync::atomic::Ordering::Relaxed);
    harness.runtime.push_script(ContainerScript::exiting(0));

    let job = harness.service.submit(Uuid::new_v4(), pytorch_request()).await.unwrap();
    let status = wait_for_status(&harness.job_repository, job.id, JobStatus::Completed, WAIT).await;
    assert_eq!(status, JobStatus::Completed);
}

#[tokio::test]
async fn test_container_create_failure_marks_the_job_failed() {
    let harness = harness();
    harness.runtime.push_script(ContainerScript {
        fail_create: Some("no space left on device".to_string()),
        ..Default::default()
    });

    let job = harness.service.submit(Uuid::new_v4(), pytorch_request()).await.unwrap();
    let status = wait_for_status(&harness.job_repository, job.id, JobStatus::Failed, WAIT).await;
    assert_eq!(status, JobStatus::Failed);

    let failed = harness.job_repository.get(job.id).await.unwrap();
    assert!(failed.status_message.is_some());
    assert!(!harness.executor.is_running(job.id));
}

#[tokio::test]
async fn test_update_is_refused_while_running_and_allowed_after() {
    let harness = harness();
    harness
        .runtime
        .push_script(ContainerScript::exiting(0).running_for(Duration::from_millis(300)));

    let job = harness.service.submit(Uuid::new_v4(), pytorch_request()).await.unwrap();
    wait_for_status(&harness.job_repository, job.id, JobStatus::Running, WAIT).await;

    let update = modelforge_engine::io_models::UpdateJobRequest {
        description: Some("tuned baseline".to_string()),
        ..Default::default()
    };
    let refused = harness.service.update(job.id, update.clone()).await;
    assert!(refused.is_err());

    wait_for_status(&harness.job_repository, job.id, JobStatus::Completed, WAIT).await;
    let updated = harness.service.update(job.id, update).await.unwrap();
    assert_eq!(updated.description, "tuned baseline");
}

#[tokio::test]
async fn test_delete_running_job_stops_it_first() {
    let harness = harness();
    harness
        .runtime
        .push_script(ContainerScript::exiting(0).running_for(Duration::from_secs(60)));

    let job = harness.service.submit(Uuid::new_v4(), pytorch_request()).await.unwrap();
    wait_for_status(&harness.job_repository, job.id, JobStatus::Running, WAIT).await;

    harness.service.delete(job.id).await.unwrap();
    assert!(harness.service.get(job.id).await.is_err());
    assert!(!harness.executor.is_running(job.id));
}

#[tokio::test]
async fn test_list_filters_and_paginates() {
    let harness = harness();
    let project_id = Uuid::new_v4();
    for _ in 0..3 {
        harness.runtime.push_script(ContainerScript::exiting(0));
        let mut request = pytorch_request();
        request.project_id = Some(project_id);
        let job = harness.service.submit(Uuid::new_v4(), request).await.unwrap();
        wait_for_status(&harness.job_repository, job.id, JobStatus::Completed, WAIT).await;
    }

    let page = harness
        .service
        .list(ListJobsQuery {
            project_id: Some(project_id),
            status: Some(JobStatus::Completed),
            page: Some(1),
            page_size: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 2);
}

#[tokio::test]
async fn test_log_streaming_replays_history_then_tails_until_end() {
    let harness = harness();
    harness.runtime.push_script(
        ContainerScript::exiting(0)
            .with_stdout_lines(&["preparing data", "Epoch 1/2 loss: 0.9", "Epoch 2/2 loss: 0.4"])
            .running_for(Duration::from_millis(150)),
    );

    let job = harness.service.submit(Uuid::new_v4(), pytorch_request()).await.unwrap();
    wait_for_status(&harness.job_repository, job.id, JobStatus::Running, WAIT).await;

    let (sender, mut receiver) = mpsc::channel(64);
    let streamer = {
        let service = harness.service.clone();
        let id = job.id;
        tokio::spawn(async move { service.stream_logs(id, sender).await })
    };

    let mut saw_end = false;
    let mut messages = Vec::new();
    while let Some(event) = receiver.recv().await {
        match event {
            LogStreamEvent::Log(entry) => messages.push(entry.message),
            LogStreamEvent::End { status, .. } => {
                assert_eq!(status, JobStatus::Completed);
                saw_end = true;
            }
        }
    }
    streamer.await.unwrap().unwrap();

    assert!(saw_end);
    assert!(messages.iter().any(|message| message.contains("preparing data")));
    assert!(messages.iter().any(|message| message.contains("Training completed successfully")));
}

#[tokio::test]
async fn test_progress_follows_epochs_and_is_monotonic() {
    let harness = harness();
    harness.runtime.push_script(
        ContainerScript::exiting(0)
            .with_stdout_lines(&["Epoch 1/4 loss: 0.9", "Epoch 2/4 loss: 0.7", "Epoch 4/4 loss: 0.2", "Epoch 3/4 loss: 0.4"]),
    );

    let mut request = pytorch_request();
    request.hyperparameters.insert("epochs".to_string(), serde_json::json!(4));
    let job = harness.service.submit(Uuid::new_v4(), request).await.unwrap();
    wait_for_status(&harness.job_repository, job.id, JobStatus::Completed, WAIT).await;

    // out-of-order epoch 3 after 4 must not move progress backwards
    let finished = harness.job_repository.get(job.id).await.unwrap();
    assert_eq!(finished.progress, 100.0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_tears_the_job_down() {
    let harness = harness();
    // never exits on its own
    harness
        .runtime
        .push_script(ContainerScript::exiting(0).running_for(Duration::from_secs(24 * 3600)));

    let mut request = pytorch_request();
    request.timeout_hours = Some(1);
    let job = harness.service.submit(Uuid::new_v4(), request).await.unwrap();

    let status = wait_for_status(&harness.job_repository, job.id, JobStatus::Failed, Duration::from_secs(2 * 3600)).await;
    assert_eq!(status, JobStatus::Failed);

    let failed = harness.job_repository.get(job.id).await.unwrap();
    assert!(failed.status_message.unwrap().contains("timed out"));
    assert!(!harness.executor.is_running(job.id));
}
