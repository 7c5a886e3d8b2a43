mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{DEFAULT_IMAGE_URL, FakeClient, ImageReply};
use gen_scheduler::Error;
use gen_scheduler::admission::{AdmissionController, MemoryRateLimitStore, WaitContext};
use gen_scheduler::config::{SettingsCache, StaticSettings};
use gen_scheduler::database::models::{
    GenerationTaskDbModel, PageDraft, PageType, RecordStatus, TaskKind, TaskParams, TaskStatus,
};
use gen_scheduler::database::repositories::{
    CompositeRepository, SqlxCompositeRepository, SqlxTaskRepository, TaskRepository,
};
use gen_scheduler::database::DbPool;
use gen_scheduler::database::time::now_ms;
use gen_scheduler::generation::{GenerationError, VideoJobStatus};
use gen_scheduler::scheduler::outcome::{INTERNAL_ERROR_MESSAGE, RETRY_LIMIT_MESSAGE, record_success};
use gen_scheduler::scheduler::reaper::STALE_MARGIN;
use gen_scheduler::scheduler::{
    GenerationStore, ImageTaskHandler, Outcome, PageStore, PageTaskHandler, RetryLadder,
    StaleTaskReaper, TaskStore, VideoTaskHandler, run_once,
};
use gen_scheduler::services::{CompositeService, NewRecord, NewTask, TaskService};

fn instant_ladder() -> RetryLadder {
    RetryLadder::new(vec![Duration::ZERO, Duration::ZERO, Duration::ZERO])
}

struct ImageHarness {
    _dir: tempfile::TempDir,
    pool: DbPool,
    repo: Arc<SqlxTaskRepository>,
    client: Arc<FakeClient>,
    handler: Arc<ImageTaskHandler>,
    store: GenerationStore,
    settings: Arc<SettingsCache>,
}

async fn image_harness(settings: StaticSettings, ladder: RetryLadder) -> ImageHarness {
    let (dir, pool) = common::setup_db().await;
    let repo = Arc::new(SqlxTaskRepository::new(pool.clone()));
    let client = FakeClient::new();
    let store = GenerationStore::new(repo.clone(), TaskKind::Image);
    let settings = common::settings(settings).await;
    let handler = Arc::new(ImageTaskHandler::new(
        store.clone(),
        client.clone(),
        common::storage(&dir),
        settings.clone(),
        ladder,
    ));
    ImageHarness {
        _dir: dir,
        pool,
        repo,
        client,
        handler,
        store,
        settings,
    }
}

/// Pretend the running row was last touched `age` ago.
async fn age_running_row(pool: &DbPool, id: &str, age: Duration) {
    sqlx::query("UPDATE generation_task SET updated_at = ? WHERE id = ?")
        .bind(now_ms() - age.as_millis() as i64)
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

async fn enqueue(repo: &SqlxTaskRepository, kind: TaskKind) -> String {
    let task =
        GenerationTaskDbModel::new(kind, 7, "img-1", "a red fox", &TaskParams::default()).unwrap();
    repo.create_task(&task).await.unwrap();
    task.id
}

#[tokio::test]
async fn timeouts_are_retried_until_success() {
    let settings =
        StaticSettings::new().with_task_timeout(TaskKind::Image, Duration::from_millis(50));
    let h = image_harness(settings, instant_ladder()).await;
    let id = enqueue(&h.repo, TaskKind::Image).await;

    h.client.push_image(ImageReply::Fail(GenerationError::GatewayTimeout));
    h.client.push_image(ImageReply::Hang);

    assert!(run_once(&h.handler).await.unwrap());
    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Pending));
    assert_eq!(task.attempts, 1);
    assert_eq!(task.last_error.as_deref(), Some("upstream gateway timeout"));
    assert!(task.next_attempt_at.is_some());

    // The provider call never returns; the execution deadline turns it into a timeout.
    assert!(run_once(&h.handler).await.unwrap());
    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Pending));
    assert_eq!(task.attempts, 2);
    assert_eq!(task.last_error.as_deref(), Some("generation timed out"));

    assert!(run_once(&h.handler).await.unwrap());
    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Succeeded));
    assert_eq!(task.attempts, 3);
    assert_eq!(task.last_error, None);
    assert_eq!(task.error_message, None);
    assert_eq!(task.media(), vec![DEFAULT_IMAGE_URL.to_string()]);
    assert!(task.completed_at.is_some());

    assert!(!run_once(&h.handler).await.unwrap());
}

#[tokio::test]
async fn retry_waits_follow_the_ladder() {
    let ladder = RetryLadder::new(vec![Duration::from_secs(10), Duration::from_secs(30)]);
    let h = image_harness(StaticSettings::new(), ladder).await;
    let id = enqueue(&h.repo, TaskKind::Image).await;

    h.client.push_image(ImageReply::Fail(GenerationError::Timeout));
    let before = now_ms();
    assert!(run_once(&h.handler).await.unwrap());
    let after = now_ms();

    let task = h.repo.get_task(&id).await.unwrap();
    let next = task.next_attempt_at.unwrap();
    assert!(next >= before + 10_000 && next <= after + 10_000);

    // Not due yet.
    assert!(!run_once(&h.handler).await.unwrap());
}

#[tokio::test]
async fn retry_ceiling_fails_the_task() {
    let settings = StaticSettings::new().with_max_attempts(TaskKind::Image, 2);
    let h = image_harness(settings, instant_ladder()).await;
    let id = enqueue(&h.repo, TaskKind::Image).await;

    h.client.push_image(ImageReply::Fail(GenerationError::Timeout));
    h.client.push_image(ImageReply::Fail(GenerationError::GatewayTimeout));

    assert!(run_once(&h.handler).await.unwrap());
    assert!(run_once(&h.handler).await.unwrap());

    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Failed));
    assert_eq!(task.attempts, 2);
    assert_eq!(task.error_message.as_deref(), Some("upstream gateway timeout"));
    assert!(task.media().is_empty());
    assert!(!run_once(&h.handler).await.unwrap());
}

#[tokio::test]
async fn non_retryable_errors_fail_immediately() {
    let h = image_harness(StaticSettings::new(), instant_ladder()).await;
    let id = enqueue(&h.repo, TaskKind::Image).await;

    h.client.push_image(ImageReply::Fail(GenerationError::Upstream {
        status: 400,
        message: "prompt rejected".to_string(),
    }));
    assert!(run_once(&h.handler).await.unwrap());

    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Failed));
    assert_eq!(task.attempts, 1);
    assert!(task.error_message.unwrap().contains("prompt rejected"));
}

#[tokio::test]
async fn panicking_execution_is_recorded_as_failure() {
    let h = image_harness(StaticSettings::new(), instant_ladder()).await;
    let id = enqueue(&h.repo, TaskKind::Image).await;

    h.client.push_image(ImageReply::Panic);
    assert!(run_once(&h.handler).await.unwrap());

    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Failed));
    assert_eq!(task.error_message.as_deref(), Some(INTERNAL_ERROR_MESSAGE));
}

#[tokio::test]
async fn inline_media_is_stored_before_completion() {
    let h = image_harness(StaticSettings::new(), instant_ladder()).await;
    let id = enqueue(&h.repo, TaskKind::Image).await;

    h.client.push_image(ImageReply::Bytes(vec![1, 2, 3, 4]));
    assert!(run_once(&h.handler).await.unwrap());

    let task = h.repo.get_task(&id).await.unwrap();
    let media = task.media();
    assert_eq!(media.len(), 1);
    assert!(media[0].starts_with("https://media.test/"));
    assert!(media[0].ends_with(".png"));
}

#[tokio::test]
async fn stale_recovery_supersedes_the_old_claim() {
    let h = image_harness(StaticSettings::new(), instant_ladder()).await;
    let id = enqueue(&h.repo, TaskKind::Image).await;

    // A worker claims the task and then goes quiet.
    let stale = h.store.claim_next().await.unwrap().unwrap();
    assert_eq!(stale.attempts, 1);

    let reaper = StaleTaskReaper::new(
        Arc::new(h.store.clone()),
        Duration::from_secs(600),
        Duration::from_secs(30),
    );
    assert_eq!(reaper.sweep_stale().await.unwrap(), 0);
    assert_eq!(reaper.sweep(now_ms() + 1).await.unwrap(), 1);

    assert!(run_once(&h.handler).await.unwrap());
    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Succeeded));
    assert_eq!(task.attempts, 2);

    // The late write from the first worker is rejected.
    let late = record_success(&h.store, &stale.claim(), &["https://late/x.png".to_string()]).await;
    assert_eq!(late, Outcome::Superseded);
    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.media(), vec![DEFAULT_IMAGE_URL.to_string()]);
}

#[tokio::test]
async fn reaper_outwaits_a_long_execution_timeout() {
    let settings =
        StaticSettings::new().with_task_timeout(TaskKind::Image, Duration::from_secs(1800));
    let h = image_harness(settings, instant_ladder()).await;
    let id = enqueue(&h.repo, TaskKind::Image).await;
    h.store.claim_next().await.unwrap().unwrap();

    let reaper = StaleTaskReaper::new(
        Arc::new(h.store.clone()),
        Duration::from_secs(600),
        Duration::from_secs(30),
    )
    .with_settings(h.settings.clone());
    assert_eq!(reaper.threshold(), Duration::from_secs(1800) + STALE_MARGIN);

    // Past the queue threshold but still inside the execution timeout.
    age_running_row(&h.pool, &id, Duration::from_secs(20 * 60)).await;
    assert_eq!(reaper.sweep_stale().await.unwrap(), 0);
    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Running));

    age_running_row(&h.pool, &id, Duration::from_secs(40 * 60)).await;
    assert_eq!(reaper.sweep_stale().await.unwrap(), 1);
    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Pending));
}

#[tokio::test]
async fn reaper_keeps_queue_threshold_for_short_timeouts() {
    let settings =
        StaticSettings::new().with_task_timeout(TaskKind::Image, Duration::from_secs(30));
    let h = image_harness(settings, instant_ladder()).await;
    let reaper = StaleTaskReaper::new(
        Arc::new(h.store.clone()),
        Duration::from_secs(600),
        Duration::from_secs(30),
    )
    .with_settings(h.settings.clone());
    assert_eq!(reaper.threshold(), Duration::from_secs(600));
}

#[tokio::test]
async fn recovered_claim_past_the_ceiling_fails_without_calling_the_provider() {
    let settings = StaticSettings::new().with_max_attempts(TaskKind::Image, 1);
    let h = image_harness(settings, instant_ladder()).await;
    let id = enqueue(&h.repo, TaskKind::Image).await;

    h.store.claim_next().await.unwrap().unwrap();
    let reaper = StaleTaskReaper::new(
        Arc::new(h.store.clone()),
        Duration::from_secs(600),
        Duration::from_secs(30),
    );
    reaper.sweep(now_ms() + 1).await.unwrap();

    assert!(run_once(&h.handler).await.unwrap());
    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Failed));
    assert_eq!(task.attempts, 2);
    assert_eq!(task.error_message.as_deref(), Some(RETRY_LIMIT_MESSAGE));
    assert!(h.client.image_requests().is_empty());
}

struct VideoHarness {
    _dir: tempfile::TempDir,
    repo: Arc<SqlxTaskRepository>,
    client: Arc<FakeClient>,
    store: GenerationStore,
    handler: Arc<VideoTaskHandler>,
}

async fn video_harness(poll_delay: Duration) -> VideoHarness {
    let (dir, pool) = common::setup_db().await;
    let repo = Arc::new(SqlxTaskRepository::new(pool));
    let client = FakeClient::new();
    let store = GenerationStore::new(repo.clone(), TaskKind::Video);
    let handler = Arc::new(VideoTaskHandler::new(
        store.clone(),
        client.clone(),
        common::storage(&dir),
        common::settings(StaticSettings::new()).await,
        instant_ladder(),
        poll_delay,
    ));
    VideoHarness {
        _dir: dir,
        repo,
        client,
        store,
        handler,
    }
}

#[tokio::test]
async fn video_is_submitted_once_then_polled_until_done() {
    let h = video_harness(Duration::ZERO).await;
    let id = enqueue(&h.repo, TaskKind::Video).await;

    h.client.push_video(VideoJobStatus::InProgress);
    h.client.push_video(VideoJobStatus::Completed);

    assert!(run_once(&h.handler).await.unwrap());
    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Running));
    assert_eq!(task.external_id.as_deref(), Some("job-1"));
    assert_eq!(task.attempts, 1);

    assert!(run_once(&h.handler).await.unwrap());
    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Running));
    assert_eq!(task.attempts, 2);

    assert!(run_once(&h.handler).await.unwrap());
    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Succeeded));
    assert_eq!(task.attempts, 3);
    assert_eq!(task.media(), vec!["https://provider.test/job-1.mp4".to_string()]);

    assert_eq!(h.client.submitted(), 1);
    assert_eq!(h.client.polled(), vec!["job-1".to_string(), "job-1".to_string()]);
}

#[tokio::test]
async fn rejected_video_job_fails_the_task() {
    let h = video_harness(Duration::ZERO).await;
    let id = enqueue(&h.repo, TaskKind::Video).await;

    h.client.push_video(VideoJobStatus::Failed);
    assert!(run_once(&h.handler).await.unwrap());
    assert!(run_once(&h.handler).await.unwrap());

    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Failed));
    assert_eq!(task.error_message.as_deref(), Some("content policy"));
}

#[tokio::test]
async fn parked_video_resumes_polling_after_restart() {
    let h = video_harness(Duration::from_secs(3600)).await;
    let id = enqueue(&h.repo, TaskKind::Video).await;

    assert!(run_once(&h.handler).await.unwrap());
    // Parked an hour out.
    assert!(!run_once(&h.handler).await.unwrap());

    let reaper = StaleTaskReaper::new(
        Arc::new(h.store.clone()),
        Duration::from_secs(1800),
        Duration::from_secs(60),
    );
    assert_eq!(reaper.sweep(now_ms() + 1).await.unwrap(), 1);

    h.client.push_video(VideoJobStatus::Completed);
    assert!(run_once(&h.handler).await.unwrap());

    let task = h.repo.get_task(&id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Succeeded));
    assert_eq!(h.client.submitted(), 1);
    assert_eq!(h.client.polled(), vec!["job-1".to_string()]);
}

struct PageHarness {
    _dir: tempfile::TempDir,
    repo: Arc<SqlxCompositeRepository>,
    client: Arc<FakeClient>,
    service: CompositeService,
    handler: Arc<PageTaskHandler>,
}

async fn page_harness() -> PageHarness {
    let (dir, pool) = common::setup_db().await;
    let repo = Arc::new(SqlxCompositeRepository::new(pool));
    let client = FakeClient::new();
    let settings = common::settings(StaticSettings::new()).await;
    let handler = Arc::new(PageTaskHandler::new(
        PageStore::new(repo.clone()),
        client.clone(),
        common::storage(&dir),
        settings.clone(),
        instant_ladder(),
    ));
    let admission = Arc::new(AdmissionController::new(
        Arc::new(MemoryRateLimitStore::new()),
        settings,
    ));
    let service = CompositeService::new(repo.clone(), admission);
    PageHarness {
        _dir: dir,
        repo,
        client,
        service,
        handler,
    }
}

fn story(pages: usize) -> NewRecord {
    NewRecord {
        user_id: 7,
        topic: "Moon cat".to_string(),
        outline: "A cat visits the moon.".to_string(),
        model_id: "img-1".to_string(),
        reference_images: vec!["https://uploads.test/cat.png".to_string()],
        pages: (0..pages)
            .map(|i| PageDraft::new(PageType::Content, format!("page {i}")))
            .collect(),
    }
}

async fn drain(handler: &Arc<PageTaskHandler>) -> usize {
    let mut runs = 0;
    while run_once(handler).await.unwrap() {
        runs += 1;
    }
    runs
}

#[tokio::test]
async fn cover_is_generated_first_and_feeds_later_pages() {
    let h = page_harness().await;
    let record = h.service.create_record(story(3)).await.unwrap();

    // Drafts are not scheduled.
    assert!(!run_once(&h.handler).await.unwrap());

    h.service
        .start_generation(&WaitContext::new(), None, 7, &record.id)
        .await
        .unwrap();

    h.client.push_image(ImageReply::Bytes(vec![9, 9, 9]));
    assert_eq!(drain(&h.handler).await, 3);

    let view = h.service.get_record(7, &record.id).await.unwrap();
    assert_eq!(view.record.status(), Some(RecordStatus::Completed));
    assert_eq!(view.counts.succeeded, 3);
    assert!(view.pages[0].is_cover());

    let cover_url = view.record.cover_url.clone().unwrap();
    assert!(cover_url.starts_with("https://media.test/"));
    assert_eq!(view.pages[0].media_url.as_deref(), Some(cover_url.as_str()));

    let requests = h.client.image_requests();
    assert_eq!(
        requests[0].reference_image.as_deref(),
        Some("https://uploads.test/cat.png")
    );
    assert_eq!(requests[1].reference_image.as_deref(), Some(cover_url.as_str()));
    assert_eq!(requests[2].reference_image.as_deref(), Some(cover_url.as_str()));
    assert!(requests[0].prompt.contains("Moon cat"));
}

#[tokio::test]
async fn failed_page_leaves_record_partial_until_retried() {
    let h = page_harness().await;
    let record = h.service.create_record(story(3)).await.unwrap();
    h.service
        .start_generation(&WaitContext::new(), None, 7, &record.id)
        .await
        .unwrap();

    h.client.push_image(ImageReply::Url("https://provider.test/cover.png".into()));
    h.client.push_image(ImageReply::Url("https://provider.test/p1.png".into()));
    h.client.push_image(ImageReply::Fail(GenerationError::Rejected("nsfw".into())));
    assert_eq!(drain(&h.handler).await, 3);

    let view = h.service.get_record(7, &record.id).await.unwrap();
    assert_eq!(view.record.status(), Some(RecordStatus::Partial));
    let failed = view.pages[2].clone();
    assert_eq!(failed.status(), Some(TaskStatus::Failed));

    assert!(matches!(
        h.service.retry_pages(7, &record.id, &[]).await,
        Err(Error::Validation(_))
    ));
    assert_eq!(
        h.service
            .retry_pages(7, &record.id, &[failed.id.clone()])
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        h.repo.get_record(&record.id).await.unwrap().status(),
        Some(RecordStatus::Generating)
    );

    assert_eq!(drain(&h.handler).await, 1);
    let view = h.service.get_record(7, &record.id).await.unwrap();
    assert_eq!(view.record.status(), Some(RecordStatus::Completed));
    assert_eq!(
        view.record.cover_url.as_deref(),
        Some("https://provider.test/cover.png")
    );
}

#[tokio::test]
async fn record_with_only_failures_is_in_error() {
    let h = page_harness().await;
    let record = h.service.create_record(story(2)).await.unwrap();
    h.service
        .start_generation(&WaitContext::new(), None, 7, &record.id)
        .await
        .unwrap();

    for _ in 0..2 {
        h.client.push_image(ImageReply::Fail(GenerationError::Upstream {
            status: 422,
            message: "bad prompt".to_string(),
        }));
    }
    // A failed cover does not block the remaining pages.
    assert_eq!(drain(&h.handler).await, 2);

    let view = h.service.get_record(7, &record.id).await.unwrap();
    assert_eq!(view.record.status(), Some(RecordStatus::Error));
    assert_eq!(view.record.cover_url, None);
    assert_eq!(view.counts.failed, 2);
}

#[tokio::test]
async fn regeneration_starts_a_fresh_attempt_round() {
    let h = page_harness().await;
    let record = h.service.create_record(story(1)).await.unwrap();
    let ctx = WaitContext::new();

    h.service.start_generation(&ctx, None, 7, &record.id).await.unwrap();
    for _ in 0..3 {
        h.client.push_image(ImageReply::Fail(GenerationError::Timeout));
    }
    assert_eq!(drain(&h.handler).await, 3);
    let view = h.service.get_record(7, &record.id).await.unwrap();
    assert_eq!(view.record.status(), Some(RecordStatus::Error));
    assert_eq!(view.pages[0].attempts, 3);

    h.service.start_generation(&ctx, None, 7, &record.id).await.unwrap();
    assert_eq!(drain(&h.handler).await, 1);
    let view = h.service.get_record(7, &record.id).await.unwrap();
    assert_eq!(view.record.status(), Some(RecordStatus::Completed));
    assert_eq!(view.pages[0].attempts, 4);
    assert_eq!(view.pages[0].attempts_in_round(), 1);
}

#[tokio::test]
async fn records_are_scoped_to_their_owner() {
    let h = page_harness().await;
    let record = h.service.create_record(story(1)).await.unwrap();

    assert!(matches!(
        h.service.get_record(8, &record.id).await,
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        h.service
            .start_generation(&WaitContext::new(), None, 8, &record.id)
            .await,
        Err(Error::NotFound { .. })
    ));
    assert!(h.service.delete_record(8, &record.id).await.is_err());

    h.service.delete_record(7, &record.id).await.unwrap();
    assert!(h.service.list_records(7, None, None).await.unwrap().is_empty());
}

async fn task_service(settings: StaticSettings) -> (tempfile::TempDir, TaskService) {
    let (dir, pool) = common::setup_db().await;
    let settings: Arc<SettingsCache> = common::settings(settings).await;
    let admission = Arc::new(AdmissionController::new(
        Arc::new(MemoryRateLimitStore::new()),
        settings,
    ));
    let service = TaskService::new(Arc::new(SqlxTaskRepository::new(pool)), admission);
    (dir, service)
}

#[tokio::test]
async fn submission_waits_for_admission_and_times_out() {
    let (_dir, service) = task_service(StaticSettings::new().with_model("img-1", 1, true)).await;

    let first = service
        .submit_image(&WaitContext::new(), None, NewTask::new(7, "img-1", "a fox"))
        .await
        .unwrap();
    assert_eq!(first.status(), Some(TaskStatus::Pending));

    let ctx = WaitContext::new().with_timeout(Duration::from_millis(100));
    let denied = service
        .submit_image(&ctx, None, NewTask::new(7, "img-1", "another fox"))
        .await;
    assert!(matches!(
        denied,
        Err(Error::RateLimited {
            deadline_exceeded: true
        })
    ));

    // Other users and unlimited models are unaffected.
    service
        .submit_image(&ctx, None, NewTask::new(8, "img-1", "a fox"))
        .await
        .unwrap();
    service
        .submit_video(&ctx, None, NewTask::new(7, "vid-1", "a running fox"))
        .await
        .unwrap();
}

#[tokio::test]
async fn submission_validates_and_normalizes() {
    let (_dir, service) = task_service(StaticSettings::new()).await;
    let ctx = WaitContext::new();

    assert!(matches!(
        service.submit_image(&ctx, None, NewTask::new(7, "img-1", "  ")).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        service.submit_image(&ctx, None, NewTask::new(0, "img-1", "fox")).await,
        Err(Error::Validation(_))
    ));

    let params = TaskParams {
        count: 12,
        ..TaskParams::default()
    };
    let task = service
        .submit_image(&ctx, None, NewTask::new(7, " img-1 ", " fox ").with_params(params))
        .await
        .unwrap();
    assert_eq!(task.model_id, "img-1");
    assert_eq!(task.prompt, "fox");
    assert_eq!(task.params().unwrap().count, 4);
}

#[tokio::test]
async fn tasks_are_deleted_only_by_their_owner() {
    let (_dir, service) = task_service(StaticSettings::new()).await;
    let task = service
        .submit_image(&WaitContext::new(), None, NewTask::new(7, "img-1", "fox"))
        .await
        .unwrap();

    assert!(matches!(
        service.delete(8, &task.id).await,
        Err(Error::NotFound { .. })
    ));
    service.delete(7, &task.id).await.unwrap();
    assert!(matches!(
        service.get_status(&task.id).await,
        Err(Error::NotFound { .. })
    ));
}
