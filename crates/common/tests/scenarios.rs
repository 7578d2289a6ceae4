//! End-to-end scenarios across the MailProof domain model

use mailproof_common::aggregator::{Dispatch, WorkerEvent};
use mailproof_common::job::RenderJobUpdate;
use mailproof_common::result::{
    AccessibilityResult, CompatibilityIssue, IssueCategory, PerformanceResult, SpamResult,
};
use mailproof_common::screenshot::{ComparisonResult, ImageMetadata, StorageInfo, StorageProvider};
use mailproof_common::*;
use uuid::Uuid;

fn submit(clients: &[&str], ids: &dyn IdGenerator) -> RenderJob {
    let config = RenderJobConfig::new(clients.iter().copied());
    let params = CreateRenderJob {
        subject: Some("Autumn sale".to_string()),
        ..CreateRenderJob::new("user-42", "<html><body><h1>Sale</h1></body></html>", config)
    };
    RenderJob::create(params, ids).unwrap()
}

fn metadata() -> ImageMetadata {
    ImageMetadata {
        width: 1200,
        height: 2400,
        format: ImageFormat::Png,
        size_bytes: 512_000,
        quality: None,
        dpi: Some(144),
        color_space: Some("srgb".to_string()),
        has_alpha: false,
        hash: Some("3f2a".to_string()),
    }
}

fn storage(id: Uuid) -> StorageInfo {
    StorageInfo {
        provider: StorageProvider::Gcs,
        bucket: Some("mailproof-renders".to_string()),
        key: format!("renders/{}.png", id),
        url: format!("https://storage.example.com/renders/{}.png", id),
        thumbnail_url: None,
        cdn_url: Some(format!("https://cdn.example.com/renders/{}.png", id)),
        is_public: true,
        expires_at: None,
    }
}

fn capture_events(id: Uuid) -> Vec<WorkerEvent> {
    vec![
        WorkerEvent::CaptureStarted { screenshot_id: id },
        WorkerEvent::Captured {
            screenshot_id: id,
            metadata: metadata(),
            processing_time_ms: 1_100,
        },
        WorkerEvent::ProcessingStarted { screenshot_id: id },
        WorkerEvent::Stored {
            screenshot_id: id,
            storage: storage(id),
        },
        WorkerEvent::Compared {
            screenshot_id: id,
            comparison: ComparisonResult::new(Uuid::from_u128(7_000), 97.0),
        },
    ]
}

#[test]
fn test_two_clients_two_viewports_make_four_tasks() {
    let ids = SequentialIds::new();
    let mut job = submit(&["gmail", "yandex"], &ids);
    assert_eq!(job.total_tasks(), 4);

    let config = RenderJobConfig::new(["gmail", "yandex", "mailru"]);
    job.update(RenderJobUpdate {
        config: Some(config),
        ..RenderJobUpdate::default()
    })
    .unwrap();
    assert_eq!(job.total_tasks(), 6);
}

#[test]
fn test_complete_only_from_processing() {
    let ids = SequentialIds::new();
    let mut job = submit(&["gmail"], &ids);
    assert!(job.complete().is_err());
    job.queue().unwrap();
    assert!(job.complete().is_err());
    job.start().unwrap();
    job.complete().unwrap();

    assert_eq!(job.progress(), 100);
    assert!(job.completed_at().unwrap() >= job.started_at().unwrap());
    assert!(job.complete().is_err());
}

#[test]
fn test_gmail_preset_profile() {
    let gmail = presets::gmail().unwrap();
    assert_eq!(gmail.client_type(), ClientType::Web);
    assert_eq!(gmail.platform(), Platform::Web);
    let supported = Feature::SCORED.iter().filter(|f| gmail.supports_feature(**f)).count();
    assert_eq!(supported, 7);
    assert!((75..=100).contains(&gmail.compatibility_score()));
}

#[test]
fn test_entities_roundtrip_through_json() {
    let ids = SequentialIds::new();
    let job = submit(&["gmail", "outlook-2019"], &ids);
    let clients = presets::all().unwrap();
    let plan = CapturePlanner::new().plan(&job, &clients, &ids).unwrap();
    let result = TestResult::create(CreateTestResult::for_job(&job), &ids).unwrap();

    let json = serde_json::to_string(&job).unwrap();
    assert_eq!(serde_json::from_str::<RenderJob>(&json).unwrap(), job);
    for client in &clients {
        let json = serde_json::to_string(client).unwrap();
        assert_eq!(&serde_json::from_str::<EmailClient>(&json).unwrap(), client);
    }
    for shot in &plan.screenshots {
        assert_eq!(&Screenshot::from_data(shot.to_data()).unwrap(), shot);
    }
    assert_eq!(TestResult::from_data(result.to_data()).unwrap(), result);
}

#[test]
fn test_deserializing_revalidates() {
    let ids = SequentialIds::new();
    let job = submit(&["gmail"], &ids);
    let mut value = serde_json::to_value(&job).unwrap();
    value["config"]["clients"] = serde_json::json!([]);
    assert!(serde_json::from_value::<RenderJob>(value).is_err());
}

#[test]
fn test_full_job_lifecycle() {
    let ids = SequentialIds::new();
    let clients = presets::all().unwrap();
    let job = submit(&["gmail", "apple-mail"], &ids);
    let result = TestResult::create(CreateTestResult::for_job(&job), &ids).unwrap();
    let plan = CapturePlanner::new().plan(&job, &clients, &ids).unwrap();
    let screenshot_ids: Vec<Uuid> = plan.screenshots.iter().map(|s| s.id()).collect();

    let mut agg = JobAggregator::new(job, result, plan.screenshots, clients).unwrap();

    // first capture of the first screenshot fails once and is retried
    let dispatches = agg
        .apply(WorkerEvent::CaptureFailed {
            screenshot_id: screenshot_ids[0],
            error: "page load timeout".to_string(),
        })
        .unwrap();
    assert!(matches!(&dispatches[..], [Dispatch::Retry(task)] if task.attempt == 1));

    for id in &screenshot_ids {
        for event in capture_events(*id) {
            assert!(agg.apply(event).unwrap().is_empty());
        }
    }
    assert_eq!(agg.job().progress(), 100);

    for (client, viewport, status, score) in [
        ("gmail", "desktop", TestStatus::Passed, 95.0),
        ("gmail", "mobile", TestStatus::Passed, 90.0),
        ("apple-mail", "desktop", TestStatus::Passed, 99.0),
        ("apple-mail", "mobile", TestStatus::Failed, 64.0),
    ] {
        let issues = if status == TestStatus::Failed {
            vec![CompatibilityIssue::new(
                Severity::Critical,
                IssueCategory::Layout,
                "two-column layout does not stack",
            )]
        } else {
            Vec::new()
        };
        agg.apply(WorkerEvent::ClientTested {
            client_id: client.to_string(),
            viewport: viewport.to_string(),
            status,
            compatibility_score: score,
            issues,
            render_time_ms: 2_000,
            error_message: None,
        })
        .unwrap();
    }
    assert_eq!(agg.job().status(), JobStatus::Processing);

    agg.apply(WorkerEvent::Accessibility {
        result: AccessibilityResult::new(85.0),
    })
    .unwrap();
    agg.apply(WorkerEvent::Performance {
        result: PerformanceResult::new(70.0, 48_000),
    })
    .unwrap();
    let dispatches = agg
        .apply(WorkerEvent::Spam {
            result: SpamResult::new(90.0, 1.5, false),
        })
        .unwrap();
    assert!(matches!(
        &dispatches[..],
        [Dispatch::Finished {
            status: JobStatus::Completed,
            ..
        }]
    ));

    let snapshot = agg.into_snapshot();
    let result = &snapshot.result;
    assert_eq!(result.overall_status(), TestStatus::Failed);
    assert_eq!(result.summary().passed_clients, 3);
    assert_eq!(result.summary().failed_clients, 1);
    assert_eq!(result.summary().average_compatibility_score, 87.0);
    assert_eq!(result.summary().total_screenshots as usize, screenshot_ids.len());
    // 87 * 0.40 + 85 * 0.25 + 70 * 0.20 + 90 * 0.15
    assert_eq!(result.overall_score(), 83.55);
    assert_eq!(result.compatibility_level(), CompatibilityLevel::Good);
    assert_eq!(result.critical_issues().len(), 1);
    assert_eq!(result.critical_issues()[0].client_name, "Apple Mail");
    assert!(snapshot.screenshots.iter().all(|s| s.is_ready()));
    assert_eq!(snapshot.screenshots[0].retry_count(), 1);
}

#[test]
fn test_store_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("mailproof.db");
    let ids = SequentialIds::new();

    {
        let db = Database::open(&path).unwrap();
        db.save_all(&presets::all().unwrap()).unwrap();
        let job = submit(&["gmail"], &ids);
        let result = TestResult::create(CreateTestResult::for_job(&job), &ids).unwrap();
        db.save_job_state(&job, &result, &[]).unwrap();
    }

    let db = Database::open(&path).unwrap();
    assert_eq!(db.count::<EmailClient>().unwrap(), presets::PRESET_IDS.len());
    let jobs: Vec<RenderJob> = db.list().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(db.result_for_job(jobs[0].id()).unwrap().job_id(), jobs[0].id());
}
