// tests/full_pipeline_test.rs

mod common;

use common::{Harness, StubBehavior, StubStage};
use docflow::backend::TaskQueue;
use docflow::data_model::{DocumentStatus, PipelineStep};
use docflow::error::PipelineError;
use docflow::quota::QuotaType;
use docflow::router::IngestOutcome;
use std::collections::HashMap;

#[tokio::test(start_paused = true)]
async fn document_flows_through_all_stages_to_completion() {
    let harness = Harness::new(Harness::fast_settings());

    let outcome = harness.ingest_upload("doc-1", "org-a").await;
    let document = match outcome {
        IngestOutcome::Created(doc) => doc,
        other => panic!("expected Created, got {:?}", other),
    };
    assert_eq!(document.status, DocumentStatus::Pending);
    assert_eq!(document.original_location, "mem://canonical/doc-1");

    harness.drain().await;

    let document = harness.document("doc-1").await;
    assert_eq!(document.status, DocumentStatus::Completed);
    // one artifact per stage
    assert_eq!(document.artifacts.len(), PipelineStep::ALL.len());
    assert!(document.artifacts.contains_key("ocr"));
    assert!(document.artifacts.contains_key("notifier"));
    assert!(document.error_message.is_none());

    let events = harness.sink.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, DocumentStatus::Completed);
    let results = events[0].results.as_ref().expect("completed event carries results");
    assert_eq!(results.len(), PipelineStep::ALL.len());
}

#[tokio::test(start_paused = true)]
async fn duplicate_ingest_is_skipped_without_side_effects() {
    let harness = Harness::new(Harness::fast_settings());

    let first = harness.ingest_upload("doc-2", "org-a").await;
    assert!(matches!(first, IngestOutcome::Created(_)));
    // one process message from the first ingest
    assert_eq!(harness.queue.len().await, 1);

    let second = harness.ingest_upload("doc-2", "org-a").await;
    match second {
        IngestOutcome::Skipped { doc_id, .. } => assert_eq!(doc_id, "doc-2"),
        other => panic!("expected Skipped, got {:?}", other),
    }
    assert_eq!(harness.queue.len().await, 1);

    harness.drain().await;
    assert_eq!(harness.document("doc-2").await.status, DocumentStatus::Completed);

    // still a duplicate after completion
    let third = harness.ingest_upload("doc-2", "org-a").await;
    assert!(matches!(third, IngestOutcome::Skipped { .. }));
    assert!(harness.queue.is_empty().await);
    assert_eq!(harness.sink.events().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn ingest_is_denied_once_the_file_count_quota_is_spent() {
    let mut settings = Harness::fast_settings();
    settings.quotas.default_limits.file_count_total = 1;
    let harness = Harness::new(settings);

    let first = harness.ingest_upload("doc-f1", "org-q").await;
    assert!(matches!(first, IngestOutcome::Created(_)));

    // admission recorded the upload against both counters
    let files = harness.quota.status("org-q", QuotaType::FileCountTotal).await.unwrap();
    assert_eq!(files.current_usage, 1);
    let storage = harness.quota.status("org-q", QuotaType::StorageTotal).await.unwrap();
    assert_eq!(storage.current_usage, 9);

    let denied = harness.try_ingest_upload("doc-f2", "org-q").await;
    match denied {
        Err(PipelineError::QuotaExceeded { org_id, quota }) => {
            assert_eq!(org_id, "org-q");
            assert_eq!(quota, "file_count_total");
        }
        other => panic!("expected QuotaExceeded, got {:?}", other),
    }
    // nothing was persisted or dispatched for the denied request
    assert!(harness.state.get_document("doc-f2").await.unwrap().is_none());
    assert_eq!(harness.queue.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn oversized_upload_is_denied_by_the_storage_quota() {
    let mut settings = Harness::fast_settings();
    settings.quotas.default_limits.storage_total_bytes = 4;
    let harness = Harness::new(settings);

    // the seeded upload is 9 bytes, over the 4-byte allowance
    let denied = harness.try_ingest_upload("doc-f3", "org-q").await;
    match denied {
        Err(PipelineError::QuotaExceeded { quota, .. }) => {
            assert_eq!(quota, "storage_total");
        }
        other => panic!("expected QuotaExceeded, got {:?}", other),
    }
    assert!(harness.state.get_document("doc-f3").await.unwrap().is_none());
    assert!(harness.queue.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn transient_stage_failure_is_retried_to_success() {
    let flaky = StubStage::new(PipelineStep::Structure, StubBehavior::FailFirst(2));
    let harness = Harness::with_stages(Harness::fast_settings(), vec![flaky.clone()]);

    harness.ingest_upload("doc-3", "org-a").await;
    harness.drain().await;

    assert_eq!(flaky.calls(), 3);
    let document = harness.document("doc-3").await;
    assert_eq!(document.status, DocumentStatus::Completed);
    assert!(document.artifacts.contains_key("structure"));
}

#[tokio::test(start_paused = true)]
async fn retries_are_bounded_and_final_error_is_reported() {
    let mut settings = Harness::fast_settings();
    settings.retry.default_max_retries = 2;
    let broken = StubStage::new(PipelineStep::Tagger, StubBehavior::AlwaysFail);
    let harness = Harness::with_stages(settings, vec![broken.clone()]);

    harness.ingest_upload("doc-4", "org-a").await;
    harness.drain().await;

    // initial attempt plus two retries
    assert_eq!(broken.calls(), 3);
    let document = harness.document("doc-4").await;
    assert_eq!(document.status, DocumentStatus::Failed);
    let error = document.error_message.expect("failed document carries the error");
    assert!(error.contains("induced failure"), "got '{}'", error);

    let events = harness.sink.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, DocumentStatus::Failed);
    assert!(events[0].results.is_none());
    assert_eq!(events[0].error.as_deref(), Some(error.as_str()));
}

#[tokio::test(start_paused = true)]
async fn low_confidence_output_flags_the_document_for_review() {
    let structure = StubStage::new(
        PipelineStep::Structure,
        StubBehavior::SucceedWith(HashMap::from([
            ("structureExtraction".to_string(), 0.5),
            ("altTextGeneration".to_string(), 0.95),
        ])),
    );
    let harness = Harness::with_stages(Harness::fast_settings(), vec![structure]);

    harness.ingest_upload("doc-5", "org-a").await;
    harness.drain().await;

    let document = harness.document("doc-5").await;
    assert_eq!(document.status, DocumentStatus::Completed);
    assert_eq!(document.metadata.get("needs_review").map(String::as_str), Some("true"));
    // weighted score 0.66875 lands in the medium band
    assert_eq!(
        document.metadata.get("review_priority").map(String::as_str),
        Some("medium")
    );
}

#[tokio::test(start_paused = true)]
async fn stage_output_feeds_the_next_stage_input() {
    let harness = Harness::new(Harness::fast_settings());

    harness.ingest_upload("doc-6", "org-a").await;

    // run the first stage, then inspect the job created for the second
    let delivery = harness.queue.dequeue().await.unwrap();
    harness.worker.handle_delivery(delivery).await;

    let next = harness.queue.dequeue().await.unwrap();
    assert_eq!(next.message.step, PipelineStep::Structure);
    let job = harness.job(&next.message.job_id).await;
    assert_eq!(job.input_data["data"]["step"], "ocr");
}
