//! End-to-end pipeline runs against scripted collaborators.

mod common;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use stockpile::admission::AdmissionGuard;
use stockpile::collaborators::mounted::MountedStorage;
use stockpile::error::CollaboratorError;
use stockpile::pipeline::layout::SUMMARY_FILE;
use stockpile::pipeline::{
    InputUnit, OrchestratorSettings, PipelineOrchestrator, RunOutcome, RunStage, SourceTag,
};
use stockpile::retry::{RetryPolicy, RetrySettings};
use stockpile::scheduler::{self, RunDispatcher};

fn orchestrator(fakes: &Fakes, out: &std::path::Path) -> PipelineOrchestrator {
    PipelineOrchestrator::new(fakes.collaborators.clone(), out, fast_settings())
}

// ── Scenario A ──────────────────────────────────────────────────────

#[tokio::test]
async fn empty_transcript_completes_with_nothing_downloaded() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let fakes = Fakes::phrases_only("", &["should never be used"]);

    let media = media_file(input_dir.path(), "silence.mp4");
    let run = orchestrator(&fakes, out.path())
        .run(InputUnit::new(media, SourceTag::Local))
        .await;

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    assert_eq!(run.stage, RunStage::Completed);
    assert!(run.phrases.is_empty());
    assert_eq!(run.files_downloaded(), 0);
    assert_eq!(fakes.extractor.calls.load(Ordering::SeqCst), 0);

    let project = run.project_dir.unwrap();
    assert!(subfolders(&project).is_empty());
    assert!(project.join(SUMMARY_FILE).is_file());

    let sent = fakes.notifier.last().unwrap();
    assert_eq!(sent.outcome, RunOutcome::Succeeded);
    assert_eq!(sent.phrases_processed, 0);
    assert_eq!(sent.files_downloaded, 0);
}

// ── Scenario B ──────────────────────────────────────────────────────

#[tokio::test]
async fn best_scored_candidate_is_the_one_downloaded() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let fakes = Fakes::new(
        FakeTranscriber::new("the berlin wall came down in 1989"),
        FakeExtractor::new(&["Berlin Wall"]),
        FakeSearcher::default().with(
            "berlin wall",
            ["a", "b", "c", "d", "e"].iter().map(|id| candidate(id)).collect(),
        ),
        FakeEvaluator::new(vec![evaluation("b", 7), evaluation("d", 9)]),
        FakeDownloader::new(),
        RecordingNotifier::default(),
    );
    let settings = OrchestratorSettings {
        max_candidates_per_phrase: 1,
        ..fast_settings()
    };
    let orchestrator = PipelineOrchestrator::new(fakes.collaborators.clone(), out.path(), settings);

    let media = media_file(input_dir.path(), "talk.mov");
    let run = orchestrator.run(InputUnit::new(media, SourceTag::Local)).await;

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    assert_eq!(fakes.downloader.attempts(), vec!["d".to_string()]);
    assert_eq!(run.files_downloaded(), 1);

    let file = &run.downloads[0].files[0];
    let name = file.file_name().unwrap().to_string_lossy();
    assert!(name.starts_with("score09_"), "{name}");
    assert_eq!(file.parent().unwrap().file_name().unwrap(), "berlin_wall");
    assert_eq!(fakes.notifier.last().unwrap().files_downloaded, 1);
}

// ── Scenario C ──────────────────────────────────────────────────────

#[tokio::test]
async fn fatal_download_failure_skips_only_that_candidate() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let fakes = Fakes::new(
        FakeTranscriber::new("crt monitors flicker"),
        FakeExtractor::new(&["crt monitor"]),
        FakeSearcher::default().with("crt monitor", vec![candidate("one"), candidate("two")]),
        FakeEvaluator::new(vec![evaluation("one", 9), evaluation("two", 8)]),
        FakeDownloader::new().failing("one", CollaboratorError::NotFound("video removed".into())),
        RecordingNotifier::default(),
    );

    let media = media_file(input_dir.path(), "talk.mp4");
    let run = orchestrator(&fakes, out.path())
        .run(InputUnit::new(media, SourceTag::Local))
        .await;

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    // Fatal failures are not retried.
    assert_eq!(fakes.downloader.attempts(), vec!["one".to_string(), "two".to_string()]);

    let files = &run.downloads[0].files;
    assert_eq!(files.len(), 1);
    assert!(files[0].is_file());
    assert!(files[0].file_name().unwrap().to_string_lossy().starts_with("score08_"));
}

// ── Scenario D ──────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_detection_runs_once() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let fakes = Fakes::new(
        FakeTranscriber::new("").slow(Duration::from_millis(200)),
        FakeExtractor::new(&[]),
        FakeSearcher::default(),
        FakeEvaluator::new(Vec::new()),
        FakeDownloader::new(),
        RecordingNotifier::default(),
    );
    let orchestrator = Arc::new(orchestrator(&fakes, out.path()));
    let guard = AdmissionGuard::new();
    let dispatcher = RunDispatcher::new(orchestrator, guard.clone(), 3);

    let media = media_file(input_dir.path(), "talk.mp4");
    let (scheduler, queue) = scheduler::channel();
    let callback = scheduler.detection_callback();
    callback(media.as_path(), SourceTag::Local);
    callback(media.as_path(), SourceTag::Local);
    drop(callback);
    drop(scheduler);

    let stats = tokio::time::timeout(
        Duration::from_secs(10),
        dispatcher.run(queue, std::future::pending()),
    )
    .await
    .unwrap();

    assert_eq!(stats.started, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(fakes.transcriber.calls(), 1);
    assert_eq!(fakes.notifier.count(), 1);
    assert_eq!(guard.active_count(), 0);
}

// ── Scenario E ──────────────────────────────────────────────────────

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let fakes = Fakes::new(
        FakeTranscriber::new("hello").failing_first([
            CollaboratorError::Network("connection reset".into()),
            CollaboratorError::Network("connection reset".into()),
        ]),
        FakeExtractor::new(&["hello"]),
        FakeSearcher::default(),
        FakeEvaluator::new(Vec::new()),
        FakeDownloader::new(),
        RecordingNotifier::default(),
    );
    let quick = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
    let settings = OrchestratorSettings {
        retry: RetrySettings {
            api: quick,
            download: quick,
            file: quick,
        },
        ..Default::default()
    };
    let orchestrator = PipelineOrchestrator::new(fakes.collaborators.clone(), out.path(), settings);

    let media = media_file(input_dir.path(), "talk.wav");
    let run = orchestrator.run(InputUnit::new(media, SourceTag::Local)).await;

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    assert_eq!(fakes.transcriber.calls(), 3);
    assert_eq!(run.transcript.as_deref(), Some("hello"));
    assert_eq!(run.phrases, vec!["hello".to_string()]);
}

// ── Failure paths ───────────────────────────────────────────────────

#[tokio::test]
async fn transcription_failure_fails_run_and_notifies() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let fakes = Fakes::new(
        FakeTranscriber::new("unused")
            .failing_first([CollaboratorError::Permission("model file unreadable".into())]),
        FakeExtractor::new(&["anything"]),
        FakeSearcher::default(),
        FakeEvaluator::new(Vec::new()),
        FakeDownloader::new(),
        RecordingNotifier::default(),
    );

    let media = media_file(input_dir.path(), "talk.mp4");
    let run = orchestrator(&fakes, out.path())
        .run(InputUnit::new(media, SourceTag::Local))
        .await;

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    assert_eq!(run.stage, RunStage::Failed);
    assert_eq!(fakes.transcriber.calls(), 1);
    assert!(run.project_dir.is_none());
    assert!(run.failure_reason.as_deref().unwrap().contains("model file unreadable"));

    let sent = fakes.notifier.last().unwrap();
    assert_eq!(sent.outcome, RunOutcome::Failed);
    assert!(sent.failure_reason.is_some());
    assert!(subfolders(out.path()).is_empty());
}

#[tokio::test]
async fn unsupported_input_never_reaches_transcriber() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let fakes = Fakes::phrases_only("text", &["phrase"]);

    let notes = media_file(input_dir.path(), "notes.txt");
    let run = orchestrator(&fakes, out.path())
        .run(InputUnit::new(notes, SourceTag::Local))
        .await;

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    assert_eq!(fakes.transcriber.calls(), 0);
}

#[tokio::test]
async fn extraction_failure_fails_run() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let fakes = Fakes::new(
        FakeTranscriber::new("a perfectly good transcript"),
        FakeExtractor::failing(CollaboratorError::Permission("api key rejected".into())),
        FakeSearcher::default(),
        FakeEvaluator::new(Vec::new()),
        FakeDownloader::new(),
        RecordingNotifier::default(),
    );

    let media = media_file(input_dir.path(), "talk.mp4");
    let run = orchestrator(&fakes, out.path())
        .run(InputUnit::new(media, SourceTag::Local))
        .await;

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    assert_eq!(fakes.extractor.calls.load(Ordering::SeqCst), 1);
    assert!(run.transcript.is_some());
    assert!(run.project_dir.is_none());
    let reason = run.failure_reason.unwrap();
    assert!(reason.contains("Phrase extraction failed"), "{reason}");
    assert_eq!(fakes.notifier.last().unwrap().outcome, RunOutcome::Failed);
}

#[tokio::test]
async fn search_and_evaluation_failures_skip_only_their_phrase() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let fakes = Fakes::new(
        FakeTranscriber::new("storms, harbors and bridges"),
        FakeExtractor::new(&["storm", "harbor", "bridge"]),
        FakeSearcher::default()
            .failing_for("storm", CollaboratorError::Permission("quota exceeded for key".into()))
            .with("harbor", vec![candidate("h1")])
            .with("bridge", vec![candidate("b1")]),
        FakeEvaluator::new(vec![evaluation("h1", 8), evaluation("b1", 9)])
            .failing_for("bridge", CollaboratorError::Validation("unparseable reply".into())),
        FakeDownloader::new(),
        RecordingNotifier::default(),
    );

    let media = media_file(input_dir.path(), "talk.mp4");
    let run = orchestrator(&fakes, out.path())
        .run(InputUnit::new(media, SourceTag::Local))
        .await;

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    assert_eq!(run.phrases_processed, 3);
    assert_eq!(fakes.downloader.attempts(), vec!["h1".to_string()]);
    let project = run.project_dir.unwrap();
    assert_eq!(subfolders(&project), vec![project.join("harbor")]);
}

#[tokio::test]
async fn notifier_failure_does_not_change_outcome() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let fakes = Fakes::new(
        FakeTranscriber::new(""),
        FakeExtractor::new(&[]),
        FakeSearcher::default(),
        FakeEvaluator::new(Vec::new()),
        FakeDownloader::new(),
        RecordingNotifier::failing(CollaboratorError::Validation("mailbox rejected".into())),
    );

    let media = media_file(input_dir.path(), "talk.mp4");
    let run = orchestrator(&fakes, out.path())
        .run(InputUnit::new(media, SourceTag::Local))
        .await;

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    assert_eq!(fakes.notifier.count(), 1);
}

// ── Downloads and folders ───────────────────────────────────────────

#[tokio::test]
async fn only_phrases_with_downloads_keep_folders() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let fakes = Fakes::new(
        FakeTranscriber::new("three topics"),
        FakeExtractor::new(&["found", "nothing here", "all failed"]),
        FakeSearcher::default()
            .with("found", vec![candidate("f1")])
            .with("all failed", vec![candidate("x1")]),
        FakeEvaluator::new(vec![evaluation("f1", 8), evaluation("x1", 10)]),
        FakeDownloader::new().failing("x1", CollaboratorError::Validation("too large".into())),
        RecordingNotifier::default(),
    );

    let media = media_file(input_dir.path(), "talk.mp4");
    let run = orchestrator(&fakes, out.path())
        .run(InputUnit::new(media, SourceTag::Local))
        .await;

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    assert_eq!(run.phrases_processed, 3);

    let project = run.project_dir.unwrap();
    let with_files = run.downloads.iter().filter(|d| !d.files.is_empty()).count();
    let folders = subfolders(&project);
    assert_eq!(folders.len(), with_files);
    assert_eq!(folders, vec![project.join("found")]);

    let summary = fs::read_to_string(project.join(SUMMARY_FILE)).unwrap();
    assert!(summary.contains("TOTAL FILES: 1"), "{summary}");
}

#[tokio::test]
async fn phrases_sharing_a_folder_name_do_not_share_a_folder() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let fakes = Fakes::new(
        FakeTranscriber::new("the city skyline at dusk"),
        FakeExtractor::new(&["city: skyline", "city? skyline"]),
        FakeSearcher::default()
            .with("city: skyline", vec![candidate("c1")])
            .with("city? skyline", vec![candidate("c2")]),
        FakeEvaluator::new(vec![evaluation("c1", 8), evaluation("c2", 8)]),
        FakeDownloader::new(),
        RecordingNotifier::default(),
    );

    let media = media_file(input_dir.path(), "talk.mp4");
    let run = orchestrator(&fakes, out.path())
        .run(InputUnit::new(media, SourceTag::Local))
        .await;

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    assert_eq!(run.phrases, vec!["city: skyline".to_string()]);

    let project = run.project_dir.unwrap();
    let with_files = run.downloads.iter().filter(|d| !d.files.is_empty()).count();
    let folders = subfolders(&project);
    assert_eq!(folders.len(), with_files);
    assert_eq!(folders, vec![project.join("city__skyline")]);
}

#[tokio::test]
async fn oversized_and_overlong_candidates_are_skipped() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let mut long = candidate("long");
    long.duration_secs = 3_600;
    let fakes = Fakes::new(
        FakeTranscriber::new("a topic"),
        FakeExtractor::new(&["topic"]),
        FakeSearcher::default().with("topic", vec![long, candidate("big")]),
        FakeEvaluator::new(vec![evaluation("long", 10), evaluation("big", 9)]),
        FakeDownloader::new().of_size(4_096),
        RecordingNotifier::default(),
    );
    let settings = OrchestratorSettings {
        max_download_bytes: 1_024,
        ..fast_settings()
    };
    let orchestrator = PipelineOrchestrator::new(fakes.collaborators.clone(), out.path(), settings);

    let media = media_file(input_dir.path(), "talk.mp4");
    let run = orchestrator.run(InputUnit::new(media, SourceTag::Local)).await;

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    // The long candidate is rejected before any download starts.
    assert_eq!(fakes.downloader.attempts(), vec!["big".to_string()]);
    assert_eq!(run.files_downloaded(), 0);
    assert!(subfolders(&run.project_dir.unwrap()).is_empty());
}

#[tokio::test]
async fn remote_folders_created_on_demand() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    fs::create_dir(mount.path().join("projects")).unwrap();

    let mut fakes = Fakes::new(
        FakeTranscriber::new("two topics"),
        FakeExtractor::new(&["harbor", "empty topic"]),
        FakeSearcher::default().with("harbor", vec![candidate("h1")]),
        FakeEvaluator::new(vec![evaluation("h1", 7)]),
        FakeDownloader::new(),
        RecordingNotifier::default(),
    );
    fakes.collaborators = fakes
        .collaborators
        .clone()
        .with_storage(Arc::new(MountedStorage::new(mount.path()).unwrap()));
    let settings = OrchestratorSettings {
        remote_parent: Some("projects".into()),
        remote_folders_on_demand: true,
        ..fast_settings()
    };
    let orchestrator = PipelineOrchestrator::new(fakes.collaborators.clone(), out.path(), settings);

    let media = media_file(input_dir.path(), "talk.mp4");
    let run = orchestrator.run(InputUnit::new(media, SourceTag::Local)).await;

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    let remote_id = run.remote_project.clone().unwrap();
    let remote_root = mount.path().join(&remote_id);
    assert!(remote_id.starts_with("projects/"));

    let remote_folders = subfolders(&remote_root);
    assert_eq!(remote_folders, vec![remote_root.join("harbor")]);
    let uploaded: Vec<_> = fs::read_dir(remote_root.join("harbor")).unwrap().flatten().collect();
    assert_eq!(uploaded.len(), 1);

    let local_project = run.project_dir.clone().unwrap();
    assert_eq!(subfolders(&local_project), vec![local_project.join("harbor")]);

    let link = fakes.notifier.last().unwrap().remote_project.unwrap();
    assert!(link.starts_with("file://"), "{link}");
}

#[tokio::test]
async fn remote_folders_created_at_layout_when_eager() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    fs::create_dir(mount.path().join("projects")).unwrap();

    let storage = Arc::new(ScriptedStorage::new(mount.path()));
    let mut fakes = Fakes::new(
        FakeTranscriber::new("two topics"),
        FakeExtractor::new(&["harbor", "empty topic"]),
        FakeSearcher::default().with("harbor", vec![candidate("h1")]),
        FakeEvaluator::new(vec![evaluation("h1", 7)]),
        FakeDownloader::new(),
        RecordingNotifier::default(),
    );
    fakes.collaborators = fakes.collaborators.clone().with_storage(storage.clone());
    let settings = OrchestratorSettings {
        remote_parent: Some("projects".into()),
        remote_folders_on_demand: false,
        ..fast_settings()
    };
    let orchestrator = PipelineOrchestrator::new(fakes.collaborators.clone(), out.path(), settings);
    assert!(!orchestrator.layout().lazy_phrase_folders());

    let media = media_file(input_dir.path(), "talk.mp4");
    let run = orchestrator.run(InputUnit::new(media, SourceTag::Local)).await;

    assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
    let remote_id = run.remote_project.clone().unwrap();
    // Every phrase folder exists remotely before the first download.
    assert_eq!(
        storage.created(),
        vec![
            remote_id.clone(),
            format!("{remote_id}/harbor"),
            format!("{remote_id}/empty_topic"),
        ]
    );
    let remote_root = mount.path().join(&remote_id);
    assert_eq!(
        subfolders(&remote_root),
        vec![remote_root.join("empty_topic"), remote_root.join("harbor")]
    );
    let uploaded: Vec<_> = fs::read_dir(remote_root.join("harbor")).unwrap().flatten().collect();
    assert_eq!(uploaded.len(), 1);

    // Locally, the empty phrase folder is still cleaned up.
    let local_project = run.project_dir.unwrap();
    assert_eq!(subfolders(&local_project), vec![local_project.join("harbor")]);
}

#[tokio::test]
async fn remote_project_folder_failure_fails_run() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();

    let storage = Arc::new(
        ScriptedStorage::new(mount.path()).failing_create(|_, parent| parent == "projects"),
    );
    let mut fakes = Fakes::new(
        FakeTranscriber::new("a topic"),
        FakeExtractor::new(&["harbor"]),
        FakeSearcher::default().with("harbor", vec![candidate("h1")]),
        FakeEvaluator::new(vec![evaluation("h1", 7)]),
        FakeDownloader::new(),
        RecordingNotifier::default(),
    );
    fakes.collaborators = fakes.collaborators.clone().with_storage(storage.clone());
    let settings = OrchestratorSettings {
        remote_parent: Some("projects".into()),
        ..fast_settings()
    };
    let orchestrator = PipelineOrchestrator::new(fakes.collaborators.clone(), out.path(), settings);

    let media = media_file(input_dir.path(), "talk.mp4");
    let run = orchestrator.run(InputUnit::new(media, SourceTag::Local)).await;

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    assert!(run.remote_project.is_none());
    assert!(storage.created().is_empty());
    assert!(fakes.downloader.attempts().is_empty());
    let reason = run.failure_reason.unwrap();
    assert!(reason.contains("Project layout failed"), "{reason}");
    assert_eq!(fakes.notifier.last().unwrap().outcome, RunOutcome::Failed);
}

#[tokio::test]
async fn phrase_folder_failure_escapes_phrase_and_fails_run() {
    let input_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    fs::create_dir(mount.path().join("projects")).unwrap();

    // The project folder is fine; its phrase folders are refused.
    let storage = Arc::new(
        ScriptedStorage::new(mount.path()).failing_create(|_, parent| parent != "projects"),
    );
    let mut fakes = Fakes::new(
        FakeTranscriber::new("two topics"),
        FakeExtractor::new(&["harbor", "bridge"]),
        FakeSearcher::default()
            .with("harbor", vec![candidate("h1")])
            .with("bridge", vec![candidate("b1")]),
        FakeEvaluator::new(vec![evaluation("h1", 7), evaluation("b1", 9)]),
        FakeDownloader::new(),
        RecordingNotifier::default(),
    );
    fakes.collaborators = fakes.collaborators.clone().with_storage(storage.clone());
    let settings = OrchestratorSettings {
        remote_parent: Some("projects".into()),
        remote_folders_on_demand: true,
        ..fast_settings()
    };
    let orchestrator = PipelineOrchestrator::new(fakes.collaborators.clone(), out.path(), settings);

    let media = media_file(input_dir.path(), "talk.mp4");
    let run = orchestrator.run(InputUnit::new(media, SourceTag::Local)).await;

    assert_eq!(run.outcome, Some(RunOutcome::Failed));
    assert_eq!(run.stage, RunStage::Failed);
    // The first phrase's failure stops the run; the second is never tried.
    assert_eq!(run.phrases_processed, 0);
    assert!(fakes.downloader.attempts().is_empty());
    assert_eq!(storage.created().len(), 1);
    let reason = run.failure_reason.unwrap();
    assert!(reason.contains("Folder creation failed for phrase 'harbor'"), "{reason}");

    let sent = fakes.notifier.last().unwrap();
    assert_eq!(sent.outcome, RunOutcome::Failed);
}
