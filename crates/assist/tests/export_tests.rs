//! Export pipeline integration tests.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;

use assist::export::{EXPORT_DIR_NAME, ExportError, ExportPipeline, ExportSettings};
use assist::report::{PdfReportRenderer, report_file_name};

mod common;
use assist::store::{MessageRole, NewMessage};
use common::{TestApp, TestUploader, UploadBehaviour, add_user, seed_chat};

fn export_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 7).unwrap()
}

fn zip_entries(path: &Path) -> Vec<String> {
    let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_only_enabled_assistants_are_exported() {
    let app = TestApp::new().await;
    add_user(&app.repo, "u1", "alice", "user").await;
    add_user(&app.repo, "u2", "bob", "user").await;
    let first = seed_chat(&app.repo, "u1", "a1", "s1", 2).await;
    seed_chat(&app.repo, "u2", "a1", "s2", 4).await;
    seed_chat(&app.repo, "u1", "a2", "s3", 2).await;

    let report = app.export.run_for_date(export_date()).await.unwrap();

    assert_eq!(report.report_count, 2);
    assert_eq!(report.message_count, 6);
    assert!(report.uploaded);
    assert!(report.folder_removed);
    assert_eq!(
        report.archive_path,
        app.export_root().join(EXPORT_DIR_NAME).join("20250307.zip")
    );
    assert!(!app.export_root().join(EXPORT_DIR_NAME).join("20250307").exists());

    let entries = zip_entries(&report.archive_path);
    assert!(entries.iter().all(|e| !e.starts_with("A2")));
    assert!(entries.contains(&"A1/".to_string()));
    assert!(entries.contains(&"A1/alice/".to_string()));
    assert!(entries.contains(&"A1/bob/".to_string()));

    // Report numbering runs per assistant across users.
    let reports: Vec<_> = entries.iter().filter(|e| e.ends_with(".pdf")).collect();
    assert_eq!(reports.len(), 2);
    let seqs: BTreeSet<String> = reports
        .iter()
        .map(|e| {
            let name = e.rsplit('/').next().unwrap();
            name.trim_end_matches(".pdf").rsplit('_').next().unwrap().to_string()
        })
        .collect();
    assert_eq!(seqs, BTreeSet::from(["1".to_string(), "2".to_string()]));

    let date_part = report_file_name(first.created(), 1, "pdf");
    let date_part = &date_part["chat_".len().."chat_".len() + 8];
    assert!(reports.iter().all(|e| e.contains(&format!("chat_{date_part}_"))));
}

#[tokio::test]
async fn test_trivial_chat_gets_folder_but_no_report() {
    let app = TestApp::new().await;
    add_user(&app.repo, "u3", "dave", "user").await;
    seed_chat(&app.repo, "u3", "a1", "s1", 1).await;

    let report = app.export.run_for_date(export_date()).await.unwrap();

    assert_eq!(report.report_count, 0);
    assert_eq!(report.message_count, 0);
    let entries = zip_entries(&report.archive_path);
    assert_eq!(entries, vec!["A1/".to_string(), "A1/dave/".to_string()]);

    // The trivial chat is purged all the same.
    assert_eq!(report.purged.unwrap().chats, 1);
}

#[tokio::test]
async fn test_unknown_owner_falls_back_to_user_id() {
    let app = TestApp::new().await;
    seed_chat(&app.repo, "ghost-id", "a1", "s1", 2).await;

    let report = app.export.run_for_date(export_date()).await.unwrap();

    let entries = zip_entries(&report.archive_path);
    assert!(entries.contains(&"A1/ghost-id/".to_string()));
}

#[tokio::test]
async fn test_second_run_after_purge_is_empty() {
    let app = TestApp::new().await;
    add_user(&app.repo, "u1", "alice", "user").await;
    seed_chat(&app.repo, "u1", "a1", "s1", 2).await;

    let first = app.export.run_for_date(export_date()).await.unwrap();
    assert_eq!(first.report_count, 1);
    assert!(app.repo.record_counts().await.unwrap().is_empty());

    let next_day = export_date().succ_opt().unwrap();
    let second = app.export.run_for_date(next_day).await.unwrap();
    assert_eq!(second.report_count, 0);
    assert_eq!(second.message_count, 0);
    assert!(second.purged.unwrap().is_empty());
    assert_eq!(zip_entries(&second.archive_path), vec!["A1/".to_string()]);

    assert_eq!(
        app.uploader.uploaded(),
        vec!["20250307.zip".to_string(), "20250308.zip".to_string()]
    );
    assert!(app.archive_dir().join("20250308.zip").exists());
}

#[tokio::test]
async fn test_unverified_upload_aborts_before_purge() {
    let app = TestApp::with_upload(UploadBehaviour::Corrupt, false).await;
    seed_chat(&app.repo, "u1", "a1", "s1", 2).await;

    let result = app.export.run_for_date(export_date()).await;

    match result {
        Err(ExportError::UnverifiedUpload { archive }) => assert!(archive.exists()),
        other => panic!("expected unverified upload, got {other:?}"),
    }
    let counts = app.repo.record_counts().await.unwrap();
    assert_eq!(counts.chats, 1);
    assert_eq!(counts.messages, 2);
}

#[tokio::test]
async fn test_failed_upload_purges_when_verification_not_required() {
    let app = TestApp::new().await;
    seed_chat(&app.repo, "u1", "a1", "s1", 2).await;

    let uploader = Arc::new(TestUploader::new(
        UploadBehaviour::Fail,
        &app.temp.path().join("unused"),
    ));
    let pipeline = ExportPipeline::new(
        app.repo.clone(),
        Arc::new(PdfReportRenderer::new("Assist Test")),
        uploader,
        ExportSettings {
            root: app.temp.path().join("lenient"),
            require_verified_upload: false,
        },
    );

    let report = pipeline.run_for_date(export_date()).await.unwrap();

    assert!(!report.uploaded);
    assert!(report.archive_path.exists());
    assert_eq!(report.purged.unwrap().chats, 1);
    assert!(app.repo.record_counts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rows_written_during_export_survive_purge() {
    let app = TestApp::with_upload(UploadBehaviour::Verified, true).await;
    add_user(&app.repo, "u1", "alice", "user").await;
    add_user(&app.repo, "u2", "bob", "user").await;
    let exported = seed_chat(&app.repo, "u1", "a1", "s1", 2).await;

    let export = app.export.clone();
    let run = tokio::spawn(async move { export.run_for_date(export_date()).await });
    app.uploader.started.notified().await;

    // New chat and a follow-up on the exported one while the upload is pending.
    let late = seed_chat(&app.repo, "u2", "a1", "s2", 4).await;
    app.repo
        .append_message(NewMessage {
            chat_id: exported.id.clone(),
            role: MessageRole::User,
            content: "follow-up".to_string(),
            is_ocr: false,
        })
        .await
        .unwrap();

    app.uploader.release.notify_one();
    let report = run.await.unwrap().unwrap();

    assert_eq!(report.report_count, 1);
    assert_eq!(report.message_count, 2);
    let entries = zip_entries(&report.archive_path);
    assert!(entries.iter().all(|e| !e.starts_with("A1/bob")));

    let purged = report.purged.unwrap();
    assert_eq!(purged.messages, 2);
    assert_eq!(purged.chats, 0);

    assert_eq!(app.repo.list_messages(&late.id, true).await.unwrap().len(), 4);
    let kept = app.repo.list_messages(&exported.id, true).await.unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].content, "follow-up");

    // The next run picks up what the first one left behind.
    app.uploader.release.notify_one();
    let next = app
        .export
        .run_for_date(export_date().succ_opt().unwrap())
        .await
        .unwrap();
    assert_eq!(next.report_count, 1);
    assert!(app.repo.record_counts().await.unwrap().is_empty());
}
