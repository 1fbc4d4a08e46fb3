//! End-to-end import scenarios: archive in, encrypted index out, read back through a query.

use serde_json::json;
use tessera_ingest::{ConfiguredCategory, IngestOptions, InputFile};
use tessera_store::{FileStatus, ParseStage, ProviderQuery, ResetOutcome, SecretSource, SkipReason};

use crate::harness::{acme_export, gzip, ExportBuilder, TestVault};

async fn acme(tv: &TestVault) -> ProviderQuery<ConfiguredCategory> {
    tv.vault.provider::<ConfiguredCategory>("acme").await.unwrap()
}

fn zip_input(name: &str, builder: ExportBuilder) -> InputFile {
    InputFile::new(name, builder.zip().unwrap())
}

#[tokio::test]
async fn test_zip_with_json_and_csv() {
    let tv = TestVault::new();
    let report = tv
        .vault
        .import_files("acme", vec![acme_export().unwrap()], None, None)
        .await
        .unwrap();
    assert!(report.committed);
    assert_eq!(report.files, 2);
    assert_eq!(report.timeline_entries, 4);
    assert_eq!(report.parse_errors, 1);

    let q = acme(&tv).await;
    assert_eq!(q.get_files().len(), 2);
    assert_eq!(q.get_timeline_entries().len(), 4);
    assert!(q.get_has_errors());

    let csv = q.find_file("acme.zip/b.csv").unwrap();
    assert_eq!(csv.status, Some(FileStatus::Parsed));
    assert_eq!(csv.errors.len(), 1);
    assert_eq!(csv.errors[0].stage, ParseStage::Transform);
    assert!(q.find_file("acme.zip/a.json").unwrap().errors.is_empty());
}

#[tokio::test]
async fn test_oversize_member_of_tar_gz() {
    let tv = TestVault::with_options(IngestOptions {
        size_limit: 32,
        ..Default::default()
    });
    let export = ExportBuilder::new()
        .file("big.bin", vec![7u8; 100])
        .file("notes.txt", "short")
        .tar_gz()
        .unwrap();
    let report = tv
        .vault
        .import_files("acme", vec![InputFile::new("acme.tar.gz", export)], None, None)
        .await
        .unwrap();
    assert_eq!(report.files, 2);
    assert_eq!(report.skipped_too_large, 1);

    let q = acme(&tv).await;
    let big = q.find_file("acme.tar.gz/big.bin").unwrap().clone();
    assert_eq!(big.skipped, Some(SkipReason::TooLarge));
    assert!(big.payload.is_none());
    assert!(q.hydrate_file(&big).await.unwrap().unwrap().data.is_empty());

    let notes = q.find_file("acme.tar.gz/notes.txt").unwrap().clone();
    assert_eq!(notes.status, Some(FileStatus::Unknown));
    assert_eq!(q.hydrate_file(&notes).await.unwrap().unwrap().data, b"short");
}

#[tokio::test]
async fn test_reset_only_provider_then_reimport() {
    let tv = TestVault::new();
    tv.vault
        .import_files("acme", vec![acme_export().unwrap()], None, None)
        .await
        .unwrap();
    let first_secret = tv.secrets.current().await.unwrap();
    assert!(first_secret.is_some());

    assert_eq!(tv.vault.reset_provider("acme").await.unwrap(), ResetOutcome::StoreCleared);
    assert!(tv.vault.get_providers().await.unwrap().is_empty());
    assert!(tv.secrets.current().await.unwrap().is_none());
    assert!(acme(&tv).await.get_files().is_empty());

    tv.vault
        .import_files("acme", vec![acme_export().unwrap()], None, None)
        .await
        .unwrap();
    assert_ne!(tv.secrets.current().await.unwrap(), first_secret);
    assert_eq!(tv.vault.get_providers().await.unwrap().len(), 1);
    assert_eq!(acme(&tv).await.get_timeline_entries().len(), 4);
}

#[tokio::test]
async fn test_reset_keeps_other_providers() {
    let tv = TestVault::new();
    tv.vault
        .import_files("acme", vec![acme_export().unwrap()], None, None)
        .await
        .unwrap();
    let events = "{\"at\": 100, \"name\": \"boot\"}\n{\"at\": 200, \"name\": \"halt\"}\n";
    tv.vault
        .import_files("zeta", vec![InputFile::new("events.jsonl.gz", gzip(events.as_bytes()).unwrap())], None, None)
        .await
        .unwrap();

    assert_eq!(
        tv.vault.reset_provider("acme").await.unwrap(),
        ResetOutcome::Removed { remaining: 1 }
    );
    assert!(tv.vault.reset_provider("acme").await.unwrap() == ResetOutcome::NotPresent);
    let zeta = tv.vault.provider::<ConfiguredCategory>("zeta").await.unwrap();
    assert_eq!(zeta.get_timeline_entries().len(), 2);
    assert!(tv.secrets.current().await.unwrap().is_some());
}

#[tokio::test]
async fn test_gzip_input_is_single_member() {
    let tv = TestVault::new();
    let events = "{\"at\": 100, \"name\": \"boot\"}\n\n{\"at\": 200, \"name\": \"halt\"}\n";
    let report = tv
        .vault
        .import_files("zeta", vec![InputFile::new("events.jsonl.gz", gzip(events.as_bytes()).unwrap())], None, None)
        .await
        .unwrap();
    assert_eq!(report.files, 1);

    let q = tv.vault.provider::<ConfiguredCategory>("zeta").await.unwrap();
    assert_eq!(q.get_files()[0].path, vec!["events.jsonl.gz", "events.jsonl"]);
    let entries = q.get_timeline_entries();
    assert_eq!(entries.len(), 2);
    let first = q.hydrate_timeline_entry(&entries[0]).await.unwrap().unwrap();
    assert_eq!(first.context.unwrap().title, "boot");
    assert_eq!(first.value, json!({"at": 100, "name": "boot"}));
    assert_eq!(first.file, vec!["events.jsonl.gz", "events.jsonl"]);
}

#[tokio::test]
async fn test_nested_containers() {
    let tv = TestVault::new();
    let inner = ExportBuilder::new()
        .file("a.json", r#"[{"ts": "2023-01-01T00:00:00Z", "text": "deep"}]"#)
        .zip()
        .unwrap();
    let outer = ExportBuilder::new()
        .file("inner.zip", inner)
        .file("logs/b.csv.gz", gzip(b"date,place\n2023-01-02 00:00:00,home\n").unwrap())
        .file("a.json", r#"[{"ts": "2023-01-03T00:00:00Z", "text": "top"}]"#);
    tv.vault
        .import_files("acme", vec![zip_input("outer.zip", outer)], None, None)
        .await
        .unwrap();

    let q = acme(&tv).await;
    let paths: Vec<String> = q.get_files().iter().map(|f| f.joined_path()).collect();
    assert_eq!(paths.len(), 3);
    assert!(paths.contains(&"outer.zip/inner.zip/a.json".to_string()));
    assert!(paths.contains(&"outer.zip/logs/b.csv.gz/b.csv".to_string()));

    // Rules see the path below the top-level input, so nested copies don't match "a.json".
    let nested = q.find_file("outer.zip/inner.zip/a.json").unwrap();
    assert_eq!(nested.status, Some(FileStatus::Unknown));
    assert_eq!(q.find_file("outer.zip/a.json").unwrap().status, Some(FileStatus::Parsed));
    assert_eq!(q.get_timeline_entries().len(), 1);
}

#[tokio::test]
async fn test_corrupt_and_unsupported_inputs() {
    let tv = TestVault::new();
    let inputs = vec![
        InputFile::new("bad.zip", b"definitely not a zip".to_vec()),
        InputFile::new("readme.txt", b"hello".to_vec()),
        acme_export().unwrap(),
    ];
    let report = tv.vault.import_files("acme", inputs, None, None).await.unwrap();
    assert!(report.committed);
    assert_eq!(report.files, 2);
    let failed: Vec<&str> = report.failed_inputs.iter().map(|f| f.path.as_str()).collect();
    assert!(failed.contains(&"bad.zip"));
    assert!(failed.contains(&"readme.txt"));
    assert_eq!(acme(&tv).await.get_timeline_entries().len(), 4);
}

#[tokio::test]
async fn test_empty_selection_keeps_previous_import() {
    let tv = TestVault::new();
    tv.vault
        .import_files("acme", vec![acme_export().unwrap()], None, None)
        .await
        .unwrap();

    let report = tv
        .vault
        .import_files("acme", vec![InputFile::new("readme.txt", b"hello".to_vec())], None, None)
        .await
        .unwrap();
    assert!(!report.committed);
    assert_eq!(report.failed_inputs.len(), 1);
    assert_eq!(acme(&tv).await.get_timeline_entries().len(), 4);
}

#[tokio::test]
async fn test_reimport_replaces_everything() {
    let tv = TestVault::new();
    tv.vault
        .import_files("acme", vec![acme_export().unwrap()], None, None)
        .await
        .unwrap();
    let smaller = ExportBuilder::new().file("a.json", r#"[{"ts": "2024-01-01T00:00:00Z", "text": "only"}]"#);
    tv.vault
        .import_files("acme", vec![zip_input("acme.zip", smaller)], None, None)
        .await
        .unwrap();

    let q = acme(&tv).await;
    assert_eq!(q.get_files().len(), 1);
    assert_eq!(q.get_timeline_entries().len(), 1);
    assert!(!q.get_has_errors());
}

#[tokio::test]
async fn test_duplicate_tokens_collapse() {
    let tv = TestVault::new();
    let posts = r#"[
        {"ts": "2023-03-01T09:00:00Z", "text": "same"},
        {"ts": "2023-03-01T09:00:00Z", "text": "same"},
        {"ts": "2023-03-01T09:00:00Z", "text": "other"}
    ]"#;
    let report = tv
        .vault
        .import_files("acme", vec![zip_input("acme.zip", ExportBuilder::new().file("a.json", posts))], None, None)
        .await
        .unwrap();
    assert_eq!(report.timeline_entries, 2);
    assert_eq!(report.duplicate_entries, 1);
    assert_eq!(acme(&tv).await.get_timeline_entries().len(), 2);
}

#[tokio::test]
async fn test_timeline_is_chronological() {
    let tv = TestVault::new();
    let posts = r#"[
        {"ts": "2023-05-01T00:00:00Z", "text": "c"},
        {"ts": "2021-01-01T00:00:00Z", "text": "a"},
        {"ts": "2022-07-15T12:30:00+02:00", "text": "b"}
    ]"#;
    tv.vault
        .import_files("acme", vec![zip_input("acme.zip", ExportBuilder::new().file("a.json", posts))], None, None)
        .await
        .unwrap();

    let entries = acme(&tv).await.get_timeline_entries();
    let days: Vec<&str> = entries.iter().map(|e| e.day.as_str()).collect();
    assert_eq!(days, vec!["2021-01-01", "2022-07-15", "2023-05-01"]);
    assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert!(entries.windows(2).all(|w| w[0].slug < w[1].slug));
}

#[tokio::test]
async fn test_file_statuses_and_metadata() {
    let tv = TestVault::new();
    let export = ExportBuilder::new()
        .file("media/photos/1.jpg", b"\xff\xd8\xff")
        .file("logo.png", b"\x89PNG")
        .file("empty.json", "[{}, []]")
        .file("blank.txt", "  \n\t")
        .file("mystery.bin", b"\x00\x01\x02")
        .file("account.json", r#"{"id": 42, "email": "a@example.com"}"#);
    tv.vault
        .import_files("acme", vec![zip_input("acme.zip", export)], None, None)
        .await
        .unwrap();

    let q = acme(&tv).await;
    let status = |p: &str| q.find_file(&format!("acme.zip/{}", p)).and_then(|f| f.status);
    assert_eq!(status("media/photos/1.jpg"), Some(FileStatus::Skipped));
    assert_eq!(status("logo.png"), Some(FileStatus::Skipped));
    assert_eq!(status("empty.json"), Some(FileStatus::Empty));
    assert_eq!(status("blank.txt"), Some(FileStatus::Empty));
    assert_eq!(status("mystery.bin"), Some(FileStatus::Unknown));
    assert_eq!(status("account.json"), Some(FileStatus::Parsed));

    let metadata = q.get_metadata();
    assert_eq!(metadata["account"], json!({"id": 42, "email": "a@example.com"}));

    let skipped = q.find_file("acme.zip/logo.png").unwrap().clone();
    assert_eq!(q.hydrate_file(&skipped).await.unwrap().unwrap().data, b"\x89PNG");
}

#[tokio::test]
async fn test_profiles_filter_timeline() {
    let tv = TestVault::new();
    let with_profiles = || -> InputFile {
        let export = ExportBuilder::new()
            .file("profiles.json", r#"[{"name": "bob"}, {"name": "ann"}]"#)
            .file(
                "a.json",
                r#"[{"ts": "2023-03-01T09:00:00Z", "text": "first", "by": "ann"},
                    {"ts": "2023-03-02T09:00:00Z", "text": "second", "by": "bob"}]"#,
            )
            .file("b.csv", "date,place\n2023-03-01 12:00:00,cafe\n2023-03-03 18:30:00,gym\n");
        zip_input("acme.zip", export)
    };

    let profiles = tv.vault.list_profiles("acme", vec![with_profiles()]).await.unwrap();
    assert_eq!(profiles, vec!["ann", "bob"]);
    assert!(tv.vault.get_providers().await.unwrap().is_empty());

    tv.vault
        .import_files("acme", vec![with_profiles()], Some("ann".to_string()), None)
        .await
        .unwrap();
    let q = acme(&tv).await;
    let posts = q
        .get_timeline_entries()
        .into_iter()
        .filter(|e| e.category == ConfiguredCategory("post".into()))
        .count();
    assert_eq!(posts, 1);
    assert_eq!(q.get_timeline_entries().len(), 3);
}

#[tokio::test]
async fn test_entry_by_slug_and_raw_bytes() {
    let tv = TestVault::new();
    let export = acme_export().unwrap();
    tv.vault.import_files("acme", vec![export.clone()], None, None).await.unwrap();

    let q = acme(&tv).await;
    let key = q.get_timeline_entries().remove(0);
    let entry = q.get_timeline_entry_by_slug(&key.slug).await.unwrap().unwrap();
    assert_eq!(entry.key.slug, key.slug);
    assert_eq!(entry.context.unwrap().title, "first");
    assert!(q.get_timeline_entry_by_slug("0000000000000000").await.unwrap().is_none());

    let file = q.find_file("acme.zip/a.json").unwrap().clone();
    let stored = q.hydrate_file(&file).await.unwrap().unwrap();
    assert!(String::from_utf8(stored.data).unwrap().contains("\"second\""));
}

#[tokio::test]
async fn test_progress_reaches_one() {
    use std::sync::{Arc, Mutex};

    let tv = TestVault::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let progress: tessera_ingest::ProgressFn = Arc::new(move |f: f64| sink.lock().unwrap().push(f));
    let second = zip_input("more.zip", ExportBuilder::new().file("x.txt", "x"));
    tv.vault
        .import_files("acme", vec![acme_export().unwrap(), second], None, Some(progress))
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|f| (0.0..=1.0).contains(f)));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*seen.last().unwrap(), 1.0);
}

#[tokio::test]
async fn test_on_disk_vault_survives_reopen() {
    use tessera_ingest::{Vault, VaultConfig};

    let dir = tempfile::tempdir().unwrap();
    let config = VaultConfig {
        data_dir: dir.path().join("data"),
        secret_path: dir.path().join("secret.json"),
        providers: vec![crate::harness::acme_spec()],
        ..Default::default()
    };

    let vault = Vault::open(&config).await.unwrap();
    vault
        .import_files("acme", vec![acme_export().unwrap()], None, None)
        .await
        .unwrap();
    drop(vault);

    let reopened = Vault::open(&config).await.unwrap();
    let q = reopened.provider::<ConfiguredCategory>("acme").await.unwrap();
    assert_eq!(q.get_timeline_entries().len(), 4);
    let file = q.find_file("acme.zip/b.csv").unwrap().clone();
    assert!(q.hydrate_file(&file).await.unwrap().unwrap().data.starts_with(b"date,place"));

    assert_eq!(reopened.reset_provider("acme").await.unwrap(), ResetOutcome::StoreCleared);
    assert!(!config.secret_path.exists());
}
