//! Property-based tests over whole imports.

use proptest::prelude::*;
use tessera_ingest::{ConfiguredCategory, InputFile};

use crate::harness::{ExportBuilder, TestVault};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn posts_json(posts: &[(u32, String)]) -> String {
    let items: Vec<serde_json::Value> = posts
        .iter()
        .map(|(secs, text)| {
            serde_json::json!({"ts": time_of_day(*secs), "text": text})
        })
        .collect();
    serde_json::Value::Array(items).to_string()
}

/// `secs` after midnight on 2020-01-01, as RFC 3339.
fn time_of_day(secs: u32) -> String {
    let secs = secs % 86_400;
    format!("2020-01-01T{:02}:{:02}:{:02}Z", secs / 3600, (secs / 60) % 60, secs % 60)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_entries_are_distinct_tokens(posts in prop::collection::vec((0u32..86_400, "[a-z]{1,6}"), 0..20)) {
        let tv = TestVault::new();
        let data = ExportBuilder::new().file("a.json", posts_json(&posts)).zip().unwrap();
        let report = runtime()
            .block_on(tv.vault.import_files("acme", vec![InputFile::new("x.zip", data)], None, None))
            .unwrap();

        let distinct: std::collections::BTreeSet<_> = posts.iter().collect();
        prop_assert_eq!(report.timeline_entries, distinct.len());
        prop_assert_eq!(report.timeline_entries + report.duplicate_entries, posts.len());
        prop_assert_eq!(report.parse_errors, 0);
    }

    #[test]
    fn prop_arbitrary_files_never_fail_an_import(
        files in prop::collection::vec(("[a-z]{1,8}\\.(json|csv|txt)", prop::collection::vec(any::<u8>(), 0..256)), 1..8)
    ) {
        let tv = TestVault::new();
        let mut builder = ExportBuilder::new();
        let mut names = std::collections::BTreeSet::new();
        for (name, data) in &files {
            if names.insert(name.clone()) {
                builder = builder.file(name, data);
            }
        }
        let data = builder.zip().unwrap();
        let rt = runtime();
        let report = rt
            .block_on(tv.vault.import_files("acme", vec![InputFile::new("x.zip", data)], None, None))
            .unwrap();
        prop_assert!(report.committed);
        prop_assert_eq!(report.files, names.len());

        let q = rt.block_on(tv.vault.provider::<ConfiguredCategory>("acme")).unwrap();
        prop_assert_eq!(q.get_files().len(), names.len());
        prop_assert!(q.get_files().iter().all(|f| f.status.is_some()));
    }
}
