use std::fs;

use super::*;
use crate::mapping::CancelSignal;
use crate::model::MatchConfidence;

fn spans(manifest: &SegmentManifest) -> Vec<(usize, usize)> {
    manifest
        .segments
        .iter()
        .map(|segment| (segment.start_pdf_index, segment.end_pdf_index))
        .collect()
}

fn write_book(dir: &Path) -> BookJob {
    let pdf_path = dir.join("Billy Joel - Greatest Hits.pdf");
    fs::write(&pdf_path, b"%PDF-1.4 not really a pdf").expect("pdf");

    let toc_path = dir.join("Billy Joel - Greatest Hits.toc.json");
    fs::write(
        &toc_path,
        r#"{"entries": [{"title": "Big Shot", "page": 3}, {"song_title": "Honesty", "printed_page": 7}]}"#,
    )
    .expect("toc");

    let replay_path = dir.join("replies.json");
    fs::write(
        &replay_path,
        r#"{
            "2": "PRINTED_PAGE: 3\nIS_SONG_START: YES\nSONG_TITLE: Big Shot",
            "3": "PRINTED_PAGE: 4\nIS_SONG_START: NO\nSONG_TITLE: none",
            "6": {"printed_page": 7, "is_song_start": true, "song_title": "Honesty"}
        }"#,
    )
    .expect("replay");

    BookJob {
        output_path: default_output_path(&dir.join("cache"), &pdf_path),
        pdf_path,
        toc_path,
        replay_path: Some(replay_path),
        total_pages: Some(12),
    }
}

#[test]
fn toc_accepts_bare_arrays_and_wrapped_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bare = dir.path().join("bare.json");
    fs::write(&bare, r#"[{"title": "Piano Man", "page": 12}]"#).expect("write");
    assert_eq!(
        load_toc(&bare).expect("toc"),
        vec![TocEntry::new("Piano Man", 12)]
    );

    let broken = dir.path().join("broken.json");
    fs::write(&broken, r#"{"songs": []}"#).expect("write");
    assert!(load_toc(&broken).is_err());
}

#[test]
fn default_output_uses_a_safe_stem() {
    let path = default_output_path(Path::new("/cache"), Path::new("/books/Movin' Out.pdf"));
    assert_eq!(path, PathBuf::from("/cache/segments/Movin__Out.segments.json"));
}

#[tokio::test]
async fn replayed_book_is_resolved_and_written() {
    let dir = tempfile::tempdir().expect("tempdir");
    let job = write_book(dir.path());
    let cache_root = dir.path().join("cache");
    let store = open_store(&cache_root).expect("store");
    let config = MappingConfig::default();

    let manifest = resolve_one(
        &job,
        &config,
        &cache_root,
        store.clone(),
        CancelSignal::never(),
    )
    .await
    .expect("resolve");

    assert_eq!(spans(&manifest), vec![(2, 5), (6, 11)]);
    assert!(
        manifest
            .segments
            .iter()
            .all(|segment| segment.match_confidence == MatchConfidence::DirectMatch)
    );
    assert_eq!(manifest.offset.global_offset(), Some(-1));
    assert_eq!(manifest.book.total_pages, 12);
    assert_eq!(manifest.book.book_id.len(), 64);

    let written: SegmentManifest = read_json(&job.output_path).expect("manifest");
    assert_eq!(written.segments, manifest.segments);

    let rerun = resolve_one(&job, &config, &cache_root, store, CancelSignal::never())
        .await
        .expect("rerun");
    assert_eq!(rerun.classifier.classifier_calls, 0);
    assert!(rerun.classifier.store_hits > 0);
    assert_eq!(
        serde_json::to_string(&rerun.segments).expect("json"),
        serde_json::to_string(&manifest.segments).expect("json")
    );
}

#[tokio::test]
async fn cancelled_book_leaves_no_artifact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let job = write_book(dir.path());
    let cache_root = dir.path().join("cache");
    let store = open_store(&cache_root).expect("store");
    let (handle, cancel) = cancel_pair();
    handle.cancel();

    let error = resolve_one(&job, &MappingConfig::default(), &cache_root, store, cancel)
        .await
        .expect_err("cancelled");

    assert!(matches!(
        error.downcast_ref::<crate::error::MappingError>(),
        Some(crate::error::MappingError::Cancelled)
    ));
    assert!(!job.output_path.exists());
}

#[tokio::test]
async fn command_classifier_requires_a_program() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut job = write_book(dir.path());
    job.replay_path = None;
    let cache_root = dir.path().join("cache");
    let store = open_store(&cache_root).expect("store");

    let error = resolve_one(
        &job,
        &MappingConfig::default(),
        &cache_root,
        store,
        CancelSignal::never(),
    )
    .await
    .expect_err("no program");
    assert!(error.to_string().contains("classifier.program"));
}

#[tokio::test]
async fn corrected_replay_file_is_read_again() {
    let dir = tempfile::tempdir().expect("tempdir");
    let job = write_book(dir.path());
    let cache_root = dir.path().join("cache");
    let store = open_store(&cache_root).expect("store");
    let config = MappingConfig::default();

    let first = resolve_one(&job, &config, &cache_root, store.clone(), CancelSignal::never())
        .await
        .expect("first");
    assert_eq!(spans(&first), vec![(2, 5), (6, 11)]);

    let replay_path = job.replay_path.clone().expect("replay path");
    fs::write(
        &replay_path,
        r#"{
            "2": "PRINTED_PAGE: 3\nIS_SONG_START: YES\nSONG_TITLE: Big Shot",
            "8": {"printed_page": null, "is_song_start": true, "song_title": "Honesty"}
        }"#,
    )
    .expect("rewrite replay");

    let second = resolve_one(&job, &config, &cache_root, store, CancelSignal::never())
        .await
        .expect("second");
    assert!(second.classifier.classifier_calls > 0);
    assert_eq!(spans(&second), vec![(2, 7), (8, 11)]);
}
