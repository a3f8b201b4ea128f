use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::Utc;
use futures::{StreamExt, stream};
use tracing::{error, info, warn};

use crate::cli::BatchArgs;
use crate::commands::inventory;
use crate::commands::resolve::{BookJob, default_output_path, open_store, resolve_one};
use crate::config::{ClassifierKind, MappingConfig};
use crate::error::MappingError;
use crate::mapping::{CancelSignal, ObservationStore, cancel_pair};
use crate::model::{BatchBookResult, BatchRunManifest, BookEntry, BookOutcome, SegmentManifest};
use crate::util::{now_utc_string, utc_compact_string, write_json_atomic};

pub async fn run(args: BatchArgs) -> Result<()> {
    let mut config = MappingConfig::load(args.config.as_deref())?;
    if let Some(jobs) = args.jobs {
        config.batch.jobs = jobs;
    }
    config.validate()?;

    let inventory = inventory::build_manifest(&args.books_dir)?;
    let warnings = inventory
        .missing_toc
        .iter()
        .map(|pdf| format!("skipped {pdf}: no table of contents"))
        .collect::<Vec<_>>();
    for warning in &warnings {
        warn!("{warning}");
    }
    if inventory.books.is_empty() {
        bail!("no books with a table of contents in {}", args.books_dir.display());
    }

    let store = open_store(&args.cache_root)?;
    let (handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling batch");
            handle.cancel();
        }
    });

    let started = Utc::now();
    let run_id = format!("batch-{}", utc_compact_string(started));
    info!(
        run_id = %run_id,
        books = inventory.books.len(),
        jobs = config.batch.jobs,
        "batch started"
    );

    let mut results = stream::iter(inventory.books.iter())
        .map(|book| {
            run_book(
                book,
                &args.books_dir,
                &args.cache_root,
                &config,
                store.clone(),
                cancel.clone(),
            )
        })
        .buffer_unordered(config.batch.jobs)
        .collect::<Vec<BatchBookResult>>()
        .await;
    results.sort_by(|a, b| a.stem.cmp(&b.stem));

    let manifest = BatchRunManifest {
        manifest_version: 1,
        run_id,
        started_at: started.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        updated_at: now_utc_string(),
        books_dir: args.books_dir.display().to_string(),
        jobs: config.batch.jobs,
        books: results,
        warnings,
    };
    let manifest_path = args
        .cache_root
        .join("runs")
        .join(format!("batch_run_{}.json", utc_compact_string(started)));
    write_json_atomic(&manifest_path, &manifest)?;

    let count = |outcome: BookOutcome| {
        manifest
            .books
            .iter()
            .filter(|book| book.outcome == outcome)
            .count()
    };
    info!(
        path = %manifest_path.display(),
        accepted = count(BookOutcome::Accepted),
        review_required = count(BookOutcome::ReviewRequired),
        failed = count(BookOutcome::Failed),
        cancelled = count(BookOutcome::Cancelled),
        "batch completed"
    );

    Ok(())
}

/// Never fails: every problem is folded into the book's outcome so other
/// books keep running.
async fn run_book(
    book: &BookEntry,
    books_dir: &Path,
    cache_root: &Path,
    config: &MappingConfig,
    store: Arc<ObservationStore>,
    cancel: CancelSignal,
) -> BatchBookResult {
    if cancel.is_cancelled() {
        return outcome_for_error(&book.stem, BookOutcome::Cancelled, "batch cancelled");
    }

    let pdf_path = books_dir.join(&book.pdf_filename);
    let replay_path = match config.classifier.kind {
        ClassifierKind::Replay => Some(books_dir.join(format!("{}.replay.json", book.stem))),
        ClassifierKind::Command => None,
    };
    let job = BookJob {
        output_path: default_output_path(cache_root, &pdf_path),
        toc_path: books_dir.join(&book.toc_filename),
        pdf_path,
        replay_path,
        total_pages: None,
    };

    let resolving = resolve_one(&job, config, cache_root, store, cancel);
    let finished = match config.batch.book_timeout_secs {
        // Dropping the future on timeout kills any child process still running.
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), resolving).await {
            Ok(finished) => finished,
            Err(_) => {
                error!(book = %book.stem, timeout_secs = secs, "book timed out");
                return outcome_for_error(
                    &book.stem,
                    BookOutcome::Failed,
                    &format!("timed out after {secs} s"),
                );
            }
        },
        None => resolving.await,
    };

    match finished {
        Ok(manifest) => outcome_for_manifest(&book.stem, &job.output_path, &manifest),
        Err(err) => {
            let cancelled = matches!(
                err.downcast_ref::<MappingError>(),
                Some(MappingError::Cancelled)
            );
            if cancelled {
                warn!(book = %book.stem, "book cancelled");
                return outcome_for_error(&book.stem, BookOutcome::Cancelled, "batch cancelled");
            }
            error!(book = %book.stem, error = %format!("{err:#}"), "book failed");
            outcome_for_error(&book.stem, BookOutcome::Failed, &format!("{err:#}"))
        }
    }
}

fn outcome_for_manifest(
    stem: &str,
    artifact: &Path,
    manifest: &SegmentManifest,
) -> BatchBookResult {
    let outcome = if manifest.review.review_required {
        BookOutcome::ReviewRequired
    } else {
        BookOutcome::Accepted
    };
    info!(
        book = %stem,
        outcome = ?outcome,
        segments = manifest.segments.len(),
        fallback = manifest.review.fallback_count,
        "book finished"
    );
    BatchBookResult {
        stem: stem.to_string(),
        outcome,
        segment_count: manifest.segments.len(),
        fallback_count: manifest.review.fallback_count,
        artifact_path: Some(artifact.display().to_string()),
        error: None,
    }
}

fn outcome_for_error(stem: &str, outcome: BookOutcome, message: &str) -> BatchBookResult {
    BatchBookResult {
        stem: stem.to_string(),
        outcome,
        segment_count: 0,
        fallback_count: 0,
        artifact_path: None,
        error: Some(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn replay_config() -> MappingConfig {
        let mut config = MappingConfig::default();
        config.classifier.kind = ClassifierKind::Replay;
        config
    }

    fn book(stem: &str) -> BookEntry {
        BookEntry {
            stem: stem.to_string(),
            pdf_filename: format!("{stem}.pdf"),
            toc_filename: format!("{stem}.toc.json"),
            sha256: String::new(),
        }
    }

    #[tokio::test]
    async fn broken_book_is_isolated_as_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("Broken.pdf"), b"x").expect("pdf");
        fs::write(dir.path().join("Broken.toc.json"), b"not json").expect("toc");
        let cache_root = dir.path().join("cache");
        let store = open_store(&cache_root).expect("store");

        let result = run_book(
            &book("Broken"),
            dir.path(),
            &cache_root,
            &replay_config(),
            store,
            CancelSignal::never(),
        )
        .await;

        assert_eq!(result.outcome, BookOutcome::Failed);
        assert!(result.error.expect("error").contains("Broken.toc.json"));
        assert!(result.artifact_path.is_none());
    }

    #[tokio::test]
    async fn cancelled_batch_skips_remaining_books() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache_root = dir.path().join("cache");
        let store = open_store(&cache_root).expect("store");
        let (handle, cancel) = cancel_pair();
        handle.cancel();

        let result = run_book(
            &book("Never Started"),
            dir.path(),
            &cache_root,
            &replay_config(),
            store,
            cancel,
        )
        .await;

        assert_eq!(result.outcome, BookOutcome::Cancelled);
    }
}
