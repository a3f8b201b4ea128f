use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::mapping::ObservationStore;
use crate::model::{BatchRunManifest, SegmentManifest};
use crate::util::read_json;

pub fn run(args: StatusArgs) -> Result<()> {
    let segments_dir = args.cache_root.join("segments");
    let runs_dir = args.cache_root.join("runs");
    let store_path = args.cache_root.join("observations.sqlite");

    info!(cache_root = %args.cache_root.display(), "status requested");

    let manifests = json_files(&segments_dir, ".segments.json")?;
    if manifests.is_empty() {
        warn!(path = %segments_dir.display(), "no segment manifests found");
    }

    let store = if store_path.exists() {
        let store = ObservationStore::open(&store_path)
            .with_context(|| format!("failed to open {}", store_path.display()))?;
        info!(
            path = %store_path.display(),
            books = store.count_books()?,
            "observation store status"
        );
        Some(store)
    } else {
        warn!(path = %store_path.display(), "observation store missing");
        None
    };

    let mut review_required = 0usize;
    let mut incomplete = 0usize;
    for path in &manifests {
        let manifest: SegmentManifest = match read_json(path) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "unreadable segment manifest"
                );
                continue;
            }
        };
        if manifest.review.review_required {
            review_required += 1;
        }
        if !manifest.review.complete {
            incomplete += 1;
        }

        let stored_pages = match &store {
            Some(store) => store.count_for_book(&manifest.book.book_id)?,
            None => 0,
        };
        let longest_song = manifest
            .segments
            .iter()
            .map(|segment| segment.page_count())
            .max()
            .unwrap_or(0);

        info!(
            pdf = %manifest.book.pdf_path,
            generated_at = %manifest.generated_at,
            offset_status = ?manifest.offset.status,
            offset = ?manifest.offset.global_offset(),
            segments = manifest.segments.len(),
            toc_entries = manifest.toc_entry_count,
            fallback = manifest.review.fallback_count,
            longest_song,
            stored_pages,
            review_required = manifest.review.review_required,
            reasons = %manifest.review.reasons.join("; "),
            "book status"
        );
    }

    info!(
        books = manifests.len(),
        review_required,
        incomplete,
        "segment manifest totals"
    );

    match json_files(&runs_dir, ".json")?.last() {
        Some(latest) => {
            let run: BatchRunManifest = read_json(latest)?;
            info!(
                run_id = %run.run_id,
                started_at = %run.started_at,
                books = run.books.len(),
                warnings = run.warnings.len(),
                "latest batch run"
            );
        }
        None => warn!(path = %runs_dir.display(), "no batch runs recorded"),
    }

    Ok(())
}

/// Sorted files in `dir` whose names end with `suffix`; a missing directory
/// yields nothing.
fn json_files(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(suffix) && !name.starts_with('.'));
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_and_foreign_files_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("b.segments.json"), b"{}").expect("write");
        fs::write(dir.path().join("a.segments.json"), b"{}").expect("write");
        fs::write(dir.path().join(".a.segments.json.42.partial"), b"{}").expect("write");
        fs::write(dir.path().join("notes.txt"), b"").expect("write");

        let files = json_files(dir.path(), ".segments.json").expect("files");
        let names = files
            .iter()
            .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.segments.json", "b.segments.json"]);
    }

    #[test]
    fn empty_cache_root_reports_without_failing() {
        let dir = tempfile::tempdir().expect("tempdir");
        run(StatusArgs {
            cache_root: dir.path().to_path_buf(),
        })
        .expect("status");
    }
}
