use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::cli::InventoryArgs;
use crate::model::{BookEntry, BookInventoryManifest};
use crate::util::{now_utc_string, sha256_file, write_json_atomic};

pub const INVENTORY_FILENAME: &str = "book_inventory.json";

pub fn run(args: InventoryArgs) -> Result<()> {
    let manifest = build_manifest(&args.books_dir)?;

    for missing in &manifest.missing_toc {
        warn!(pdf = %missing, "no table of contents next to pdf");
    }

    if args.dry_run {
        info!(
            book_count = manifest.book_count,
            missing_toc = manifest.missing_toc.len(),
            source = %manifest.source_directory,
            "inventory dry-run complete"
        );
        return Ok(());
    }

    let manifest_path = args
        .manifest_path
        .unwrap_or_else(|| args.books_dir.join(INVENTORY_FILENAME));

    write_json_atomic(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote inventory manifest");
    info!(book_count = manifest.book_count, "inventory completed");

    Ok(())
}

/// `<stem>.toc.json` next to the PDF.
pub fn toc_path_for(pdf_path: &Path) -> PathBuf {
    let stem = pdf_path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("book");
    pdf_path.with_file_name(format!("{stem}.toc.json"))
}

pub fn build_manifest(books_dir: &Path) -> Result<BookInventoryManifest> {
    let mut pdf_paths = discover_pdfs(books_dir)?;
    pdf_paths.sort();

    if pdf_paths.is_empty() {
        bail!("no PDFs found in {}", books_dir.display());
    }

    let mut books = Vec::with_capacity(pdf_paths.len());
    let mut missing_toc = Vec::new();
    for path in pdf_paths {
        let pdf_filename = file_name(&path)?;
        let toc_path = toc_path_for(&path);
        if !toc_path.is_file() {
            missing_toc.push(pdf_filename);
            continue;
        }

        books.push(BookEntry {
            stem: path
                .file_stem()
                .and_then(|value| value.to_str())
                .unwrap_or_default()
                .to_string(),
            toc_filename: file_name(&toc_path)?,
            sha256: sha256_file(&path)?,
            pdf_filename,
        });
    }

    Ok(BookInventoryManifest {
        manifest_version: 1,
        generated_at: now_utc_string(),
        source_directory: books_dir.display().to_string(),
        book_count: books.len(),
        books,
        missing_toc,
    })
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(ToOwned::to_owned)
        .with_context(|| format!("invalid UTF-8 filename: {}", path.display()))
}

fn discover_pdfs(books_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pdfs = Vec::new();

    let entries = fs::read_dir(books_dir)
        .with_context(|| format!("failed to read {}", books_dir.display()))?;

    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", books_dir.display()))?;
        let path = entry.path();

        if !entry
            .file_type()
            .with_context(|| format!("failed to inspect file type: {}", path.display()))?
            .is_file()
        {
            continue;
        }

        let is_pdf = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);

        if is_pdf {
            pdfs.push(path);
        }
    }

    Ok(pdfs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn books_without_toc_are_listed_separately() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("Elton John.pdf"), b"a").expect("pdf");
        fs::write(dir.path().join("Elton John.toc.json"), b"[]").expect("toc");
        fs::write(dir.path().join("Queen.PDF"), b"b").expect("pdf");
        fs::write(dir.path().join("notes.txt"), b"c").expect("txt");

        let manifest = build_manifest(dir.path()).expect("manifest");

        assert_eq!(manifest.book_count, 1);
        assert_eq!(manifest.books[0].stem, "Elton John");
        assert_eq!(manifest.books[0].toc_filename, "Elton John.toc.json");
        assert_eq!(manifest.books[0].sha256.len(), 64);
        assert_eq!(manifest.missing_toc, vec!["Queen.PDF".to_string()]);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(build_manifest(dir.path()).is_err());
    }
}
