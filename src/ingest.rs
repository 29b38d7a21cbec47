//! Dataset ingestion: unpack an uploaded zip into the retraining folder and
//! register every labeled image as an unprocessed training row.
//!
//! The retraining folder is wiped before every extraction. Callers hold the
//! shared dataset lock so ingestions never overlap each other or a retrain.

use std::collections::BTreeSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use chrono::Utc;
use zip::ZipArchive;

use crate::backend::{TableStore, TrainingRow, TRAINING_TABLE};
use crate::dataset::scan_labeled_dir;
use crate::error::ServiceError;

#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub registered: usize,
    pub labels: Vec<String>,
}

impl IngestOutcome {
    pub fn message(&self) -> String {
        format!("{} images extracted and saved.", self.registered)
    }
}

pub fn is_zip_name(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

/// Recreates `target` and extracts `archive` into it.
pub fn extract_archive(archive: &[u8], target: &Path) -> Result<(), ServiceError> {
    if target.exists() {
        std::fs::remove_dir_all(target)?;
    }
    std::fs::create_dir_all(target)?;

    let mut zip = ZipArchive::new(Cursor::new(archive))
        .map_err(|e| ServiceError::CorruptArchive(e.to_string()))?;
    zip.extract(target)
        .map_err(|e| ServiceError::CorruptArchive(e.to_string()))?;
    Ok(())
}

/// Builds one unprocessed row per image found under `root`'s label folders.
pub fn training_rows(root: &Path) -> Result<Vec<TrainingRow>, ServiceError> {
    let uploaded_at = Utc::now();
    let rows = scan_labeled_dir(root)?
        .into_iter()
        .map(|image| TrainingRow {
            id: None,
            image_path: image.path.to_string_lossy().into_owned(),
            shoe_class: image.label,
            is_processed: false,
            uploaded_at,
        })
        .collect();
    Ok(rows)
}

pub async fn ingest_archive(
    tables: &dyn TableStore,
    filename: &str,
    archive: Vec<u8>,
    target: &Path,
) -> Result<IngestOutcome, ServiceError> {
    if !is_zip_name(filename) {
        return Err(ServiceError::InvalidArchive);
    }

    let target: PathBuf = target.to_path_buf();
    let rows = tokio::task::spawn_blocking(move || {
        extract_archive(&archive, &target)?;
        training_rows(&target)
    })
    .await??;

    let labels: Vec<String> = rows
        .iter()
        .map(|r| r.shoe_class.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    if !rows.is_empty() {
        let batch = serde_json::to_value(&rows)?;
        tables
            .insert(TRAINING_TABLE, batch)
            .await
            .map_err(ServiceError::RemoteWriteFailure)?;
    }

    tracing::info!(
        "Ingested {} ({} training rows, labels {:?})",
        filename,
        rows.len(),
        labels
    );

    Ok(IngestOutcome {
        registered: rows.len(),
        labels,
    })
}


#[cfg(test)]
mod tests {
    use super::test_archives::*;
    use super::*;
    use crate::backend::fakes::MemoryBackend;

    #[tokio::test]
    async fn labeled_folders_become_unprocessed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("retraining_data");
        let backend = MemoryBackend::default();

        let outcome = ingest_archive(&backend, "shoes.zip", boots_and_sandals(), &target)
            .await
            .unwrap();

        assert_eq!(outcome.registered, 4);
        assert_eq!(outcome.labels, vec!["Boot", "Sandal"]);
        assert_eq!(outcome.message(), "4 images extracted and saved.");

        let rows = backend.rows(TRAINING_TABLE);
        assert_eq!(rows.len(), 4);
        for row in &rows {
            let row: TrainingRow = serde_json::from_value(row.clone()).unwrap();
            assert!(!row.is_processed);
            assert!(row.image_path.contains(&row.shoe_class));
            assert!(!row.image_path.ends_with(".txt"));
            assert!(Path::new(&row.image_path).exists());
        }
        let boots = rows.iter().filter(|r| r["shoe_class"] == "Boot").count();
        assert_eq!(boots, 2);
    }

    #[tokio::test]
    async fn non_zip_name_is_rejected_without_rows() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::default();

        let result = ingest_archive(
            &backend,
            "shoes.tar.gz",
            boots_and_sandals(),
            &dir.path().join("retraining_data"),
        )
        .await;

        assert!(matches!(result, Err(ServiceError::InvalidArchive)));
        assert!(backend.rows(TRAINING_TABLE).is_empty());
    }

    #[tokio::test]
    async fn corrupt_archive_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::default();

        let result = ingest_archive(
            &backend,
            "shoes.zip",
            b"PK\x03\x04 but not really".to_vec(),
            &dir.path().join("retraining_data"),
        )
        .await;

        assert!(matches!(result, Err(ServiceError::CorruptArchive(_))));
        assert!(backend.rows(TRAINING_TABLE).is_empty());
    }

    #[tokio::test]
    async fn reingestion_replaces_previous_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("retraining_data");
        let backend = MemoryBackend::default();

        ingest_archive(&backend, "first.zip", boots_and_sandals(), &target)
            .await
            .unwrap();
        let second = zip_with(&[("Shoe/x.jpg", png_bytes(9))]);
        let outcome = ingest_archive(&backend, "second.ZIP", second, &target)
            .await
            .unwrap();

        assert_eq!(outcome.labels, vec!["Shoe"]);
        assert!(!target.join("Boot").exists());
        assert_eq!(backend.rows(TRAINING_TABLE).len(), 5);
    }

    #[tokio::test]
    async fn failed_registration_surfaces_remote_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::default();
        backend.set_fail_writes(true);

        let result = ingest_archive(
            &backend,
            "shoes.zip",
            boots_and_sandals(),
            &dir.path().join("retraining_data"),
        )
        .await;

        assert!(matches!(result, Err(ServiceError::RemoteWriteFailure(_))));
    }
}
