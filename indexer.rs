use crate::error::{Error, Result};
use crate::models::{IndexFailure, IndexReport, RecognizeOptions, ReferenceIndexEntry};
use crate::recognizer::Recognizer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;
use walkdir::WalkDir;

const SUPPORTED_EXT: &[&str] = &["jpg", "jpeg", "png"];

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXT.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Runs every image under a directory through the recognizer. One file
/// failing is recorded in the report and never aborts the batch.
pub struct ReferenceIndexer {
    recognizer: Arc<Recognizer>,
    options: RecognizeOptions,
    concurrency: usize,
}

type FileOutcome = std::result::Result<ReferenceIndexEntry, IndexFailure>;

impl ReferenceIndexer {
    pub fn new(recognizer: Arc<Recognizer>, threshold: f64, concurrency: usize) -> Self {
        Self {
            recognizer,
            options: RecognizeOptions {
                threshold,
                use_cache: true,
                enhanced_analysis: false,
            },
            concurrency: concurrency.max(1),
        }
    }

    pub async fn index_directory(&self, root: &Path) -> Result<IndexReport> {
        if !root.is_dir() {
            return Err(Error::Path(format!(
                "Reference directory not found: {}",
                root.display()
            )));
        }
        let started_at = chrono::Utc::now();
        let report_id = Uuid::new_v4().to_string();

        let discovered: Vec<PathBuf> = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| is_supported_image(e.path()))
            .map(|e| e.into_path())
            .collect();
        let total = discovered.len();
        log::info!(
            "Indexing {total} reference images under {} (report {report_id})",
            root.display()
        );

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<(usize, FileOutcome)> = JoinSet::new();
        for (idx, path) in discovered.into_iter().enumerate() {
            let filename = display_name(root, &path);
            let recognizer = self.recognizer.clone();
            let options = self.options;
            let permits = permits.clone();
            tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => index_file(&recognizer, &path, filename, &options).await,
                    Err(err) => Err(IndexFailure {
                        filename,
                        message: err.to_string(),
                    }),
                };
                (idx, outcome)
            });
        }

        let mut outcomes: Vec<(usize, FileOutcome)> = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => log::warn!("Indexing task failed: {err}"),
            }
        }
        outcomes.sort_by_key(|(idx, _)| *idx);

        let mut entries = Vec::new();
        let mut errors = Vec::new();
        for (_, outcome) in outcomes {
            match outcome {
                Ok(entry) => entries.push(entry),
                Err(failure) => errors.push(failure),
            }
        }
        let processed = entries.len();
        let failed = total - processed;
        log::info!("Indexed {processed}/{total} reference images ({failed} failed)");

        Ok(IndexReport {
            report_id,
            root: root.to_string_lossy().to_string(),
            total,
            processed,
            failed,
            entries,
            errors,
            started_at,
            finished_at: chrono::Utc::now(),
        })
    }
}

async fn index_file(
    recognizer: &Recognizer,
    path: &Path,
    filename: String,
    options: &RecognizeOptions,
) -> FileOutcome {
    let result = match tokio::fs::read(path).await {
        Ok(bytes) => recognizer.recognize(Arc::new(bytes), options).await,
        Err(err) => Err(Error::Io(err)),
    };
    match result {
        Ok(result) => Ok(ReferenceIndexEntry {
            filename,
            fingerprint: result.image_info.fingerprint,
            predictions: result.predictions,
            has_match: result.has_match,
        }),
        Err(err) => {
            log::warn!("Failed to index {}: {err}", path.display());
            Err(IndexFailure {
                filename,
                message: err.to_string(),
            })
        }
    }
}

fn display_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}
