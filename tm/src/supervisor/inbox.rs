//! Drop directory for task definition files

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::Deserialize;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::TaskDefinition;
use crate::queue::TaskQueue;
use crate::store::JsonFile;

const PROCESSED_DIR: &str = "processed";
const REJECTED_DIR: &str = "rejected";

/// Suffix of a file taken by an ingest pass
const CLAIMED_SUFFIX: &str = "claimed";

/// A definition file holds either one record or a list
#[derive(Deserialize)]
#[serde(untagged)]
enum DefinitionFile {
    Many(Vec<TaskDefinition>),
    One(Box<TaskDefinition>),
}

/// Parse a YAML or JSON definition file
pub fn load_definitions(path: &Path) -> Result<Vec<TaskDefinition>> {
    read_definitions(path, path)
}

/// Parse `path` in the format named by the extension of `format_from`
fn read_definitions(path: &Path, format_from: &Path) -> Result<Vec<TaskDefinition>> {
    debug!(path = %path.display(), "read_definitions: called");
    let content = fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
    let parsed: DefinitionFile = match format_from.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content).context(format!("Failed to parse {}", path.display()))?,
        _ => serde_yaml::from_str(&content).context(format!("Failed to parse {}", path.display()))?,
    };
    Ok(match parsed {
        DefinitionFile::Many(definitions) => definitions,
        DefinitionFile::One(definition) => vec![*definition],
    })
}

/// What one ingest pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub files: usize,
    pub enqueued: usize,
    /// Definitions the queue refused, plus one per unreadable file
    pub rejected: usize,
}

/// Task definitions waiting in `<store>/inbox`
#[derive(Debug, Clone)]
pub struct Inbox {
    dir: PathBuf,
}

impl Inbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write validated definitions as a new inbox file
    pub fn submit(&self, definitions: &[TaskDefinition]) -> Result<PathBuf> {
        debug!(count = definitions.len(), "Inbox::submit: called");
        for definition in definitions {
            definition.clone().normalize()?;
        }
        let path = self.dir.join(format!("{}.json", uuid::Uuid::now_v7()));
        JsonFile::<Vec<TaskDefinition>>::new(&path)
            .save(&definitions.to_vec())
            .context("Failed to write inbox file")?;
        info!(path = %path.display(), count = definitions.len(), "Submitted task definitions");
        Ok(path)
    }

    /// Definition files in name order
    fn pending_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context(format!("Failed to read inbox {}", self.dir.display())),
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .filter(|path| matches!(path.extension().and_then(|e| e.to_str()), Some("yml" | "yaml" | "json")))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Enqueue every pending file and move it aside
    ///
    /// Each file is claimed by renaming it before its definitions are
    /// enqueued, so it is enqueued at most once. A file the queue could not
    /// persist is put back for the next pass. A claimed file that could not
    /// be moved to `processed/` keeps its `.claimed` suffix and is not read
    /// again.
    pub async fn ingest(&self, queue: &TaskQueue) -> Result<IngestReport> {
        debug!(dir = %self.dir.display(), "Inbox::ingest: called");
        let mut report = IngestReport::default();

        for path in self.pending_files()? {
            let Some(name) = path.file_name().map(OsStr::to_os_string) else {
                continue;
            };
            let claimed = claimed_path(&path);
            if let Err(e) = fs::rename(&path, &claimed) {
                // Another pass took it first
                debug!(path = %path.display(), error = %e, "Inbox::ingest: claim failed");
                continue;
            }
            report.files += 1;

            let definitions = match read_definitions(&claimed, &path) {
                Ok(definitions) => definitions,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Rejected task file");
                    report.rejected += 1;
                    self.move_to(&claimed, REJECTED_DIR, &name)?;
                    continue;
                }
            };

            let results = match queue.enqueue_batch(definitions).await {
                Ok(results) => results,
                Err(e) => {
                    if let Err(restore) = fs::rename(&claimed, &path) {
                        warn!(path = %claimed.display(), error = %restore, "Failed to return claimed task file");
                    }
                    return Err(e).context(format!("Failed to enqueue {}", path.display()));
                }
            };
            for result in results {
                match result {
                    Ok(id) => {
                        debug!(%id, "Inbox::ingest: enqueued");
                        report.enqueued += 1;
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Rejected task definition");
                        report.rejected += 1;
                    }
                }
            }
            self.move_to(&claimed, PROCESSED_DIR, &name)?;
        }

        if report.files > 0 {
            info!(
                files = report.files,
                enqueued = report.enqueued,
                rejected = report.rejected,
                "Ingested inbox"
            );
        }
        Ok(report)
    }

    /// Move `path` into `subdir` under `name`
    fn move_to(&self, path: &Path, subdir: &str, name: &OsStr) -> Result<PathBuf> {
        let dir = self.dir.join(subdir);
        fs::create_dir_all(&dir).context(format!("Failed to create {}", dir.display()))?;
        let mut target = dir.join(name);
        if target.exists() {
            target = dir.join(format!("{}-{}", uuid::Uuid::now_v7(), name.to_string_lossy()));
        }
        fs::rename(path, &target).context(format!("Failed to move {}", path.display()))?;
        Ok(target)
    }
}

fn claimed_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsStr::to_os_string).unwrap_or_default();
    name.push(".");
    name.push(CLAIMED_SUFFIX);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::TaskKind;
    use crate::queue::{QueueConfig, TaskFilter};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_load_single_and_list() {
        let temp = tempdir().unwrap();
        let one = temp.path().join("one.yml");
        fs::write(&one, "type: analysis\nanalysis_type: security\ntarget: src/lib.rs\n").unwrap();
        let many = temp.path().join("many.json");
        fs::write(&many, r#"[{"type": "test"}, {"type": "documentation", "priority": -1}]"#).unwrap();

        let loaded = load_definitions(&one).unwrap();
        assert_eq!(loaded.len(), 1);
        let (kind, subtype, _, payload) = loaded[0].clone().normalize().unwrap();
        assert_eq!(kind, TaskKind::Analysis);
        assert_eq!(subtype.as_deref(), Some("security"));
        assert_eq!(payload, json!({"target": "src/lib.rs"}));

        let loaded = load_definitions(&many).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].priority, -1);
    }

    #[test]
    fn test_submit_rejects_unknown_type() {
        let temp = tempdir().unwrap();
        let inbox = Inbox::new(temp.path().join("inbox"));
        assert!(inbox.submit(&[TaskDefinition::new("launch", json!({}))]).is_err());
        assert!(!temp.path().join("inbox").exists());
    }

    #[tokio::test]
    async fn test_ingest_moves_files() {
        let temp = tempdir().unwrap();
        let inbox = Inbox::new(temp.path().join("inbox"));
        let clock = Arc::new(ManualClock::default());
        let queue = TaskQueue::spawn(temp.path().join("task_queue.json"), QueueConfig::default(), clock).unwrap();

        let submitted = inbox
            .submit(&[
                TaskDefinition::new("test", json!({"command": "true"})),
                TaskDefinition::new("analysis", json!({})),
            ])
            .unwrap();
        fs::write(inbox.dir().join("broken.yml"), "type: [unclosed").unwrap();
        fs::write(inbox.dir().join("mixed.yml"), "- type: test\n- type: nonsense\n").unwrap();
        fs::write(inbox.dir().join("notes.txt"), "ignored").unwrap();

        let report = inbox.ingest(&queue).await.unwrap();
        assert_eq!(report.files, 3);
        assert_eq!(report.enqueued, 3);
        assert_eq!(report.rejected, 2);

        assert!(!submitted.exists());
        assert!(inbox.dir().join("processed").join(submitted.file_name().unwrap()).exists());
        assert!(inbox.dir().join("processed").join("mixed.yml").exists());
        assert!(inbox.dir().join("rejected").join("broken.yml").exists());
        assert!(inbox.dir().join("notes.txt").exists());
        assert_eq!(queue.list(TaskFilter::default()).await.unwrap().len(), 3);

        let again = inbox.ingest(&queue).await.unwrap();
        assert_eq!(again, IngestReport::default());
    }

    #[tokio::test]
    async fn test_failed_enqueue_returns_file_to_inbox() {
        let temp = tempdir().unwrap();
        let inbox = Inbox::new(temp.path().join("inbox"));
        let clock = Arc::new(ManualClock::default());
        let queue = TaskQueue::spawn(temp.path().join("task_queue.json"), QueueConfig::default(), clock).unwrap();
        let submitted = inbox.submit(&[TaskDefinition::new("test", json!({}))]).unwrap();

        queue.shutdown().await.unwrap();
        assert!(inbox.ingest(&queue).await.is_err());

        assert!(submitted.exists());
        assert!(!claimed_path(&submitted).exists());
        assert!(!inbox.dir().join("processed").exists());
    }

    #[tokio::test]
    async fn test_claimed_files_are_not_read_again() {
        let temp = tempdir().unwrap();
        let inbox = Inbox::new(temp.path().join("inbox"));
        let clock = Arc::new(ManualClock::default());
        let queue = TaskQueue::spawn(temp.path().join("task_queue.json"), QueueConfig::default(), clock).unwrap();

        let submitted = inbox.submit(&[TaskDefinition::new("test", json!({}))]).unwrap();
        // Left behind by a pass that enqueued it but could not move it aside
        let claimed = claimed_path(&submitted);
        fs::rename(&submitted, &claimed).unwrap();
        assert_eq!(claimed.file_name().unwrap().to_str().unwrap().rsplit('.').next(), Some("claimed"));

        let report = inbox.ingest(&queue).await.unwrap();
        assert_eq!(report, IngestReport::default());
        assert!(claimed.exists());
        assert!(queue.list(TaskFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ingest_missing_dir_is_empty() {
        let temp = tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let queue = TaskQueue::spawn(temp.path().join("task_queue.json"), QueueConfig::default(), clock).unwrap();
        let report = Inbox::new(temp.path().join("nope")).ingest(&queue).await.unwrap();
        assert_eq!(report.files, 0);
    }
}
