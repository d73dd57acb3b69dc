//! File-backed [`HistoryStore`].
//!
//! Layout under the base path:
//!
//! ```text
//! history/<class>/<code>/<year>.jsonl   one HistoryPoint per line, ascending
//! latest/<class>.json                   latest snapshots of the class
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Datelike;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use super::{
    AssetClass, AssetKey, AssetSnapshot, HistoryPoint, HistoryRange, HistoryStore,
    PersistenceError,
};

pub struct JsonlHistoryStore {
    base_path: PathBuf,
}

impl JsonlHistoryStore {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn history_dir(&self, key: &AssetKey) -> PathBuf {
        self.base_path
            .join("history")
            .join(key.class.as_str())
            .join(sanitize_code(&key.code))
    }

    fn history_file(&self, key: &AssetKey, year: i32) -> PathBuf {
        self.history_dir(key).join(format!("{year:04}.jsonl"))
    }

    fn latest_file(&self, class: AssetClass) -> PathBuf {
        self.base_path
            .join("latest")
            .join(format!("{}.json", class.as_str()))
    }

    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create directory")?;
        }
        Ok(())
    }

    async fn read_jsonl<T: for<'de> serde::Deserialize<'de>>(&self, path: &Path) -> Result<Vec<T>> {
        let file = match fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to open file"),
        };

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut items = Vec::new();

        while let Some(line) = lines.next_line().await.context("Failed to read line")? {
            if line.trim().is_empty() {
                continue;
            }
            let item: T = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse JSONL line: {line}"))?;
            items.push(item);
        }

        Ok(items)
    }

    async fn write_jsonl<T: serde::Serialize>(&self, path: &Path, items: &[T]) -> Result<()> {
        self.ensure_dir(path).await?;

        let mut content = String::new();
        for item in items {
            let line = serde_json::to_string(item).context("Failed to serialize item")?;
            content.push_str(&line);
            content.push('\n');
        }

        let tmp = path.with_extension("jsonl.tmp");
        let mut file = fs::File::create(&tmp)
            .await
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(content.as_bytes())
            .await
            .context("Failed to write JSONL lines")?;
        file.flush().await.context("Failed to flush JSONL file")?;
        drop(file);
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        Ok(())
    }

    /// Writes `path` through a sibling temp file so readers never see a half-written document.
    async fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        self.ensure_dir(path).await?;

        let content = serde_json::to_vec_pretty(value).context("Failed to serialize document")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    async fn year_files(&self, key: &AssetKey) -> Result<Vec<(i32, PathBuf)>> {
        let dir = self.history_dir(key);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read history directory"),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let year = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i32>().ok());
            if let Some(year) = year {
                files.push((year, path));
            }
        }
        files.sort_by_key(|(year, _)| *year);
        Ok(files)
    }

    /// Merges points into their year files. A point whose `recorded_at` is already
    /// on file for its key is skipped, so a retried batch lands once.
    async fn append_points(&self, points: &[HistoryPoint]) -> Result<usize> {
        let mut grouped: HashMap<(AssetKey, i32), Vec<&HistoryPoint>> = HashMap::new();
        for point in points {
            grouped
                .entry((point.key.clone(), point.recorded_at.year()))
                .or_default()
                .push(point);
        }

        let mut written = 0;
        for ((key, year), items) in grouped {
            let path = self.history_file(&key, year);
            let mut existing: Vec<HistoryPoint> = self.read_jsonl(&path).await?;
            let before = existing.len();
            for item in items {
                let seen = existing
                    .iter()
                    .any(|p| p.key == item.key && p.recorded_at == item.recorded_at);
                if !seen {
                    existing.push(item.clone());
                }
            }
            if existing.len() == before {
                continue;
            }
            written += existing.len() - before;
            existing.sort_by_key(|p| p.recorded_at);
            self.write_jsonl(&path, &existing).await?;
        }
        Ok(written)
    }

    async fn query_points(&self, key: &AssetKey, range: &HistoryRange) -> Result<Vec<HistoryPoint>> {
        let from_year = range.from.map(|from| from.year());
        let to_year = range.to.map(|to| to.year());

        let mut points = Vec::new();
        for (year, path) in self.year_files(key).await? {
            if from_year.is_some_and(|from| year < from) || to_year.is_some_and(|to| year > to) {
                continue;
            }
            let items: Vec<HistoryPoint> = self.read_jsonl(&path).await?;
            points.extend(items.into_iter().filter(|p| p.key == *key));
        }
        Ok(range.apply(points))
    }

    async fn read_latest(&self, class: AssetClass) -> Result<Vec<AssetSnapshot>> {
        let path = self.latest_file(class);
        let content = match fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read latest values"),
        };
        let snapshots = serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(snapshots)
    }
}

#[async_trait::async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn append(&self, points: &[HistoryPoint]) -> Result<(), PersistenceError> {
        if points.is_empty() {
            return Ok(());
        }
        let written = self.append_points(points).await?;
        debug!(points = points.len(), written, "history appended");
        Ok(())
    }

    async fn query(
        &self,
        key: &AssetKey,
        range: &HistoryRange,
    ) -> Result<Vec<HistoryPoint>, PersistenceError> {
        Ok(self.query_points(key, range).await?)
    }

    async fn load_latest(&self, class: AssetClass) -> Result<Vec<AssetSnapshot>, PersistenceError> {
        Ok(self.read_latest(class).await?)
    }

    async fn put_latest(
        &self,
        class: AssetClass,
        snapshots: &[AssetSnapshot],
    ) -> Result<(), PersistenceError> {
        let path = self.latest_file(class);
        self.write_json(&path, &snapshots).await?;
        Ok(())
    }
}

/// Directory name for a code. Keeps letters from any script so "Altın" and "Altin" differ.
fn sanitize_code(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}
