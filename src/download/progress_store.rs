//! 下载进度的持久化（断点续传的唯一依据）。
//!
//! 磁盘布局（状态目录下）：
//! - `status.json`：[`ProgressRecord`]，已完成章节序号升序保存
//! - `chapters/00012.json`：每个已完成章节的标题与正文
//!
//! 所有修改都经过同一把锁串行化，并在返回前原子写盘（临时文件 + rename）。
//! 章节正文总是先于序号落盘，所以 `completed` 中的序号一定能找到正文。

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use super::models::{BookMeta, ChapterContent};

pub const STATUS_FILE: &str = "status.json";
const CHAPTER_DIR: &str = "chapters";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub book_id: String,
    #[serde(default)]
    pub total_chapters: u32,
    #[serde(default)]
    pub completed: BTreeSet<u32>,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub meta: BookMeta,
}

impl ProgressRecord {
    pub fn new(book_id: &str) -> Self {
        Self {
            book_id: book_id.to_string(),
            ..Self::default()
        }
    }

    pub fn is_complete(&self, index: u32) -> bool {
        self.completed.contains(&index)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("进度文件不存在: {0}")]
    NotFound(PathBuf),
    #[error("进度文件损坏 {path}: {detail}")]
    CorruptState { path: PathBuf, detail: String },
    #[error("章节序号 {index} 超出范围 [1, {total}]")]
    OutOfRange { index: u32, total: u32 },
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// `open` 的结果，用于决定是否提示续传以及是否告警。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Created,
    Resumed,
    /// 旧文件无法解析，已按零进度处理
    Recovered { detail: String },
}

pub struct ProgressStore {
    dir: PathBuf,
    status_file: PathBuf,
    record: Mutex<ProgressRecord>,
}

impl ProgressStore {
    /// 只读加载磁盘上的进度，不做任何修正。
    pub fn load(dir: &Path, book_id: &str) -> Result<ProgressRecord, StoreError> {
        let path = dir.join(STATUS_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path));
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let record: ProgressRecord =
            serde_json::from_str(&raw).map_err(|e| StoreError::CorruptState {
                path: path.clone(),
                detail: e.to_string(),
            })?;
        if record.book_id != book_id {
            return Err(StoreError::CorruptState {
                path,
                detail: format!("book_id 不匹配: {}", record.book_id),
            });
        }
        Ok(record)
    }

    /// 打开（或新建）某本书的进度；文件损坏时降级为零进度而不是报错。
    pub fn open(dir: &Path, book_id: &str) -> Result<(Self, OpenOutcome), StoreError> {
        fs::create_dir_all(dir.join(CHAPTER_DIR)).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let (record, outcome) = match Self::load(dir, book_id) {
            Ok(record) => (record, OpenOutcome::Resumed),
            Err(StoreError::NotFound(_)) => (ProgressRecord::new(book_id), OpenOutcome::Created),
            Err(StoreError::CorruptState { path, detail }) => {
                warn!(target: "progress_store", path = %path.display(), %detail, "进度文件损坏，按零进度处理");
                let backup = path.with_extension("json.corrupt");
                if let Err(e) = fs::rename(&path, &backup) {
                    debug!(target: "progress_store", error = ?e, "备份损坏的进度文件失败");
                }
                (ProgressRecord::new(book_id), OpenOutcome::Recovered { detail })
            }
            Err(e) => return Err(e),
        };

        let store = Self {
            dir: dir.to_path_buf(),
            status_file: dir.join(STATUS_FILE),
            record: Mutex::new(record),
        };
        store.drop_uncached_chapters()?;
        if outcome != OpenOutcome::Resumed {
            store.flush()?;
        }
        Ok((store, outcome))
    }

    pub fn snapshot(&self) -> ProgressRecord {
        self.lock().clone()
    }

    /// 目录发现后更新总章节数与书籍信息，并剔除超出范围的旧序号。
    pub fn set_catalog(&self, total_chapters: u32, meta: &BookMeta) -> Result<(), StoreError> {
        let mut record = self.lock();
        record.total_chapters = total_chapters;
        if meta != &BookMeta::default() {
            record.meta = meta.clone();
        }
        let before = record.completed.len();
        record
            .completed
            .retain(|&i| i >= 1 && i <= total_chapters);
        let dropped = before - record.completed.len();
        if dropped > 0 {
            warn!(target: "progress_store", dropped, total_chapters, "剔除超出目录范围的已完成章节");
        }
        self.write_record(&mut record)
    }

    /// 标记章节完成；重复标记是空操作。返回是否为新增。
    pub fn mark_complete(&self, index: u32) -> Result<bool, StoreError> {
        let mut record = self.lock();
        self.mark_locked(&mut record, index)
    }

    /// 先写章节正文缓存，再标记完成；两步在同一把锁内完成。
    pub fn commit_chapter(&self, chapter: &ChapterContent) -> Result<bool, StoreError> {
        let mut record = self.lock();
        if record.is_complete(chapter.index) {
            return Ok(false);
        }
        check_range(&record, chapter.index)?;
        let bytes = serde_json::to_vec(chapter)?;
        write_atomic(&self.chapter_path(chapter.index), &bytes)?;
        self.mark_locked(&mut record, chapter.index)
    }

    /// 强制写盘。每次修改都已经写过，这里用于关闭时兜底。
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut record = self.lock();
        self.write_record(&mut record)
    }

    /// 重新下载：清空已完成记录（进度文件与章节缓存目录保留）。
    pub fn reset(&self) -> Result<(), StoreError> {
        let mut record = self.lock();
        record.completed.clear();
        info!(target: "progress_store", book_id = %record.book_id, "已清空下载记录");
        self.write_record(&mut record)
    }

    /// 读取指定章节的缓存正文，按序号升序返回；未完成的序号被跳过。
    pub fn load_chapters(&self, indices: &[u32]) -> Result<Vec<ChapterContent>, StoreError> {
        let record = self.snapshot();
        let wanted: BTreeSet<u32> = indices
            .iter()
            .copied()
            .filter(|i| record.is_complete(*i))
            .collect();
        let mut out = Vec::with_capacity(wanted.len());
        for index in wanted {
            let path = self.chapter_path(index);
            let raw = fs::read(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let chapter: ChapterContent =
                serde_json::from_slice(&raw).map_err(|e| StoreError::CorruptState {
                    path,
                    detail: e.to_string(),
                })?;
            out.push(chapter);
        }
        Ok(out)
    }

    fn lock(&self) -> MutexGuard<'_, ProgressRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_locked(&self, record: &mut ProgressRecord, index: u32) -> Result<bool, StoreError> {
        check_range(record, index)?;
        if !record.completed.insert(index) {
            return Ok(false);
        }
        if let Err(e) = self.write_record(record) {
            // 内存状态与磁盘保持一致
            record.completed.remove(&index);
            return Err(e);
        }
        debug!(target: "progress_store", index, done = record.completed.len(), "章节已记录");
        Ok(true)
    }

    fn write_record(&self, record: &mut ProgressRecord) -> Result<(), StoreError> {
        record.last_updated = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let bytes = serde_json::to_vec_pretty(&*record)?;
        write_atomic(&self.status_file, &bytes)
    }

    fn chapter_path(&self, index: u32) -> PathBuf {
        self.dir.join(CHAPTER_DIR).join(format!("{index:05}.json"))
    }

    /// 已完成但缓存正文丢失的章节无法组装输出，退回待下载。
    fn drop_uncached_chapters(&self) -> Result<(), StoreError> {
        let mut record = self.lock();
        let missing: Vec<u32> = record
            .completed
            .iter()
            .copied()
            .filter(|&i| !self.chapter_path(i).is_file())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        warn!(target: "progress_store", count = missing.len(), "部分已完成章节缺少正文缓存，将重新下载");
        for i in missing {
            record.completed.remove(&i);
        }
        self.write_record(&mut record)
    }
}

fn check_range(record: &ProgressRecord, index: u32) -> Result<(), StoreError> {
    // total 为 0 表示目录尚未发现，只检查下界
    if index == 0 || (record.total_chapters > 0 && index > record.total_chapters) {
        return Err(StoreError::OutOfRange {
            index,
            total: record.total_chapters,
        });
    }
    Ok(())
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
