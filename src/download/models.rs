//! 下载相关的数据模型定义。
//!
//! 包含章节任务/结果、会话配置、会话状态与最终报告等核心数据结构。

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;
use crate::network_parser::fetcher::FailureKind;

/// 目录中的一章：序号从 1 开始。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRef {
    pub index: u32,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMeta {
    pub book_name: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
}

/// 发现阶段的结果：书籍信息 + 完整目录。
#[derive(Debug, Clone, Default)]
pub struct BookCatalog {
    pub meta: BookMeta,
    pub chapters: Vec<ChapterRef>,
}

impl BookCatalog {
    pub fn total_chapters(&self) -> u32 {
        self.chapters.len() as u32
    }
}

/// 待抓取的章节；尝试计数只在本次运行内有效，不落盘。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterTask {
    pub index: u32,
    pub url: String,
    pub title: String,
    pub attempt_count: u32,
}

impl From<&ChapterRef> for ChapterTask {
    fn from(ch: &ChapterRef) -> Self {
        Self {
            index: ch.index,
            url: ch.url.clone(),
            title: ch.title.clone(),
            attempt_count: 0,
        }
    }
}

/// 已完成章节的内容，也是章节缓存文件的格式。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterContent {
    pub index: u32,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterStatus {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl From<FailureKind> for ChapterStatus {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Transient => ChapterStatus::TransientFailure,
            FailureKind::Permanent => ChapterStatus::PermanentFailure,
        }
    }
}

/// 单次抓取的结果，由 worker 回报给调度器。
#[derive(Debug, Clone)]
pub struct ChapterResult {
    pub index: u32,
    pub title: String,
    pub body: String,
    pub status: ChapterStatus,
    pub detail: Option<String>,
}

/// 本次运行中永久失败的章节（重试耗尽或不可重试）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedChapter {
    pub index: u32,
    pub title: String,
    pub url: String,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    All,
    /// 闭区间，1 起。
    Range { start: u32, end: u32 },
}

impl RangeSpec {
    pub fn bounds(&self) -> Option<(u32, u32)> {
        match *self {
            RangeSpec::All => None,
            RangeSpec::Range { start, end } => Some((start, end)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Txt,
    Epub,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Txt => "txt",
            OutputFormat::Epub => "epub",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "txt" => Ok(OutputFormat::Txt),
            "epub" => Ok(OutputFormat::Epub),
            other => Err(format!("不支持的格式: {other}（可选 txt / epub）")),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub book_id: String,
    pub chapter_range: RangeSpec,
    /// 推荐 1-3；更大的值只告警，不截断。
    pub worker_count: usize,
    pub output_format: OutputFormat,
    /// 输出目录；状态目录也放在这里。
    pub output_path: PathBuf,
    pub allow_overwrite: bool,
    pub retry: RetryPolicy,
    /// 单次抓取的上限，超时按临时失败处理。
    pub attempt_timeout: Duration,
}

impl SessionConfig {
    pub fn new(book_id: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            book_id: book_id.into(),
            chapter_range: RangeSpec::All,
            worker_count: 1,
            output_format: OutputFormat::Txt,
            output_path: output_path.into(),
            allow_overwrite: false,
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeChoice {
    /// 跳过已完成章节继续下载
    Resume,
    /// 清空已完成记录重新下载（状态文件保留）
    Fresh,
    /// 放弃本次会话
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Running,
    Completed,
    PartiallyCompleted,
    Cancelled,
    Fatal,
}

impl SessionState {
    /// 进程退出码：完整成功与部分成功区分开。
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionState::Completed => 0,
            SessionState::PartiallyCompleted => 2,
            SessionState::Cancelled => 130,
            SessionState::Fatal | SessionState::Initializing | SessionState::Running => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub state: SessionState,
    pub book_id: String,
    pub book_name: Option<String>,
    /// 本次请求范围内的章节数
    pub requested: usize,
    /// 范围内已完成（含历史运行）的章节数
    pub completed: usize,
    pub failed: Vec<FailedChapter>,
    /// 范围内仍缺失的章节序号（升序）
    pub missing: Vec<u32>,
    pub output: Option<PathBuf>,
    pub fatal: Option<String>,
    pub elapsed: Duration,
}

impl SessionReport {
    pub fn success_rate(&self) -> f64 {
        if self.requested == 0 {
            return 0.0;
        }
        self.completed as f64 * 100.0 / self.requested as f64
    }
}
