//! 下载会话：一次运行从配置解析到终态的完整流程。
//!
//! 状态流转：`Initializing → Running → Completed | PartiallyCompleted | Cancelled | Fatal`。
//! 进度存储一旦打开，无论以何种终态结束都只在收尾时 flush 一次。

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::cancel::CancelToken;
use super::models::{
    BookCatalog, ChapterTask, FailedChapter, RangeSpec, ResumeChoice, SessionConfig, SessionReport,
    SessionState,
};
use super::progress::{ProgressCallback, ProgressReporter};
use super::progress_store::{OpenOutcome, ProgressRecord, ProgressStore, StoreError, write_atomic};
use super::scheduler::{SchedulerError, SchedulerOutcome, TaskScheduler};
use crate::base_system::book_paths::status_folder_path;
use crate::base_system::context::RECOMMENDED_MAX_WORKERS;
use crate::book_parser::finalize::{ArtifactRequest, write_artifact};
use crate::network_parser::fetcher::{FetchError, FetcherFactory};

pub const FAILED_CHAPTERS_FILE: &str = "failed_chapters.json";

/// 已有进度时的续传决策（CLI 里是交互提示）。
pub type ResumeDecider = Box<dyn FnMut(&ProgressRecord) -> ResumeChoice + Send>;

#[derive(Debug, Error)]
pub enum SessionFatal {
    #[error("抓取组件不可用: {0}")]
    FetcherUnavailable(String),
    #[error("没有可下载的章节: {0}")]
    NoChapters(String),
    #[error("章节范围无效: {start}-{end}（共 {total} 章）")]
    InvalidRange { start: u32, end: u32, total: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("生成输出文件失败: {0}")]
    Output(String),
}

impl From<SchedulerError> for SessionFatal {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::FetcherUnavailable(detail) => SessionFatal::FetcherUnavailable(detail),
            SchedulerError::Store(e) => SessionFatal::Store(e),
        }
    }
}

pub struct DownloadSession {
    config: SessionConfig,
    factory: Arc<dyn FetcherFactory>,
    decider: ResumeDecider,
    show_progress: bool,
    progress_cb: Option<ProgressCallback>,
    state: SessionState,
}

impl DownloadSession {
    pub fn new(config: SessionConfig, factory: Arc<dyn FetcherFactory>) -> Self {
        Self {
            config,
            factory,
            decider: Box::new(|_| ResumeChoice::Resume),
            show_progress: false,
            progress_cb: None,
            state: SessionState::Initializing,
        }
    }

    pub fn with_resume_decider(mut self, decider: ResumeDecider) -> Self {
        self.decider = decider;
        self
    }

    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn with_progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.progress_cb = Some(cb);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status_dir(&self) -> PathBuf {
        status_folder_path(&self.config.output_path, &self.config.book_id)
    }

    /// 执行整个会话。单章失败只体现在报告里；只有致命错误会让状态变为 `Fatal`。
    pub fn run(&mut self, cancel: &CancelToken) -> SessionReport {
        let started = Instant::now();
        self.state = SessionState::Initializing;
        let mut report = SessionReport {
            state: SessionState::Initializing,
            book_id: self.config.book_id.clone(),
            book_name: None,
            requested: 0,
            completed: 0,
            failed: Vec::new(),
            missing: Vec::new(),
            output: None,
            fatal: None,
            elapsed: Duration::ZERO,
        };

        let state = match self.drive(cancel, &mut report) {
            Ok(state) => state,
            Err(e) => {
                error!(target: "session", book_id = %self.config.book_id, error = %e, "会话终止");
                report.fatal = Some(e.to_string());
                SessionState::Fatal
            }
        };

        self.state = state;
        report.state = state;
        report.elapsed = started.elapsed();
        info!(
            target: "session",
            book_id = %report.book_id,
            state = ?state,
            requested = report.requested,
            completed = report.completed,
            failed = report.failed.len(),
            "会话结束"
        );
        report
    }

    fn drive(
        &mut self,
        cancel: &CancelToken,
        report: &mut SessionReport,
    ) -> Result<SessionState, SessionFatal> {
        let cfg = &self.config;
        if cfg.worker_count > RECOMMENDED_MAX_WORKERS {
            warn!(
                target: "session",
                workers = cfg.worker_count,
                recommended = RECOMMENDED_MAX_WORKERS,
                "并发数超过推荐值，可能触发站点限流"
            );
        }
        if let RangeSpec::Range { start, end } = cfg.chapter_range {
            if start == 0 || start > end {
                return Err(SessionFatal::InvalidRange {
                    start,
                    end,
                    total: 0,
                });
            }
        }

        let Some(catalog) = self.discover(cancel)? else {
            info!(target: "session", "发现阶段被中断");
            return Ok(SessionState::Cancelled);
        };
        let total = catalog.total_chapters();
        if total == 0 {
            return Err(SessionFatal::NoChapters("目录为空".to_string()));
        }
        let (start, end) = match self.config.chapter_range {
            RangeSpec::All => (1, total),
            RangeSpec::Range { start, end } if end <= total => (start, end),
            RangeSpec::Range { start, end } => {
                return Err(SessionFatal::InvalidRange { start, end, total });
            }
        };
        report.book_name = catalog.meta.book_name.clone();
        report.requested = (end - start + 1) as usize;
        info!(
            target: "session",
            book_id = %self.config.book_id,
            book_name = catalog.meta.book_name.as_deref().unwrap_or("-"),
            total,
            start,
            end,
            "目录已获取"
        );

        let status_dir = self.status_dir();
        let (store, opened) = ProgressStore::open(&status_dir, &self.config.book_id)?;
        if let OpenOutcome::Recovered { detail } = &opened {
            warn!(target: "session", %detail, "历史进度无法读取，将从头下载");
        }
        store.set_catalog(total, &catalog.meta)?;
        let store = Arc::new(store);

        let result = self.download(&store, &catalog, (start, end), &opened, cancel);
        // 唯一一次收尾写盘，无论结果如何
        let flushed = store.flush();
        let outcome = match (result, flushed) {
            (Err(e), flushed) => {
                if let Err(fe) = flushed {
                    error!(target: "session", error = %fe, "收尾写入进度失败");
                }
                return Err(e);
            }
            (Ok(_), Err(fe)) => return Err(fe.into()),
            (Ok(None), Ok(())) => return Ok(SessionState::Cancelled),
            (Ok(Some(outcome)), Ok(())) => outcome,
        };

        let record = store.snapshot();
        let done: BTreeSet<u32> = record.completed.range(start..=end).copied().collect();
        report.completed = done.len();
        report.missing = (start..=end).filter(|i| !done.contains(i)).collect();
        report.failed = outcome.failed;

        if outcome.cancelled {
            info!(
                target: "session",
                completed = report.completed,
                requested = report.requested,
                "已取消，进度已保存，下次运行可继续"
            );
            return Ok(SessionState::Cancelled);
        }

        let state = if report.missing.is_empty() {
            SessionState::Completed
        } else {
            SessionState::PartiallyCompleted
        };
        self.write_failure_report(&status_dir, state, &report.failed);

        if done.is_empty() {
            warn!(target: "session", "没有任何已完成章节，跳过输出");
            return Ok(state);
        }
        let indices: Vec<u32> = done.into_iter().collect();
        let chapters = store.load_chapters(&indices)?;
        let meta = if catalog.meta.book_name.is_some() {
            catalog.meta.clone()
        } else {
            record.meta.clone()
        };
        let request = ArtifactRequest {
            dir: &self.config.output_path,
            book_id: &self.config.book_id,
            meta: &meta,
            range: self.config.chapter_range.bounds(),
            format: self.config.output_format,
            allow_overwrite: self.config.allow_overwrite,
        };
        let path = write_artifact(&request, &chapters)
            .map_err(|e| SessionFatal::Output(format!("{e:#}")))?;
        info!(target: "session", path = %path.display(), chapters = chapters.len(), "输出文件已生成");
        report.output = Some(path);
        Ok(state)
    }

    /// 发现阶段：获取书籍信息与目录。瞬时失败按重试策略重试；返回 `None` 表示被取消。
    fn discover(&self, cancel: &CancelToken) -> Result<Option<BookCatalog>, SessionFatal> {
        let mut fetcher = self
            .factory
            .create()
            .map_err(|e| SessionFatal::FetcherUnavailable(e.into_detail()))?;
        let policy = self.config.retry;
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            attempt += 1;
            match fetcher.discover(&self.config.book_id) {
                Ok(catalog) => return Ok(Some(catalog)),
                Err(FetchError::Unavailable(detail)) => {
                    return Err(SessionFatal::FetcherUnavailable(detail));
                }
                Err(FetchError::Failed { kind, detail }) => {
                    if !policy.should_retry(attempt, kind) {
                        return Err(SessionFatal::NoChapters(detail));
                    }
                    let delay = policy.delay_for(attempt);
                    warn!(target: "session", attempt, %detail, "获取目录失败，{}ms 后重试", delay.as_millis());
                    if !sleep_unless_cancelled(delay, cancel) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// 续传决策 + 调度。`Ok(None)` 表示用户放弃。
    fn download(
        &mut self,
        store: &Arc<ProgressStore>,
        catalog: &BookCatalog,
        (start, end): (u32, u32),
        opened: &OpenOutcome,
        cancel: &CancelToken,
    ) -> Result<Option<SchedulerOutcome>, SessionFatal> {
        let snapshot = store.snapshot();
        if *opened == OpenOutcome::Resumed && !snapshot.completed.is_empty() {
            match (self.decider)(&snapshot) {
                ResumeChoice::Resume => {
                    info!(target: "session", done = snapshot.completed.len(), "继续上次的下载进度");
                }
                ResumeChoice::Fresh => store.reset()?,
                ResumeChoice::Abort => {
                    info!(target: "session", "用户取消了本次下载");
                    return Ok(None);
                }
            }
        }

        let record = store.snapshot();
        let pending: Vec<ChapterTask> = catalog
            .chapters
            .iter()
            .filter(|ch| (start..=end).contains(&ch.index) && !record.is_complete(ch.index))
            .map(ChapterTask::from)
            .collect();
        let already = record.completed.range(start..=end).count();
        debug!(target: "session", pending = pending.len(), already, "待下载章节已计算");

        self.state = SessionState::Running;
        let requested = (end - start + 1) as usize;
        let mut progress = ProgressReporter::new(
            requested,
            already,
            self.show_progress,
            self.progress_cb.take(),
        );
        let scheduler = TaskScheduler::new(
            &self.config.book_id,
            self.config.worker_count,
            self.config.retry,
            Arc::clone(store),
            Arc::clone(&self.factory),
            cancel.clone(),
        )
        .with_attempt_timeout(self.config.attempt_timeout);
        let outcome = scheduler.run(pending, &mut progress);
        progress.finish();
        Ok(Some(outcome?))
    }

    fn write_failure_report(
        &self,
        status_dir: &std::path::Path,
        state: SessionState,
        failed: &[FailedChapter],
    ) {
        let path = status_dir.join(FAILED_CHAPTERS_FILE);
        if state == SessionState::Completed {
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    debug!(target: "session", error = ?e, "删除旧的失败章节记录失败");
                }
            }
            return;
        }
        let written = serde_json::to_vec_pretty(failed)
            .map_err(StoreError::from)
            .and_then(|bytes| write_atomic(&path, &bytes));
        match written {
            Ok(()) => info!(target: "session", path = %path.display(), count = failed.len(), "失败章节已记录"),
            Err(e) => warn!(target: "session", error = %e, "写入失败章节记录失败"),
        }
    }
}

/// 分段睡眠以便及时响应取消；返回 false 表示被取消。
fn sleep_unless_cancelled(total: Duration, cancel: &CancelToken) -> bool {
    let step = Duration::from_millis(100);
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(step.min(deadline - now));
    }
}
