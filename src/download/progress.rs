//! 进度上报与 CLI 进度条管理。

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::base_system::logging;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// 范围内已完成章节（含历史运行）
    pub saved_chapters: usize,
    pub chapter_total: usize,
    /// 本次运行永久失败的章节
    pub failed_chapters: usize,
    /// 本次运行的重试次数
    pub retries: usize,
}

pub type ProgressCallback = Box<dyn FnMut(ProgressSnapshot) + Send>;

pub struct ProgressReporter {
    snapshot: ProgressSnapshot,
    cb: Option<ProgressCallback>, // optional UI callback
    bar: Option<ProgressBar>,
}

impl ProgressReporter {
    pub fn new(
        chapter_total: usize,
        already_saved: usize,
        show_bar: bool,
        cb: Option<ProgressCallback>,
    ) -> Self {
        let bar = if show_bar && chapter_total > already_saved {
            let style = ProgressStyle::with_template(
                "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} ({eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
            let bar = ProgressBar::with_draw_target(
                Some(chapter_total as u64),
                ProgressDrawTarget::stderr(),
            );
            bar.set_style(style);
            bar.set_prefix("下载进度");
            bar.set_position(already_saved as u64);
            logging::attach_console_bar(&bar);
            Some(bar)
        } else {
            None
        };

        let mut reporter = Self {
            snapshot: ProgressSnapshot {
                saved_chapters: already_saved,
                chapter_total,
                failed_chapters: 0,
                retries: 0,
            },
            cb,
            bar,
        };
        reporter.emit();
        reporter
    }

    /// 不显示进度条、不回调，测试与库调用的默认值。
    pub fn silent(chapter_total: usize, already_saved: usize) -> Self {
        Self::new(chapter_total, already_saved, false, None)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot
    }

    fn emit(&mut self) {
        if let Some(cb) = self.cb.as_mut() {
            cb(self.snapshot);
        }
    }

    pub fn inc_saved(&mut self) {
        self.snapshot.saved_chapters =
            (self.snapshot.saved_chapters + 1).min(self.snapshot.chapter_total);
        if let Some(bar) = self.bar.as_ref() {
            bar.inc(1);
        }
        self.emit();
    }

    pub fn inc_failed(&mut self) {
        self.snapshot.failed_chapters += 1;
        if let Some(bar) = self.bar.as_ref() {
            bar.set_message(format!("失败 {}", self.snapshot.failed_chapters));
        }
        self.emit();
    }

    pub fn inc_retry(&mut self) {
        self.snapshot.retries += 1;
        self.emit();
    }

    pub fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            logging::detach_console_bar();
            bar.finish_and_clear();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.finish();
    }
}
