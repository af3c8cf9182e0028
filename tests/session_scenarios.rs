mod common;

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{BOOK_ID, BOOK_NAME, FakeSite, session, session_config};
use shuba_novel_downloader::download::cancel::CancelToken;
use shuba_novel_downloader::download::models::{
    OutputFormat, RangeSpec, ResumeChoice, SessionState,
};
use shuba_novel_downloader::download::progress_store::ProgressStore;
use shuba_novel_downloader::download::session::{DownloadSession, FAILED_CHAPTERS_FILE};
use shuba_novel_downloader::network_parser::fetcher::{
    ChapterFetcher, FailureKind, FetchError, FetcherFactory,
};

fn stored_completed(dir: &std::path::Path) -> BTreeSet<u32> {
    let status = dir.join(format!("{BOOK_ID}_status"));
    ProgressStore::load(&status, BOOK_ID).unwrap().completed
}

fn chapter_positions(text: &str, indices: impl IntoIterator<Item = u32>) -> Vec<usize> {
    indices
        .into_iter()
        .map(|i| text.find(&format!("第{i}章\n")).unwrap())
        .collect()
}

#[test]
fn permanent_failures_end_partially_completed() {
    let dir = tempfile::tempdir().unwrap();
    let site = FakeSite::new(5);
    site.fail_always(2, FailureKind::Transient);
    site.fail_always(4, FailureKind::Transient);

    let report = session(session_config(dir.path(), 2), &site).run(&CancelToken::new());

    assert_eq!(report.state, SessionState::PartiallyCompleted);
    assert_eq!(report.requested, 5);
    assert_eq!(report.completed, 3);
    assert_eq!(report.missing, vec![2, 4]);
    let failed: Vec<(u32, u32)> = report.failed.iter().map(|f| (f.index, f.attempts)).collect();
    assert_eq!(failed, vec![(2, 3), (4, 3)]);
    assert_eq!(stored_completed(dir.path()), BTreeSet::from([1, 3, 5]));

    // 部分输出仍然生成，只包含成功的章节
    let output = report.output.expect("partial output");
    let text = fs::read_to_string(output).unwrap();
    let pos = chapter_positions(&text, [1, 3, 5]);
    assert!(pos[0] < pos[1] && pos[1] < pos[2]);
    assert!(!text.contains("第2章\n"));

    let failed_file = dir
        .path()
        .join(format!("{BOOK_ID}_status"))
        .join(FAILED_CHAPTERS_FILE);
    let listed: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(failed_file).unwrap()).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 2);
    assert_eq!(listed[0]["index"], 2);
}

#[test]
fn discovered_book_downloads_completely_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let site = FakeSite::new(10);

    let report = session(session_config(dir.path(), 3), &site).run(&CancelToken::new());

    assert_eq!(report.state, SessionState::Completed);
    assert_eq!(report.state.exit_code(), 0);
    assert_eq!(report.completed, 10);
    assert!(report.missing.is_empty());
    assert_eq!(site.calls(), 10);
    assert_eq!(stored_completed(dir.path()), (1..=10).collect());

    let output = report.output.unwrap();
    assert_eq!(output.file_name().unwrap().to_str().unwrap(), format!("{BOOK_NAME}.txt"));
    let text = fs::read_to_string(output).unwrap();
    assert!(text.starts_with(&format!("书名: {BOOK_NAME}\n")));
    let pos = chapter_positions(&text, 1..=10);
    assert!(pos.windows(2).all(|w| w[0] < w[1]));
    assert!(
        !dir.path()
            .join(format!("{BOOK_ID}_status"))
            .join(FAILED_CHAPTERS_FILE)
            .exists()
    );
}

#[test]
fn resumed_run_matches_uninterrupted_run() {
    let uninterrupted = tempfile::tempdir().unwrap();
    let site = FakeSite::new(6);
    let report = session(session_config(uninterrupted.path(), 1), &site).run(&CancelToken::new());
    assert_eq!(report.state, SessionState::Completed);

    let resumed = tempfile::tempdir().unwrap();
    let site = FakeSite::new(6);
    let cancel = CancelToken::new();
    site.cancel_when_fetching(3, &cancel);
    let first = session(session_config(resumed.path(), 1), &site).run(&cancel);
    assert_eq!(first.state, SessionState::Cancelled);
    assert_eq!(first.state.exit_code(), 130);
    assert!(first.output.is_none());
    assert_eq!(stored_completed(resumed.path()), BTreeSet::from([1, 2, 3]));

    let site = FakeSite::new(6);
    let second = session(session_config(resumed.path(), 2), &site).run(&CancelToken::new());
    assert_eq!(second.state, SessionState::Completed);
    // 已完成章节不会重新抓取
    assert_eq!(site.calls(), 3);
    assert_eq!(
        stored_completed(resumed.path()),
        stored_completed(uninterrupted.path())
    );

    let a = fs::read_to_string(report.output.unwrap()).unwrap();
    let b = fs::read_to_string(second.output.unwrap()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn cancellation_persists_exactly_the_successful_chapters() {
    let dir = tempfile::tempdir().unwrap();
    let site = FakeSite::new(30);
    let cancel = CancelToken::new();
    site.cancel_when_fetching(7, &cancel);

    let report = session(session_config(dir.path(), 3), &site).run(&cancel);

    assert_eq!(report.state, SessionState::Cancelled);
    let stored = stored_completed(dir.path());
    assert_eq!(stored, site.succeeded());
    assert!(stored.contains(&7));
    assert!(stored.len() < 30);
    assert_eq!(report.completed, stored.len());
}

#[test]
fn factory_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let factory: Arc<dyn FetcherFactory> =
        Arc::new(|| -> Result<Box<dyn ChapterFetcher>, FetchError> {
            Err(FetchError::Unavailable("浏览器无法启动".to_string()))
        });
    let mut s = DownloadSession::new(session_config(dir.path(), 2), factory);

    let report = s.run(&CancelToken::new());
    assert_eq!(report.state, SessionState::Fatal);
    assert_eq!(report.state.exit_code(), 1);
    assert!(report.fatal.unwrap().contains("浏览器无法启动"));
    assert!(report.output.is_none());
}

#[test]
fn worker_initialisation_failure_keeps_committed_progress() {
    let dir = tempfile::tempdir().unwrap();
    let site = FakeSite::new(4);

    // 第一次运行完成两章
    let mut cfg = session_config(dir.path(), 1);
    cfg.chapter_range = RangeSpec::Range { start: 1, end: 2 };
    assert_eq!(
        session(cfg, &site).run(&CancelToken::new()).state,
        SessionState::Completed
    );

    // 第二次：发现阶段的实例可用，worker 实例全部创建失败
    let created = Arc::new(AtomicUsize::new(0));
    let inner = site.factory();
    let counter = Arc::clone(&created);
    let factory: Arc<dyn FetcherFactory> =
        Arc::new(move || -> Result<Box<dyn ChapterFetcher>, FetchError> {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                inner.create()
            } else {
                Err(FetchError::Unavailable("driver crashed".to_string()))
            }
        });
    let report = DownloadSession::new(session_config(dir.path(), 2), factory)
        .run(&CancelToken::new());

    assert_eq!(report.state, SessionState::Fatal);
    assert!(report.output.is_none());
    assert_eq!(stored_completed(dir.path()), BTreeSet::from([1, 2]));
}

#[test]
fn fresh_choice_refetches_everything_and_abort_stops() {
    let dir = tempfile::tempdir().unwrap();
    let site = FakeSite::new(3);
    session(session_config(dir.path(), 1), &site).run(&CancelToken::new());
    assert_eq!(site.calls(), 3);

    let site = FakeSite::new(3);
    let aborted = session(session_config(dir.path(), 1), &site)
        .with_resume_decider(Box::new(|_| ResumeChoice::Abort))
        .run(&CancelToken::new());
    assert_eq!(aborted.state, SessionState::Cancelled);
    assert_eq!(site.calls(), 0);
    assert_eq!(stored_completed(dir.path()).len(), 3);

    let site = FakeSite::new(3);
    let fresh = session(session_config(dir.path(), 1), &site)
        .with_resume_decider(Box::new(|record| {
            assert_eq!(record.completed.len(), 3);
            ResumeChoice::Fresh
        }))
        .run(&CancelToken::new());
    assert_eq!(fresh.state, SessionState::Completed);
    assert_eq!(site.calls(), 3);
}

#[test]
fn range_output_is_named_by_range_and_never_clobbers() {
    let dir = tempfile::tempdir().unwrap();
    let site = FakeSite::new(8);
    let mut cfg = session_config(dir.path(), 2);
    cfg.chapter_range = RangeSpec::Range { start: 2, end: 4 };

    let report = session(cfg.clone(), &site).run(&CancelToken::new());
    assert_eq!(report.state, SessionState::Completed);
    assert_eq!(report.requested, 3);
    let first = report.output.unwrap();
    assert_eq!(
        first.file_name().unwrap().to_str().unwrap(),
        format!("{BOOK_NAME}_2-4.txt")
    );
    let text = fs::read_to_string(&first).unwrap();
    assert!(!text.contains("第1章\n") && !text.contains("第5章\n"));

    // 同一区间再跑一次：不允许覆盖时写到编号文件
    let again = session(cfg, &site).run(&CancelToken::new());
    assert_eq!(
        again.output.unwrap().file_name().unwrap().to_str().unwrap(),
        format!("{BOOK_NAME}_2-4 (2).txt")
    );
    assert!(first.exists());
}

#[test]
fn epub_output_and_workers_above_recommendation() {
    let dir = tempfile::tempdir().unwrap();
    let site = FakeSite::new(12);
    site.fail_times(5, &[FailureKind::Transient, FailureKind::Transient]);
    let mut cfg = session_config(dir.path(), 6);
    cfg.output_format = OutputFormat::Epub;

    let report = session(cfg, &site).run(&CancelToken::new());
    assert_eq!(report.state, SessionState::Completed);
    assert_eq!(site.calls(), 14);
    let output = report.output.unwrap();
    assert_eq!(output.extension().unwrap(), "epub");
    assert!(fs::metadata(output).unwrap().len() > 0);
}

#[test]
fn permanent_failure_is_attempted_once() {
    let dir = tempfile::tempdir().unwrap();
    let site = FakeSite::new(3);
    site.fail_always(3, FailureKind::Permanent);

    let report = session(session_config(dir.path(), 1), &site).run(&CancelToken::new());
    assert_eq!(report.state, SessionState::PartiallyCompleted);
    assert_eq!(report.state.exit_code(), 2);
    assert_eq!(site.calls(), 3);
    assert_eq!(report.failed[0].reason, "章节不存在");
}

#[test]
fn progress_callback_sees_saves_and_retries() {
    let dir = tempfile::tempdir().unwrap();
    let site = FakeSite::new(4);
    site.fail_times(2, &[FailureKind::Transient]);

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let report = session(session_config(dir.path(), 2), &site)
        .with_progress_callback(Box::new(move |snap| sink.lock().unwrap().push(snap)))
        .run(&CancelToken::new());

    assert_eq!(report.state, SessionState::Completed);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.first().unwrap().saved_chapters, 0);
    let last = seen.last().unwrap();
    assert_eq!(last.saved_chapters, 4);
    assert_eq!(last.chapter_total, 4);
    assert_eq!(last.failed_chapters, 0);
    assert_eq!(seen.iter().map(|s| s.retries).max(), Some(1));
}

#[test]
fn panicking_fetcher_ends_session_as_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let site = FakeSite::new(4);
    site.panic_when_fetching(2);

    let cfg = session_config(dir.path(), 2);
    let runner_site = Arc::clone(&site);
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let report = session(cfg, &runner_site).run(&CancelToken::new());
        let _ = tx.send(report);
    });
    let report = rx
        .recv_timeout(std::time::Duration::from_secs(10))
        .expect("session should finish after a worker panic");

    assert_eq!(report.state, SessionState::Fatal);
    assert!(report.fatal.unwrap().contains("解析崩溃"));
    assert!(report.output.is_none());
    assert!(!stored_completed(dir.path()).contains(&2));
}
