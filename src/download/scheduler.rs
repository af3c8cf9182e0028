//! 章节调度：固定大小的 worker 池 + 派发队列 + 重试。
//!
//! 协调线程（调用 `run` 的线程）独占队列和重试表，只做记账不做抓取；
//! worker 各自持有一个抓取实例，成功后直接写入进度存储（存储内部串行化），
//! 再通过事件通道回报结果。
//!
//! 每次派发带一个租约：worker 拿到结果后先认领租约再提交，协调线程在
//! 单次抓取超时后收回租约。两者只有一方能成功，超时的那次尝试即使之后
//! 返回也不会再落盘或回报；卡住的 worker 被放弃，由新线程顶替。
//!
//! 单章失败在这里被吸收：要么重新入队，要么记入失败列表，不会向上传播。
//! 只有抓取组件不可用（包括抓取时 panic）或进度无法落盘才会以错误返回。

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::cancel::CancelToken;
use super::models::{ChapterContent, ChapterResult, ChapterStatus, ChapterTask, FailedChapter};
use super::progress::ProgressReporter;
use super::progress_store::{ProgressStore, StoreError};
use super::retry::{RetryDecision, RetryPolicy};
use crate::network_parser::fetcher::{ChapterFetcher, FailureKind, FetchError, FetcherFactory};

/// 协调循环的最长阻塞时间，决定取消信号与超时检查的响应延迟。
const TICK: Duration = Duration::from_millis(100);

/// 单次抓取的默认上限。
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("抓取组件不可用: {0}")]
    FetcherUnavailable(String),
    #[error("进度写入失败: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
pub struct SchedulerOutcome {
    /// 本次运行新完成的章节（升序）
    pub completed: Vec<u32>,
    /// 本次运行永久失败的章节（升序）
    pub failed: Vec<FailedChapter>,
    pub cancelled: bool,
}

const LEASE_QUEUED: u8 = 0;
const LEASE_RUNNING: u8 = 1;
const LEASE_CLAIMED: u8 = 2;
const LEASE_EXPIRED: u8 = 3;

/// 一次派发的归属。
struct Lease {
    state: AtomicU8,
    worker: AtomicUsize,
}

enum Expiry {
    /// 还没有 worker 接手，直接作废
    NotStarted,
    /// 执行中的 worker 被放弃
    Abandoned(usize),
    /// worker 已认领结果，事件马上就到
    Claimed,
}

impl Lease {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(LEASE_QUEUED),
            worker: AtomicUsize::new(usize::MAX),
        }
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn start(&self, worker_id: usize) -> bool {
        self.worker.store(worker_id, Ordering::SeqCst);
        self.transition(LEASE_QUEUED, LEASE_RUNNING)
    }

    fn claim(&self) -> bool {
        self.transition(LEASE_RUNNING, LEASE_CLAIMED)
    }

    fn expire(&self) -> Expiry {
        if self.transition(LEASE_RUNNING, LEASE_EXPIRED) {
            Expiry::Abandoned(self.worker.load(Ordering::SeqCst))
        } else if self.transition(LEASE_QUEUED, LEASE_EXPIRED) {
            Expiry::NotStarted
        } else {
            Expiry::Claimed
        }
    }
}

struct Job {
    ticket: u64,
    task: ChapterTask,
    lease: Arc<Lease>,
}

struct InFlight {
    task: ChapterTask,
    deadline: Instant,
    lease: Arc<Lease>,
}

enum WorkerEvent {
    Finished {
        ticket: u64,
        task: ChapterTask,
        result: ChapterResult,
    },
    CommitFailed {
        ticket: u64,
        task: ChapterTask,
        error: StoreError,
    },
    FetcherUnavailable {
        ticket: Option<u64>,
        detail: String,
    },
}

pub struct TaskScheduler {
    book_id: String,
    workers: usize,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    store: Arc<ProgressStore>,
    factory: Arc<dyn FetcherFactory>,
    cancel: CancelToken,
}

impl TaskScheduler {
    pub fn new(
        book_id: &str,
        workers: usize,
        policy: RetryPolicy,
        store: Arc<ProgressStore>,
        factory: Arc<dyn FetcherFactory>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            book_id: book_id.to_string(),
            workers: workers.max(1),
            policy,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            store,
            factory,
            cancel,
        }
    }

    /// 超过该时长仍未返回的抓取按临时失败处理。
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn run(
        &self,
        pending: Vec<ChapterTask>,
        progress: &mut ProgressReporter,
    ) -> Result<SchedulerOutcome, SchedulerError> {
        let mut queue: VecDeque<ChapterTask> = {
            let mut tasks = pending;
            tasks.sort_by_key(|t| t.index);
            tasks.dedup_by_key(|t| t.index);
            tasks.into()
        };
        let mut outcome = SchedulerOutcome::default();
        if queue.is_empty() {
            return Ok(outcome);
        }

        let pool_size = self.workers.min(queue.len());
        info!(target: "scheduler", pending = queue.len(), workers = pool_size, "开始调度章节");

        let (tx_job, rx_job) = channel::unbounded::<Job>();
        let (tx_evt, rx_evt) = channel::unbounded::<WorkerEvent>();
        let mut workers: HashMap<usize, JoinHandle<()>> = HashMap::with_capacity(pool_size);
        for worker_id in 0..pool_size {
            if let Some(h) = self.spawn_worker(worker_id, &rx_job, &tx_evt) {
                workers.insert(worker_id, h);
            }
        }
        ensure_pool(&workers)?;
        let mut next_worker_id = pool_size;

        let mut delayed: Vec<(Instant, ChapterTask)> = Vec::new();
        let mut in_flight: HashMap<u64, InFlight> = HashMap::new();
        let mut next_ticket = 0u64;
        let mut fatal: Option<SchedulerError> = None;
        let mut stopping = false;

        loop {
            if !stopping && self.cancel.is_cancelled() {
                info!(target: "scheduler", in_flight = in_flight.len(), queued = queue.len() + delayed.len(), "收到停止信号，不再派发新任务");
                outcome.cancelled = true;
                stopping = true;
            }

            // 超时的在途任务按临时失败处理
            let now = Instant::now();
            let overdue: Vec<u64> = in_flight
                .iter()
                .filter(|(_, f)| f.deadline <= now)
                .map(|(ticket, _)| *ticket)
                .collect();
            for ticket in overdue {
                let expiry = match in_flight.get(&ticket) {
                    Some(f) => f.lease.expire(),
                    None => continue,
                };
                match expiry {
                    Expiry::Claimed => continue,
                    Expiry::NotStarted => {}
                    Expiry::Abandoned(worker_id) => {
                        // 卡住的线程不再 join，它醒来后认领失败会自行退出
                        workers.remove(&worker_id);
                        if !stopping {
                            if let Some(h) = self.spawn_worker(next_worker_id, &rx_job, &tx_evt) {
                                workers.insert(next_worker_id, h);
                            }
                            next_worker_id += 1;
                        }
                    }
                }
                let Some(f) = in_flight.remove(&ticket) else {
                    continue;
                };
                let mut task = f.task;
                task.attempt_count += 1;
                warn!(
                    target: "scheduler",
                    index = task.index,
                    attempt = task.attempt_count,
                    timeout_ms = self.attempt_timeout.as_millis() as u64,
                    "章节抓取超时"
                );
                let result = ChapterResult {
                    index: task.index,
                    title: task.title.clone(),
                    body: String::new(),
                    status: ChapterStatus::TransientFailure,
                    detail: Some(format!(
                        "抓取超时（{}ms）",
                        self.attempt_timeout.as_millis()
                    )),
                };
                self.handle_result(task, result, stopping, &mut delayed, &mut outcome, progress);
            }

            if stopping {
                // 未派发的任务留在进度文件之外，下次运行重新计算
                queue.clear();
                delayed.clear();
            } else {
                let now = Instant::now();
                let mut i = 0;
                while i < delayed.len() {
                    if delayed[i].0 <= now {
                        let (_, task) = delayed.swap_remove(i);
                        queue.push_back(task);
                    } else {
                        i += 1;
                    }
                }

                if workers.is_empty() && !queue.is_empty() {
                    error!(target: "scheduler", "没有可用的 worker，终止调度");
                    fatal.get_or_insert(SchedulerError::FetcherUnavailable(
                        "没有可用的 worker 线程".to_string(),
                    ));
                    stopping = true;
                    continue;
                }

                while in_flight.len() < workers.len() {
                    let Some(task) = queue.pop_front() else {
                        break;
                    };
                    debug!(target: "scheduler", index = task.index, attempt = task.attempt_count + 1, "派发章节");
                    let ticket = next_ticket;
                    next_ticket += 1;
                    let lease = Arc::new(Lease::new());
                    let job = Job {
                        ticket,
                        task: task.clone(),
                        lease: Arc::clone(&lease),
                    };
                    if tx_job.send(job).is_err() {
                        queue.push_front(task);
                        break;
                    }
                    in_flight.insert(
                        ticket,
                        InFlight {
                            task,
                            deadline: Instant::now() + self.attempt_timeout,
                            lease,
                        },
                    );
                }
            }

            if in_flight.is_empty() && (stopping || (queue.is_empty() && delayed.is_empty())) {
                break;
            }

            let wait = delayed
                .iter()
                .map(|(at, _)| at.saturating_duration_since(Instant::now()))
                .min()
                .map_or(TICK, |d| d.min(TICK));

            let event = match rx_evt.recv_timeout(wait) {
                Ok(event) => event,
                Err(channel::RecvTimeoutError::Timeout) => continue,
                Err(channel::RecvTimeoutError::Disconnected) => {
                    // 协调线程自己持有发送端，理论上不会走到这里
                    fatal.get_or_insert(SchedulerError::FetcherUnavailable(
                        "事件通道已关闭".to_string(),
                    ));
                    break;
                }
            };

            match event {
                WorkerEvent::Finished {
                    ticket,
                    task,
                    result,
                } => {
                    if in_flight.remove(&ticket).is_none() {
                        continue;
                    }
                    self.handle_result(
                        task,
                        result,
                        stopping,
                        &mut delayed,
                        &mut outcome,
                        progress,
                    );
                }
                WorkerEvent::CommitFailed {
                    ticket,
                    task,
                    error,
                } => {
                    in_flight.remove(&ticket);
                    error!(target: "scheduler", index = task.index, error = %error, "章节已下载但进度写入失败");
                    fatal.get_or_insert(SchedulerError::Store(error));
                    stopping = true;
                }
                WorkerEvent::FetcherUnavailable { ticket, detail } => {
                    if let Some(ticket) = ticket {
                        in_flight.remove(&ticket);
                    }
                    error!(target: "scheduler", %detail, "抓取组件不可用，终止调度");
                    fatal.get_or_insert(SchedulerError::FetcherUnavailable(detail));
                    stopping = true;
                }
            }
        }

        drop(tx_job);
        for (_, h) in workers {
            if h.join().is_err() {
                warn!(target: "scheduler", "worker 线程异常退出");
            }
        }

        if let Some(err) = fatal {
            return Err(err);
        }

        outcome.completed.sort_unstable();
        outcome.failed.sort_by_key(|f| f.index);
        info!(
            target: "scheduler",
            completed = outcome.completed.len(),
            failed = outcome.failed.len(),
            cancelled = outcome.cancelled,
            "调度结束"
        );
        Ok(outcome)
    }

    fn handle_result(
        &self,
        task: ChapterTask,
        result: ChapterResult,
        stopping: bool,
        delayed: &mut Vec<(Instant, ChapterTask)>,
        outcome: &mut SchedulerOutcome,
        progress: &mut ProgressReporter,
    ) {
        let kind = match result.status {
            ChapterStatus::Success => {
                outcome.completed.push(task.index);
                progress.inc_saved();
                return;
            }
            ChapterStatus::TransientFailure => FailureKind::Transient,
            ChapterStatus::PermanentFailure => FailureKind::Permanent,
        };
        let detail = result.detail.unwrap_or_default();

        if stopping {
            // 停止阶段不再重试，也不算永久失败：章节保持待下载
            debug!(target: "scheduler", index = task.index, %detail, "停止阶段的失败，留待下次运行");
            return;
        }

        match self.policy.decide(task.attempt_count, kind) {
            RetryDecision::RetryAfter(delay) => {
                debug!(
                    target: "scheduler",
                    index = task.index,
                    attempt = task.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    %detail,
                    "章节抓取失败，稍后重试"
                );
                progress.inc_retry();
                delayed.push((Instant::now() + delay, task));
            }
            RetryDecision::GiveUp => {
                warn!(
                    target: "scheduler",
                    index = task.index,
                    title = %task.title,
                    attempts = task.attempt_count,
                    %detail,
                    "章节下载失败"
                );
                progress.inc_failed();
                outcome.failed.push(FailedChapter {
                    index: task.index,
                    title: task.title,
                    url: task.url,
                    attempts: task.attempt_count,
                    reason: detail,
                });
            }
        }
    }

    fn spawn_worker(
        &self,
        worker_id: usize,
        rx_job: &channel::Receiver<Job>,
        tx_evt: &channel::Sender<WorkerEvent>,
    ) -> Option<JoinHandle<()>> {
        let rx_job = rx_job.clone();
        let tx_evt = tx_evt.clone();
        let factory = Arc::clone(&self.factory);
        let store = Arc::clone(&self.store);
        let book_id = self.book_id.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("chapter-worker-{worker_id}"))
            .spawn(move || worker_loop(worker_id, &book_id, factory, store, rx_job, tx_evt));
        match spawned {
            Ok(h) => Some(h),
            Err(e) => {
                warn!(target: "scheduler", worker_id, error = ?e, "创建 worker 线程失败");
                None
            }
        }
    }
}

/// 一个 worker 都没起来时，后续派发只会空等。
fn ensure_pool(workers: &HashMap<usize, JoinHandle<()>>) -> Result<(), SchedulerError> {
    if workers.is_empty() {
        error!(target: "scheduler", "worker 线程全部创建失败");
        return Err(SchedulerError::FetcherUnavailable(
            "无法创建 worker 线程".to_string(),
        ));
    }
    Ok(())
}

fn worker_loop(
    worker_id: usize,
    book_id: &str,
    factory: Arc<dyn FetcherFactory>,
    store: Arc<ProgressStore>,
    rx_job: channel::Receiver<Job>,
    tx_evt: channel::Sender<WorkerEvent>,
) {
    let mut fetcher = match factory.create() {
        Ok(f) => f,
        Err(e) => {
            let _ = tx_evt.send(WorkerEvent::FetcherUnavailable {
                ticket: None,
                detail: e.into_detail(),
            });
            return;
        }
    };

    // 发送端关闭即退出；停止阶段协调线程不再派发，在途的这一章总会跑完或超时
    while let Ok(job) = rx_job.recv() {
        let Job {
            ticket,
            mut task,
            lease,
        } = job;
        if !lease.start(worker_id) {
            continue;
        }
        task.attempt_count += 1;

        let attempted = panic::catch_unwind(AssertUnwindSafe(|| {
            attempt(fetcher.as_mut(), book_id, &task)
        }));
        if !lease.claim() {
            // 已判超时，由顶替的线程继续工作
            debug!(target: "scheduler", worker_id, index = task.index, "超时后返回的结果已丢弃");
            return;
        }

        let (event, keep_going) = match attempted {
            Err(payload) => (
                WorkerEvent::FetcherUnavailable {
                    ticket: Some(ticket),
                    detail: format!("抓取第 {} 章时 panic: {}", task.index, panic_message(payload)),
                },
                false,
            ),
            Ok(Err(detail)) => (
                WorkerEvent::FetcherUnavailable {
                    ticket: Some(ticket),
                    detail,
                },
                false,
            ),
            Ok(Ok(result)) if result.status == ChapterStatus::Success => {
                let content = ChapterContent {
                    index: result.index,
                    title: result.title.clone(),
                    body: result.body.clone(),
                };
                match panic::catch_unwind(AssertUnwindSafe(|| store.commit_chapter(&content))) {
                    Ok(Ok(_)) => (
                        WorkerEvent::Finished {
                            ticket,
                            task,
                            result,
                        },
                        true,
                    ),
                    Ok(Err(error)) => (
                        WorkerEvent::CommitFailed {
                            ticket,
                            task,
                            error,
                        },
                        true,
                    ),
                    Err(payload) => (
                        WorkerEvent::FetcherUnavailable {
                            ticket: Some(ticket),
                            detail: format!("提交第 {} 章时 panic: {}", task.index, panic_message(payload)),
                        },
                        false,
                    ),
                }
            }
            Ok(Ok(result)) => (
                WorkerEvent::Finished {
                    ticket,
                    task,
                    result,
                },
                true,
            ),
        };
        if tx_evt.send(event).is_err() || !keep_going {
            return;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}

/// 执行一次抓取并分类；`Err` 表示抓取组件本身失效。
fn attempt(
    fetcher: &mut dyn ChapterFetcher,
    book_id: &str,
    task: &ChapterTask,
) -> Result<ChapterResult, String> {
    let failed = |status: ChapterStatus, detail: String| ChapterResult {
        index: task.index,
        title: task.title.clone(),
        body: String::new(),
        status,
        detail: Some(detail),
    };

    match fetcher.fetch(book_id, task) {
        Ok(raw) if raw.body.trim().is_empty() => Ok(failed(
            ChapterStatus::TransientFailure,
            "章节内容为空".to_string(),
        )),
        Ok(raw) => {
            let title = if raw.title.trim().is_empty() {
                task.title.clone()
            } else {
                raw.title
            };
            Ok(ChapterResult {
                index: task.index,
                title,
                body: raw.body,
                status: ChapterStatus::Success,
                detail: None,
            })
        }
        Err(FetchError::Failed { kind, detail }) => Ok(failed(kind.into(), detail)),
        Err(FetchError::Unavailable(detail)) => Err(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::models::BookMeta;
    use crate::download::models::BookCatalog;
    use crate::network_parser::fetcher::RawChapter;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Script = Arc<Mutex<HashMap<u32, VecDeque<Result<(), FailureKind>>>>>;

    /// 按脚本返回结果；脚本耗尽后一律成功。
    struct ScriptedFetcher {
        script: Script,
        calls: Arc<AtomicUsize>,
        on_fetch: Option<Arc<dyn Fn(u32) + Send + Sync>>,
    }

    impl ChapterFetcher for ScriptedFetcher {
        fn discover(&mut self, _book_id: &str) -> Result<BookCatalog, FetchError> {
            Ok(BookCatalog::default())
        }

        fn fetch(&mut self, _book_id: &str, task: &ChapterTask) -> Result<RawChapter, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hook) = &self.on_fetch {
                hook(task.index);
            }
            let next = self
                .script
                .lock()
                .unwrap()
                .get_mut(&task.index)
                .and_then(|q| q.pop_front());
            match next {
                Some(Err(FailureKind::Transient)) => Err(FetchError::transient("timeout")),
                Some(Err(FailureKind::Permanent)) => Err(FetchError::permanent("gone")),
                _ => Ok(RawChapter {
                    title: format!("第{}章", task.index),
                    body: format!("body {}", task.index),
                }),
            }
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<ProgressStore>,
        script: Script,
        calls: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new(total: u32) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let (store, _) = ProgressStore::open(dir.path(), "book").unwrap();
            store.set_catalog(total, &BookMeta::default()).unwrap();
            Self {
                _dir: dir,
                store: Arc::new(store),
                script: Arc::default(),
                calls: Arc::default(),
            }
        }

        fn script(&self, index: u32, outcomes: &[Result<(), FailureKind>]) {
            self.script
                .lock()
                .unwrap()
                .insert(index, outcomes.iter().copied().collect());
        }

        fn scheduler(
            &self,
            workers: usize,
            cancel: CancelToken,
            on_fetch: Option<Arc<dyn Fn(u32) + Send + Sync>>,
        ) -> TaskScheduler {
            let script = Arc::clone(&self.script);
            let calls = Arc::clone(&self.calls);
            let factory = move || -> Result<Box<dyn ChapterFetcher>, FetchError> {
                Ok(Box::new(ScriptedFetcher {
                    script: Arc::clone(&script),
                    calls: Arc::clone(&calls),
                    on_fetch: on_fetch.clone(),
                }))
            };
            TaskScheduler::new(
                "book",
                workers,
                RetryPolicy::immediate(3),
                Arc::clone(&self.store),
                Arc::new(factory),
                cancel,
            )
        }
    }

    fn tasks(indices: impl IntoIterator<Item = u32>) -> Vec<ChapterTask> {
        indices
            .into_iter()
            .map(|index| ChapterTask {
                index,
                url: format!("https://example.invalid/{index}"),
                title: format!("第{index}章"),
                attempt_count: 0,
            })
            .collect()
    }

    #[test]
    fn all_chapters_complete_with_multiple_workers() {
        let h = Harness::new(6);
        let scheduler = h.scheduler(3, CancelToken::new(), None);
        let mut progress = ProgressReporter::silent(6, 0);

        let out = scheduler.run(tasks([6, 2, 4, 1, 3, 5]), &mut progress).unwrap();
        assert_eq!(out.completed, vec![1, 2, 3, 4, 5, 6]);
        assert!(out.failed.is_empty());
        assert!(!out.cancelled);
        assert_eq!(h.store.snapshot().completed.len(), 6);
        assert_eq!(progress.snapshot().saved_chapters, 6);
    }

    #[test]
    fn transient_failures_are_retried_until_success() {
        let h = Harness::new(2);
        h.script(
            1,
            &[Err(FailureKind::Transient), Err(FailureKind::Transient)],
        );
        let scheduler = h.scheduler(1, CancelToken::new(), None);
        let mut progress = ProgressReporter::silent(2, 0);

        let out = scheduler.run(tasks(1..=2), &mut progress).unwrap();
        assert_eq!(out.completed, vec![1, 2]);
        assert_eq!(progress.snapshot().retries, 2);
        assert_eq!(h.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn retries_are_capped_at_three_attempts() {
        let h = Harness::new(2);
        h.script(2, &[Err(FailureKind::Transient); 5]);
        let scheduler = h.scheduler(2, CancelToken::new(), None);
        let mut progress = ProgressReporter::silent(2, 0);

        let out = scheduler.run(tasks(1..=2), &mut progress).unwrap();
        assert_eq!(out.completed, vec![1]);
        assert_eq!(out.failed.len(), 1);
        assert_eq!(out.failed[0].index, 2);
        assert_eq!(out.failed[0].attempts, 3);
        assert!(!h.store.snapshot().is_complete(2));
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let h = Harness::new(1);
        h.script(1, &[Err(FailureKind::Permanent)]);
        let scheduler = h.scheduler(1, CancelToken::new(), None);
        let mut progress = ProgressReporter::silent(1, 0);

        let out = scheduler.run(tasks([1]), &mut progress).unwrap();
        assert_eq!(out.failed[0].attempts, 1);
        assert_eq!(out.failed[0].reason, "gone");
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unavailable_fetcher_is_fatal() {
        let h = Harness::new(3);
        let factory = || -> Result<Box<dyn ChapterFetcher>, FetchError> {
            Err(FetchError::Unavailable("no browser".to_string()))
        };
        let scheduler = TaskScheduler::new(
            "book",
            2,
            RetryPolicy::immediate(3),
            Arc::clone(&h.store),
            Arc::new(factory),
            CancelToken::new(),
        );
        let mut progress = ProgressReporter::silent(3, 0);

        let err = scheduler.run(tasks(1..=3), &mut progress).unwrap_err();
        assert!(matches!(err, SchedulerError::FetcherUnavailable(_)));
        assert!(h.store.snapshot().completed.is_empty());
    }

    #[test]
    fn cancellation_stops_dispatch_but_keeps_in_flight_result() {
        let h = Harness::new(5);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let hook: Arc<dyn Fn(u32) + Send + Sync> = Arc::new(move |index: u32| {
            if index == 2 {
                trigger.cancel();
            }
        });
        let scheduler = h.scheduler(1, cancel, Some(hook));
        let mut progress = ProgressReporter::silent(5, 0);

        let out = scheduler.run(tasks(1..=5), &mut progress).unwrap();
        assert!(out.cancelled);
        assert_eq!(out.completed, vec![1, 2]);
        assert!(out.failed.is_empty());
        let done: Vec<u32> = h.store.snapshot().completed.into_iter().collect();
        assert_eq!(done, vec![1, 2]);
    }

    #[test]
    fn empty_body_counts_as_transient() {
        struct Blank;
        impl ChapterFetcher for Blank {
            fn discover(&mut self, _: &str) -> Result<BookCatalog, FetchError> {
                Ok(BookCatalog::default())
            }
            fn fetch(&mut self, _: &str, _: &ChapterTask) -> Result<RawChapter, FetchError> {
                Ok(RawChapter {
                    title: String::new(),
                    body: "  \n".to_string(),
                })
            }
        }
        let task = &tasks([1])[0];
        let result = attempt(&mut Blank, "book", task).unwrap();
        assert_eq!(result.status, ChapterStatus::TransientFailure);
    }

    fn sleep_once_on(index: u32, pause: Duration) -> Arc<dyn Fn(u32) + Send + Sync> {
        let slept = Arc::new(std::sync::atomic::AtomicBool::new(false));
        Arc::new(move |i: u32| {
            if i == index && !slept.swap(true, Ordering::SeqCst) {
                std::thread::sleep(pause);
            }
        })
    }

    #[test]
    fn panicking_fetcher_ends_run_as_unavailable() {
        let h = Harness::new(4);
        let hook: Arc<dyn Fn(u32) + Send + Sync> = Arc::new(|index: u32| {
            if index == 2 {
                panic!("parser exploded");
            }
        });
        let scheduler = h.scheduler(2, CancelToken::new(), Some(hook));
        let mut progress = ProgressReporter::silent(4, 0);

        let err = scheduler.run(tasks(1..=4), &mut progress).unwrap_err();
        match err {
            SchedulerError::FetcherUnavailable(detail) => {
                assert!(detail.contains("parser exploded"), "{detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!h.store.snapshot().is_complete(2));
    }

    #[test]
    fn hung_attempt_times_out_and_is_retried() {
        let h = Harness::new(3);
        let scheduler = h
            .scheduler(1, CancelToken::new(), Some(sleep_once_on(2, Duration::from_millis(800))))
            .with_attempt_timeout(Duration::from_millis(200));
        let mut progress = ProgressReporter::silent(3, 0);

        let out = scheduler.run(tasks(1..=3), &mut progress).unwrap();
        assert_eq!(out.completed, vec![1, 2, 3]);
        assert!(out.failed.is_empty());
        assert_eq!(progress.snapshot().retries, 1);
        assert_eq!(progress.snapshot().saved_chapters, 3);
    }

    #[test]
    fn attempts_that_never_return_become_failures() {
        let h = Harness::new(2);
        let hook: Arc<dyn Fn(u32) + Send + Sync> = Arc::new(|index: u32| {
            if index == 1 {
                std::thread::sleep(Duration::from_millis(600));
            }
        });
        let scheduler = h
            .scheduler(1, CancelToken::new(), Some(hook))
            .with_attempt_timeout(Duration::from_millis(100));
        let mut progress = ProgressReporter::silent(2, 0);

        let out = scheduler.run(tasks(1..=2), &mut progress).unwrap();
        assert_eq!(out.completed, vec![2]);
        assert_eq!(out.failed.len(), 1);
        assert_eq!(out.failed[0].index, 1);
        assert_eq!(out.failed[0].attempts, 3);
        assert!(out.failed[0].reason.contains("超时"));
        assert!(!h.store.snapshot().is_complete(1));
    }

    #[test]
    fn cancellation_does_not_wait_for_hung_attempt() {
        let h = Harness::new(3);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let hook: Arc<dyn Fn(u32) + Send + Sync> = Arc::new(move |index: u32| {
            if index == 1 {
                trigger.cancel();
                std::thread::sleep(Duration::from_secs(3));
            }
        });
        let scheduler = h
            .scheduler(1, cancel, Some(hook))
            .with_attempt_timeout(Duration::from_millis(200));
        let mut progress = ProgressReporter::silent(3, 0);

        let started = Instant::now();
        let out = scheduler.run(tasks(1..=3), &mut progress).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(out.cancelled);
        assert!(out.completed.is_empty());
        assert!(out.failed.is_empty());
        assert!(h.store.snapshot().completed.is_empty());
    }

    #[test]
    fn empty_worker_pool_is_fatal() {
        let err = ensure_pool(&HashMap::new()).unwrap_err();
        assert!(matches!(err, SchedulerError::FetcherUnavailable(_)));
    }
}
