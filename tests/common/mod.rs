#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use shuba_novel_downloader::download::cancel::CancelToken;
use shuba_novel_downloader::download::models::{
    BookCatalog, BookMeta, ChapterRef, ChapterTask, SessionConfig,
};
use shuba_novel_downloader::download::retry::RetryPolicy;
use shuba_novel_downloader::download::session::DownloadSession;
use shuba_novel_downloader::network_parser::fetcher::{
    ChapterFetcher, FailureKind, FetchError, FetcherFactory, RawChapter,
};

pub const BOOK_ID: &str = "48273";
pub const BOOK_NAME: &str = "测试之书";

/// 多个 worker 共享的脚本与观测数据。
#[derive(Default)]
pub struct FakeSite {
    pub total: u32,
    /// 每章的失败脚本；耗尽后成功
    pub script: Mutex<HashMap<u32, Vec<FailureKind>>>,
    /// 总是失败的章节
    pub always_fail: Mutex<HashMap<u32, FailureKind>>,
    /// 抓取成功（已返回正文）的章节
    pub succeeded: Mutex<BTreeSet<u32>>,
    pub fetch_calls: AtomicUsize,
    /// 抓取第 N 章时触发取消
    pub cancel_on: Mutex<Option<(u32, CancelToken)>>,
    /// 抓取第 N 章时 panic
    pub panic_on: Mutex<Option<u32>>,
}

impl FakeSite {
    pub fn new(total: u32) -> Arc<Self> {
        Arc::new(Self {
            total,
            ..Self::default()
        })
    }

    pub fn fail_always(&self, index: u32, kind: FailureKind) {
        self.always_fail.lock().unwrap().insert(index, kind);
    }

    pub fn fail_times(&self, index: u32, kinds: &[FailureKind]) {
        self.script.lock().unwrap().insert(index, kinds.to_vec());
    }

    pub fn cancel_when_fetching(&self, index: u32, token: &CancelToken) {
        *self.cancel_on.lock().unwrap() = Some((index, token.clone()));
    }

    pub fn panic_when_fetching(&self, index: u32) {
        *self.panic_on.lock().unwrap() = Some(index);
    }

    pub fn calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn succeeded(&self) -> BTreeSet<u32> {
        self.succeeded.lock().unwrap().clone()
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn FetcherFactory> {
        let site = Arc::clone(self);
        Arc::new(move || -> Result<Box<dyn ChapterFetcher>, FetchError> {
            Ok(Box::new(FakeFetcher {
                site: Arc::clone(&site),
            }))
        })
    }
}

pub struct FakeFetcher {
    site: Arc<FakeSite>,
}

impl ChapterFetcher for FakeFetcher {
    fn discover(&mut self, _book_id: &str) -> Result<BookCatalog, FetchError> {
        Ok(BookCatalog {
            meta: BookMeta {
                book_name: Some(BOOK_NAME.to_string()),
                author: Some("佚名".to_string()),
                description: Some("简介".to_string()),
            },
            chapters: (1..=self.site.total)
                .map(|i| ChapterRef {
                    index: i,
                    title: format!("第{i}章"),
                    url: format!("https://fake.invalid/txt/{BOOK_ID}/{i}"),
                })
                .collect(),
        })
    }

    fn fetch(&mut self, _book_id: &str, task: &ChapterTask) -> Result<RawChapter, FetchError> {
        self.site.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((at, token)) = self.site.cancel_on.lock().unwrap().as_ref() {
            if *at == task.index {
                token.cancel();
            }
        }

        let explode = *self.site.panic_on.lock().unwrap() == Some(task.index);
        if explode {
            panic!("第{}章解析崩溃", task.index);
        }

        if let Some(kind) = self.site.always_fail.lock().unwrap().get(&task.index) {
            return Err(match kind {
                FailureKind::Transient => FetchError::transient("连接超时"),
                FailureKind::Permanent => FetchError::permanent("章节不存在"),
            });
        }
        let scripted = self
            .site
            .script
            .lock()
            .unwrap()
            .get_mut(&task.index)
            .and_then(|q| if q.is_empty() { None } else { Some(q.remove(0)) });
        if let Some(kind) = scripted {
            return Err(match kind {
                FailureKind::Transient => FetchError::transient("连接超时"),
                FailureKind::Permanent => FetchError::permanent("章节不存在"),
            });
        }

        self.site.succeeded.lock().unwrap().insert(task.index);
        Ok(RawChapter {
            title: task.title.clone(),
            body: format!("第{}章的正文。\n第二段。", task.index),
        })
    }
}

pub fn session_config(dir: &Path, workers: usize) -> SessionConfig {
    let mut cfg = SessionConfig::new(BOOK_ID, dir);
    cfg.worker_count = workers;
    cfg.retry = RetryPolicy::immediate(3);
    cfg
}

pub fn session(cfg: SessionConfig, site: &Arc<FakeSite>) -> DownloadSession {
    DownloadSession::new(cfg, site.factory())
}
