//! 章节抓取协作方的接口约定。
//!
//! 调度器只依赖这里的 trait；具体站点的页面解析放在 `shuba` 里。
//! 每个 worker 通过 [`FetcherFactory`] 拿到独立的抓取实例，
//! 因此实现方不需要自己处理跨线程共享。

use thiserror::Error;

use crate::download::models::{BookCatalog, ChapterTask};

/// 失败类型由抓取方判定，重试策略据此决定是否重试。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 网络抖动、超时、空页面、限流等，重试可能成功
    Transient,
    /// 章节不存在或内容已被移除，本次运行不再重试
    Permanent,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("抓取失败（{kind:?}）: {detail}")]
    Failed { kind: FailureKind, detail: String },
    /// 协作方本身不可用（初始化失败等），整个会话无法继续
    #[error("抓取组件不可用: {0}")]
    Unavailable(String),
}

impl FetchError {
    pub fn transient(detail: impl Into<String>) -> Self {
        FetchError::Failed {
            kind: FailureKind::Transient,
            detail: detail.into(),
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        FetchError::Failed {
            kind: FailureKind::Permanent,
            detail: detail.into(),
        }
    }

    /// 不带前缀的错误描述，供上层包装。
    pub fn into_detail(self) -> String {
        match self {
            FetchError::Failed { detail, .. } | FetchError::Unavailable(detail) => detail,
        }
    }

    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            FetchError::Failed { kind, .. } => Some(*kind),
            FetchError::Unavailable(_) => None,
        }
    }
}

/// 抓取到的原始章节（已去标签、未必已清洗）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChapter {
    pub title: String,
    pub body: String,
}

pub trait ChapterFetcher: Send {
    /// 获取书籍信息与完整目录；`all` 模式据此确定章节总数。
    fn discover(&mut self, book_id: &str) -> Result<BookCatalog, FetchError>;

    /// 抓取单章。实现方应给每次请求设置超时并按 Transient 返回；
    /// 调度层另有上限，超过后放弃这次调用。panic 视为组件不可用。
    fn fetch(&mut self, book_id: &str, task: &ChapterTask) -> Result<RawChapter, FetchError>;
}

pub trait FetcherFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn ChapterFetcher>, FetchError>;
}

impl<F> FetcherFactory for F
where
    F: Fn() -> Result<Box<dyn ChapterFetcher>, FetchError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn ChapterFetcher>, FetchError> {
        self()
    }
}
