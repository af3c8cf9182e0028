//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`         — 数据模型（章节任务/结果、会话配置与报告）
//! - `progress_store` — 断点续传的持久化进度
//! - `retry`          — 单章重试策略
//! - `scheduler`      — worker 池与任务派发
//! - `session`        — 会话状态机与输出组装
//! - `cancel`         — 协作式取消与信号接入
//! - `progress`       — 进度上报与 CLI 进度条

pub mod cancel;
pub mod models;
pub mod progress;
pub mod progress_store;
pub mod retry;
pub mod scheduler;
pub mod session;
