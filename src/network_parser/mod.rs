//! 网络与页面解析。
//!
//! `fetcher` 定义调度器依赖的抓取接口；`shuba` 是唯一的站点实现，
//! `content` 负责章节正文的提取与清洗。

pub mod content;
pub mod fetcher;
pub mod shuba;
