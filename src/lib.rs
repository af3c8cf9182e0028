//! 69书吧小说下载器。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/路径/书籍 ID 解析等基础设施
//! - `network_parser`：抓取接口与站点适配（目录、章节正文清洗）
//! - `download`：断点续传的下载编排（进度存储、重试、调度、会话）
//! - `book_parser`：导出 txt/epub
//! - `ui`：命令行交互

pub mod base_system;
pub mod book_parser;
pub mod download;
pub mod network_parser;
pub mod ui;
