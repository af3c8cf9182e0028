//! 基础设施：配置、日志、路径与输入解析。

pub mod book_id;
pub mod book_paths;
pub mod config;
pub mod context;
pub mod logging;
