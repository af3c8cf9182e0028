//! 输出模块入口：把已完成章节组装成 txt / epub。

pub mod epub_generator;
pub mod finalize;
pub mod txt_generator;
