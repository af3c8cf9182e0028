//! TXT 输出：书籍信息头 + 按序号排列的章节。

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::download::models::{BookMeta, ChapterContent};

const SEPARATOR_WIDTH: usize = 50;

/// 渲染整本书。调用方保证 `chapters` 已按序号升序。
pub fn render_txt(book_id: &str, meta: &BookMeta, chapters: &[ChapterContent]) -> String {
    let mut out = String::new();
    let name = meta.book_name.as_deref().unwrap_or(book_id);
    let _ = writeln!(out, "书名: {name}");
    if let Some(author) = meta.author.as_deref().filter(|a| !a.trim().is_empty()) {
        let _ = writeln!(out, "作者: {author}");
    }
    if let Some(desc) = meta.description.as_deref().filter(|d| !d.trim().is_empty()) {
        let _ = writeln!(out, "简介: {}", desc.trim());
    }
    let _ = write!(out, "\n{}\n\n", "=".repeat(SEPARATOR_WIDTH));

    for ch in chapters {
        let _ = write!(out, "{}\n\n", ch.title.trim());
        for line in ch.body.lines() {
            out.push_str(line.trim());
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

pub fn write_txt(
    path: &Path,
    book_id: &str,
    meta: &BookMeta,
    chapters: &[ChapterContent],
) -> Result<()> {
    let text = render_txt(book_id, meta, chapters);
    fs::write(path, text).with_context(|| format!("写入 {} 失败", path.display()))
}
