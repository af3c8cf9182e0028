//! 输出组装：选择渲染器、决定产物路径并原子写出。

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use super::{epub_generator, txt_generator};
use crate::base_system::book_paths::{non_clobbering_path, output_file_name};
use crate::download::models::{BookMeta, ChapterContent, OutputFormat};

/// 纯序列化：给定有序章节写出一个文件。
pub trait OutputRenderer {
    fn render(
        &self,
        path: &Path,
        book_id: &str,
        meta: &BookMeta,
        chapters: &[ChapterContent],
    ) -> Result<()>;
}

struct TxtRenderer;
struct EpubRenderer;

impl OutputRenderer for TxtRenderer {
    fn render(
        &self,
        path: &Path,
        book_id: &str,
        meta: &BookMeta,
        chapters: &[ChapterContent],
    ) -> Result<()> {
        txt_generator::write_txt(path, book_id, meta, chapters)
    }
}

impl OutputRenderer for EpubRenderer {
    fn render(
        &self,
        path: &Path,
        book_id: &str,
        meta: &BookMeta,
        chapters: &[ChapterContent],
    ) -> Result<()> {
        epub_generator::write_epub(path, book_id, meta, chapters)
    }
}

pub fn renderer_for(format: OutputFormat) -> Box<dyn OutputRenderer> {
    match format {
        OutputFormat::Txt => Box::new(TxtRenderer),
        OutputFormat::Epub => Box::new(EpubRenderer),
    }
}

pub struct ArtifactRequest<'a> {
    pub dir: &'a Path,
    pub book_id: &'a str,
    pub meta: &'a BookMeta,
    /// `None` 表示全本
    pub range: Option<(u32, u32)>,
    pub format: OutputFormat,
    pub allow_overwrite: bool,
}

impl ArtifactRequest<'_> {
    /// 最终写出的路径；不允许覆盖时已存在的同名文件会让位给编号文件。
    pub fn target_path(&self) -> PathBuf {
        let name = self.meta.book_name.as_deref().unwrap_or(self.book_id);
        let file_name = output_file_name(name, self.range, self.format.extension());
        if self.allow_overwrite {
            self.dir.join(file_name)
        } else {
            non_clobbering_path(self.dir, &file_name)
        }
    }
}

/// 按序号排序后渲染，先写临时文件再改名，中途失败不会留下半截产物。
pub fn write_artifact(req: &ArtifactRequest<'_>, chapters: &[ChapterContent]) -> Result<PathBuf> {
    let mut ordered = chapters.to_vec();
    ordered.sort_by_key(|c| c.index);
    ordered.dedup_by_key(|c| c.index);

    fs::create_dir_all(req.dir).with_context(|| format!("创建目录 {} 失败", req.dir.display()))?;
    let target = req.target_path();
    if target.exists() {
        warn!(target: "finalize", path = %target.display(), "覆盖已存在的输出文件");
    }

    let tmp = NamedTempFile::new_in(req.dir).context("创建临时文件失败")?;
    renderer_for(req.format).render(tmp.path(), req.book_id, req.meta, &ordered)?;
    tmp.persist(&target)
        .map_err(|e| e.error)
        .with_context(|| format!("保存 {} 失败", target.display()))?;

    info!(
        target: "finalize",
        path = %target.display(),
        chapters = ordered.len(),
        format = %req.format,
        "产物已写出"
    );
    Ok(target)
}
