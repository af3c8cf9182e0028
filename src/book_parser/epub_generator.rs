//! EPUB 生成器。

use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::{Result, anyhow};
use epub_builder::{EpubBuilder, EpubContent, EpubVersion, ReferenceType, ZipLibrary};

use crate::download::models::{BookMeta, ChapterContent};

/// 用于从 book_id 确定性生成 UUID v5 的命名空间。
/// 同一本书重新导出时 dc:identifier 不变，阅读器能沿用阅读进度。
const EPUB_UUID_NAMESPACE: uuid::Uuid = uuid::Uuid::from_bytes([
    0x3f, 0x1c, 0x52, 0x8e, 0x6a, 0x0d, 0x4b, 0x27, 0x9e, 0x41, 0x5d, 0xc2, 0x07, 0x88, 0xa1, 0x6b,
]);

const STYLESHEET: &str = "body { font-family: serif; line-height:1.6; }
h1 { font-size:1.3em; text-align:center; margin:1em 0; }
p { text-indent:2em; margin:0 0 .6em 0; }
p.no-indent { text-indent:0; }";

pub struct EpubGenerator {
    book: EpubBuilder<ZipLibrary>,
    chapters: Vec<(String, String, String)>,
}

impl EpubGenerator {
    pub fn new(book_id: &str, meta: &BookMeta) -> Result<Self> {
        let zip = ZipLibrary::new().map_err(|e| anyhow!(e.to_string()))?;
        let mut book = EpubBuilder::new(zip).map_err(|e| anyhow!(e.to_string()))?;
        book.epub_version(EpubVersion::V30);
        book.set_uuid(uuid::Uuid::new_v5(&EPUB_UUID_NAMESPACE, book_id.as_bytes()));

        let title = meta.book_name.as_deref().unwrap_or(book_id);
        book.metadata("title", title).ok();
        book.metadata("toc_name", title).ok();
        book.metadata("lang", "zh-CN").ok();
        if let Some(author) = meta.author.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            book.metadata("author", author).ok();
        }
        if let Some(desc) = meta
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
        {
            book.metadata("description", desc).ok();
        }
        book.metadata("generator", "shuba-novel-downloader").ok();

        Ok(Self {
            book,
            chapters: Vec::new(),
        })
    }

    pub fn add_chapter(&mut self, chapter: &ChapterContent) {
        let file_name = format!("chapter_{:05}.xhtml", chapter.index);
        let html = wrap_chapter_html(&chapter.title, &body_to_paragraphs(&chapter.body));
        self.chapters
            .push((file_name, chapter.title.trim().to_string(), html));
    }

    pub fn generate(mut self, output_path: &Path) -> Result<()> {
        // stylesheet() 而不是 add_resource()，否则 epub-builder 会另建一个空的 stylesheet.css
        self.book
            .stylesheet(Cursor::new(STYLESHEET))
            .map_err(|e| anyhow!(e.to_string()))?;

        for (file_name, title, html) in self.chapters {
            self.book
                .add_content(
                    EpubContent::new(file_name, Cursor::new(html))
                        .title(title)
                        .reftype(ReferenceType::Text),
                )
                .map_err(|e| anyhow!(e.to_string()))?;
        }

        let mut buffer = Vec::new();
        self.book
            .generate(&mut buffer)
            .map_err(|e| anyhow!(e.to_string()))?;
        fs::write(output_path, buffer)?;
        Ok(())
    }
}

pub fn write_epub(
    path: &Path,
    book_id: &str,
    meta: &BookMeta,
    chapters: &[ChapterContent],
) -> Result<()> {
    let mut generator = EpubGenerator::new(book_id, meta)?;
    for ch in chapters {
        generator.add_chapter(ch);
    }
    generator.generate(path)
}

fn body_to_paragraphs(body: &str) -> String {
    let paragraphs: Vec<String> = body
        .lines()
        .map(|l| l.trim().trim_start_matches('\u{3000}'))
        .filter(|l| !l.is_empty())
        .map(|l| format!("<p>{}</p>", html_escape(l)))
        .collect();
    if paragraphs.is_empty() {
        return "<p class='no-indent'>本章内容为空。</p>".to_string();
    }
    paragraphs.join("\n")
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn wrap_chapter_html(title: &str, body: &str) -> String {
    let title = html_escape(title.trim());
    format!(
        "<?xml version='1.0' encoding='utf-8'?>\n<!DOCTYPE html>\n<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"zh-CN\" xml:lang=\"zh-CN\">\n  <head>\n    <title>{title}</title>\n    <link href=\"stylesheet.css\" rel=\"stylesheet\" type=\"text/css\"/>\n  </head>\n  <body><h1>{title}</h1>\n{body}\n  </body>\n</html>"
    )
}
