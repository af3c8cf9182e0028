//! 章节正文提取与清洗。
//!
//! 页面里除了正文还夹着标题、日期、作者行和各种站点提示，
//! 这里只保留正文段落，每段一行。

use std::sync::OnceLock;

use regex::Regex;
use scraper::node::Element;
use scraper::{Html, Selector};

/// 按顺序尝试的正文容器。
const CONTENT_SELECTORS: &[&str] = &[".txtnav", "#content", ".content", "#txtContent"];

/// 正文容器内需要整体丢弃的块（翻页按钮、阅读提示）。
const JUNK_CLASSES: &[&str] = &["readinline", "readpage", "readpage2"];

/// 包含任一片段的行视为站点提示。
const NOISE_FRAGMENTS: &[&str] = &[
    "章节错误",
    "举报",
    "加入书签",
    "www.69shuba.com",
    "69书吧",
    "请记住本站",
    "本章未完",
    "点击下一页",
    "()",
    "(本章完)",
    "手机用户请浏览",
    "更好的阅读体验",
    "最新网址",
    "最新章节",
    "手机阅读",
];

fn re_date_line() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("compile date regex"))
}

fn re_all_tags() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"(?is)<[^>]+>").expect("compile tag regex"))
}

fn re_blank_run() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"\n{4,}").expect("compile blank-run regex"))
}

/// 从章节页提取正文；找不到正文容器或正文为空时返回 `None`。
pub fn extract_chapter_text(html: &str, chapter_title: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let container = CONTENT_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|sel| doc.select(&sel).next())?;

    let title = chapter_title.trim();
    let mut paragraphs = Vec::new();
    for node in container.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let junk = node
            .ancestors()
            .take_while(|a| a.id() != container.id())
            .filter_map(|a| a.value().as_element())
            .any(is_junk_element);
        if junk {
            continue;
        }
        let line = text.trim();
        if line.is_empty() || is_noise_line(line, title) {
            continue;
        }
        paragraphs.push(line.to_string());
    }

    if paragraphs.is_empty() {
        return None;
    }
    Some(normalize_text(&paragraphs.join("\n")))
}

/// 标题行、日期行、作者行以及站点提示都不是正文。
pub fn is_noise_line(line: &str, chapter_title: &str) -> bool {
    if !chapter_title.is_empty() && line.starts_with(chapter_title) {
        return true;
    }
    if re_date_line().is_match(line) {
        return true;
    }
    if line.starts_with("作者：") || line.starts_with("作者:") {
        return true;
    }
    NOISE_FRAGMENTS.iter().any(|f| line.contains(f))
}

/// 去残留标签、统一换行、压缩过长的空行、逐行去首尾空白。
pub fn normalize_text(raw: &str) -> String {
    let without_tags = re_all_tags().replace_all(raw, "");
    let unix = without_tags.replace('\r', "");
    let collapsed = re_blank_run().replace_all(&unix, "\n\n");
    collapsed
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn is_junk_element(el: &Element) -> bool {
    match el.name() {
        "script" | "style" => true,
        "div" | "p" => el.classes().any(|c| JUNK_CLASSES.contains(&c)),
        _ => false,
    }
}
