//! 书籍 ID/链接解析与规范化。

use regex::Regex;
use std::sync::OnceLock;

static RE_URL: OnceLock<Regex> = OnceLock::new();
static RE_BOOK: OnceLock<Regex> = OnceLock::new();
static RE_TXT: OnceLock<Regex> = OnceLock::new();

fn re_url() -> &'static Regex {
    RE_URL.get_or_init(|| Regex::new(r"https?://\S+").expect("compile RE_URL"))
}

fn re_book() -> &'static Regex {
    RE_BOOK.get_or_init(|| Regex::new(r"/book/(\d+)(?:\.htm|/|$)").expect("compile RE_BOOK"))
}

fn re_txt() -> &'static Regex {
    RE_TXT.get_or_init(|| Regex::new(r"/txt/(\d+)/").expect("compile RE_TXT"))
}

/// 接受纯数字 ID、书籍页/目录页链接或章节页链接。
pub fn parse_book_id(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Some(trimmed.to_string());
    }

    // 用户可能连同前后文字一起粘贴
    let target = re_url()
        .find(trimmed)
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    re_book()
        .captures(target)
        .or_else(|| re_txt().captures(target))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
