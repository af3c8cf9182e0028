//! 69书吧站点适配：书籍信息、目录与章节页。
//!
//! 页面为 GBK 编码；响应头缺少 charset 时按 GBK 解码。

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use super::content;
use super::fetcher::{ChapterFetcher, FetchError, FetcherFactory, RawChapter};
use crate::base_system::context::Config;
use crate::download::models::{BookCatalog, BookMeta, ChapterRef, ChapterTask};

/// 目录链接的候选选择器，按顺序尝试，取第一个有结果的。
const CATALOG_SELECTORS: &[&str] = &[
    ".catalog ul li a",
    ".listmain dd a",
    "#list dl dd a",
    ".chapterlist a",
    "a[href*=\"/txt/\"]",
];

#[derive(Debug, Clone)]
pub struct ShubaConfig {
    pub base_url: String,
    pub user_agent: String,
    pub request_timeout: Duration,
}

impl ShubaConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            user_agent: cfg.user_agent.clone(),
            request_timeout: cfg.request_timeout(),
        }
    }
}

pub struct ShubaFetcher {
    client: Client,
    config: ShubaConfig,
}

impl ShubaFetcher {
    pub fn new(config: ShubaConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .unwrap_or(HeaderValue::from_static("Mozilla/5.0")),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FetchError::Unavailable(format!("初始化 HTTP 客户端失败: {e}")))?;
        Ok(Self { client, config })
    }

    fn book_url(&self, book_id: &str) -> String {
        format!("{}/book/{book_id}.htm", self.config.base_url)
    }

    fn catalog_url(&self, book_id: &str) -> String {
        format!("{}/book/{book_id}/", self.config.base_url)
    }

    fn get_page(&self, url: &str) -> Result<String, FetchError> {
        debug!(target: "fetcher", %url, "请求页面");
        let resp = self.client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                FetchError::transient(format!("请求超时: {url}"))
            } else {
                FetchError::transient(format!("请求失败: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, url));
        }
        let text = resp
            .text_with_charset("gbk")
            .map_err(|e| FetchError::transient(format!("读取响应失败: {e}")))?;
        if text.trim().is_empty() {
            return Err(FetchError::transient(format!("空页面: {url}")));
        }
        Ok(text)
    }
}

impl ChapterFetcher for ShubaFetcher {
    fn discover(&mut self, book_id: &str) -> Result<BookCatalog, FetchError> {
        // 书籍信息取不到不影响下载，只是输出文件缺少书名等信息
        let meta = match self.get_page(&self.book_url(book_id)) {
            Ok(html) => parse_book_meta(&html),
            Err(e) => {
                warn!(target: "fetcher", book_id, error = %e, "获取书籍信息失败");
                BookMeta::default()
            }
        };

        let html = self.get_page(&self.catalog_url(book_id))?;
        let chapters = parse_catalog(&html, &self.config.base_url);
        if chapters.is_empty() {
            return Err(FetchError::transient("目录页未解析到任何章节"));
        }
        debug!(target: "fetcher", book_id, chapters = chapters.len(), "目录解析完成");
        Ok(BookCatalog { meta, chapters })
    }

    fn fetch(&mut self, _book_id: &str, task: &ChapterTask) -> Result<RawChapter, FetchError> {
        let html = self.get_page(&task.url)?;
        let body = content::extract_chapter_text(&html, &task.title)
            .ok_or_else(|| FetchError::transient(format!("未找到章节内容: {}", task.title)))?;
        Ok(RawChapter {
            title: task.title.clone(),
            body,
        })
    }
}

/// 每个 worker 一个独立的客户端。
pub fn factory(config: ShubaConfig) -> impl FetcherFactory {
    move || -> Result<Box<dyn ChapterFetcher>, FetchError> {
        Ok(Box::new(ShubaFetcher::new(config.clone())?))
    }
}

fn classify_status(status: StatusCode, url: &str) -> FetchError {
    let detail = format!("HTTP {} {url}", status.as_u16());
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::permanent(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN | StatusCode::REQUEST_TIMEOUT => {
            FetchError::transient(detail)
        }
        s if s.is_server_error() => FetchError::transient(detail),
        _ => FetchError::permanent(detail),
    }
}

fn select_first<'a>(doc: &'a Html, selector: &str) -> Option<ElementRef<'a>> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel).next()
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

pub fn parse_book_meta(html: &str) -> BookMeta {
    let doc = Html::parse_document(html);

    // h1 里的 <small> 是附加信息，不属于书名
    let book_name = select_first(&doc, ".booknav2 h1")
        .map(|h1| {
            h1.descendants()
                .filter(|node| {
                    !node
                        .ancestors()
                        .take_while(|a| a.id() != h1.id())
                        .filter_map(|a| a.value().as_element())
                        .any(|el| el.name() == "small")
                })
                .filter_map(|node| node.value().as_text().map(|t| t.trim().to_string()))
                .collect::<String>()
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let author = select_first(&doc, ".booknav2 p")
        .map(element_text)
        .map(|s| {
            s.trim_start_matches("作者：")
                .trim_start_matches("作者:")
                .trim()
                .to_string()
        })
        .filter(|s| !s.is_empty());

    let description = select_first(&doc, ".navtxt p")
        .map(element_text)
        .filter(|s| !s.is_empty());

    BookMeta {
        book_name,
        author,
        description,
    }
}

/// 解析目录页；章节序号按页面顺序从 1 开始编号。
pub fn parse_catalog(html: &str, base_url: &str) -> Vec<ChapterRef> {
    let doc = Html::parse_document(html);
    let base = base_url.trim_end_matches('/');

    for selector in CATALOG_SELECTORS {
        let Ok(sel) = Selector::parse(selector) else {
            continue;
        };
        let chapters: Vec<ChapterRef> = doc
            .select(&sel)
            .filter_map(|a| {
                let title = element_text(a);
                let href = a.value().attr("href")?.trim();
                if title.is_empty() || href.is_empty() {
                    return None;
                }
                Some((title, absolute_url(base, href)))
            })
            .enumerate()
            .map(|(i, (title, url))| ChapterRef {
                index: i as u32 + 1,
                title,
                url,
            })
            .collect();
        if !chapters.is_empty() {
            return chapters;
        }
    }
    Vec::new()
}

fn absolute_url(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{base}{href}")
    } else {
        format!("{base}/{href}")
    }
}
