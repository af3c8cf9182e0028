use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::info;

use shuba_novel_downloader::base_system::book_id::parse_book_id;
use shuba_novel_downloader::base_system::config::load_or_create;
use shuba_novel_downloader::base_system::context::Config;
use shuba_novel_downloader::base_system::logging::{LogOptions, LogSystem};
use shuba_novel_downloader::download::cancel::{CancelToken, install_signal_handler};
use shuba_novel_downloader::download::models::{OutputFormat, RangeSpec, SessionConfig};
use shuba_novel_downloader::download::retry::RetryPolicy;
use shuba_novel_downloader::download::session::DownloadSession;
use shuba_novel_downloader::network_parser::shuba::{self, ShubaConfig};
use shuba_novel_downloader::ui::noui;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "shuba-novel-downloader")]
#[command(about = "69书吧小说下载器（断点续传）")]
struct Cli {
    /// 书籍 ID 或书籍页链接；留空则交互输入
    book: Option<String>,

    /// 并发数（推荐 1-3），默认取配置文件
    #[arg(short, long)]
    workers: Option<usize>,

    /// 输出格式：txt / epub
    #[arg(short, long)]
    format: Option<OutputFormat>,

    /// 保存目录
    #[arg(long)]
    save_path: Option<PathBuf>,

    /// 起始章节（含，从 1 开始）
    #[arg(long, requires = "end")]
    start: Option<u32>,

    /// 结束章节（含）
    #[arg(long, requires = "start")]
    end: Option<u32>,

    /// 存在历史进度时不询问，直接继续
    #[arg(short = 'y', long, default_value_t = false)]
    yes: bool,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 显示版本信息后退出
    #[arg(long, default_value_t = false)]
    version: bool,

    /// 数据目录路径（用于存放 config.yml 和 logs）
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("错误: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    if cli.version {
        println!("Shuba Novel Downloader v{}", VERSION);
        return Ok(0);
    }

    let data_dir = cli.data_dir.as_deref();
    let log = init_logging(cli.debug, data_dir)?;
    info!(target: "startup", "当前版本: v{}", VERSION);

    let config =
        load_or_create::<Config>(None, data_dir).map_err(|e| anyhow!(e.to_string()))?;

    let cancel = CancelToken::new();
    install_signal_handler(&cancel, log.exit_handle()).context("注册中断信号处理失败")?;

    let input = match cli.book.clone() {
        Some(book) => book,
        None => noui::read_line("请输入书籍ID或链接：")?,
    };
    let book_id =
        parse_book_id(&input).ok_or_else(|| anyhow!("无法识别的书籍ID或链接: {}", input.trim()))?;

    let session_cfg = build_session_config(&cli, &config, book_id)?;

    let auto_yes = cli.yes || std::env::var_os("CI").is_some();
    let factory = shuba::factory(ShubaConfig::from_config(&config));
    let mut session = DownloadSession::new(session_cfg, Arc::new(factory))
        .with_resume_decider(noui::resume_decider(auto_yes))
        .with_progress_bar(true);

    let report = session.run(&cancel);
    println!("{}", noui::format_summary(&report));

    let code = report.state.exit_code();
    log.add_exit_hook(move || info!(target: "startup", code, "程序退出"));
    // 先收尾日志（归档），再以会话状态退出
    drop(log);
    Ok(code)
}

fn build_session_config(cli: &Cli, config: &Config, book_id: String) -> Result<SessionConfig> {
    let save_dir = cli
        .save_path
        .clone()
        .unwrap_or_else(|| config.default_save_dir());
    let mut cfg = SessionConfig::new(book_id, save_dir);

    cfg.worker_count = cli.workers.unwrap_or(config.max_workers).max(1);
    cfg.output_format = match cli.format {
        Some(f) => f,
        None => config
            .novel_format
            .parse()
            .map_err(|e: String| anyhow!("配置项 novel_format 无效: {e}"))?,
    };
    cfg.chapter_range = match (cli.start, cli.end) {
        (Some(start), Some(end)) => RangeSpec::Range { start, end },
        _ => RangeSpec::All,
    };
    cfg.allow_overwrite = config.allow_overwrite_files;
    cfg.retry = RetryPolicy::from_config(config);
    cfg.attempt_timeout = config.attempt_timeout();
    Ok(cfg)
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        console: true,
    };
    LogSystem::init_with_base(opts, base_dir).map_err(|e| anyhow!(e))
}
