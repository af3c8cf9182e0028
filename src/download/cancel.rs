//! 协作式取消令牌。
//!
//! 信号处理函数只负责 `cancel()`；调度循环与会话收尾自己观察令牌，
//! 不存在强制终止，进度落盘总能完成。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回是否为首次取消。
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// 把 Ctrl+C / SIGTERM 接到令牌上。第二次按下时放弃等待在途请求，
/// 先执行 `before_exit`（日志收尾）再以 130 退出。
pub fn install_signal_handler<F>(token: &CancelToken, before_exit: F) -> Result<(), ctrlc::Error>
where
    F: Fn() + Send + 'static,
{
    let token = token.clone();
    ctrlc::set_handler(move || {
        if handle_interrupt(&token, &before_exit) {
            std::process::exit(130);
        }
    })
}

/// 返回是否应当立即退出进程。
fn handle_interrupt(token: &CancelToken, before_exit: &dyn Fn()) -> bool {
    if token.cancel() {
        warn!(target: "download", "检测到中断，停止派发新任务，等待进行中的章节完成并保存进度...");
        return false;
    }
    eprintln!("再次中断，立即退出（已完成章节均已落盘）");
    before_exit();
    true
}
