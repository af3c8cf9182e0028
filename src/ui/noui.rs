//! 命令行交互：输入提示、续传确认与结果汇总。

use std::io::{self, BufRead, Write};

use anyhow::Result;

use crate::download::models::{ResumeChoice, SessionReport, SessionState};
use crate::download::progress_store::ProgressRecord;
use crate::download::session::ResumeDecider;

pub fn read_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    io::stdout().flush().ok();
    let stdin = io::stdin();
    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    Ok(line)
}

/// 把用户输入映射为续传决策；空输入按继续处理。
pub fn parse_resume_answer(answer: &str) -> Option<ResumeChoice> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "" | "y" | "yes" | "1" => Some(ResumeChoice::Resume),
        "r" | "2" => Some(ResumeChoice::Fresh),
        "n" | "no" | "q" | "0" => Some(ResumeChoice::Abort),
        _ => None,
    }
}

/// `auto_yes` 时不提问直接续传（`--yes` 或 CI 环境）。
pub fn resume_decider(auto_yes: bool) -> ResumeDecider {
    Box::new(move |record: &ProgressRecord| {
        if auto_yes {
            return ResumeChoice::Resume;
        }
        println!(
            "\n检测到历史下载记录：已完成 {} / {} 章（更新于 {}）",
            record.completed.len(),
            record.total_chapters,
            if record.last_updated.is_empty() {
                "未知"
            } else {
                record.last_updated.as_str()
            }
        );
        loop {
            let answer = match read_line("继续下载[Y] / 重新下载[r] / 取消[n]: ") {
                Ok(a) => a,
                // stdin 不可用时保守地继续
                Err(_) => return ResumeChoice::Resume,
            };
            if let Some(choice) = parse_resume_answer(&answer) {
                return choice;
            }
            println!("输入无效，请重新输入");
        }
    })
}

pub fn format_summary(report: &SessionReport) -> String {
    let mut lines = Vec::new();
    let name = report.book_name.as_deref().unwrap_or(&report.book_id);
    let headline = match report.state {
        SessionState::Completed => "下载完成",
        SessionState::PartiallyCompleted => "下载完成（部分章节失败）",
        SessionState::Cancelled => "下载已取消，进度已保存",
        _ => "下载失败",
    };
    lines.push(format!("\n===== {headline}：{name} ====="));
    if let Some(reason) = report.fatal.as_deref() {
        lines.push(format!("原因: {reason}"));
    }
    if report.requested > 0 {
        lines.push(format!(
            "请求 {} 章 | 已完成 {} 章 | 失败 {} 章 | 成功率 {:.1}%",
            report.requested,
            report.completed,
            report.failed.len(),
            report.success_rate()
        ));
    }
    if !report.missing.is_empty() {
        lines.push(format!("缺失章节: {}", compact_indices(&report.missing)));
    }
    for f in report.failed.iter().take(10) {
        lines.push(format!("  第{}章 {}: {}", f.index, f.title, f.reason));
    }
    if report.failed.len() > 10 {
        lines.push(format!(
            "  ... 其余 {} 章见 failed_chapters.json",
            report.failed.len() - 10
        ));
    }
    if let Some(path) = report.output.as_ref() {
        lines.push(format!("已保存到: {}", path.display()));
    }
    lines.push(format!("用时 {:.1} 秒", report.elapsed.as_secs_f32()));
    lines.join("\n")
}

/// `[1,2,3,5,7,8]` → `1-3, 5, 7-8`
fn compact_indices(indices: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut iter = indices.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(", ")
}
