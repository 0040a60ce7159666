use chrono::Utc;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use owo_colors::OwoColorize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// Try to enable ANSI escape sequence support on Windows consoles.
/// Returns true if enabling succeeded (or platform likely already supports ANSI), false otherwise.
#[cfg(windows)]
pub fn try_enable_ansi_on_windows() -> bool {
    enable_ansi_support::enable_ansi_support().is_ok()
}

// On non-Windows platforms ANSI support is typically available by default in
// terminals; provide a no-op fallback to avoid referencing the optional crate.
#[cfg(not(windows))]
pub fn try_enable_ansi_on_windows() -> bool {
    false
}

/// Convert a byte count into a human readable string using IEC units (KiB/MiB/GiB).
pub fn human_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Initialize a MultiProgress and a total ProgressBar plus a header spinner ProgressBar.
/// The header bar is used to display a single-line startup summary above the total progress.
pub fn init_progress_and_mp(
    verbose: bool,
    total: u64,
    total_style: &ProgressStyle,
) -> (std::sync::Arc<MultiProgress>, ProgressBar, ProgressBar) {
    let mp = std::sync::Arc::new(if verbose {
        MultiProgress::with_draw_target(ProgressDrawTarget::stdout())
    } else {
        MultiProgress::new()
    });
    let header = mp.add(ProgressBar::new_spinner());
    header.set_style(ProgressStyle::with_template("{msg}").expect("valid header template"));
    let total_pb = mp.add(ProgressBar::new(total));
    total_pb.set_style(total_style.clone());
    let _ = try_enable_ansi_on_windows();
    (mp, total_pb, header)
}

/// Populate and set the startup header message above the total progress bar.
/// Fields are: Action, Worker, Backoff, Buf — each aligned and separated by 4 spaces.
pub fn set_startup_header(
    header: &ProgressBar,
    action: &str,
    worker_count: usize,
    backoff_ms: u64,
    buf_size: usize,
) {
    let buf_hr = human_bytes(buf_size as u64);
    let action_field = format!("{:<12}", format!("Action:{}", action));
    let conc_field = format!("{:<12}", format!("Worker:{}", worker_count));
    let backoff_field = format!("{:<12}", format!("Backoff:{}ms", backoff_ms));
    let buffer_field = format!("{:<12}", format!("Buf:{}", buf_hr));
    let mut header_msg_plain =
        format!("{}    {}    {}    {}", action_field, conc_field, backoff_field, buffer_field);
    if try_enable_ansi_on_windows() {
        let action_col = action_field.green();
        let conc_col = conc_field.cyan();
        let back_col = backoff_field.yellow();
        let buf_col = buffer_field.magenta();
        header_msg_plain = format!("{}    {}    {}    {}", action_col, conc_col, back_col, buf_col);
    }
    header.set_message(header_msg_plain);
}

/// Print a concise summary line for a completed operation.
pub fn print_summary(total_bytes: u64, elapsed_secs: f64, done: u64, skipped: u64, failed: u64) {
    if elapsed_secs > 0.0 && total_bytes > 0 {
        let mb = total_bytes as f64 / 1024.0 / 1024.0;
        println!(
            "平均速率: {:.2} MB/s (传输 {} 字节, 耗时 {:.2} 秒) | 完成: {} | 跳过: {} | 失败: {}",
            mb / elapsed_secs,
            total_bytes,
            elapsed_secs,
            done,
            skipped,
            failed
        );
    } else {
        println!("完成: {} | 跳过: {} | 失败: {} (耗时 {:.2} 秒)", done, skipped, failed, elapsed_secs);
    }
}

/// Write per-item failures as JSON Lines under the given path (append mode),
/// one object per failed item, with a UTC run header object first.
pub fn write_failures_jsonl(
    path: Option<PathBuf>,
    failures: &[(String, String)],
) -> Option<PathBuf> {
    let p = path?;
    if let Some(parent) = p.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let mut f = OpenOptions::new().create(true).append(true).open(&p).ok()?;
    let header = serde_json::json!({
        "run": Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
        "failures": failures.len(),
    });
    if let Ok(line) = serde_json::to_string(&header) {
        let _ = writeln!(f, "{}", line);
    }
    for (name, descr) in failures {
        let obj = serde_json::json!({"item": name, "problem": descr});
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(f, "{}", line);
        }
    }
    Some(p)
}

// Simple glob-style matcher supporting '*' and '?'. Not full-featured but
// sufficient for our use (matching file names against the ASCII mask group).
pub fn wildcard_match(pat: &str, text: &str) -> bool {
    let p: Vec<char> = pat.chars().collect();
    let t: Vec<char> = text.chars().collect();
    fn helper(p: &[char], t: &[char]) -> bool {
        if p.is_empty() {
            return t.is_empty();
        }
        if p[0] == '*' {
            // Try to match '*' with any number of chars
            if helper(&p[1..], t) {
                return true;
            }
            if !t.is_empty() && helper(p, &t[1..]) {
                return true;
            }
            return false;
        } else if !t.is_empty() && (p[0] == '?' || p[0] == t[0]) {
            return helper(&p[1..], &t[1..]);
        }
        false
    }
    helper(&p, &t)
}

/// Deterministic autorename candidate for collision avoidance. Phase 0 keeps
/// the name; later phases produce "name (2)", "name (3)", …; from phase 10 on
/// the name is additionally reduced to a conservative character set for
/// servers that rejected the decorated names.
pub fn autorename_candidate(name: &str, phase: u32) -> String {
    if phase == 0 {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };
    if phase < 10 {
        format!("{} ({}){}", stem, phase + 1, ext)
    } else {
        let safe: String = stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        format!("{} ({}){}", safe, phase + 1, ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2 * 1024), "2.00 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.00 MiB");
    }

    #[test]
    fn wildcard_masks_match_names() {
        assert!(wildcard_match("*.txt", "notes.txt"));
        assert!(wildcard_match("report?.csv", "report1.csv"));
        assert!(!wildcard_match("*.txt", "notes.bin"));
        assert!(wildcard_match("*", "anything"));
    }

    #[test]
    fn autorename_sequence_is_deterministic() {
        assert_eq!(autorename_candidate("report.txt", 0), "report.txt");
        assert_eq!(autorename_candidate("report.txt", 1), "report (2).txt");
        assert_eq!(autorename_candidate("report.txt", 2), "report (3).txt");
        assert_eq!(autorename_candidate("noext", 1), "noext (2)");
        assert_eq!(autorename_candidate("weird:na me.txt", 10), "weird_na_me (11).txt");
    }
}
