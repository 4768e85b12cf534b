// Output formatting and display for CLI

use crate::ipc::{InstanceLogs, ResponseData};
use crate::logs::LogStream;
use crate::process::{ProcessHandle, ProcessStatus, StartReport};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print a successful response to stdout
pub fn print_response(data: &ResponseData) {
    match data {
        ResponseData::Started(report) => print_start_report(report),
        ResponseData::Processes(handles) => {
            for handle in handles {
                println!(
                    "{} {} is {}",
                    "✓".green().bold(),
                    handle.name.cyan(),
                    format_status_colored(handle.status)
                );
            }
        }
        ResponseData::Status(handles) => {
            if handles.is_empty() {
                println!("{}", "No processes are managed".yellow());
            } else {
                print_status_table(handles);
            }
        }
        ResponseData::Logs(logs) => print_logs(logs),
        ResponseData::Pong { pid } => {
            println!("{} Daemon is running (pid {})", "✓".green().bold(), pid);
        }
        ResponseData::Success(message) => {
            println!("{} {}", "✓".green().bold(), message);
        }
    }
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

fn print_start_report(report: &StartReport) {
    if !report.started.is_empty() {
        print_status_table(&report.started);
    }
    for (name, reason) in &report.failures {
        eprintln!("{} {}: {}", "✗".red().bold(), name.cyan(), reason);
    }
    if report.is_success() {
        println!(
            "{}",
            format!("✓ Started {} instance(s)", report.started.len())
                .green()
                .bold()
        );
    }
}

/// Print a formatted table of instances
fn print_status_table(handles: &[ProcessHandle]) {
    #[derive(Tabled)]
    struct ProcessRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
        #[tabled(rename = "Last exit")]
        last_exit: String,
    }

    let rows: Vec<ProcessRow> = handles
        .iter()
        .map(|h| ProcessRow {
            name: truncate(&h.name, 24),
            status: format_status_colored(h.status),
            pid: h
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            memory: h
                .memory_bytes
                .map(format_memory)
                .unwrap_or_else(|| "-".to_string()),
            uptime: h
                .uptime()
                .map(|d| format_duration(&d))
                .unwrap_or_else(|| "-".to_string()),
            restarts: h.restart_count.to_string(),
            last_exit: h
                .last_exit
                .map(|e| e.to_string())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);

    for handle in handles.iter().filter(|h| h.status == ProcessStatus::Failed) {
        if let Some(ref reason) = handle.failure {
            println!("  {} {}", handle.name.red().bold(), reason.dimmed());
        }
    }
    println!(
        "{}",
        format!("Total: {} instance(s)", handles.len())
            .dimmed()
            .italic()
    );
}

fn print_logs(logs: &[InstanceLogs]) {
    if logs.iter().all(|l| l.entries.is_empty()) {
        println!("{}", "No logs available".yellow());
        return;
    }

    for instance in logs {
        println!("\n{}", instance.name.bold().underline());
        for entry in &instance.entries {
            match entry.stream {
                LogStream::Stdout => println!("{}", entry.format()),
                LogStream::Stderr => println!("{}", entry.format().red()),
            }
        }
    }
    println!();
}

/// Format a status with color coding
fn format_status_colored(status: ProcessStatus) -> String {
    match status {
        ProcessStatus::Running => status.to_string().green().to_string(),
        ProcessStatus::Starting | ProcessStatus::Restarting => {
            status.to_string().yellow().to_string()
        }
        ProcessStatus::Stopped => status.to_string().bright_black().to_string(),
        ProcessStatus::Failed => status.to_string().red().bold().to_string(),
    }
}

/// Format a duration in human-readable format
pub fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    let (major, major_unit, minor, minor_unit) = match secs {
        0..=59 => return format!("{}s", secs),
        60..=3599 => (secs / 60, "m", secs % 60, "s"),
        3600..=86399 => (secs / 3600, "h", (secs % 3600) / 60, "m"),
        _ => (secs / 86400, "d", (secs % 86400) / 3600, "h"),
    };

    if minor > 0 {
        format!("{}{} {}{}", major, major_unit, minor, minor_unit)
    } else {
        format!("{}{}", major, major_unit)
    }
}

/// Format memory usage in human-readable format
pub fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

/// Truncate a string to a maximum number of characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Spinner shown while waiting on the daemon
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(&Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(&Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(&Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(&Duration::from_secs(3700)), "1h 1m");
        assert_eq!(format_duration(&Duration::from_secs(90000)), "1d 1h");
    }

    #[test]
    fn test_format_memory() {
        assert_eq!(format_memory(512), "512B");
        assert_eq!(format_memory(2048), "2.0KB");
        assert_eq!(format_memory(2 * 1024 * 1024), "2.0MB");
        assert_eq!(format_memory(3 * 1024 * 1024 * 1024), "3.00GB");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a very long string", 10), "this is...");
    }

    #[test]
    fn test_status_colors_keep_text() {
        colored::control::set_override(false);
        assert_eq!(format_status_colored(ProcessStatus::Failed), "failed");
        assert_eq!(format_status_colored(ProcessStatus::Running), "running");
    }
}
