use colored::*;
use tracing::info;

use crate::terminal::colors;
use crate::terminal::logging::PRINT_TARGET;

pub const TOTAL_WIDTH: usize = 64;

/// Emits `msg` verbatim, bypassing the level symbols of the log formatter.
pub fn print(msg: &str) {
    info!(target: PRINT_TARGET, raw_msg = msg);
}

pub fn blank() {
    print("");
}

pub fn header(title: &str) {
    let title: String = format!("⟦ {} ⟧", title.to_uppercase());
    let (left, right) = split_fill(title.chars().count());
    print(&format!(
        "{}{}{}",
        "─".repeat(left).bright_black(),
        title.bright_green(),
        "─".repeat(right).bright_black()
    ));
}

pub fn fat_separator() {
    print(&"═".repeat(TOTAL_WIDTH).bright_black().to_string());
}

pub fn print_status<T: AsRef<str>>(msg: T) {
    print(&format!(
        "{} {}",
        ">".color(colors::SEPARATOR),
        msg.as_ref().color(colors::TEXT_DEFAULT)
    ));
}

/// An indexed entry followed by one aligned `key...: value` branch per row.
pub fn tree(idx: usize, name: &str, rows: &[(String, ColoredString)]) {
    print(&format!(
        "{}{}{} {}",
        "[".color(colors::SEPARATOR),
        idx.to_string().color(colors::ACCENT),
        "]".color(colors::SEPARATOR),
        name.color(colors::PRIMARY)
    ));

    let key_width: usize = rows.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    for (i, (key, value)) in rows.iter().enumerate() {
        let branch: &str = if i + 1 == rows.len() { "└─" } else { "├─" };
        print(&format!(
            " {} {}{} {}",
            branch.bright_black(),
            key.color(colors::TEXT_DEFAULT),
            leader(key, key_width).color(colors::SEPARATOR),
            value
        ));
    }
}

pub fn no_results() {
    print(&"No devices answered.".red().bold().to_string());
}

/// Dashes left and right of a centered title `title_len` chars wide.
fn split_fill(title_len: usize) -> (usize, usize) {
    let fill: usize = TOTAL_WIDTH.saturating_sub(title_len);
    (fill / 2, fill - fill / 2)
}

/// Dots that line every key up to `width`, then the colon.
fn leader(key: &str, width: usize) -> String {
    format!("{}:", ".".repeat(width.saturating_sub(key.len()) + 1))
}
