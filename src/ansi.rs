//! Terminal output normalization
//!
//! Raw PTY streams carry ANSI CSI sequences and control bytes that a web
//! client cannot render. Two modes are provided:
//!
//! - **Strip mode** removes every escape sequence and non-printable control
//!   character (tabs and newlines survive). Idempotent.
//! - **Color mode** translates SGR color/bold codes into span markup using a
//!   fixed palette tuned for dark backgrounds, then enriches bare filenames
//!   by extension when the stream carried no colors of its own.
//!
//! The module also hosts the prompt heuristic used by the shell read loop to
//! decide that a command's output has finished.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// CSI and 7-bit C1 escape sequences.
static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1B(?:[@-Z\\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ansi pattern"));

/// Remaining control characters, excluding tab and newline.
static CONTROL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").expect("control pattern"));

/// SGR sequences: `ESC [ <codes> m`.
static SGR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[([0-9;]+)m").expect("sgr pattern"));

/// Whitespace-separated tokens that look like filenames with an extension.
static FILENAME_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[\w.-]+\.[a-zA-Z0-9]{1,4}\b").expect("filename pattern"));

/// Three or more consecutive newlines.
static EXCESS_BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("blank-line pattern"));

/// Remove every ANSI escape sequence and control character, keeping tabs and
/// newlines. `strip_ansi(strip_ansi(s)) == strip_ansi(s)`.
pub fn strip_ansi(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let without_escapes = ANSI_ESCAPE.replace_all(text, "");
    CONTROL_CHARS.replace_all(&without_escapes, "").into_owned()
}

/// Fixed dark-background palette for the standard 8/16 ANSI foreground codes.
///
/// Black and its bright variant render white because the client draws on a
/// dark background; the bright variants otherwise share the normal table.
fn palette(code: &str) -> Option<&'static str> {
    match code {
        "30" | "37" | "90" | "97" => Some("#ffffff"),
        "31" | "91" => Some("#e74c3c"),
        "32" | "92" => Some("#2ecc71"),
        "33" | "93" => Some("#f39c12"),
        "34" | "94" => Some("#4a90e2"),
        "35" | "95" => Some("#9b59b6"),
        "36" | "96" => Some("#1abc9c"),
        _ => None,
    }
}

/// Translate SGR sequences into span markup.
///
/// A reset (`0`) closes the currently open span; a reset with nothing open
/// emits nothing, and any spans still open at end of stream are closed, so
/// the output is always balanced.
pub fn colorize(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut depth: usize = 0;
    let converted = SGR_PATTERN.replace_all(text, |caps: &Captures| {
        let codes = &caps[1];
        if codes == "0" {
            return if depth > 0 {
                depth -= 1;
                "</span>".to_string()
            } else {
                String::new()
            };
        }

        let mut color = "#ffffff";
        let mut bold = false;
        for code in codes.split(';') {
            match code {
                "1" | "01" => bold = true,
                other => {
                    if let Some(hex) = palette(other) {
                        color = hex;
                    }
                }
            }
        }

        depth += 1;
        if bold {
            format!("<span style=\"color: {color}; font-weight: 600\">")
        } else {
            format!("<span style=\"color: {color}\">")
        }
    });

    let mut out = converted.into_owned();
    for _ in 0..depth {
        out.push_str("</span>");
    }
    out
}

const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".zip", ".rar", ".tar", ".gz", ".bz2", ".xz", ".7z", ".tgz", ".tbz2", ".cab", ".arj",
    ".lzh", ".ace", ".zoo", ".arc", ".pak", ".pk3", ".pk4", ".war", ".jar",
];

const EXECUTABLE_EXTENSIONS: &[&str] = &[
    ".exe", ".bin", ".run", ".app", ".deb", ".rpm", ".msi", ".dmg", ".pkg", ".snap",
];

const IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".svg", ".ico", ".tiff", ".webp", ".raw",
    ".psd", ".ai", ".eps",
];

const DOCUMENT_EXTENSIONS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".odt", ".ods", ".odp",
    ".rtf", ".txt", ".md", ".tex",
];

fn extension_style(filename: &str) -> Option<(&'static str, &'static str)> {
    let lower = filename.to_lowercase();
    if ARCHIVE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        return Some(("#e74c3c", "500"));
    }
    if EXECUTABLE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        return Some(("#2ecc71", "500"));
    }
    if IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        return Some(("#9b59b6", "400"));
    }
    if DOCUMENT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        return Some(("#f39c12", "400"));
    }
    None
}

/// Wrap bare filename tokens in extension-class colors.
///
/// Applies only when the text carries no span markup at all, so already
/// colorized listings are left untouched.
pub fn enhance_file_colors(text: &str) -> String {
    if text.is_empty() || text.contains("<span") {
        return text.to_string();
    }

    FILENAME_TOKEN
        .replace_all(text, |caps: &Captures| {
            let token = &caps[0];
            match extension_style(token) {
                Some((color, weight)) => format!(
                    "<span style=\"color: {color}; font-weight: {weight};\">{token}</span>"
                ),
                None => token.to_string(),
            }
        })
        .into_owned()
}

/// Normalize a raw terminal chunk for web display.
///
/// With `preserve_colors`, SGR codes become span markup and bare filenames
/// are enriched; otherwise everything is stripped to plain text. Excess blank
/// lines are collapsed and the result trimmed either way.
pub fn clean_output(text: &str, preserve_colors: bool) -> String {
    if text.is_empty() {
        return String::new();
    }

    let cleaned = if preserve_colors {
        enhance_file_colors(&colorize(text))
    } else {
        strip_ansi(text)
    };

    EXCESS_BLANK_LINES
        .replace_all(&cleaned, "\n\n")
        .trim()
        .to_string()
}

/// Does this (already stripped) line look like a shell prompt?
///
/// Trailing spaces are significant: `"user@host:~$ "` is the canonical form.
pub fn is_prompt_line(line: &str) -> bool {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return false;
    }

    line.ends_with("$ ")
        || line.ends_with("# ")
        || line.ends_with("> ")
        || (line.contains('@') && (line.contains('$') || line.contains('#')))
}

/// Extract the prompt from the tail of a raw output chunk, if present.
///
/// The returned prompt is the stripped final non-empty line.
pub fn extract_prompt(output: &str) -> Option<String> {
    if output.is_empty() {
        return None;
    }

    let clean = strip_ansi(output);
    let last_line = clean.lines().rev().find(|l| !l.trim().is_empty())?;

    if is_prompt_line(last_line) {
        Some(last_line.trim().to_string())
    } else {
        None
    }
}
