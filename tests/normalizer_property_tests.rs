//! Property tests for the terminal output normalizer
//!
//! Strip mode must be idempotent and lossless for printable text; color mode
//! must always emit balanced markup; the prompt heuristic must find the
//! final prompt line regardless of preceding content.

use sshbroker::ansi::{clean_output, colorize, extract_prompt, strip_ansi};

/// A grab bag of awkward inputs: interleaved SGR codes, cursor movement,
/// stray escapes, control bytes, multi-byte text, and plain output.
fn awkward_inputs() -> Vec<String> {
    vec![
        String::new(),
        "plain output, nothing special".to_string(),
        "\x1b[1;31mbold red\x1b[0m then plain".to_string(),
        "\x1b[32mgreen\x1b[33myellow\x1b[0m\x1b[0m".to_string(),
        "\x1b[2J\x1b[H\x1b[1;1Hredrawn screen".to_string(),
        "stray escape \x1b alone and \x1bZ c1".to_string(),
        "bell\x07 backspace\x08 null\x00 del\x7f".to_string(),
        "tabs\tand\nnewlines\npreserved".to_string(),
        "한글 출력과 \x1b[34mcolor\x1b[0m mixed".to_string(),
        "total 48\n-rw-r--r-- 1 u u 1024 data.zip\n-rwxr-xr-x 1 u u 2048 run.bin".to_string(),
        "\x1b[0m\x1b[0mreset spam\x1b[0m".to_string(),
        "\x1b[01;34mdir\x1b[0m \x1b[01;32mexec\x1b[0m user@host:~$ ".to_string(),
    ]
}

#[test]
fn strip_is_idempotent_on_awkward_inputs() {
    for input in awkward_inputs() {
        let once = strip_ansi(&input);
        let twice = strip_ansi(&once);
        assert_eq!(once, twice, "strip not idempotent for {input:?}");
    }
}

#[test]
fn strip_leaves_no_escape_or_control_bytes() {
    for input in awkward_inputs() {
        let stripped = strip_ansi(&input);
        for byte in stripped.bytes() {
            let ok = byte == b'\t' || byte == b'\n' || byte >= 0x20;
            assert!(ok && byte != 0x7f, "byte {byte:#04x} survived in {input:?}");
        }
    }
}

#[test]
fn colorize_always_balances_spans() {
    for input in awkward_inputs() {
        let colored = colorize(&input);
        let opens = colored.matches("<span").count();
        let closes = colored.matches("</span>").count();
        assert_eq!(opens, closes, "unbalanced spans for {input:?}");
    }
}

#[test]
fn clean_output_color_mode_balances_spans() {
    for input in awkward_inputs() {
        let cleaned = clean_output(&input, true);
        let opens = cleaned.matches("<span").count();
        let closes = cleaned.matches("</span>").count();
        assert_eq!(opens, closes, "unbalanced spans for {input:?}");
    }
}

#[test]
fn strip_preserves_printable_characters() {
    let input = "\x1b[31mhello world 123\x1b[0m \x1b[2Jtrailing";
    let stripped = strip_ansi(input);
    for expected in ["hello world 123", "trailing"] {
        assert!(stripped.contains(expected));
    }
}

#[test]
fn prompt_found_after_arbitrary_preceding_content() {
    for noise in [
        "",
        "line one\nline two\n",
        "\x1b[32mcolored noise\x1b[0m\n",
        "binary-ish \x00\x07 junk\n",
        "a very long line that scrolls and scrolls and scrolls\n",
    ] {
        let stream = format!("{noise}user@host:~$ ");
        assert_eq!(
            extract_prompt(&stream),
            Some("user@host:~$".to_string()),
            "prompt missed after {noise:?}"
        );
    }
}

#[test]
fn prompt_absent_when_output_keeps_flowing() {
    assert_eq!(extract_prompt("downloading... 42%\n"), None);
    assert_eq!(extract_prompt("no prompt here"), None);
}

#[test]
fn filename_enrichment_survives_clean_pipeline() {
    let listing = "archive.tar.gz installer.deb photo.jpeg report.pdf plain.conf";
    let cleaned = clean_output(listing, true);

    assert!(cleaned.contains(">archive.tar.gz</span>"));
    assert!(cleaned.contains(">installer.deb</span>"));
    assert!(cleaned.contains(">photo.jpeg</span>"));
    assert!(cleaned.contains(">report.pdf</span>"));
    assert!(!cleaned.contains(">plain.conf</span>"));

    // Every printable character of the original listing is still present.
    let restripped = strip_ansi(&cleaned)
        .replace("<span style=\"color: #e74c3c; font-weight: 500;\">", "")
        .replace("<span style=\"color: #2ecc71; font-weight: 500;\">", "")
        .replace("<span style=\"color: #9b59b6; font-weight: 400;\">", "")
        .replace("<span style=\"color: #f39c12; font-weight: 400;\">", "")
        .replace("</span>", "");
    assert_eq!(restripped, listing);
}
