//! Safe decoding of raw subprocess output.
//!
//! Child processes write whatever bytes they like. This module turns one chunk
//! (normally a single line, trailing newline included) into text that can always
//! be printed to a terminal and written to a UTF-8 log file. ANSI color sequences
//! survive; control bytes known to corrupt terminal rendering do not.

use std::sync::OnceLock;

use regex::Regex;

// Tab, LF, CR and ESC are deliberately absent from this class.
const CONTROL_CLASS: &str = r"[\x00-\x08\x0B\x0C\x0E-\x1A\x1C-\x1F\x7F-\x{9F}]";

fn control_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(CONTROL_CLASS).expect("control class is a valid regex"))
}

/// Decodes a chunk of subprocess output into printable text.
///
/// Strict UTF-8 is tried first, falling back to Latin-1 which accepts every
/// byte. Non-ASCII letters are transliterated to their closest ASCII form and
/// unsafe control characters are removed. Never fails.
pub fn decode(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => latin1(bytes),
    };
    let text = transliterate(&text).unwrap_or(text);
    strip_controls(&text)
}

/// Removes the control characters that are not safe to echo to a terminal.
fn strip_controls(text: &str) -> String {
    control_pattern().replace_all(text, "").into_owned()
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

// Returns None when a character has no known ASCII form; the caller then keeps
// the untransliterated text.
fn transliterate(text: &str) -> Option<String> {
    if text.is_ascii() {
        return Some(text.to_string());
    }
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_ascii() || is_c1(ch) {
            out.push(ch);
            continue;
        }
        out.push_str(deunicode::deunicode_char(ch)?);
    }
    Some(out)
}

fn is_c1(ch: char) -> bool {
    ('\u{80}'..='\u{9f}').contains(&ch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_empty_output() {
        assert_eq!(decode(b""), "");
    }

    #[test]
    fn plain_utf8_passes_through() {
        assert_eq!(decode(b"compiling app\n"), "compiling app\n");
    }

    #[test]
    fn accents_are_transliterated() {
        assert_eq!(decode("Diretório não encontrado\n".as_bytes()), "Diretorio nao encontrado\n");
    }

    #[test]
    fn invalid_utf8_falls_back_to_latin1() {
        assert_eq!(decode(b"caf\xe9 \xff\n"), "cafe y\n");
    }

    #[test]
    fn color_sequences_survive() {
        let input = b"\x1b[32mok\x1b[0m\r\n";
        assert_eq!(decode(input), "\u{1b}[32mok\u{1b}[0m\r\n");
    }

    #[test]
    fn unsafe_controls_are_removed() {
        let input = b"a\x00b\x0bc\x7fd\x0ce\x1af\x1cg\th\r\n";
        assert_eq!(decode(input), "abcdefg\th\r\n");
    }

    #[test]
    fn c1_controls_are_removed_from_valid_utf8() {
        assert_eq!(decode("x\u{85}y\u{9b}z".as_bytes()), "xyz");
    }

    #[test]
    fn every_single_byte_decodes_safely() {
        for byte in 0u8..=255 {
            let out = decode(&[byte]);
            for ch in out.chars() {
                let code = ch as u32;
                let allowed = matches!(code, 0x09 | 0x0A | 0x0D | 0x1B) || (0x20..0x7F).contains(&code) || code > 0x9F;
                assert!(allowed, "byte {byte:#04x} produced {code:#x}");
            }
            if matches!(byte, 0x09 | 0x0A | 0x0D | 0x1B) {
                assert_eq!(out, char::from(byte).to_string());
            }
        }
    }

    #[test]
    fn kept_controls_stay_in_position() {
        let input = b"\x00\t\x01\n\x02\r\x03\x1b[1m";
        assert_eq!(decode(input), "\t\n\r\u{1b}[1m");
    }

    #[test]
    fn invalid_utf8_with_escape_keeps_escape() {
        let out = decode(b"\x1b[31m\xc3\x28 err\n");
        assert!(out.starts_with("\u{1b}[31m"));
        assert!(out.ends_with(" err\n"));
    }
}
