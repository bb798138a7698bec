//! Incremental ANSI escape sequence decoding.
//!
//! Process output arrives in arbitrary chunks, so the decoder keeps its parse state
//! between calls to [`AnsiDecoder::feed`] and only hands back complete lines. SGR
//! sequences are turned into styled [`Segment`]s; every other escape sequence is
//! stripped so control bytes never leak into stored logs.

use serde::{Deserialize, Serialize};

use crate::output::Segment;

const MAX_CSI_PARAMS: usize = 64;
const MAX_STRING_SEQUENCE: usize = 4096;

/// Foreground colors understood by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    Gray,
    DarkGray,
    LightRed,
    LightGreen,
    LightYellow,
    LightBlue,
    LightMagenta,
    LightCyan,
    White,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct AnsiStyle {
    fg: Option<Color>,
    bold: bool,
    underline: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Ground,
    Escape,
    EscapeIntermediate,
    Csi,
    /// OSC, DCS, SOS, PM and APC bodies: skipped until BEL or ST.
    Str,
    StrEscape,
}

/// One complete line of decoded output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLine {
    /// Styled runs in display order. Empty for a blank line.
    pub segments: Vec<Segment>,
    /// Number of raw bytes (escapes and terminator included) consumed by this line.
    pub raw_len: usize,
}

/// Streaming decoder for a single output stream of a single unit.
#[derive(Debug)]
pub struct AnsiDecoder {
    state: ParseState,
    params: Vec<u8>,
    csi_malformed: bool,
    str_len: usize,
    style: AnsiStyle,
    run_style: AnsiStyle,
    run: Vec<u8>,
    segments: Vec<Segment>,
    pending_cr: bool,
    raw_len: usize,
}

impl Default for AnsiDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AnsiDecoder {
    pub fn new() -> Self {
        Self {
            state: ParseState::Ground,
            params: Vec::new(),
            csi_malformed: false,
            str_len: 0,
            style: AnsiStyle::default(),
            run_style: AnsiStyle::default(),
            run: Vec::new(),
            segments: Vec::new(),
            pending_cr: false,
            raw_len: 0,
        }
    }

    /// Feeds a chunk of raw bytes and returns every line completed by it.
    ///
    /// Incomplete trailing data (a partial line, a split UTF-8 code point or a
    /// truncated escape sequence) is retained for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<DecodedLine> {
        let mut lines = Vec::new();
        for &byte in bytes {
            self.raw_len += 1;
            self.step(byte, &mut lines);
        }
        lines
    }

    /// Flushes a trailing unterminated line, if any. Called when the stream closes.
    pub fn finish(&mut self) -> Option<DecodedLine> {
        if self.state == ParseState::Csi {
            self.degrade_csi();
        }
        self.state = ParseState::Ground;
        self.pending_cr = false;
        if self.run.is_empty() && self.segments.is_empty() {
            self.raw_len = 0;
            return None;
        }
        Some(self.take_line())
    }

    fn step(&mut self, byte: u8, lines: &mut Vec<DecodedLine>) {
        match self.state {
            ParseState::Ground => self.ground(byte, lines),
            ParseState::Escape => match byte {
                b'[' => {
                    self.params.clear();
                    self.csi_malformed = false;
                    self.state = ParseState::Csi;
                }
                b']' | b'P' | b'X' | b'^' | b'_' => {
                    self.str_len = 0;
                    self.state = ParseState::Str;
                }
                0x1b => {}
                0x20..=0x2f => self.state = ParseState::EscapeIntermediate,
                0x30..=0x7e => self.state = ParseState::Ground,
                _ => {
                    // Not an escape after all: drop the ESC and treat the byte as text.
                    self.state = ParseState::Ground;
                    self.ground(byte, lines);
                }
            },
            ParseState::EscapeIntermediate => match byte {
                0x20..=0x2f => {}
                0x30..=0x7e => self.state = ParseState::Ground,
                _ => {
                    self.state = ParseState::Ground;
                    self.ground(byte, lines);
                }
            },
            ParseState::Csi => self.csi(byte, lines),
            ParseState::Str => match byte {
                0x07 => self.state = ParseState::Ground,
                0x1b => self.state = ParseState::StrEscape,
                b'\n' => {
                    // Unterminated string sequence: never swallow the rest of the stream.
                    self.state = ParseState::Ground;
                    self.ground(byte, lines);
                }
                _ => {
                    self.str_len += 1;
                    if self.str_len > MAX_STRING_SEQUENCE {
                        self.state = ParseState::Ground;
                    }
                }
            },
            ParseState::StrEscape => {
                if byte == b'\\' {
                    self.state = ParseState::Ground;
                } else {
                    self.state = ParseState::Escape;
                    self.step(byte, lines);
                }
            }
        }
    }

    fn ground(&mut self, byte: u8, lines: &mut Vec<DecodedLine>) {
        if self.pending_cr {
            self.pending_cr = false;
            if byte != b'\n' {
                // Bare carriage return: the line is being redrawn, keep only the rewrite.
                self.run.clear();
                self.segments.clear();
            }
        }
        match byte {
            b'\n' => lines.push(self.take_line()),
            b'\r' => self.pending_cr = true,
            0x1b => self.state = ParseState::Escape,
            b'\t' => self.push_text(byte),
            0x00..=0x1f | 0x7f => {}
            _ => self.push_text(byte),
        }
    }

    fn csi(&mut self, byte: u8, lines: &mut Vec<DecodedLine>) {
        match byte {
            0x30..=0x3f => {
                if self.params.len() >= MAX_CSI_PARAMS {
                    self.degrade_csi();
                    self.state = ParseState::Ground;
                    self.ground(byte, lines);
                    return;
                }
                if !matches!(byte, b'0'..=b'9' | b';' | b':') {
                    self.csi_malformed = true;
                }
                self.params.push(byte);
            }
            0x20..=0x2f => {
                self.csi_malformed = true;
                self.params.push(byte);
            }
            0x40..=0x7e => {
                self.state = ParseState::Ground;
                if byte == b'm' && !self.csi_malformed {
                    apply_sgr(&mut self.style, &self.params);
                }
                self.params.clear();
            }
            0x1b => {
                self.degrade_csi();
                self.state = ParseState::Escape;
            }
            _ => {
                self.degrade_csi();
                self.state = ParseState::Ground;
                self.ground(byte, lines);
            }
        }
    }

    // A CSI sequence that never terminated: surface what followed the ESC as plain text.
    fn degrade_csi(&mut self) {
        let params = std::mem::take(&mut self.params);
        self.push_text(b'[');
        for byte in params {
            self.push_text(byte);
        }
    }

    fn push_text(&mut self, byte: u8) {
        if self.run.is_empty() {
            self.run_style = self.style;
        } else if self.run_style != self.style {
            self.flush_run();
            self.run_style = self.style;
        }
        self.run.push(byte);
    }

    fn flush_run(&mut self) {
        if self.run.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.run).into_owned();
        self.run.clear();
        let style = self.run_style;
        if let Some(last) = self.segments.last_mut() {
            if last.fg == style.fg && last.bold == style.bold && last.underline == style.underline
            {
                last.text.push_str(&text);
                return;
            }
        }
        self.segments.push(Segment {
            text,
            fg: style.fg,
            bold: style.bold,
            underline: style.underline,
        });
    }

    fn take_line(&mut self) -> DecodedLine {
        self.flush_run();
        let line = DecodedLine {
            segments: std::mem::take(&mut self.segments),
            raw_len: self.raw_len,
        };
        self.raw_len = 0;
        line
    }
}

fn apply_sgr(state: &mut AnsiStyle, params: &[u8]) {
    let values = parse_params(params);
    let mut i = 0;
    while i < values.len() {
        match values[i] {
            0 => {
                *state = AnsiStyle::default();
                i += 1;
            }
            1 => {
                state.bold = true;
                i += 1;
            }
            4 => {
                state.underline = true;
                i += 1;
            }
            21 | 22 => {
                state.bold = false;
                i += 1;
            }
            24 => {
                state.underline = false;
                i += 1;
            }
            30..=37 => {
                state.fg = basic_color(values[i] - 30, false);
                i += 1;
            }
            90..=97 => {
                state.fg = basic_color(values[i] - 90, true);
                i += 1;
            }
            39 => {
                state.fg = None;
                i += 1;
            }
            38 | 48 => {
                let is_fg = values[i] == 38;
                if let Some((advance, color)) = parse_extended_color(&values[i + 1..]) {
                    if is_fg {
                        state.fg = Some(color);
                    }
                    i += 1 + advance;
                } else {
                    i += 1;
                }
            }
            _ => {
                i += 1;
            }
        }
    }
}

fn parse_params(params: &[u8]) -> Vec<u32> {
    if params.is_empty() {
        return vec![0];
    }
    let mut values = Vec::new();
    for part in params.split(|&b| b == b';' || b == b':') {
        if part.is_empty() {
            values.push(0);
            continue;
        }
        let parsed = std::str::from_utf8(part)
            .ok()
            .and_then(|s| s.parse::<u32>().ok());
        // Out-of-range numbers still occupy a slot so extended colors stay aligned.
        values.push(parsed.unwrap_or(u32::MAX));
    }
    values
}

fn parse_extended_color(values: &[u32]) -> Option<(usize, Color)> {
    match *values.first()? {
        5 => {
            let index = u8::try_from(*values.get(1)?).ok()?;
            Some((2, Color::Indexed(index)))
        }
        2 => {
            let r = u8::try_from(*values.get(1)?).ok()?;
            let g = u8::try_from(*values.get(2)?).ok()?;
            let b = u8::try_from(*values.get(3)?).ok()?;
            Some((4, Color::Rgb(r, g, b)))
        }
        _ => None,
    }
}

fn basic_color(index: u32, bright: bool) -> Option<Color> {
    let color = match (index, bright) {
        (0, false) => Color::Black,
        (1, false) => Color::Red,
        (2, false) => Color::Green,
        (3, false) => Color::Yellow,
        (4, false) => Color::Blue,
        (5, false) => Color::Magenta,
        (6, false) => Color::Cyan,
        (7, false) => Color::Gray,
        (0, true) => Color::DarkGray,
        (1, true) => Color::LightRed,
        (2, true) => Color::LightGreen,
        (3, true) => Color::LightYellow,
        (4, true) => Color::LightBlue,
        (5, true) => Color::LightMagenta,
        (6, true) => Color::LightCyan,
        (7, true) => Color::White,
        _ => return None,
    };
    Some(color)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<DecodedLine> {
        let mut decoder = AnsiDecoder::new();
        let mut lines = decoder.feed(bytes);
        lines.extend(decoder.finish());
        lines
    }

    fn texts(line: &DecodedLine) -> Vec<&str> {
        line.segments.iter().map(|s| s.text.as_str()).collect()
    }

    #[test]
    fn decodes_red_error_prefix() {
        let lines = decode_all(b"\x1b[31mERROR\x1b[0m: failed\n");
        assert_eq!(lines.len(), 1);
        let segments = &lines[0].segments;
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "ERROR");
        assert_eq!(segments[0].fg, Some(Color::Red));
        assert_eq!(segments[1].text, ": failed");
        assert_eq!(segments[1].fg, None);
        assert_eq!(lines[0].raw_len, 23);
    }

    #[test]
    fn plain_text_has_single_default_segment() {
        let lines = decode_all(b"hello\n");
        assert_eq!(texts(&lines[0]), vec!["hello"]);
        assert!(!lines[0].segments[0].bold);
    }

    #[test]
    fn buffers_partial_lines_until_newline() {
        let mut decoder = AnsiDecoder::new();
        assert!(decoder.feed(b"abc").is_empty());
        let lines = decoder.feed(b"def\nxyz");
        assert_eq!(lines.len(), 1);
        assert_eq!(texts(&lines[0]), vec!["abcdef"]);
        let tail = decoder.finish().unwrap();
        assert_eq!(texts(&tail), vec!["xyz"]);
    }

    #[test]
    fn split_at_every_boundary_matches_whole_feed() {
        let input: &[u8] = "\x1b[1;4;32mok\x1b[0m done \u{e9}\x1b]0;title\x07!\r\n\
            \x1b[38;5;208mindexed\x1b[39m plain\x1b[2K\n\x1b[38;2;1;2;3mrgb\x1b[m\n"
            .as_bytes();
        let whole = decode_all(input);
        for split in 0..=input.len() {
            let mut decoder = AnsiDecoder::new();
            let mut lines = decoder.feed(&input[..split]);
            lines.extend(decoder.feed(&input[split..]));
            lines.extend(decoder.finish());
            assert_eq!(lines, whole, "split at {split}");
        }
        let mut decoder = AnsiDecoder::new();
        let mut lines = Vec::new();
        for byte in input {
            lines.extend(decoder.feed(std::slice::from_ref(byte)));
        }
        lines.extend(decoder.finish());
        assert_eq!(lines, whole);
    }

    #[test]
    fn style_persists_across_lines_until_reset() {
        let lines = decode_all(b"\x1b[1mone\ntwo\x1b[22m three\n");
        assert!(lines[0].segments[0].bold);
        assert!(lines[1].segments[0].bold);
        assert!(!lines[1].segments[1].bold);
    }

    #[test]
    fn strips_osc_and_non_sgr_csi() {
        let lines = decode_all(b"hi\x1b]0;title\x07there\x1b[2J\x1b[?25l!\n");
        assert_eq!(texts(&lines[0]), vec!["hithere!"]);
    }

    #[test]
    fn carriage_return_keeps_last_rewrite() {
        let lines = decode_all(b"10%\r50%\r100%\n");
        assert_eq!(texts(&lines[0]), vec!["100%"]);
        let crlf = decode_all(b"line\r\n");
        assert_eq!(texts(&crlf[0]), vec!["line"]);
    }

    #[test]
    fn malformed_csi_degrades_to_text() {
        let lines = decode_all(b"a\x1b[31\nb\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(texts(&lines[0]), vec!["a[31"]);
        assert_eq!(texts(&lines[1]), vec!["b"]);
    }

    #[test]
    fn truncated_escape_at_eof_does_not_panic() {
        let mut decoder = AnsiDecoder::new();
        assert!(decoder.feed(b"tail\x1b[3").is_empty());
        let line = decoder.finish().unwrap();
        assert_eq!(texts(&line), vec!["tail[3"]);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let lines = decode_all(b"bad \xff byte\n");
        assert_eq!(texts(&lines[0]), vec!["bad \u{fffd} byte"]);
    }

    #[test]
    fn redundant_sgr_does_not_split_segments() {
        let lines = decode_all(b"\x1b[31mA\x1b[31mB\n");
        assert_eq!(lines[0].segments.len(), 1);
        assert_eq!(lines[0].segments[0].text, "AB");
    }

    #[test]
    fn parse_params_defaults_to_reset() {
        assert_eq!(parse_params(b""), vec![0]);
        assert_eq!(parse_params(b";"), vec![0, 0]);
        assert_eq!(parse_params(b"1;"), vec![1, 0]);
    }

    #[test]
    fn parse_extended_color_handles_index_and_rgb() {
        let indexed = parse_extended_color(&[5, 120]).unwrap();
        assert_eq!(indexed, (2, Color::Indexed(120)));

        let rgb = parse_extended_color(&[2, 1, 2, 3]).unwrap();
        assert_eq!(rgb, (4, Color::Rgb(1, 2, 3)));

        assert!(parse_extended_color(&[9]).is_none());
        assert!(parse_extended_color(&[5, 999]).is_none());
    }

    #[test]
    fn basic_color_rejects_out_of_range() {
        assert!(basic_color(9, false).is_none());
    }
}
