//! Segmentation of tool output into progress events.
//!
//! Wrapped tools print progress with carriage returns (`\r`) to redraw the
//! current line and newlines (`\n`) to append. Output arrives in arbitrary
//! chunks, so the parser buffers bytes and only emits a segment once its
//! terminator is known. A trailing `\r` is held back until the next byte
//! shows whether it starts a `\r\n` pair.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Inner width of a compressed progress bar
pub const BAR_WIDTH: usize = 20;

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s?%").expect("valid percent regex"));

// Only spans made of bar glyphs; bracketed file names like "[Group]" are left alone.
static BAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[=#>\-\*\.\| ]{4,}\]").expect("valid bar regex"));

/// One line of tool output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub text: String,
    /// Replace the previously displayed line instead of appending
    pub is_overwrite: bool,
    pub percent: Option<f64>,
}

impl ProgressEvent {
    /// Build an event from a raw segment, extracting the percentage and compressing bars.
    pub fn from_segment(raw: &str, is_overwrite: bool) -> Self {
        let percent = extract_percent(raw);
        let text = compress_bars(raw.trim_end(), percent);
        Self {
            text,
            is_overwrite,
            percent,
        }
    }
}

/// First `NN` or `NN.NN` followed by `%` that lies within 0..=100
pub fn extract_percent(text: &str) -> Option<f64> {
    PERCENT_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
        .find(|p| (0.0..=100.0).contains(p))
}

/// Redraw every ASCII progress bar at `BAR_WIDTH`, keeping the rest of the line intact.
pub fn compress_bars(text: &str, percent: Option<f64>) -> String {
    BAR_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let inner = &caps[0][1..caps[0].len() - 1];
            let ratio = match percent {
                Some(p) => p / 100.0,
                None => {
                    let filled = inner.chars().filter(|c| *c != ' ' && *c != '.').count();
                    filled as f64 / inner.chars().count().max(1) as f64
                }
            };
            render_bar(ratio)
        })
        .into_owned()
}

fn render_bar(ratio: f64) -> String {
    let filled = ((ratio.clamp(0.0, 1.0) * BAR_WIDTH as f64).round() as usize).min(BAR_WIDTH);
    let mut bar = String::with_capacity(BAR_WIDTH + 2);
    bar.push('[');
    if filled == BAR_WIDTH {
        bar.push_str(&"=".repeat(BAR_WIDTH));
    } else if filled > 0 {
        bar.push_str(&"=".repeat(filled - 1));
        bar.push('>');
        bar.push_str(&" ".repeat(BAR_WIDTH - filled));
    } else {
        bar.push_str(&" ".repeat(BAR_WIDTH));
    }
    bar.push(']');
    bar
}

/// Stateful `\r`/`\n` line splitter
#[derive(Debug, Default)]
pub struct OutputStreamParser {
    buffer: Vec<u8>,
    previous_was_cr: bool,
}

impl OutputStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_str(&mut self, chunk: &str) -> Vec<ProgressEvent> {
        self.feed(chunk.as_bytes())
    }

    /// Consume a chunk and return every segment it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ProgressEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\r' || *b == b'\n') else {
                break;
            };

            let (consumed, by_cr) = if self.buffer[pos] == b'\r' {
                match self.buffer.get(pos + 1) {
                    // undecided until we see the next byte
                    None => break,
                    Some(b'\n') => (pos + 2, false),
                    Some(_) => (pos + 1, true),
                }
            } else {
                (pos + 1, false)
            };

            let segment: Vec<u8> = self.buffer.drain(..consumed).take(pos).collect();
            if let Some(event) = self.segment(&segment, by_cr) {
                events.push(event);
            }
        }

        events
    }

    /// Flush the unterminated remainder at end of stream
    pub fn finish(&mut self) -> Option<ProgressEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut rest = std::mem::take(&mut self.buffer);
        let by_cr = rest.last() == Some(&b'\r');
        if by_cr {
            rest.pop();
        }
        self.segment(&rest, by_cr)
    }

    fn segment(&mut self, bytes: &[u8], by_cr: bool) -> Option<ProgressEvent> {
        // an lf-terminated line right after a cr line replaces it
        let is_overwrite = by_cr || self.previous_was_cr;
        self.previous_was_cr = by_cr;

        let text = String::from_utf8_lossy(bytes);
        if text.trim().is_empty() {
            return None;
        }
        Some(ProgressEvent::from_segment(&text, is_overwrite))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(chunks: &[&[u8]]) -> Vec<ProgressEvent> {
        let mut parser = OutputStreamParser::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.feed(chunk));
        }
        events.extend(parser.finish());
        events
    }

    #[test]
    fn splits_on_newlines_and_carriage_returns() {
        let events = parse_all(&[b"start\n10%\r20%\r30%\ndone\n"]);
        let summary: Vec<_> = events.iter().map(|e| (e.text.as_str(), e.is_overwrite)).collect();
        assert_eq!(
            summary,
            vec![("start", false), ("10%", true), ("20%", true), ("30%", true), ("done", false)]
        );
    }

    #[test]
    fn crlf_is_a_single_plain_newline() {
        let events = parse_all(&[b"one\r\ntwo\r\n"]);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| !e.is_overwrite));
    }

    #[test]
    fn flushes_unterminated_tail() {
        let events = parse_all(&[b"line\npartial"]);
        assert_eq!(events.last().unwrap().text, "partial");
        assert!(!events.last().unwrap().is_overwrite);

        let events = parse_all(&[b"50%\r"]);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_overwrite);
    }

    #[test]
    fn chunk_boundaries_do_not_change_events() {
        let input: &[u8] = b"Extracting\r\n 5%\r 12.5% [==>      ]\r100%\nDone. \xe6\x97\xa5\xe6\x9c\xac\r\n\rtail";
        let whole = parse_all(&[input]);
        for split in 1..input.len() {
            let (a, b) = input.split_at(split);
            assert_eq!(parse_all(&[a, b]), whole, "split at {}", split);
        }
        let bytewise: Vec<&[u8]> = input.chunks(1).collect();
        assert_eq!(parse_all(&bytewise), whole);
    }

    #[test]
    fn extracts_percentages() {
        assert_eq!(extract_percent("Progress: 37% [====>     ]"), Some(37.0));
        assert_eq!(extract_percent("at 12.75% now"), Some(12.75));
        assert_eq!(extract_percent("no numbers here"), None);
        assert_eq!(extract_percent("450%"), None);
    }

    #[test]
    fn skips_out_of_range_percentages_before_the_real_one() {
        assert_eq!(extract_percent("speed 150%, done 40%"), Some(40.0));
        assert_eq!(extract_percent("cpu 230% load 180%"), None);
        let event = ProgressEvent::from_segment("speed 150%, done 40%", true);
        assert_eq!(event.percent, Some(40.0));
    }

    #[test]
    fn compresses_progress_bars_to_fixed_width() {
        let event = ProgressEvent::from_segment("Progress: 37% [====>     ]", true);
        assert_eq!(event.percent, Some(37.0));
        let start = event.text.find('[').unwrap();
        let end = event.text.rfind(']').unwrap();
        assert_eq!(end - start - 1, BAR_WIDTH);
        assert!(event.text.starts_with("Progress: 37% "));

        let long = format!("{}%|[{}]", 80, "#".repeat(120));
        let compressed = compress_bars(&long, Some(80.0));
        assert_eq!(compressed.len(), "80%|".len() + BAR_WIDTH + 2);
    }

    #[test]
    fn leaves_bracketed_names_alone() {
        let text = "Loading [Group] Show - 01.mkv";
        assert_eq!(compress_bars(text, None), text);
    }
}
