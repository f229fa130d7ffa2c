use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

// `00:01:02,345 --> 00:01:04,000` (SRT) or `01:02.345 --> 01:04.000` (VTT, optional hours)
static CUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(\d+):)?(\d{1,2}):(\d{2})[,.](\d{3})\s*-->\s*(?:(\d+):)?(\d{1,2}):(\d{2})[,.](\d{3})")
        .expect("valid cue regex")
});

/// First cue start and last cue end, in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSpan {
    pub start: f64,
    pub end: f64,
}

impl TimingSpan {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    /// 1 for identical durations, falling towards 0 as they diverge
    pub fn similarity(&self, other: &TimingSpan) -> f64 {
        let (a, b) = (self.duration(), other.duration());
        let longest = a.max(b);
        if longest <= f64::EPSILON {
            return 0.0;
        }
        1.0 - (a - b).abs() / longest
    }
}

fn seconds(caps: &regex::Captures<'_>, first: usize) -> f64 {
    let field = |i: usize| {
        caps.get(first + i)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .unwrap_or(0.0)
    };
    field(0) * 3600.0 + field(1) * 60.0 + field(2) + field(3) / 1000.0
}

/// Span of every cue timestamp found in SRT or WebVTT text
pub fn parse_span(text: &str) -> Option<TimingSpan> {
    CUE_RE.captures_iter(text).fold(None, |span, caps| {
        let (start, end) = (seconds(&caps, 1), seconds(&caps, 5));
        Some(match span {
            None => TimingSpan { start, end },
            Some(s) => TimingSpan {
                start: s.start.min(start),
                end: s.end.max(end),
            },
        })
    })
}

pub async fn read_span(path: &Path) -> Option<TimingSpan> {
    let bytes = tokio::fs::read(path).await.ok()?;
    parse_span(&String::from_utf8_lossy(&bytes))
}
