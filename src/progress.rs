/// Progress extraction from the download tool's terminal output.
///
/// Recognizes progress-bar lines such as:
/// - `pulling 6a0746a1ec1a...  45% ▕████      ▏ 2.1 GB/4.7 GB   50 MB/s   51s`
/// - `downloading model: 45%| 2.15G/4.78G [00:42<00:51, 50.9MB/s]`
use regex::Regex;
use std::sync::LazyLock;

// The leading class keeps "1000%" from matching as "000%"
static PERCENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\d.])(\d{1,3}(?:\.\d+)?)\s*%").unwrap());

static SPEED_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*([KMGT]?)i?B/s").unwrap());

const MIB: f64 = 1024.0 * 1024.0;

/// One parsed progress line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReading {
    /// Completion percentage, 0-100.
    pub percent: f64,
    /// Instantaneous transfer rate in MB/s, when the line shows one.
    pub speed_mbps: Option<f64>,
}

/// Parse one line of child output. Lines without a completion percentage yield `None`.
pub fn parse_line(line: &str) -> Option<ProgressReading> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let percent: f64 = PERCENT_PATTERN
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())?;
    if !(0.0..=100.0).contains(&percent) {
        return None;
    }

    let speed_mbps = SPEED_PATTERN.captures(line).and_then(|c| {
        let value: f64 = c.get(1)?.as_str().parse().ok()?;
        let unit = c.get(2).map(|m| m.as_str()).unwrap_or("");
        Some(unit_bytes(unit) * value / MIB)
    });

    Some(ProgressReading {
        percent,
        speed_mbps,
    })
}

/// Byte multiplier for a size prefix (binary units).
fn unit_bytes(prefix: &str) -> f64 {
    match prefix.to_ascii_uppercase().as_str() {
        "K" => 1024.0,
        "M" => MIB,
        "G" => MIB * 1024.0,
        "T" => MIB * 1024.0 * 1024.0,
        _ => 1.0,
    }
}

/// Splits a byte stream into lines on `\n` and `\r`.
///
/// Progress bars redraw in place with carriage returns, so each redraw is
/// its own line. Incomplete trailing data is held until the next push.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Return whatever remains after the stream closes.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_percent_must_start_at_a_number_boundary() {
        assert_eq!(parse_line("verifying 1000% 5 MB/s"), None);

        let reading = parse_line("45% 5 MB/s").unwrap();
        assert!(approx(reading.percent, 45.0));
        let reading = parse_line("pulling abc:99.5% 5 MB/s").unwrap();
        assert!(approx(reading.percent, 99.5));
    }

    #[test]
    fn test_parse_ollama_progress_line() {
        let reading = parse_line(
            "pulling 6a0746a1ec1a...  45% ▕████████        ▏ 2.1 GB/4.7 GB   50 MB/s   51s",
        )
        .unwrap();
        assert!(approx(reading.percent, 45.0));
        assert!(approx(reading.speed_mbps.unwrap(), 50.0));
    }

    #[test]
    fn test_parse_tqdm_style_line() {
        let reading = parse_line(
            "downloading model: 45%|████████████████▌         | 2.15G/4.78G [00:42<00:51, 50.9MB/s]",
        )
        .unwrap();
        assert!(approx(reading.percent, 45.0));
        assert!(approx(reading.speed_mbps.unwrap(), 50.9));
    }

    #[test]
    fn test_parse_converts_units_to_megabytes() {
        let kb = parse_line("10% 512 KB/s").unwrap();
        assert!(approx(kb.speed_mbps.unwrap(), 0.5));

        let gb = parse_line("10% 1.5 GB/s").unwrap();
        assert!(approx(gb.speed_mbps.unwrap(), 1536.0));

        let bytes = parse_line("10% 1048576 B/s").unwrap();
        assert!(approx(bytes.speed_mbps.unwrap(), 1.0));
    }

    #[test]
    fn test_parse_accepts_binary_unit_suffix() {
        let reading = parse_line("12% 2 MiB/s").unwrap();
        assert!(approx(reading.speed_mbps.unwrap(), 2.0));
    }

    #[test]
    fn test_parse_percent_without_speed() {
        let reading = parse_line("verifying sha256 digest 100%").unwrap();
        assert!(approx(reading.percent, 100.0));
        assert_eq!(reading.speed_mbps, None);
    }

    #[test]
    fn test_parse_ignores_unrelated_lines() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("pulling manifest"), None);
        assert_eq!(parse_line("writing manifest"), None);
        assert_eq!(parse_line("success"), None);
        assert_eq!(parse_line("50 MB/s but no percentage"), None);
    }

    #[test]
    fn test_parse_rejects_impossible_percentage() {
        assert_eq!(parse_line("450% 10 MB/s"), None);
    }

    #[test]
    fn test_parse_never_panics_on_garbage() {
        for line in ["%%%", "99999999999999999999999% x", "\u{fffd}\u{fffd}%", "1.2.3% 4..5 MB/s"] {
            let _ = parse_line(line);
        }
    }

    #[test]
    fn test_splitter_handles_carriage_returns() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(b"pulling 10% 5 MB/s\rpulling 11% 6 MB/s\rpull");
        assert_eq!(lines, vec!["pulling 10% 5 MB/s", "pulling 11% 6 MB/s"]);

        let lines = splitter.push(b"ing 12% 7 MB/s\n");
        assert_eq!(lines, vec!["pulling 12% 7 MB/s"]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_splitter_skips_empty_lines_and_flushes_tail() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"\r\n\r\nabc"), Vec::<String>::new());
        assert_eq!(splitter.finish(), Some("abc".to_string()));
        assert_eq!(splitter.finish(), None);
    }
}
