//! Stable error identity from class + normalized backtrace (spec §3, §6).
//!
//! Fingerprint = 64-hex-char SHA-256 of `"{kind}:{error_class}\n{normalized_backtrace}"`.
//! Two events with identical `(kind, error_class, normalized_backtrace)` always
//! fingerprint identically, regardless of source line numbers — this is the
//! property spec §8 scenario 2 exercises.

use sha2::{Digest, Sha256};

/// One parsed backtrace frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub file: String,
    pub line: Option<u32>,
    pub function: String,
}

impl Frame {
    /// Parses a `"path:line in 'function'"` or bare `"path:line"` frame.
    /// Unparseable input is kept as-is in `file` with no line/function.
    pub fn parse(raw: &str) -> Self {
        let (location, function) = match raw.split_once(" in ") {
            Some((loc, func)) => (loc, func.trim_matches(['\'', '"']).to_string()),
            None => (raw, String::new()),
        };
        match location.rsplit_once(':') {
            Some((file, line)) if line.chars().all(|c| c.is_ascii_digit()) && !line.is_empty() => {
                Frame {
                    file: file.to_string(),
                    line: line.parse().ok(),
                    function,
                }
            }
            _ => Frame {
                file: location.to_string(),
                line: None,
                function,
            },
        }
    }

    /// Rendering used for fingerprint input: strips the line number.
    fn normalized(&self) -> String {
        if self.function.is_empty() {
            self.file.clone()
        } else {
            format!("{} in '{}'", self.file, self.function)
        }
    }
}

/// Classifies backtrace frames so the fingerprint ignores noise that would
/// otherwise make every occurrence of "the same" error look distinct.
pub struct FrameClassifier {
    /// Frames whose file matches one of these substrings are dropped
    /// entirely: the monitor's own frames, language runtime internals.
    pub internal_patterns: Vec<String>,
    /// Among frames that survive `internal_patterns`, frames matching one
    /// of these substrings are treated as library/vendor code rather than
    /// application code.
    pub vendor_patterns: Vec<String>,
}

impl Default for FrameClassifier {
    fn default() -> Self {
        Self {
            internal_patterns: vec![
                "apmcore::".to_string(),
                "/rustc/".to_string(),
                "<unknown>".to_string(),
            ],
            vendor_patterns: vec![
                "/.cargo/registry/".to_string(),
                "/.cargo/git/".to_string(),
                "/usr/lib/".to_string(),
            ],
        }
    }
}

impl FrameClassifier {
    fn is_internal(&self, frame: &Frame) -> bool {
        self.internal_patterns.iter().any(|p| frame.file.contains(p.as_str()))
    }

    fn is_vendor(&self, frame: &Frame) -> bool {
        self.vendor_patterns.iter().any(|p| frame.file.contains(p.as_str()))
    }

    /// Normalizes a raw backtrace into the string used as fingerprint input.
    ///
    /// Steps (spec §3): drop internal/self-monitor frames; take the first
    /// `k` application (non-vendor) frames, line numbers stripped; if none
    /// survive, fall back to the first 3 non-internal frames instead.
    pub fn normalize(&self, raw_frames: &[String], k: usize) -> String {
        let parsed: Vec<Frame> = raw_frames
            .iter()
            .map(|s| Frame::parse(s))
            .filter(|f| !self.is_internal(f))
            .collect();

        let app_frames: Vec<&Frame> = parsed.iter().filter(|f| !self.is_vendor(f)).take(k).collect();

        let chosen: Vec<&Frame> = if app_frames.is_empty() {
            parsed.iter().take(3).collect()
        } else {
            app_frames
        };

        chosen
            .iter()
            .map(|f| f.normalized())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Computes the 64-hex-char SHA-256 fingerprint for an error group.
pub fn fingerprint(
    kind: &str,
    error_class: &str,
    raw_backtrace: &[String],
    classifier: &FrameClassifier,
    app_frames: usize,
) -> String {
    let normalized = classifier.normalize(raw_backtrace, app_frames);
    let input = format!("{kind}:{error_class}\n{normalized}");
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backtrace(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn line_numbers_do_not_affect_fingerprint() {
        let classifier = FrameClassifier::default();
        let bt_a = backtrace(&["app/models/user.rs:42 in 'validate'"]);
        let bt_b = backtrace(&["app/models/user.rs:99 in 'validate'"]);
        let fp_a = fingerprint("http", "RuntimeError", &bt_a, &classifier, 5);
        let fp_b = fingerprint("http", "RuntimeError", &bt_b, &classifier, 5);
        assert_eq!(fp_a, fp_b);
        assert_eq!(fp_a.len(), 64);
    }

    #[test]
    fn kind_distinguishes_fingerprint() {
        let classifier = FrameClassifier::default();
        let bt = backtrace(&["app/models/user.rs:42 in 'validate'"]);
        let http_fp = fingerprint("http", "RuntimeError", &bt, &classifier, 5);
        let job_fp = fingerprint("job", "RuntimeError", &bt, &classifier, 5);
        assert_ne!(http_fp, job_fp);
    }

    #[test]
    fn falls_back_to_first_three_non_internal_frames() {
        let classifier = FrameClassifier::default();
        let bt = backtrace(&[
            "/home/u/.cargo/registry/src/foo-1.0/lib.rs:10 in 'call'",
            "/home/u/.cargo/registry/src/foo-1.0/lib.rs:20 in 'dispatch'",
            "/home/u/.cargo/registry/src/foo-1.0/lib.rs:30 in 'run'",
            "/home/u/.cargo/registry/src/foo-1.0/lib.rs:40 in 'exec'",
        ]);
        let normalized = classifier.normalize(&bt, 5);
        assert_eq!(normalized.lines().count(), 3);
    }

    #[test]
    fn internal_frames_never_appear() {
        let classifier = FrameClassifier::default();
        let bt = backtrace(&[
            "apmcore::flusher:1 in 'run'",
            "app/jobs/worker.rs:5 in 'perform'",
        ]);
        let normalized = classifier.normalize(&bt, 5);
        assert!(!normalized.contains("apmcore"));
        assert!(normalized.contains("worker.rs"));
    }
}
