// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Dev-server output scanning: bound port, URLs and build/runtime errors.

use once_cell::sync::Lazy;
use regex::Regex;

static ANSI_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").unwrap());

/// Framework banners, most specific first. Capture group 1 is the port.
static PORT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Vite, Astro, SvelteKit, Nuxt: "➜  Local:   http://localhost:5173/"
        r"(?i)\bLocal:\s+https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d{2,5})",
        // Next.js: "- Local:        http://localhost:3000" and "started server on 0.0.0.0:3000"
        r"(?i)started server on [\w\.\[\]:]+:(\d{2,5})",
        // Angular: "** Angular Live Development Server is listening on localhost:4200"
        r"(?i)listening on (?:https?://)?[\w\.\[\]]+:(\d{2,5})",
        // Generic local URL anywhere in the line.
        r"(?i)https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d{2,5})",
        // "Listening on port 8080", "running at port 3000", "port: 4000"
        r"(?i)\b(?:listening|running|serving|started)\b.*\bport\b[:\s]+(\d{2,5})",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static URL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s'"<>\)\]]+"#).unwrap());

static ERROR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\berror TS\d+\b",
        r"\b(?:SyntaxError|TypeError|ReferenceError|RangeError)\b",
        r"(?i)\bmodule not found\b",
        r"(?i)\bcannot find module\b",
        r"(?i)\bfailed to compile\b",
        r"(?i)\[vite\].*\b(?:internal server error|error)\b",
        r"(?i)\bpre-transform error\b",
        r"^ERROR in\b",
        r"\[ERROR\]",
        r"(?i)\bbuild failed\b",
        r"(?i)\bunhandled(?:promise)?rejection\b",
        r"^npm ERR!",
        r"(?i)^\s*error:\s",
        r"(?i)\bEADDRINUSE\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Summaries that mention errors without reporting one.
static BENIGN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:0|no) errors?\b|\bfound 0 errors\b").unwrap());

/// Remove terminal color and OSC sequences.
pub fn strip_ansi(line: &str) -> String {
    ANSI_REGEX.replace_all(line, "").into_owned()
}

/// The port a dev server reports it bound to, if `line` says so.
pub fn detect_port(line: &str) -> Option<u16> {
    let line = strip_ansi(line);
    PORT_PATTERNS.iter().find_map(|re| {
        re.captures(&line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .filter(|port| *port > 0)
    })
}

/// Every http(s) URL in `line`, without trailing punctuation.
pub fn detect_urls(line: &str) -> Vec<String> {
    let line = strip_ansi(line);
    URL_REGEX
        .find_iter(&line)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']).to_string())
        .collect()
}

/// Whether `line` looks like a compiler or runtime failure.
pub fn is_error_line(line: &str) -> bool {
    let line = strip_ansi(line);
    if BENIGN_REGEX.is_match(&line) {
        return false;
    }
    ERROR_PATTERNS.iter().any(|re| re.is_match(&line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vite_banner() {
        assert_eq!(detect_port("  ➜  Local:   http://localhost:5173/"), Some(5173));
        assert_eq!(detect_port("Local: http://localhost:4321"), Some(4321));
        assert_eq!(detect_port("  ➜  Network: use --host to expose"), None);
    }

    #[test]
    fn test_colored_banner() {
        let line = "\x1b[32m➜\x1b[39m  \x1b[1mLocal\x1b[22m:   \x1b[36mhttp://localhost:\x1b[1m5174\x1b[22m/\x1b[39m";
        assert_eq!(strip_ansi(line), "➜  Local:   http://localhost:5174/");
        assert_eq!(detect_port(line), Some(5174));
    }

    #[test]
    fn test_other_frameworks() {
        assert_eq!(
            detect_port("ready - started server on 0.0.0.0:3000, url: http://localhost:3000"),
            Some(3000)
        );
        assert_eq!(
            detect_port("** Angular Live Development Server is listening on localhost:4200, open your browser"),
            Some(4200)
        );
        assert_eq!(detect_port("Server listening on port 8080"), Some(8080));
        assert_eq!(detect_port("compiled successfully"), None);
    }

    #[test]
    fn test_detect_urls() {
        let urls = detect_urls("Local: http://localhost:4321/, Network: http://192.168.1.4:4321/.");
        assert_eq!(urls, vec!["http://localhost:4321/", "http://192.168.1.4:4321/"]);
    }

    #[test]
    fn test_error_lines() {
        assert!(is_error_line("src/App.tsx(3,1): error TS2304: Cannot find name 'foo'."));
        assert!(is_error_line("[vite] Internal server error: Failed to resolve import"));
        assert!(is_error_line("Module not found: Can't resolve './x'"));
        assert!(is_error_line("npm ERR! missing script: dev"));
        assert!(is_error_line("Error: listen EADDRINUSE: address already in use :::3000"));
        assert!(!is_error_line("Found 0 errors. Watching for file changes."));
        assert!(!is_error_line("ready in 312 ms"));
    }
}
