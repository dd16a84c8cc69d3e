use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEndingStyle {
    Lf,
    CrLf,
    Cr,
    /// No line break in the content at all.
    Unknown,
}

impl LineEndingStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEndingStyle::Lf | LineEndingStyle::Unknown => "\n",
            LineEndingStyle::CrLf => "\r\n",
            LineEndingStyle::Cr => "\r",
        }
    }
}

/// Picks the predominant line ending; ties favour CRLF, then LF.
pub fn detect_line_ending(content: &str) -> LineEndingStyle {
    let bytes = content.as_bytes();
    let (mut lf, mut crlf, mut cr) = (0usize, 0usize, 0usize);
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' if bytes.get(i + 1) == Some(&b'\n') => {
                crlf += 1;
                i += 2;
                continue;
            }
            b'\r' => cr += 1,
            b'\n' => lf += 1,
            _ => {}
        }
        i += 1;
    }
    debug!(lf, crlf, cr, "Detected line ending counts");

    if crlf == 0 && lf == 0 && cr == 0 {
        LineEndingStyle::Unknown
    } else if crlf >= lf && crlf >= cr {
        LineEndingStyle::CrLf
    } else if lf >= cr {
        LineEndingStyle::Lf
    } else {
        LineEndingStyle::Cr
    }
}

/// Collapses every line break to `\n`.
pub fn to_lf(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

pub fn normalize_line_endings(text: &str, target_style: LineEndingStyle) -> String {
    let lf = to_lf(text);
    match target_style {
        LineEndingStyle::Lf | LineEndingStyle::Unknown => lf,
        LineEndingStyle::CrLf => lf.replace('\n', "\r\n"),
        LineEndingStyle::Cr => lf.replace('\n', "\r"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_styles() {
        assert_eq!(detect_line_ending("a\r\nb\r\n"), LineEndingStyle::CrLf);
        assert_eq!(detect_line_ending("a\nb\n"), LineEndingStyle::Lf);
        assert_eq!(detect_line_ending("a\rb"), LineEndingStyle::Cr);
        assert_eq!(detect_line_ending("single line"), LineEndingStyle::Unknown);
        assert_eq!(detect_line_ending("a\r\nb\nc\r\n"), LineEndingStyle::CrLf);
    }

    #[test]
    fn normalizes_to_target() {
        assert_eq!(normalize_line_endings("a\nb\r\nc", LineEndingStyle::CrLf), "a\r\nb\r\nc");
        assert_eq!(normalize_line_endings("a\r\nb\rc", LineEndingStyle::Lf), "a\nb\nc");
    }
}
