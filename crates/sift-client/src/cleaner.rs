use sift_core::error::AppError;
use sift_core::traits::TextCleaner;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

const CLOSING_PUNCTUATION: &[char] = &[',', '.', ';', ':', '!', '?', ')', '}', ']'];

/// Plain-text cleaner for OCR and PDF-extracted text.
///
/// Normalizes line endings, trims every line, collapses inner whitespace,
/// removes spaces before closing punctuation and drops empty lines.
#[derive(Debug, Clone)]
pub struct PlainTextCleaner {
    flat: bool,
    strip_accents: bool,
    lowercase: bool,
}

impl PlainTextCleaner {
    pub fn new() -> Self {
        Self {
            flat: true,
            strip_accents: true,
            lowercase: false,
        }
    }

    /// Join all lines with single spaces.
    pub fn with_flat(mut self, flat: bool) -> Self {
        self.flat = flat;
        self
    }

    /// Decompose to NFD and drop combining marks (`ã` → `a`).
    pub fn with_strip_accents(mut self, strip: bool) -> Self {
        self.strip_accents = strip;
        self
    }

    pub fn with_lowercase(mut self, lowercase: bool) -> Self {
        self.lowercase = lowercase;
        self
    }

    fn clean_line(line: &str) -> String {
        let mut out = String::with_capacity(line.len());
        for word in line.split_whitespace() {
            if !out.is_empty() && !word.starts_with(CLOSING_PUNCTUATION) {
                out.push(' ');
            }
            out.push_str(word);
        }
        out
    }
}

impl Default for PlainTextCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl TextCleaner for PlainTextCleaner {
    fn clean(&self, text: &str) -> Result<String, AppError> {
        let text = text.replace("\r\n", "\n").replace('\r', "\n");
        let lines: Vec<String> = text
            .lines()
            .map(Self::clean_line)
            .filter(|l| !l.is_empty())
            .collect();

        let mut out = lines.join(if self.flat { " " } else { "\n" });
        if self.strip_accents {
            out = out.nfd().filter(|c| !is_combining_mark(*c)).collect();
        }
        if self.lowercase {
            out = out.to_lowercase();
        }
        Ok(out)
    }
}
