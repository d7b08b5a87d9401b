/// Sensitive-word scanning seam. The production scanner is an external
/// collaborator; the relay only needs a verdict plus the matched words for
/// the warning log.
pub trait SensitiveScanner: Send + Sync {
    /// `Ok(())` when the text is clean, `Err(words)` with the detected
    /// words otherwise.
    fn scan(&self, text: &str) -> Result<(), Vec<String>>;
}

#[derive(Debug, Default)]
pub struct NoopScanner;

impl SensitiveScanner for NoopScanner {
    fn scan(&self, _text: &str) -> Result<(), Vec<String>> {
        Ok(())
    }
}

/// Case-insensitive substring match against a configured word list.
#[derive(Debug, Default)]
pub struct WordListScanner {
    words: Vec<String>,
}

impl WordListScanner {
    pub fn new(words: Vec<String>) -> Self {
        Self {
            words: words.into_iter().map(|word| word.to_lowercase()).collect(),
        }
    }
}

impl SensitiveScanner for WordListScanner {
    fn scan(&self, text: &str) -> Result<(), Vec<String>> {
        let haystack = text.to_lowercase();
        let matched: Vec<String> = self
            .words
            .iter()
            .filter(|word| !word.is_empty() && haystack.contains(word.as_str()))
            .cloned()
            .collect();
        if matched.is_empty() {
            Ok(())
        } else {
            Err(matched)
        }
    }
}
