use super::*;

/// Carriage returns and backspaces terminals emit to redraw the start of a line.
pub static IGNORE_START_LINE: Lazy<Regex> =
    Lazy::new(|| compile(r"^(\r+(\s+\r+)*)|(\u{8}+(\s+\u{8}+)*)"));

/// One unit of text delivered to a classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    /// False for the unterminated tail of the buffer (typically a prompt).
    pub is_full_line: bool,
    /// True when a full line carries exactly the text previously delivered as a partial.
    pub seen_as_partial: bool,
}

/// Splits a stream of decoded chunks into lines.
///
/// Chunk boundaries are arbitrary: a line may arrive in pieces or several
/// lines may arrive at once. Complete lines are yielded in order; the
/// remaining tail is yielded as a partial fragment whenever it changes.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: String,
    last_partial: Option<String>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &str) -> Vec<Fragment> {
        self.buffer.push_str(data);
        let mut fragments = Vec::new();

        while let Some(newline_pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline_pos).collect();
            let text = clean(&line);
            let seen_as_partial = self.last_partial.take().is_some_and(|p| p == text);
            fragments.push(Fragment {
                text,
                is_full_line: true,
                seen_as_partial,
            });
        }

        if !self.buffer.is_empty() {
            let text = clean(&self.buffer);
            if !text.is_empty() && self.last_partial.as_deref() != Some(text.as_str()) {
                self.last_partial = Some(text.clone());
                fragments.push(Fragment {
                    text,
                    is_full_line: false,
                    seen_as_partial: false,
                });
            }
        }
        fragments
    }

    /// Unterminated text currently buffered.
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

fn clean(line: &str) -> String {
    IGNORE_START_LINE.replace(line, "").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(fragments: &[Fragment]) -> Vec<(&str, bool)> {
        fragments
            .iter()
            .map(|f| (f.text.as_str(), f.is_full_line))
            .collect()
    }

    #[test]
    fn joins_lines_split_across_chunks() {
        let mut splitter = LineSplitter::new();
        assert_eq!(texts(&splitter.feed("Connec")), vec![("Connec", false)]);
        assert_eq!(
            texts(&splitter.feed("ted to host.\nsftp>")),
            vec![("Connected to host.", true), ("sftp>", false)]
        );
        assert_eq!(splitter.pending(), "sftp>");
    }

    #[test]
    fn strips_carriage_returns_and_redraw_prefix() {
        let mut splitter = LineSplitter::new();
        let fragments = splitter.feed("\r\r  \rline one\r\nline two\r\n");
        assert_eq!(
            texts(&fragments),
            vec![("line one", true), ("line two", true)]
        );
    }

    #[test]
    fn unchanged_partial_is_not_redelivered() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.feed("password: ").len(), 1);
        assert!(splitter.feed("").is_empty());

        let completed = splitter.feed("\n");
        assert_eq!(completed.len(), 1);
        assert!(completed[0].is_full_line);
        assert!(completed[0].seen_as_partial);
        assert_eq!(completed[0].text, "password:");
    }

    #[test]
    fn extended_partial_is_not_marked_seen() {
        let mut splitter = LineSplitter::new();
        splitter.feed("sftp>");
        let completed = splitter.feed(" pwd\n");
        assert_eq!(texts(&completed), vec![("sftp> pwd", true)]);
        assert!(!completed[0].seen_as_partial);
    }

    #[test]
    fn empty_lines_are_kept_as_full_lines() {
        let mut splitter = LineSplitter::new();
        assert_eq!(texts(&splitter.feed("\n\n")), vec![("", true), ("", true)]);
    }
}
