//! Operator terminal input.
//!
//! Lines typed at the terminal go to the helper unchanged. The only interpretation is
//! whether a response is expected (first word `q`) and a few local words.

/// What to do with one line typed by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalInput<'a> {
    /// Blank line
    Empty,
    /// Screen clearing request, not forwarded
    Clear,
    /// Leave the terminal
    Quit,
    /// Query: send and print the answer
    Query(&'a str),
    /// Anything else: send without waiting
    Command(&'a str),
}

impl<'a> TerminalInput<'a> {
    /// Classify one operator line. Surrounding whitespace is ignored.
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return TerminalInput::Empty;
        }

        match line.to_ascii_lowercase().as_str() {
            "clear" | "cls" | "clr" => return TerminalInput::Clear,
            "quit" => return TerminalInput::Quit,
            _ => {}
        }

        let first_word = line.split_whitespace().next().unwrap_or_default();
        if first_word.eq_ignore_ascii_case("q") {
            TerminalInput::Query(line)
        } else {
            TerminalInput::Command(line)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queries_are_detected_by_first_word() {
        assert_eq!(
            TerminalInput::parse("q *IDN?"),
            TerminalInput::Query("q *IDN?")
        );
        assert_eq!(
            TerminalInput::parse("  Q :acquire:points?\n"),
            TerminalInput::Query("Q :acquire:points?")
        );
        // A command that merely starts with the letter q is not a query
        assert_eq!(TerminalInput::parse("quiet"), TerminalInput::Command("quiet"));
    }

    #[test]
    fn test_local_words() {
        assert_eq!(TerminalInput::parse(""), TerminalInput::Empty);
        assert_eq!(TerminalInput::parse("   "), TerminalInput::Empty);
        assert_eq!(TerminalInput::parse("cls"), TerminalInput::Clear);
        assert_eq!(TerminalInput::parse("CLEAR"), TerminalInput::Clear);
        assert_eq!(TerminalInput::parse("clr"), TerminalInput::Clear);
        assert_eq!(TerminalInput::parse("quit"), TerminalInput::Quit);
    }

    #[test]
    fn test_everything_else_is_forwarded() {
        assert_eq!(TerminalInput::parse("CMD"), TerminalInput::Command("CMD"));
        assert_eq!(
            TerminalInput::parse("s :acquire:count 16"),
            TerminalInput::Command("s :acquire:count 16")
        );
        assert_eq!(TerminalInput::parse("exit"), TerminalInput::Command("exit"));
    }
}
