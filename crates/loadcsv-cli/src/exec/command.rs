//! Structured command descriptors
//!
//! A [`CommandSpec`] is a program, its argument vector, and an optional standard-input
//! redirection. Nothing in the loader builds shell strings by concatenation; the only
//! place text is quoted for a shell is [`quote`] / [`CommandSpec::to_shell`].

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

/// A command to run on some execution target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    stdin_from: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin_from: None,
        }
    }

    /// Build a spec for an executable given by path.
    pub fn from_path(program: &Path) -> Self {
        Self::new(program.to_string_lossy().into_owned())
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append `flag value` only when `value` is present.
    pub fn opt_arg(self, flag: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.arg(flag).arg(value.to_string()),
            None => self,
        }
    }

    /// Read standard input from `path` on the coordinator node.
    pub fn stdin_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_from = Some(path.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn stdin_path(&self) -> Option<&Path> {
        self.stdin_from.as_deref()
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Render as one POSIX shell command line, redirection included.
    pub fn to_shell(&self) -> String {
        let mut line = join_quoted(&self.argv());
        if let Some(path) = &self.stdin_from {
            line.push_str(" < ");
            line.push_str(&quote(&path.to_string_lossy()));
        }
        line
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | ',' | '+' | '=' | '@' | '%')
}

/// Quote one word for a POSIX shell.
///
/// Words made only of safe characters are returned unchanged; anything else is wrapped
/// in single quotes with embedded `'` written as `'\''`.
pub fn quote(word: &str) -> Cow<'_, str> {
    if !word.is_empty() && word.chars().all(is_shell_safe) {
        return Cow::Borrowed(word);
    }
    let mut quoted = String::with_capacity(word.len() + 2);
    quoted.push('\'');
    for c in word.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    Cow::Owned(quoted)
}

/// Quote every word and join with single spaces.
pub fn join_quoted<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|w| quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Minimal POSIX word splitter covering what `quote` produces.
    fn shell_split(line: &str) -> Vec<String> {
        let mut words = Vec::new();
        let mut current = String::new();
        let mut in_word = false;
        let mut chars = line.chars();
        while let Some(c) = chars.next() {
            match c {
                '\'' => {
                    in_word = true;
                    for q in chars.by_ref() {
                        if q == '\'' {
                            break;
                        }
                        current.push(q);
                    }
                },
                '\\' => {
                    in_word = true;
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                },
                ' ' => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                },
                _ => {
                    in_word = true;
                    current.push(c);
                },
            }
        }
        if in_word {
            words.push(current);
        }
        words
    }

    #[test]
    fn test_safe_words_unquoted() {
        assert_eq!(quote("/opt/scidb/bin/iquery"), "/opt/scidb/bin/iquery");
        assert_eq!(quote("-c"), "-c");
        assert_eq!(quote("500000"), "500000");
    }

    #[test]
    fn test_unsafe_words_quoted() {
        assert_eq!(quote(""), "''");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("\\t"), "'\\t'");
        assert_eq!(quote("it's"), "'it'\\''s'");
        assert_eq!(quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_to_shell_with_redirection() {
        let spec = CommandSpec::new("/opt/bin/tsv2scidb")
            .args(["-p", "NS", "-d", "\\t"])
            .stdin_from("/tmp/run dir/in.csv_0000");
        assert_eq!(
            spec.to_shell(),
            "/opt/bin/tsv2scidb -p NS -d '\\t' < '/tmp/run dir/in.csv_0000'"
        );
    }

    #[test]
    fn test_opt_arg() {
        let spec = CommandSpec::new("osplitcsv")
            .opt_arg("-d", Some(","))
            .opt_arg("-t", None::<String>);
        assert_eq!(spec.argv(), vec!["osplitcsv", "-d", ","]);
    }

    proptest! {
        #[test]
        fn prop_quoting_round_trips(words in proptest::collection::vec(".*", 1..6)) {
            let line = join_quoted(&words);
            prop_assert_eq!(shell_split(&line), words);
        }
    }
}
