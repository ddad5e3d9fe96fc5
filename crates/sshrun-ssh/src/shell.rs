//! POSIX shell quoting for remote command lines

/// Quote `word` so that a POSIX shell reads it back as exactly one token.
///
/// Words made only of `[A-Za-z0-9,._+=/-]` are left bare. Anything else is
/// single-quoted, with `'` and `!` escaped outside the quotes. The empty word
/// becomes `''`.
pub fn shell_quote(word: &str) -> String {
    shell_escape::unix::escape(word.into()).into_owned()
}
