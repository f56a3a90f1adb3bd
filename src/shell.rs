//! Shell quoting for commands sent into sprites.

/// Single-quote a string for POSIX sh, escaping embedded quotes as `'\''`.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::sh_quote;

    #[test]
    fn quotes_plain_strings() {
        assert_eq!(sh_quote("hello"), "'hello'");
    }

    #[test]
    fn escapes_embedded_single_quotes() {
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }
}
