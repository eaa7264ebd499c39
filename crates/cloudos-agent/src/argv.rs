//! Shell-style word splitting for operator-supplied command strings.
//!
//! This only ever produces an argument vector. Nothing here (or anywhere in the agent)
//! hands a string to `sh -c`; metacharacters such as `;`, `|`, `$(..)` and `>` are plain
//! token characters.
//!
//! Grammar:
//! - unquoted whitespace separates tokens
//! - `'...'` is literal, no escapes
//! - `"..."` honours `\"`, `\\`, `\$`, `` \` `` and backslash-newline; other backslashes
//!   are kept as-is
//! - an unquoted backslash escapes the next character (backslash-newline is dropped)
//! - adjacent segments concatenate: `a"b c"d` is one token `ab cd`
//! - `""` and `''` yield an empty token

use crate::error::ParseError;

pub fn split(input: &str) -> Result<Vec<String>, ParseError> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_token = false;
    let mut chars = input.char_indices();

    while let Some((offset, c)) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some((_, '\'')) => break,
                        Some((_, ch)) => cur.push(ch),
                        None => return Err(ParseError::UnterminatedQuote { quote: '\'', offset }),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, e @ ('"' | '\\' | '$' | '`'))) => cur.push(e),
                            Some((_, '\n')) => {}
                            Some((_, other)) => {
                                cur.push('\\');
                                cur.push(other);
                            }
                            None => {
                                return Err(ParseError::UnterminatedQuote { quote: '"', offset });
                            }
                        },
                        Some((_, ch)) => cur.push(ch),
                        None => return Err(ParseError::UnterminatedQuote { quote: '"', offset }),
                    }
                }
            }
            '\\' => match chars.next() {
                Some((_, '\n')) => {}
                Some((_, ch)) => {
                    in_token = true;
                    cur.push(ch);
                }
                None => return Err(ParseError::TrailingEscape { offset }),
            },
            c if c.is_whitespace() => {
                if in_token {
                    out.push(std::mem::take(&mut cur));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                cur.push(c);
            }
        }
    }

    if in_token {
        out.push(cur);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn splits_bare_words() {
        assert_eq!(split("echo hi there").unwrap(), v(&["echo", "hi", "there"]));
        assert_eq!(split("  tail\t-n  50 \n").unwrap(), v(&["tail", "-n", "50"]));
        assert!(split("").unwrap().is_empty());
        assert!(split("   ").unwrap().is_empty());
    }

    #[test]
    fn double_quotes_group_words() {
        assert_eq!(split(r#"echo "hi there""#).unwrap(), v(&["echo", "hi there"]));
        assert_eq!(
            split(r#"grep "a \"quoted\" word" \\x"#).unwrap(),
            v(&["grep", r#"a "quoted" word"#, r"\x"])
        );
        // Unknown escapes inside double quotes keep the backslash.
        assert_eq!(split(r#""C:\temp""#).unwrap(), v(&[r"C:\temp"]));
    }

    #[test]
    fn single_quotes_are_literal() {
        assert_eq!(split(r"echo 'a \n $HOME'").unwrap(), v(&["echo", r"a \n $HOME"]));
    }

    #[test]
    fn adjacent_segments_concatenate() {
        assert_eq!(split(r#"a"b c"d'e f'"#).unwrap(), v(&["ab cde f"]));
        assert_eq!(split(r"hello\ world").unwrap(), v(&["hello world"]));
    }

    #[test]
    fn empty_quotes_are_tokens() {
        assert_eq!(split(r#"printf '' """#).unwrap(), v(&["printf", "", ""]));
    }

    #[test]
    fn metacharacters_are_literal() {
        assert_eq!(
            split("echo hi; rm -rf / | cat $(id) > out").unwrap(),
            v(&["echo", "hi;", "rm", "-rf", "/", "|", "cat", "$(id)", ">", "out"])
        );
    }

    #[test]
    fn line_continuation_is_dropped() {
        assert_eq!(split("ls \\\n-la").unwrap(), v(&["ls", "-la"]));
    }

    #[test]
    fn unbalanced_quotes_fail() {
        assert_eq!(
            split(r#"echo "hi there"#).unwrap_err(),
            ParseError::UnterminatedQuote { quote: '"', offset: 5 }
        );
        assert_eq!(
            split("echo 'oops").unwrap_err(),
            ParseError::UnterminatedQuote { quote: '\'', offset: 5 }
        );
        assert_eq!(
            split("echo \\").unwrap_err(),
            ParseError::TrailingEscape { offset: 5 }
        );
    }
}
