//! Lexical classifier for echoed command input. Produces the token grid
//! carried by `formatted` events; rendering is the consumer's problem.

use crate::protocol::{Token, TokenKind, TokenLine};

const KEYWORDS: &[&str] = &[
    "async", "await", "break", "case", "catch", "class", "const", "continue", "debugger",
    "default", "delete", "do", "else", "export", "extends", "false", "finally", "for", "function",
    "get", "if", "import", "in", "instanceof", "let", "new", "null", "of", "return", "set",
    "static", "super", "switch", "this", "throw", "true", "try", "typeof", "undefined", "var",
    "void", "while", "with", "yield",
];

/// Splits `source` into one `TokenLine` per source line. Joining every span of
/// every line with `\n` between lines reproduces `source` exactly.
pub fn tokenize(source: &str) -> Vec<TokenLine> {
    let mut scanner = Scanner { carry: None };
    source.split('\n').map(|line| scanner.scan_line(line)).collect()
}

/// Token state that survives a line break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Carry {
    BlockComment,
    Template,
}

struct Scanner {
    carry: Option<Carry>,
}

impl Scanner {
    fn scan_line(&mut self, line: &str) -> TokenLine {
        let mut tokens = Vec::new();
        let mut pos = 0;

        match self.carry {
            Some(Carry::BlockComment) => match line.find("*/") {
                Some(end) => {
                    push(&mut tokens, &line[..end + 2], TokenKind::Comment);
                    self.carry = None;
                    pos = end + 2;
                }
                None => {
                    push(&mut tokens, line, TokenKind::Comment);
                    return tokens;
                }
            },
            Some(Carry::Template) => match template_end(line) {
                Some(end) => {
                    push(&mut tokens, &line[..end], TokenKind::String);
                    self.carry = None;
                    pos = end;
                }
                None => {
                    push(&mut tokens, line, TokenKind::String);
                    return tokens;
                }
            },
            None => {}
        }

        while pos < line.len() {
            let rest = &line[pos..];
            let ch = match rest.chars().next() {
                Some(ch) => ch,
                None => break,
            };

            let (len, kind) = if ch == ' ' || ch == '\t' || ch == '\r' {
                (span_while(rest, |c| c == ' ' || c == '\t' || c == '\r'), TokenKind::Plain)
            } else if rest.starts_with("//") {
                (rest.len(), TokenKind::Comment)
            } else if rest.starts_with("/*") {
                match rest[2..].find("*/") {
                    Some(end) => (end + 4, TokenKind::Comment),
                    None => {
                        self.carry = Some(Carry::BlockComment);
                        (rest.len(), TokenKind::Comment)
                    }
                }
            } else if ch == '\'' || ch == '"' {
                (quoted_end(rest, ch), TokenKind::String)
            } else if ch == '`' {
                match template_end(&rest[1..]) {
                    Some(end) => (end + 1, TokenKind::String),
                    None => {
                        self.carry = Some(Carry::Template);
                        (rest.len(), TokenKind::String)
                    }
                }
            } else if ch.is_ascii_digit() || (ch == '.' && next_is_digit(rest)) {
                (
                    span_while(rest, |c| c.is_ascii_alphanumeric() || c == '_' || c == '.'),
                    TokenKind::Number,
                )
            } else if is_ident_start(ch) {
                let len = span_while(rest, is_ident_continue);
                let kind = if KEYWORDS.contains(&&rest[..len]) {
                    TokenKind::Keyword
                } else {
                    TokenKind::Identifier
                };
                (len, kind)
            } else if "()[]{};,".contains(ch) {
                (ch.len_utf8(), TokenKind::Operator)
            } else if is_operator_char(ch) {
                (operator_end(rest), TokenKind::Operator)
            } else {
                (ch.len_utf8(), TokenKind::Plain)
            };

            push(&mut tokens, &rest[..len], kind);
            pos += len;
        }

        tokens
    }
}

fn push(tokens: &mut TokenLine, text: &str, kind: TokenKind) {
    if !text.is_empty() {
        tokens.push(Token::new(text, kind));
    }
}

fn span_while(rest: &str, mut pred: impl FnMut(char) -> bool) -> usize {
    for (idx, ch) in rest.char_indices() {
        if !pred(ch) {
            return idx;
        }
    }
    rest.len()
}

fn next_is_digit(rest: &str) -> bool {
    rest.chars().nth(1).is_some_and(|c| c.is_ascii_digit())
}

fn is_ident_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_' || ch == '$'
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '$'
}

fn is_operator_char(ch: char) -> bool {
    "+-*/%=<>!&|^~?:.".contains(ch)
}

/// Length of an operator run. Stops before a comment opener so `=//x` splits
/// into `=` plus a comment.
fn operator_end(rest: &str) -> usize {
    for (idx, ch) in rest.char_indices() {
        if idx > 0 && (rest[idx..].starts_with("//") || rest[idx..].starts_with("/*")) {
            return idx;
        }
        if !is_operator_char(ch) {
            return idx;
        }
    }
    rest.len()
}

/// Byte length of a quoted string token starting at the opening quote,
/// including both quotes. An unterminated string runs to end of line.
fn quoted_end(rest: &str, quote: char) -> usize {
    let mut escaped = false;
    for (idx, ch) in rest.char_indices().skip(1) {
        if escaped {
            escaped = false;
            continue;
        }
        if ch == '\\' {
            escaped = true;
            continue;
        }
        if ch == quote {
            return idx + ch.len_utf8();
        }
    }
    rest.len()
}

/// Byte offset just past the closing backtick, or None when the template
/// continues on the next line.
fn template_end(segment: &str) -> Option<usize> {
    let mut escaped = false;
    for (idx, ch) in segment.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if ch == '\\' {
            escaped = true;
            continue;
        }
        if ch == '`' {
            return Some(idx + 1);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(line: &TokenLine) -> Vec<TokenKind> {
        line.iter().map(|token| token.kind).collect()
    }

    fn texts(line: &TokenLine) -> Vec<&str> {
        line.iter().map(|token| token.text.as_str()).collect()
    }

    #[test]
    fn classifies_simple_expression() {
        let grid = tokenize("1 + foo");
        assert_eq!(grid.len(), 1);
        assert_eq!(texts(&grid[0]), vec!["1", " ", "+", " ", "foo"]);
        assert_eq!(
            kinds(&grid[0]),
            vec![
                TokenKind::Number,
                TokenKind::Plain,
                TokenKind::Operator,
                TokenKind::Plain,
                TokenKind::Identifier,
            ]
        );
    }

    #[test]
    fn keywords_and_literals_classify_as_keyword() {
        let grid = tokenize("const ok = true");
        let line = &grid[0];
        assert_eq!(line[0].kind, TokenKind::Keyword);
        assert_eq!(line[0].text, "const");
        assert_eq!(line.last().map(|t| t.kind), Some(TokenKind::Keyword));
    }

    #[test]
    fn line_comment_runs_to_end_of_line() {
        let grid = tokenize("a // trailing + 1");
        let line = &grid[0];
        assert_eq!(line.last().map(|t| t.text.as_str()), Some("// trailing + 1"));
        assert_eq!(line.last().map(|t| t.kind), Some(TokenKind::Comment));
    }

    #[test]
    fn operator_run_stops_before_comment_opener() {
        let grid = tokenize("a =// c");
        assert_eq!(texts(&grid[0]), vec!["a", " ", "=", "// c"]);
    }

    #[test]
    fn division_is_an_operator_not_a_comment() {
        let grid = tokenize("a / b");
        assert_eq!(kinds(&grid[0])[2], TokenKind::Operator);
    }

    #[test]
    fn block_comment_spans_lines() {
        let grid = tokenize("a /* x\n y */ b");
        assert_eq!(grid.len(), 2);
        assert_eq!(grid[0].last().map(|t| t.text.as_str()), Some("/* x"));
        assert_eq!(grid[0].last().map(|t| t.kind), Some(TokenKind::Comment));
        assert_eq!(grid[1][0].text, " y */");
        assert_eq!(grid[1][0].kind, TokenKind::Comment);
        assert_eq!(grid[1].last().map(|t| t.text.as_str()), Some("b"));
    }

    #[test]
    fn string_escapes_do_not_terminate_early() {
        let grid = tokenize(r#""a\"b" + 'c'"#);
        let line = &grid[0];
        assert_eq!(line[0].text, r#""a\"b""#);
        assert_eq!(line[0].kind, TokenKind::String);
        assert_eq!(line.last().map(|t| t.text.as_str()), Some("'c'"));
    }

    #[test]
    fn unterminated_string_stops_at_line_end() {
        let grid = tokenize("x = \"oops\ny");
        assert_eq!(grid[0].last().map(|t| t.text.as_str()), Some("\"oops"));
        assert_eq!(grid[0].last().map(|t| t.kind), Some(TokenKind::String));
        assert_eq!(grid[1][0].kind, TokenKind::Identifier);
    }

    #[test]
    fn template_string_spans_lines() {
        let grid = tokenize("`one\ntwo` + 3");
        assert_eq!(grid[0][0].kind, TokenKind::String);
        assert_eq!(grid[1][0].text, "two`");
        assert_eq!(grid[1][0].kind, TokenKind::String);
        assert_eq!(grid[1].last().map(|t| t.kind), Some(TokenKind::Number));
    }

    #[test]
    fn number_forms() {
        let grid = tokenize("0xff + 1.5e3 + .25");
        let numbers: Vec<&str> = grid[0]
            .iter()
            .filter(|t| t.kind == TokenKind::Number)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(numbers, vec!["0xff", "1.5e3", ".25"]);
    }

    #[test]
    fn grid_reassembles_to_the_exact_source() {
        let source = "const n = {a: 1};\nfunction f() { /* no\nop */ return `x${n}` }\nf() // done";
        let grid = tokenize(source);
        let rebuilt: Vec<String> = grid
            .iter()
            .map(|line| line.iter().map(|t| t.text.as_str()).collect::<String>())
            .collect();
        assert_eq!(rebuilt.join("\n"), source);
    }
}
