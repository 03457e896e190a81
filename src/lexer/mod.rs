use logos::Logos;

use crate::ast::Span;

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
pub enum Token {
    // Type names
    #[token("int")]
    Int,
    #[token("float")]
    Float,
    #[token("double")]
    Double,
    #[token("char")]
    Char,
    #[token("bool")]
    Bool,
    #[token("void")]
    Void,

    // Keywords
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("return")]
    Return,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("true")]
    True,
    #[token("false")]
    False,

    // Punctuation
    #[token("(")]
    OpenParen,
    #[token(")")]
    CloseParen,
    #[token("{")]
    OpenBrace,
    #[token("}")]
    CloseBrace,
    #[token("[")]
    OpenBracket,
    #[token("]")]
    CloseBracket,
    #[token(";")]
    Semicolon,
    #[token(",")]
    Comma,

    // Operators; logos takes the longest match, so `<<=` wins over `<<`.
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("=")]
    Equal,
    #[token("==")]
    EqualEqual,
    #[token("!=")]
    BangEqual,
    #[token("<")]
    Less,
    #[token("<=")]
    LessEqual,
    #[token(">")]
    Great,
    #[token(">=")]
    GreatEqual,
    #[token("!")]
    Bang,
    #[token("~")]
    Tilde,
    #[token("&")]
    BitAnd,
    #[token("|")]
    BitOr,
    #[token("^")]
    BitXor,
    #[token("<<")]
    ShiftLeft,
    #[token(">>")]
    ShiftRight,
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("+=")]
    PlusEqual,
    #[token("-=")]
    MinusEqual,
    #[token("*=")]
    StarEqual,
    #[token("/=")]
    SlashEqual,
    #[token("%=")]
    PercentEqual,
    #[token("&=")]
    BitAndEqual,
    #[token("|=")]
    BitOrEqual,
    #[token("^=")]
    BitXorEqual,
    #[token("<<=")]
    ShiftLeftEqual,
    #[token(">>=")]
    ShiftRightEqual,

    // Literals. A decimal with an `f` suffix is a float, without one a
    // double; a bare integer is an int.
    #[regex(r"[0-9]+\.[0-9]+f", |lex| {
        let s = lex.slice();
        s[..s.len() - 1].parse::<f32>().ok()
    })]
    FloatLit(f32),

    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    DoubleLit(f64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    IntLit(i64),

    #[regex(r"'(\\.|[^'\\])'", |lex| unescape_char(lex.slice()))]
    CharLit(char),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

fn unescape_char(slice: &str) -> Option<char> {
    let inner = &slice[1..slice.len() - 1];
    let mut chars = inner.chars();
    let first = chars.next()?;
    if first != '\\' {
        return Some(first);
    }
    match chars.next()? {
        'n' => Some('\n'),
        't' => Some('\t'),
        'r' => Some('\r'),
        '0' => Some('\0'),
        '\\' => Some('\\'),
        '\'' => Some('\''),
        other => Some(other),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("[line {line}] unexpected character(s) '{snippet}'")]
pub struct LexError {
    pub line: usize,
    pub position: usize,
    pub snippet: String,
}

/// Lex source into spanned tokens. Stops at the first unrecognized
/// character and reports it with its line.
pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let range = lexer.span();
        match result {
            Ok(token) => tokens.push((token, Span { start: range.start, end: range.end })),
            Err(()) => {
                let line = source[..range.start].matches('\n').count() + 1;
                return Err(LexError {
                    line,
                    position: range.start,
                    snippet: source[range.clone()].to_string(),
                });
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        lex(source).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn lex_declaration() {
        let tokens = kinds("int x = 5;");
        assert_eq!(
            tokens,
            vec![
                Token::Int,
                Token::Ident("x".into()),
                Token::Equal,
                Token::IntLit(5),
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn lex_numeric_literal_suffixes() {
        assert_eq!(kinds("1.5f"), vec![Token::FloatLit(1.5)]);
        assert_eq!(kinds("1.5"), vec![Token::DoubleLit(1.5)]);
        assert_eq!(kinds("15"), vec![Token::IntLit(15)]);
    }

    #[test]
    fn lex_longest_operator_wins() {
        assert_eq!(kinds("<<="), vec![Token::ShiftLeftEqual]);
        assert_eq!(kinds("<<"), vec![Token::ShiftLeft]);
        assert_eq!(kinds("< <"), vec![Token::Less, Token::Less]);
        assert_eq!(kinds("++ +"), vec![Token::PlusPlus, Token::Plus]);
    }

    #[test]
    fn lex_char_escapes() {
        assert_eq!(kinds(r"'a'"), vec![Token::CharLit('a')]);
        assert_eq!(kinds(r"'\n'"), vec![Token::CharLit('\n')]);
        assert_eq!(kinds(r"'\''"), vec![Token::CharLit('\'')]);
    }

    #[test]
    fn lex_comments_skipped() {
        let tokens = kinds("// line\nint /* block */ x;");
        assert_eq!(
            tokens,
            vec![Token::Int, Token::Ident("x".into()), Token::Semicolon]
        );
    }

    #[test]
    fn lex_error_carries_line() {
        let err = lex("int x;\n@").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.snippet, "@");
    }
}
