//! Indentation-aware tokenizer.
//!
//! The scanner walks UTF-8 source and hands the compiler a flat token
//! stream. It is line-structured: the leading whitespace of every
//! non-blank logical line becomes an `Indentation` token carrying its
//! width, each line ends with `Eol`, and the input ends with a synthetic
//! `Eol` followed by `Eof`. Inside brackets newlines are plain whitespace,
//! so expressions can span lines without continuation characters.
//!
//! One token of pushback is supported, and the full scanner position can be
//! saved and restored; the compiler rewinds to re-parse comprehension head
//! expressions and assignment target lists.

use strum::IntoStaticStr;

/// Token classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub(crate) enum TokenType {
    // Structure
    /// Leading whitespace of a logical line; `width` carries its size.
    Indentation,
    /// End of a logical line.
    Eol,
    /// End of input.
    Eof,
    /// Internal: the scanner consumed something invisible (blank line,
    /// comment-only line) and the caller should fetch again.
    Retry,
    /// A scan error; `note` explains it.
    Error,

    // Literals
    Identifier,
    Int,
    Float,
    /// A plain string literal; `text` is the raw body between the quotes.
    Str,
    /// An f-string literal; `text` is the raw body between the quotes.
    FString,
    /// A bytes literal (`b"..."`).
    Bytes,
    /// A single-quoted single-codepoint literal, an integer at runtime.
    Codepoint,

    // Keywords
    And,
    As,
    Assert,
    Async,
    Await,
    Break,
    Class,
    Continue,
    Def,
    Del,
    Elif,
    Else,
    Except,
    Export,
    False,
    Finally,
    For,
    From,
    If,
    Import,
    In,
    Is,
    Lambda,
    Let,
    None,
    Not,
    Or,
    Pass,
    Raise,
    Return,
    SelfKw,
    Super,
    True,
    Try,
    While,
    With,
    Yield,

    // Operators and punctuation
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    At,
    Amp,
    Pipe,
    Caret,
    Tilde,
    LeftShift,
    RightShift,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    EqualEqual,
    BangEqual,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    StarStarAssign,
    SlashAssign,
    SlashSlashAssign,
    PercentAssign,
    AtAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    LeftShiftAssign,
    RightShiftAssign,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Colon,
    Semicolon,
    Arrow,
}

impl TokenType {
    /// True for the compound assignment operators (`+=` through `>>=`).
    #[must_use]
    pub fn is_augmented_assign(self) -> bool {
        matches!(
            self,
            Self::PlusAssign
                | Self::MinusAssign
                | Self::StarAssign
                | Self::StarStarAssign
                | Self::SlashAssign
                | Self::SlashSlashAssign
                | Self::PercentAssign
                | Self::AtAssign
                | Self::AmpAssign
                | Self::PipeAssign
                | Self::CaretAssign
                | Self::LeftShiftAssign
                | Self::RightShiftAssign
        )
    }
}

/// One token. Borrows its text from the source buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Token<'src> {
    pub ty: TokenType,
    /// The matched text. For string-like tokens this is the body between
    /// the quotes, escapes unprocessed.
    pub text: &'src str,
    pub line: u32,
    /// Indentation width in columns; zero for everything else.
    pub width: u32,
    /// Human-readable detail for `Error` tokens.
    pub note: Option<&'static str>,
}

impl<'src> Token<'src> {
    fn new(ty: TokenType, text: &'src str, line: u32) -> Self {
        Self {
            ty,
            text,
            line,
            width: 0,
            note: None,
        }
    }
}

/// Saved scanner position for rewind.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScannerState {
    current: usize,
    line: u32,
    at_line_start: bool,
    bracket_depth: u32,
}

/// The tokenizer.
#[derive(Debug, Clone)]
pub(crate) struct Scanner<'src> {
    source: &'src str,
    /// Byte offset of the next unconsumed character.
    current: usize,
    line: u32,
    /// True when the next token should be a line's `Indentation`.
    at_line_start: bool,
    /// Nesting depth of `(`/`[`/`{`; newlines inside are whitespace.
    bracket_depth: u32,
    pushback: Option<Token<'src>>,
    /// Set once the synthetic final `Eol` has been emitted.
    finished_last_line: bool,
}

impl<'src> Scanner<'src> {
    #[must_use]
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            current: 0,
            line: 1,
            at_line_start: true,
            bracket_depth: 0,
            pushback: None,
            finished_last_line: false,
        }
    }

    /// Returns the next token, transparently refetching across `Retry`.
    pub fn next_token(&mut self) -> Token<'src> {
        loop {
            let token = self.raw_token();
            if token.ty != TokenType::Retry {
                return token;
            }
        }
    }

    /// Pushes one token back; the next fetch returns it.
    ///
    /// # Panics
    /// Panics if a token is already pushed back.
    pub fn push_back(&mut self, token: Token<'src>) {
        assert!(self.pushback.is_none(), "scanner pushback already occupied");
        self.pushback = Some(token);
    }

    /// Captures the current position for a later rewind.
    ///
    /// Any pushed-back token is dropped by `restore`, so callers save
    /// before reading ahead.
    #[must_use]
    pub fn save(&self) -> ScannerState {
        debug_assert!(self.pushback.is_none(), "saving with pushback pending");
        ScannerState {
            current: self.current,
            line: self.line,
            at_line_start: self.at_line_start,
            bracket_depth: self.bracket_depth,
        }
    }

    /// Rewinds to a previously saved position.
    pub fn restore(&mut self, state: ScannerState) {
        self.current = state.current;
        self.line = state.line;
        self.at_line_start = state.at_line_start;
        self.bracket_depth = state.bracket_depth;
        self.pushback = None;
    }

    fn raw_token(&mut self) -> Token<'src> {
        if let Some(token) = self.pushback.take() {
            return token;
        }

        if self.at_line_start && self.bracket_depth == 0 {
            return self.line_start();
        }

        self.skip_inline_whitespace();

        let Some(ch) = self.peek() else {
            if !self.finished_last_line {
                self.finished_last_line = true;
                return Token::new(TokenType::Eol, "", self.line);
            }
            return Token::new(TokenType::Eof, "", self.line);
        };

        if ch == '\n' {
            self.advance();
            if self.bracket_depth > 0 {
                self.line += 1;
                return Token::new(TokenType::Retry, "", self.line);
            }
            let token = Token::new(TokenType::Eol, "", self.line);
            self.line += 1;
            self.at_line_start = true;
            return token;
        }

        let start = self.current;
        self.advance();
        match ch {
            'a'..='z' | 'A'..='Z' | '_' => self.identifier_or_prefixed_string(start),
            '0'..='9' => self.number(start),
            '"' => self.string_literal('"', TokenType::Str),
            '\'' => self.string_literal('\'', TokenType::Str),
            '(' | '[' | '{' => {
                self.bracket_depth += 1;
                let ty = match ch {
                    '(' => TokenType::LeftParen,
                    '[' => TokenType::LeftBracket,
                    _ => TokenType::LeftBrace,
                };
                Token::new(ty, self.slice(start), self.line)
            }
            ')' | ']' | '}' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                let ty = match ch {
                    ')' => TokenType::RightParen,
                    ']' => TokenType::RightBracket,
                    _ => TokenType::RightBrace,
                };
                Token::new(ty, self.slice(start), self.line)
            }
            ',' => Token::new(TokenType::Comma, self.slice(start), self.line),
            '.' => Token::new(TokenType::Dot, self.slice(start), self.line),
            ':' => Token::new(TokenType::Colon, self.slice(start), self.line),
            ';' => Token::new(TokenType::Semicolon, self.slice(start), self.line),
            '~' => Token::new(TokenType::Tilde, self.slice(start), self.line),
            '+' => self.with_assign(start, TokenType::Plus, TokenType::PlusAssign),
            '-' => {
                if self.match_char('>') {
                    Token::new(TokenType::Arrow, self.slice(start), self.line)
                } else {
                    self.with_assign(start, TokenType::Minus, TokenType::MinusAssign)
                }
            }
            '*' => {
                if self.match_char('*') {
                    self.with_assign(start, TokenType::StarStar, TokenType::StarStarAssign)
                } else {
                    self.with_assign(start, TokenType::Star, TokenType::StarAssign)
                }
            }
            '/' => {
                if self.match_char('/') {
                    self.with_assign(start, TokenType::SlashSlash, TokenType::SlashSlashAssign)
                } else {
                    self.with_assign(start, TokenType::Slash, TokenType::SlashAssign)
                }
            }
            '%' => self.with_assign(start, TokenType::Percent, TokenType::PercentAssign),
            '@' => self.with_assign(start, TokenType::At, TokenType::AtAssign),
            '&' => self.with_assign(start, TokenType::Amp, TokenType::AmpAssign),
            '|' => self.with_assign(start, TokenType::Pipe, TokenType::PipeAssign),
            '^' => self.with_assign(start, TokenType::Caret, TokenType::CaretAssign),
            '<' => {
                if self.match_char('<') {
                    self.with_assign(start, TokenType::LeftShift, TokenType::LeftShiftAssign)
                } else {
                    self.with_assign(start, TokenType::Less, TokenType::LessEqual)
                }
            }
            '>' => {
                if self.match_char('>') {
                    self.with_assign(start, TokenType::RightShift, TokenType::RightShiftAssign)
                } else {
                    self.with_assign(start, TokenType::Greater, TokenType::GreaterEqual)
                }
            }
            '=' => self.with_assign(start, TokenType::Assign, TokenType::EqualEqual),
            '!' => {
                if self.match_char('=') {
                    Token::new(TokenType::BangEqual, self.slice(start), self.line)
                } else {
                    self.error("unexpected '!'")
                }
            }
            _ => self.error("unexpected character"),
        }
    }

    /// Handles the start of a logical line: measures indentation, swallows
    /// blank and comment-only lines, and emits the `Indentation` token.
    fn line_start(&mut self) -> Token<'src> {
        let mut width = 0u32;
        loop {
            match self.peek() {
                Some(' ') => {
                    width += 1;
                    self.advance();
                }
                Some('\t') => {
                    // Tabs advance to the next multiple of eight columns.
                    width = (width / 8 + 1) * 8;
                    self.advance();
                }
                _ => break,
            }
        }
        match self.peek() {
            Option::None => {
                // The final visible line already ended; only Eof remains.
                self.at_line_start = false;
                self.finished_last_line = true;
                Token::new(TokenType::Retry, "", self.line)
            }
            Some('\n') => {
                self.advance();
                self.line += 1;
                Token::new(TokenType::Retry, "", self.line)
            }
            Some('#') => {
                self.skip_comment();
                Token::new(TokenType::Retry, "", self.line)
            }
            Some(_) => {
                self.at_line_start = false;
                let mut token = Token::new(TokenType::Indentation, "", self.line);
                token.width = width;
                token
            }
        }
    }

    fn with_assign(&mut self, start: usize, plain: TokenType, assigned: TokenType) -> Token<'src> {
        let ty = if self.match_char('=') { assigned } else { plain };
        Token::new(ty, self.slice(start), self.line)
    }

    fn identifier_or_prefixed_string(&mut self, start: usize) -> Token<'src> {
        // f"..." and b"..." prefixes bind to the immediately following quote.
        let first = self.source.as_bytes()[start];
        if (first == b'f' || first == b'b')
            && let Some(quote @ ('"' | '\'')) = self.peek()
        {
            self.advance();
            let ty = if first == b'f' { TokenType::FString } else { TokenType::Bytes };
            return self.string_literal(quote, ty);
        }
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        let text = self.slice(start);
        Token::new(keyword_or_identifier(text), text, self.line)
    }

    fn number(&mut self, start: usize) -> Token<'src> {
        let radix_prefix = self.source.as_bytes()[start] == b'0'
            && matches!(self.peek(), Some('x' | 'X' | 'b' | 'B' | 'o' | 'O'));
        if radix_prefix {
            self.advance();
            while let Some(ch) = self.peek() {
                if ch.is_ascii_alphanumeric() || ch == '_' {
                    self.advance();
                } else {
                    break;
                }
            }
            return Token::new(TokenType::Int, self.slice(start), self.line);
        }
        let mut is_float = false;
        while let Some(ch) = self.peek() {
            match ch {
                '0'..='9' | '_' => {
                    self.advance();
                }
                '.' => {
                    // A digit must follow; `1.method()` keeps the dot.
                    if self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
                        is_float = true;
                        self.advance();
                    } else {
                        break;
                    }
                }
                'e' | 'E' => {
                    let after = self.peek_second();
                    let exponent = match after {
                        Some(c) if c.is_ascii_digit() => true,
                        Some('+' | '-') => true,
                        _ => false,
                    };
                    if !exponent {
                        break;
                    }
                    is_float = true;
                    self.advance();
                    if matches!(self.peek(), Some('+' | '-')) {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
        let ty = if is_float { TokenType::Float } else { TokenType::Int };
        Token::new(ty, self.slice(start), self.line)
    }

    /// Scans a string body after its opening quote has been consumed.
    ///
    /// Triple quotes open a multi-line string. The returned token's text is
    /// the raw body between the quotes; escape processing happens in the
    /// compiler. Single-quoted bodies that cook down to one codepoint are
    /// reclassified as `Codepoint` literals.
    fn string_literal(&mut self, quote: char, ty: TokenType) -> Token<'src> {
        let triple = self.peek() == Some(quote) && self.peek_second() == Some(quote);
        if triple {
            self.advance();
            self.advance();
        }
        let body_start = self.current;
        loop {
            let Some(ch) = self.peek() else {
                return self.error("unterminated string");
            };
            if ch == '\\' {
                self.advance();
                if self.peek().is_some() {
                    self.advance();
                }
                continue;
            }
            if ch == '\n' {
                if !triple {
                    return self.error("unterminated string");
                }
                self.line += 1;
                self.advance();
                continue;
            }
            if ch == quote {
                if triple {
                    if self.peek_second() == Some(quote) && self.peek_at(2) == Some(quote) {
                        let body = &self.source[body_start..self.current];
                        self.advance();
                        self.advance();
                        self.advance();
                        return Token::new(ty, body, self.line);
                    }
                    self.advance();
                    continue;
                }
                let body = &self.source[body_start..self.current];
                self.advance();
                let ty = if ty == TokenType::Str && quote == '\'' && cooked_codepoint_count(body) == Some(1) {
                    TokenType::Codepoint
                } else {
                    ty
                };
                return Token::new(ty, body, self.line);
            }
            self.advance();
        }
    }

    fn skip_inline_whitespace(&mut self) {
        loop {
            match self.peek() {
                Some(' ' | '\t' | '\r') => {
                    self.advance();
                }
                Some('#') => self.skip_comment(),
                Some('\\') if self.peek_second() == Some('\n') => {
                    // Explicit line continuation.
                    self.advance();
                    self.advance();
                    self.line += 1;
                }
                _ => return,
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn error(&mut self, note: &'static str) -> Token<'src> {
        let mut token = Token::new(TokenType::Error, "", self.line);
        token.note = Some(note);
        token
    }

    fn peek(&self) -> Option<char> {
        self.source[self.current..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.peek_at(1)
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.source[self.current..].chars().nth(n)
    }

    fn advance(&mut self) {
        if let Some(ch) = self.peek() {
            self.current += ch.len_utf8();
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn slice(&self, start: usize) -> &'src str {
        &self.source[start..self.current]
    }
}

/// Number of codepoints a raw string body cooks down to, or `None` when an
/// escape is malformed. Used to classify single-quoted char literals.
fn cooked_codepoint_count(raw: &str) -> Option<usize> {
    let mut count = 0usize;
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next()? {
                'x' => {
                    chars.next()?;
                    chars.next()?;
                }
                'u' => {
                    for _ in 0..4 {
                        chars.next()?;
                    }
                }
                'U' => {
                    for _ in 0..8 {
                        chars.next()?;
                    }
                }
                _ => {}
            }
        }
        count += 1;
    }
    Some(count)
}

fn keyword_or_identifier(text: &str) -> TokenType {
    match text {
        "and" => TokenType::And,
        "as" => TokenType::As,
        "assert" => TokenType::Assert,
        "async" => TokenType::Async,
        "await" => TokenType::Await,
        "break" => TokenType::Break,
        "class" => TokenType::Class,
        "continue" => TokenType::Continue,
        "def" => TokenType::Def,
        "del" => TokenType::Del,
        "elif" => TokenType::Elif,
        "else" => TokenType::Else,
        "except" => TokenType::Except,
        "export" => TokenType::Export,
        "False" => TokenType::False,
        "finally" => TokenType::Finally,
        "for" => TokenType::For,
        "from" => TokenType::From,
        "if" => TokenType::If,
        "import" => TokenType::Import,
        "in" => TokenType::In,
        "is" => TokenType::Is,
        "lambda" => TokenType::Lambda,
        "let" => TokenType::Let,
        "None" => TokenType::None,
        "not" => TokenType::Not,
        "or" => TokenType::Or,
        "pass" => TokenType::Pass,
        "raise" => TokenType::Raise,
        "return" => TokenType::Return,
        "self" => TokenType::SelfKw,
        "super" => TokenType::Super,
        "True" => TokenType::True,
        "try" => TokenType::Try,
        "while" => TokenType::While,
        "with" => TokenType::With,
        "yield" => TokenType::Yield,
        _ => TokenType::Identifier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_types(source: &str) -> Vec<TokenType> {
        let mut scanner = Scanner::new(source);
        let mut out = Vec::new();
        loop {
            let token = scanner.next_token();
            let ty = token.ty;
            out.push(ty);
            if ty == TokenType::Eof {
                return out;
            }
        }
    }

    #[test]
    fn test_simple_line() {
        use TokenType::{Assign, Eof, Eol, Identifier, Indentation, Int, Let};
        assert_eq!(
            token_types("let x = 42\n"),
            vec![Indentation, Let, Identifier, Assign, Int, Eol, Eof]
        );
    }

    #[test]
    fn test_indentation_widths() {
        let mut scanner = Scanner::new("if x:\n    pass\n");
        let first = scanner.next_token();
        assert_eq!(first.ty, TokenType::Indentation);
        assert_eq!(first.width, 0);
        // if x : EOL
        for _ in 0..4 {
            scanner.next_token();
        }
        let second = scanner.next_token();
        assert_eq!(second.ty, TokenType::Indentation);
        assert_eq!(second.width, 4);
    }

    #[test]
    fn test_tab_advances_to_next_stop() {
        let mut scanner = Scanner::new("\tx\n");
        let indent = scanner.next_token();
        assert_eq!(indent.ty, TokenType::Indentation);
        assert_eq!(indent.width, 8);
    }

    #[test]
    fn test_blank_and_comment_lines_vanish() {
        use TokenType::{Eof, Eol, Identifier, Indentation};
        assert_eq!(
            token_types("x\n\n# comment only\n\ny\n"),
            vec![Indentation, Identifier, Eol, Indentation, Identifier, Eol, Eof]
        );
    }

    #[test]
    fn test_newlines_inside_brackets_are_whitespace() {
        use TokenType::{Comma, Eof, Eol, Indentation, Int, LeftBracket, RightBracket};
        assert_eq!(
            token_types("[1,\n 2]\n"),
            vec![Indentation, LeftBracket, Int, Comma, Int, RightBracket, Eol, Eof]
        );
    }

    #[test]
    fn test_numbers() {
        let mut scanner = Scanner::new("10 0xff 0b1010 0o77 1_000 1.5 2e3 1.5e-2 1.method\n");
        let expected = [
            (TokenType::Int, "10"),
            (TokenType::Int, "0xff"),
            (TokenType::Int, "0b1010"),
            (TokenType::Int, "0o77"),
            (TokenType::Int, "1_000"),
            (TokenType::Float, "1.5"),
            (TokenType::Float, "2e3"),
            (TokenType::Float, "1.5e-2"),
            (TokenType::Int, "1"),
            (TokenType::Dot, "."),
            (TokenType::Identifier, "method"),
        ];
        scanner.next_token(); // indentation
        for (ty, text) in expected {
            let token = scanner.next_token();
            assert_eq!((token.ty, token.text), (ty, text));
        }
    }

    #[test]
    fn test_string_bodies_keep_raw_escapes() {
        let mut scanner = Scanner::new("\"a\\nb\"\n");
        scanner.next_token();
        let token = scanner.next_token();
        assert_eq!(token.ty, TokenType::Str);
        assert_eq!(token.text, "a\\nb");
    }

    #[test]
    fn test_fstring_and_bytes_prefixes() {
        let mut scanner = Scanner::new("f\"x={x}\" b\"raw\"\n");
        scanner.next_token();
        let f = scanner.next_token();
        assert_eq!(f.ty, TokenType::FString);
        assert_eq!(f.text, "x={x}");
        let b = scanner.next_token();
        assert_eq!(b.ty, TokenType::Bytes);
        assert_eq!(b.text, "raw");
    }

    #[test]
    fn test_char_literal_is_single_quoted_single_codepoint() {
        let mut scanner = Scanner::new("'a' 'ab' '\\n'\n");
        scanner.next_token();
        assert_eq!(scanner.next_token().ty, TokenType::Codepoint);
        assert_eq!(scanner.next_token().ty, TokenType::Str);
        assert_eq!(scanner.next_token().ty, TokenType::Codepoint);
    }

    #[test]
    fn test_triple_quoted_string_spans_lines() {
        let mut scanner = Scanner::new("\"\"\"two\nlines\"\"\"\n");
        scanner.next_token();
        let token = scanner.next_token();
        assert_eq!(token.ty, TokenType::Str);
        assert_eq!(token.text, "two\nlines");
    }

    #[test]
    fn test_operators_max_munch() {
        let mut scanner = Scanner::new("** **= // //= << <<= <= != -> @ @=\n");
        scanner.next_token();
        let expected = [
            TokenType::StarStar,
            TokenType::StarStarAssign,
            TokenType::SlashSlash,
            TokenType::SlashSlashAssign,
            TokenType::LeftShift,
            TokenType::LeftShiftAssign,
            TokenType::LessEqual,
            TokenType::BangEqual,
            TokenType::Arrow,
            TokenType::At,
            TokenType::AtAssign,
        ];
        for ty in expected {
            assert_eq!(scanner.next_token().ty, ty);
        }
    }

    #[test]
    fn test_keywords() {
        let mut scanner = Scanner::new("def lambda yield async await export let del\n");
        scanner.next_token();
        for ty in [
            TokenType::Def,
            TokenType::Lambda,
            TokenType::Yield,
            TokenType::Async,
            TokenType::Await,
            TokenType::Export,
            TokenType::Let,
            TokenType::Del,
        ] {
            assert_eq!(scanner.next_token().ty, ty);
        }
    }

    #[test]
    fn test_pushback() {
        let mut scanner = Scanner::new("a b\n");
        scanner.next_token();
        let a = scanner.next_token();
        scanner.push_back(a);
        let again = scanner.next_token();
        assert_eq!(again.text, "a");
        assert_eq!(scanner.next_token().text, "b");
    }

    #[test]
    fn test_save_restore_rewinds() {
        let mut scanner = Scanner::new("a + b\n");
        scanner.next_token();
        let state = scanner.save();
        assert_eq!(scanner.next_token().text, "a");
        assert_eq!(scanner.next_token().ty, TokenType::Plus);
        scanner.restore(state);
        assert_eq!(scanner.next_token().text, "a");
    }

    #[test]
    fn test_missing_trailing_newline_still_ends_line() {
        use TokenType::{Eof, Eol, Identifier, Indentation};
        assert_eq!(token_types("x"), vec![Indentation, Identifier, Eol, Eof]);
    }

    #[test]
    fn test_unterminated_string_errors() {
        let mut scanner = Scanner::new("\"oops\n");
        scanner.next_token();
        let token = scanner.next_token();
        assert_eq!(token.ty, TokenType::Error);
        assert_eq!(token.note, Some("unterminated string"));
    }

    #[test]
    fn test_line_continuation() {
        use TokenType::{Eof, Eol, Identifier, Indentation, Plus};
        assert_eq!(
            token_types("a + \\\nb\n"),
            vec![Indentation, Identifier, Plus, Identifier, Eol, Eof]
        );
    }
}
