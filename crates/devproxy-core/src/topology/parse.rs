//! Minimal reader for the proxy engine's nginx-style configuration dialect.
//!
//! Only enough structure is recovered to find `location` blocks, their
//! direct-child directives, and the byte ranges needed to edit them in place.

use std::ops::Range;

use serde::Serialize;

/// Fatal problem in one route source file. A topology build never proceeds past it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{file}:{line}: {message}")]
pub struct ParseError {
    pub file: String,
    pub line: usize,
    pub message: String,
}

/// A simple `name arg...;` statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Directive {
    pub name: String,
    pub args: Vec<String>,
    pub line: usize,
    /// Byte range from the directive name through its terminating `;`.
    #[serde(skip)]
    pub span: Range<usize>,
}

impl Directive {
    pub fn first_arg(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

/// A `location [modifier] path { ... }` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationBlock {
    pub route: String,
    pub modifier: Option<String>,
    pub line: usize,
    /// Direct-child simple directives, in source order. Nested blocks are not included.
    pub directives: Vec<Directive>,
    /// Byte range from the `location` keyword through the closing `}`.
    #[serde(skip)]
    pub span: Range<usize>,
    /// Byte offset of the closing `}`.
    #[serde(skip)]
    pub close_brace: usize,
}

impl LocationBlock {
    pub fn proxy_pass(&self) -> Option<&str> {
        self.directives
            .iter()
            .find(|d| d.name == "proxy_pass")
            .and_then(Directive::first_arg)
    }

    /// Named locations (`@fallback`) are internal redirect targets, not URL routes.
    pub fn is_named(&self) -> bool {
        self.route.starts_with('@')
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedFile {
    pub file: String,
    /// Every location block in order of appearance, nested ones included.
    pub locations: Vec<LocationBlock>,
}

impl ParsedFile {
    /// First location declaring exactly `route`, ignoring named locations.
    pub fn location(&self, route: &str) -> Option<&LocationBlock> {
        self.locations
            .iter()
            .find(|loc| !loc.is_named() && loc.route == route)
    }
}

const LOCATION_MODIFIERS: &[&str] = &["=", "~", "~*", "^~"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Word(String),
    Open,
    Close,
    Semicolon,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: usize,
    start: usize,
    end: usize,
}

struct Lexer<'a> {
    file: &'a str,
    src: &'a [u8],
    text: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(file: &'a str, text: &'a str) -> Self {
        Self {
            file,
            src: text.as_bytes(),
            text,
            pos: 0,
            line: 1,
        }
    }

    fn error(&self, line: usize, message: impl Into<String>) -> ParseError {
        ParseError {
            file: self.file.to_string(),
            line,
            message: message.into(),
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, ParseError> {
        loop {
            let Some(&b) = self.src.get(self.pos) else {
                return Ok(None);
            };
            match b {
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                b' ' | b'\t' | b'\r' => self.pos += 1,
                b'#' => {
                    while let Some(&c) = self.src.get(self.pos) {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }

        let start = self.pos;
        let line = self.line;
        let single = |kind| Token {
            kind,
            line,
            start,
            end: start + 1,
        };
        let tok = match self.src[start] {
            b'{' => {
                self.pos += 1;
                single(TokenKind::Open)
            }
            b'}' => {
                self.pos += 1;
                single(TokenKind::Close)
            }
            b';' => {
                self.pos += 1;
                single(TokenKind::Semicolon)
            }
            q @ (b'"' | b'\'') => {
                let value = self.quoted(q)?;
                Token {
                    kind: TokenKind::Word(value),
                    line,
                    start,
                    end: self.pos,
                }
            }
            _ => {
                while let Some(&c) = self.src.get(self.pos) {
                    if c.is_ascii_whitespace() || matches!(c, b'{' | b'}' | b';') {
                        break;
                    }
                    self.pos += 1;
                }
                Token {
                    kind: TokenKind::Word(self.text[start..self.pos].to_string()),
                    line,
                    start,
                    end: self.pos,
                }
            }
        };
        Ok(Some(tok))
    }

    fn quoted(&mut self, quote: u8) -> Result<String, ParseError> {
        let open_line = self.line;
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            let Some(&c) = self.src.get(self.pos) else {
                return Err(self.error(open_line, "unterminated quoted string"));
            };
            self.pos += 1;
            match c {
                b'\\' => {
                    if let Some(&next) = self.src.get(self.pos) {
                        if next == b'\n' {
                            self.line += 1;
                        }
                        // Keep escapes other than the quote and backslash verbatim,
                        // the engine interprets them itself.
                        if next != quote && next != b'\\' {
                            out.push(b'\\');
                        }
                        out.push(next);
                        self.pos += 1;
                    }
                }
                c if c == quote => break,
                b'\n' => {
                    self.line += 1;
                    out.push(c);
                }
                _ => out.push(c),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

struct OpenBlock {
    name: String,
    args: Vec<String>,
    line: usize,
    start: usize,
    directives: Vec<Directive>,
}

/// Parse one source file into its location blocks.
pub fn parse_source(file: &str, text: &str) -> Result<ParsedFile, ParseError> {
    let mut lexer = Lexer::new(file, text);
    let mut pending: Vec<Token> = Vec::new();
    let mut stack: Vec<OpenBlock> = Vec::new();
    let mut locations: Vec<LocationBlock> = Vec::new();

    while let Some(tok) = lexer.next_token()? {
        match tok.kind {
            TokenKind::Word(_) => pending.push(tok),
            TokenKind::Semicolon => {
                let (name, args, first) = split_statement(&lexer, &pending, tok.line, "';'")?;
                let directive = Directive {
                    name,
                    args,
                    line: first.line,
                    span: first.start..tok.end,
                };
                if let Some(block) = stack.last_mut() {
                    block.directives.push(directive);
                }
                pending.clear();
            }
            TokenKind::Open => {
                let (name, args, first) = split_statement(&lexer, &pending, tok.line, "'{'")?;
                if name == "location" {
                    location_route(&lexer, &args, first.line)?;
                }
                stack.push(OpenBlock {
                    name,
                    args,
                    line: first.line,
                    start: first.start,
                    directives: Vec::new(),
                });
                pending.clear();
            }
            TokenKind::Close => {
                if let Some(last) = pending.last() {
                    return Err(lexer.error(last.line, "directive is missing a terminating ';'"));
                }
                let Some(block) = stack.pop() else {
                    return Err(lexer.error(tok.line, "unexpected '}'"));
                };
                if block.name == "location" {
                    let (modifier, route) = location_route(&lexer, &block.args, block.line)?;
                    locations.push(LocationBlock {
                        route,
                        modifier,
                        line: block.line,
                        directives: block.directives,
                        span: block.start..tok.end,
                        close_brace: tok.start,
                    });
                }
            }
        }
    }

    if let Some(last) = pending.last() {
        return Err(lexer.error(last.line, "unexpected end of file, expected ';' or '{'"));
    }
    if let Some(block) = stack.last() {
        return Err(lexer.error(
            block.line,
            format!("block '{}' is never closed", block.name),
        ));
    }

    // Blocks close innermost-first; report them in order of appearance.
    locations.sort_by_key(|loc| loc.span.start);
    Ok(ParsedFile {
        file: file.to_string(),
        locations,
    })
}

fn split_statement<'t>(
    lexer: &Lexer<'_>,
    pending: &'t [Token],
    line: usize,
    what: &str,
) -> Result<(String, Vec<String>, &'t Token), ParseError> {
    let Some(first) = pending.first() else {
        return Err(lexer.error(line, format!("unexpected {what}")));
    };
    let mut words = pending.iter().filter_map(|t| match &t.kind {
        TokenKind::Word(w) => Some(w.clone()),
        _ => None,
    });
    let name = words.next().unwrap_or_default();
    Ok((name, words.collect(), first))
}

fn location_route(
    lexer: &Lexer<'_>,
    args: &[String],
    line: usize,
) -> Result<(Option<String>, String), ParseError> {
    match args {
        [path] if !LOCATION_MODIFIERS.contains(&path.as_str()) => Ok((None, path.clone())),
        [modifier, path] if LOCATION_MODIFIERS.contains(&modifier.as_str()) => {
            Ok((Some(modifier.clone()), path.clone()))
        }
        [] | [_] => Err(lexer.error(line, "location without a path")),
        _ => Err(lexer.error(line, "location takes at most a modifier and a path")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# app routes
location /app/ {
    proxy_pass http://svc:3000;   # trailing comment
    proxy_set_header Host $host;
}

location = /health {
    return 200 "ok";
}

location ^~ /api/ {
    proxy_pass $api_upstream;
    location /api/ws/ {
        proxy_pass http://svc:3001/ws/;
        proxy_set_header Connection "upgrade";
    }
}
"#;

    #[test]
    fn finds_locations_in_order_with_direct_children() {
        let parsed = parse_source("apps/sample.conf", SAMPLE).expect("parse");
        let routes: Vec<_> = parsed.locations.iter().map(|l| l.route.as_str()).collect();
        assert_eq!(routes, vec!["/app/", "/health", "/api/", "/api/ws/"]);

        let app = parsed.location("/app/").unwrap();
        assert_eq!(app.proxy_pass(), Some("http://svc:3000"));
        assert_eq!(app.line, 3);
        assert_eq!(app.directives.len(), 2);
        assert!(SAMPLE[app.span.clone()].starts_with("location /app/"));
        assert_eq!(&SAMPLE[app.close_brace..app.close_brace + 1], "}");

        let health = parsed.location("/health").unwrap();
        assert_eq!(health.modifier.as_deref(), Some("="));
        assert_eq!(health.proxy_pass(), None);

        let api = parsed.location("/api/").unwrap();
        assert_eq!(api.proxy_pass(), Some("$api_upstream"));
        // the nested block's proxy_pass is not a direct child of /api/
        assert_eq!(api.directives.len(), 1);

        let ws = parsed.location("/api/ws/").unwrap();
        assert_eq!(ws.directives[1].args, vec!["Connection", "upgrade"]);
    }

    #[test]
    fn reports_unbalanced_braces_with_line() {
        let err = parse_source("bad.conf", "location /a/ {\n  proxy_pass http://a;\n").unwrap_err();
        assert_eq!(err.file, "bad.conf");
        assert_eq!(err.line, 1);
        assert!(err.message.contains("never closed"), "{}", err.message);

        let err = parse_source("bad.conf", "}\n").unwrap_err();
        assert!(err.message.contains("unexpected '}'"));
    }

    #[test]
    fn reports_missing_semicolon_and_unterminated_string() {
        let err = parse_source("x.conf", "location /a/ {\n proxy_pass http://a\n}\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("terminating ';'"));

        let err = parse_source("x.conf", "location /a/ {\n return 200 \"oops;\n}\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn location_requires_a_path() {
        let err = parse_source("x.conf", "location {\n}\n").unwrap_err();
        assert!(err.message.contains("without a path"));
        let err = parse_source("x.conf", "location ~ {\n}\n").unwrap_err();
        assert!(err.message.contains("without a path"));
    }

    #[test]
    fn named_locations_are_flagged() {
        let parsed =
            parse_source("x.conf", "location @fallback { proxy_pass http://a:1; }\n").unwrap();
        assert!(parsed.locations[0].is_named());
        assert!(parsed.location("@fallback").is_none());
    }
}
