//! In-place directive edits on one `location` block of a route source file.

use devproxy_core::knowledge::DirectiveEdit;
use devproxy_core::topology::{parse_source, Directive, LocationBlock, ParseError};

/// Directives that legitimately repeat inside a block; they are keyed by their
/// first argument as well as their name.
const MULTI_VALUED: &[&str] = &[
    "proxy_set_header",
    "add_header",
    "sub_filter",
    "proxy_hide_header",
];

const DEFAULT_INDENT: &str = "    ";

#[derive(Debug, thiserror::Error)]
pub(crate) enum EditError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{file} has no location block for {route}")]
    MissingLocation { file: String, route: String },
}

/// Apply `edits` in order to the `route` location in `text`.
///
/// The file is re-parsed after each edit so spans always refer to the current
/// text. Returns the new text, which equals `text` when every edit was a no-op.
pub(crate) fn apply_edits(
    file: &str,
    text: &str,
    route: &str,
    edits: &[DirectiveEdit],
) -> Result<String, EditError> {
    let mut current = text.to_string();
    for edit in edits {
        current = apply_edit(file, &current, route, edit)?;
    }
    Ok(current)
}

fn apply_edit(
    file: &str,
    text: &str,
    route: &str,
    edit: &DirectiveEdit,
) -> Result<String, EditError> {
    let parsed = parse_source(file, text)?;
    let block = parsed
        .location(route)
        .ok_or_else(|| EditError::MissingLocation {
            file: file.to_string(),
            route: route.to_string(),
        })?;
    match edit {
        DirectiveEdit::Ensure { directive, args } => Ok(ensure(text, block, directive, args)),
        DirectiveEdit::Remove {
            directive,
            first_arg,
        } => Ok(remove(text, block, directive, first_arg.as_deref())),
    }
}

fn same_slot(existing: &Directive, name: &str, first_arg: Option<&str>) -> bool {
    if existing.name != name {
        return false;
    }
    if MULTI_VALUED.contains(&name) {
        return existing.first_arg() == first_arg;
    }
    true
}

fn ensure(text: &str, block: &LocationBlock, name: &str, args: &[String]) -> String {
    let first_arg = args.first().map(String::as_str);
    let statement = render_statement(name, args);
    if let Some(existing) = block
        .directives
        .iter()
        .find(|d| same_slot(d, name, first_arg))
    {
        if existing.args == args {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len() + statement.len());
        out.push_str(&text[..existing.span.start]);
        out.push_str(&statement);
        out.push_str(&text[existing.span.end..]);
        return out;
    }
    insert_before_close(text, block, &statement)
}

fn insert_before_close(text: &str, block: &LocationBlock, statement: &str) -> String {
    let close = block.close_brace;
    let line_start = line_start(text, close);
    let mut out = String::with_capacity(text.len() + statement.len() + 8);
    if text[line_start..close].trim().is_empty() {
        let indent = block_indent(text, block);
        out.push_str(&text[..line_start]);
        out.push_str(&indent);
        out.push_str(statement);
        out.push('\n');
        out.push_str(&text[line_start..]);
    } else {
        // Single-line block: `location /a/ { proxy_pass x; }`
        let before = &text[..close];
        out.push_str(before);
        if !before.ends_with(char::is_whitespace) {
            out.push(' ');
        }
        out.push_str(statement);
        out.push(' ');
        out.push_str(&text[close..]);
    }
    out
}

fn remove(text: &str, block: &LocationBlock, name: &str, first_arg: Option<&str>) -> String {
    let mut doomed: Vec<&Directive> = block
        .directives
        .iter()
        .filter(|d| d.name == name && (first_arg.is_none() || d.first_arg() == first_arg))
        .collect();
    if doomed.is_empty() {
        return text.to_string();
    }
    doomed.sort_by_key(|d| std::cmp::Reverse(d.span.start));
    let mut out = text.to_string();
    for directive in doomed {
        let start = line_start(&out, directive.span.start);
        let end = line_end(&out, directive.span.end);
        let rest_blank = out[start..directive.span.start].trim().is_empty()
            && out[directive.span.end..end].trim().is_empty();
        if rest_blank {
            let end = if out[end..].starts_with('\n') { end + 1 } else { end };
            out.replace_range(start..end, "");
        } else {
            let mut span_end = directive.span.end;
            while out[span_end..].starts_with(' ') {
                span_end += 1;
            }
            out.replace_range(directive.span.start..span_end, "");
        }
    }
    out
}

fn line_start(text: &str, pos: usize) -> usize {
    text[..pos].rfind('\n').map(|i| i + 1).unwrap_or(0)
}

fn line_end(text: &str, pos: usize) -> usize {
    text[pos..].find('\n').map(|i| pos + i).unwrap_or(text.len())
}

/// Indentation of the first child directive that starts its own line, else the
/// `location` line's indentation plus one level.
fn block_indent(text: &str, block: &LocationBlock) -> String {
    for directive in &block.directives {
        let start = line_start(text, directive.span.start);
        let lead = &text[start..directive.span.start];
        if lead.trim().is_empty() {
            return lead.to_string();
        }
    }
    let start = line_start(text, block.span.start);
    let lead = &text[start..block.span.start];
    let base: String = lead.chars().take_while(|c| c.is_whitespace()).collect();
    format!("{base}{DEFAULT_INDENT}")
}

pub(crate) fn render_statement(name: &str, args: &[String]) -> String {
    let mut out = name.to_string();
    for arg in args {
        out.push(' ');
        out.push_str(&quote_arg(arg));
    }
    out.push(';');
    out
}

fn quote_arg(arg: &str) -> String {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '#' | '"' | '\''));
    if !needs_quotes {
        return arg.to_string();
    }
    if arg.contains('"') && !arg.contains('\'') {
        return format!("'{}'", arg.replace('\\', "\\\\"));
    }
    format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = "\
server {
    location /app/ {
        proxy_pass http://svc:3000;
        proxy_set_header Host $host;
    }
}
";

    fn ensure_edit(directive: &str, args: &[&str]) -> DirectiveEdit {
        DirectiveEdit::Ensure {
            directive: directive.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn ensure_inserts_with_block_indentation() {
        let out = apply_edits(
            "app.conf",
            APP,
            "/app/",
            &[ensure_edit("absolute_redirect", &["off"])],
        )
        .unwrap();
        assert!(out.contains(
            "        proxy_set_header Host $host;\n        absolute_redirect off;\n    }\n"
        ));
    }

    #[test]
    fn ensure_is_idempotent() {
        let edits = [
            ensure_edit("absolute_redirect", &["off"]),
            ensure_edit("proxy_set_header", &["X-Forwarded-Proto", "$scheme"]),
        ];
        let once = apply_edits("app.conf", APP, "/app/", &edits).unwrap();
        let twice = apply_edits("app.conf", &once, "/app/", &edits).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.matches("X-Forwarded-Proto").count(), 1);
    }

    #[test]
    fn multi_valued_directives_are_keyed_by_first_arg() {
        let out = apply_edits(
            "app.conf",
            APP,
            "/app/",
            &[
                ensure_edit("proxy_set_header", &["Host", "$http_host"]),
                ensure_edit("proxy_set_header", &["X-Forwarded-Host", "$host"]),
            ],
        )
        .unwrap();
        assert!(out.contains("proxy_set_header Host $http_host;"));
        assert!(!out.contains("proxy_set_header Host $host;"));
        assert!(out.contains("proxy_set_header X-Forwarded-Host $host;"));
    }

    #[test]
    fn single_valued_directive_is_replaced_in_place() {
        let src = "location /a/ {\n  proxy_pass http://a;\n  absolute_redirect on;\n}\n";
        let out = apply_edits("a.conf", src, "/a/", &[ensure_edit("absolute_redirect", &["off"])])
            .unwrap();
        assert_eq!(out, "location /a/ {\n  proxy_pass http://a;\n  absolute_redirect off;\n}\n");
    }

    #[test]
    fn single_line_block_gets_inline_insert() {
        let src = "location /a/ { proxy_pass http://a; }\n";
        let out = apply_edits("a.conf", src, "/a/", &[ensure_edit("absolute_redirect", &["off"])])
            .unwrap();
        assert_eq!(out, "location /a/ { proxy_pass http://a; absolute_redirect off; }\n");
    }

    #[test]
    fn remove_drops_whole_lines() {
        let edit = DirectiveEdit::Remove {
            directive: "proxy_set_header".into(),
            first_arg: Some("Host".into()),
        };
        let out = apply_edits("app.conf", APP, "/app/", &[edit.clone()]).unwrap();
        assert!(!out.contains("Host"));
        assert!(out.contains("proxy_pass http://svc:3000;\n    }\n"));
        assert_eq!(apply_edits("app.conf", &out, "/app/", &[edit]).unwrap(), out);
    }

    #[test]
    fn args_are_quoted_when_needed() {
        assert_eq!(
            render_statement("proxy_set_header", &["Accept-Encoding".into(), "".into()]),
            "proxy_set_header Accept-Encoding \"\";"
        );
        assert_eq!(
            render_statement("sub_filter", &["href=\"/".into(), "href=\"/app/".into()]),
            "sub_filter 'href=\"/' 'href=\"/app/';"
        );
        assert_eq!(render_statement("proxy_redirect", &["http://".into(), "$scheme://".into()]),
            "proxy_redirect http:// $scheme://;");
    }

    #[test]
    fn quoted_args_survive_a_reparse() {
        let edits = [ensure_edit("sub_filter", &["src=\"/", "src=\"/app/"])];
        let once = apply_edits("app.conf", APP, "/app/", &edits).unwrap();
        let twice = apply_edits("app.conf", &once, "/app/", &edits).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_location_is_an_error() {
        let err = apply_edits("app.conf", APP, "/other/", &[ensure_edit("x", &["y"])]).unwrap_err();
        assert!(matches!(err, EditError::MissingLocation { .. }));
    }
}
