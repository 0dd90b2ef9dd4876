// retrace_interceptor::styles
//
// CSS string rewriter.  Walks the token stream with `cssparser` and rebuilds
// the output with every URL reference routed through the proxy.  Consumed by
// the bridge for style property writes (`el.style.background = …`,
// `style.cssText = …`) and by the page processor for `style` attributes and
// `<style>` bodies.
//
// Handles url(…), image-set(…), @import url(…) / @import "…", @namespace,
// and url() inside @font-face blocks.

use cssparser::{Parser, ParserInput, Token};

use crate::settings::ProxySettings;
use crate::urlx::{get_proxy_url, is_supported_protocol, resolve_url};

/// Rewrite an arbitrary CSS string (stylesheet, inline style, or fragment).
pub fn process_style(settings: &ProxySettings, base_url: &str, css: &str) -> String {
    let mut input = ParserInput::new(css);
    let mut parser = Parser::new(&mut input);
    let mut out = String::with_capacity(css.len());

    rewrite_token_stream(&mut parser, settings, base_url, &mut out);

    out
}

fn proxy_css_url(settings: &ProxySettings, base: &str, raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') || !is_supported_protocol(trimmed) {
        return trimmed.to_string();
    }
    get_proxy_url(&resolve_url(base, trimmed), settings, None)
}

fn rewrite_token_stream(
    parser: &mut Parser<'_, '_>,
    settings: &ProxySettings,
    base: &str,
    out: &mut String,
) {
    // Bare string tokens are URLs only in @import position.
    let mut in_import = false;

    loop {
        let token = match parser.next_including_whitespace_and_comments() {
            Ok(t) => t.clone(),
            Err(_) => break,
        };

        match token {
            Token::UnquotedUrl(ref url_val) => {
                let rewritten = proxy_css_url(settings, base, url_val.as_ref());
                out.push_str(&format!("url({})", quote_css_url(&rewritten)));
            }

            Token::Function(ref name)
                if name.eq_ignore_ascii_case("url") || name.eq_ignore_ascii_case("image-set") =>
            {
                out.push_str(name.as_ref());
                out.push('(');
                rewrite_url_args(parser, settings, base, out);
                out.push(')');
            }

            Token::AtKeyword(ref kw) if kw.eq_ignore_ascii_case("import") => {
                out.push_str("@import ");
                in_import = true;
            }

            Token::AtKeyword(ref kw) => {
                out.push('@');
                out.push_str(kw.as_ref());
            }

            Token::QuotedString(ref s) => {
                let s_str: &str = s.as_ref();
                if in_import {
                    let rewritten = proxy_css_url(settings, base, s_str);
                    out.push_str(&format!("\"{}\"", escape_css_string(&rewritten)));
                    in_import = false;
                } else {
                    out.push_str(&format!("\"{}\"", escape_css_string(s_str)));
                }
            }

            Token::CurlyBracketBlock => {
                out.push('{');
                let _ = parser.parse_nested_block(|inner| -> Result<(), cssparser::ParseError<()>> {
                    rewrite_token_stream(inner, settings, base, out);
                    Ok(())
                });
                out.push('}');
            }

            Token::ParenthesisBlock => {
                out.push('(');
                let _ = parser.parse_nested_block(|inner| -> Result<(), cssparser::ParseError<()>> {
                    rewrite_token_stream(inner, settings, base, out);
                    Ok(())
                });
                out.push(')');
            }

            Token::SquareBracketBlock => {
                out.push('[');
                let _ = parser.parse_nested_block(|inner| -> Result<(), cssparser::ParseError<()>> {
                    rewrite_token_stream(inner, settings, base, out);
                    Ok(())
                });
                out.push(']');
            }

            Token::Function(ref name) => {
                out.push_str(name.as_ref());
                out.push('(');
                let _ = parser.parse_nested_block(|inner| -> Result<(), cssparser::ParseError<()>> {
                    rewrite_token_stream(inner, settings, base, out);
                    Ok(())
                });
                out.push(')');
            }

            Token::Ident(ref v) => out.push_str(v.as_ref()),
            Token::Hash(ref v) | Token::IDHash(ref v) => {
                out.push('#');
                out.push_str(v.as_ref());
            }
            Token::Number { value, .. } => out.push_str(&format_number(value)),
            Token::Percentage { unit_value, .. } => {
                out.push_str(&format_number(unit_value * 100.0));
                out.push('%');
            }
            Token::Dimension {
                value, ref unit, ..
            } => {
                out.push_str(&format_number(value));
                out.push_str(unit.as_ref());
            }
            Token::WhiteSpace(_) => out.push(' '),
            Token::Colon => out.push(':'),
            Token::Semicolon => {
                in_import = false;
                out.push(';');
            }
            Token::Comma => out.push(','),
            Token::Delim(c) => out.push(c),
            Token::IncludeMatch => out.push_str("~="),
            Token::DashMatch => out.push_str("|="),
            Token::PrefixMatch => out.push_str("^="),
            Token::SuffixMatch => out.push_str("$="),
            Token::SubstringMatch => out.push_str("*="),
            Token::CDO => out.push_str("<!--"),
            Token::CDC => out.push_str("-->"),
            Token::Comment(ref c) => {
                out.push_str("/*");
                out.push_str(c.as_ref());
                out.push_str("*/");
            }
            Token::BadString(ref s) => out.push_str(s.as_ref()),
            Token::BadUrl(ref s) => {
                out.push_str("url(");
                out.push_str(s.as_ref());
                out.push(')');
            }
            Token::CloseParenthesis => out.push(')'),
            Token::CloseSquareBracket => out.push(']'),
            Token::CloseCurlyBracket => out.push('}'),
            _ => {}
        }
    }
}

/// Arguments of url() / image-set(): every string or unquoted URL token is a
/// URL, descriptors pass through.
fn rewrite_url_args(
    parser: &mut Parser<'_, '_>,
    settings: &ProxySettings,
    base: &str,
    out: &mut String,
) {
    let _ = parser.parse_nested_block(|inner| -> Result<(), cssparser::ParseError<()>> {
        loop {
            let tok = match inner.next_including_whitespace_and_comments() {
                Ok(t) => t.clone(),
                Err(_) => break,
            };
            match tok {
                Token::QuotedString(ref s) => {
                    let rewritten = proxy_css_url(settings, base, s.as_ref());
                    out.push_str(&format!("\"{}\"", escape_css_string(&rewritten)));
                }
                Token::UnquotedUrl(ref s) => {
                    let rewritten = proxy_css_url(settings, base, s.as_ref());
                    out.push_str(&quote_css_url(&rewritten));
                }
                Token::Function(ref name) if name.eq_ignore_ascii_case("url") => {
                    out.push_str("url(");
                    rewrite_url_args(inner, settings, base, out);
                    out.push(')');
                }
                Token::WhiteSpace(_) => out.push(' '),
                Token::Comma => out.push(','),
                Token::Number { value, .. } => out.push_str(&format_number(value)),
                Token::Dimension {
                    value, ref unit, ..
                } => {
                    out.push_str(&format_number(value));
                    out.push_str(unit.as_ref());
                }
                Token::Ident(ref v) => out.push_str(v.as_ref()),
                Token::Delim(c) => out.push(c),
                _ => {}
            }
        }
        Ok(())
    });
}

fn quote_css_url(url: &str) -> String {
    format!("\"{}\"", escape_css_string(url))
}

fn escape_css_string(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\a ")
}

fn format_number(v: f32) -> String {
    if v == (v as i64) as f32 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ProxySettings {
        ProxySettings::new("localhost", 1337, "owner", "job")
    }

    const BASE: &str = "https://example.com/style/";

    #[test]
    fn rewrites_url_function() {
        let css = r#"body { background: url(https://example.com/bg.png); }"#;
        let out = process_style(&settings(), BASE, css);
        assert!(out.contains("http://localhost:1337/owner!job/https://example.com/bg.png"));
    }

    #[test]
    fn resolves_relative_url_against_base() {
        let css = r#"body { background: url("bg.png"); }"#;
        let out = process_style(&settings(), BASE, css);
        assert!(out.contains("/owner!job/https://example.com/style/bg.png"));
    }

    #[test]
    fn rewrites_import_string() {
        let css = r#"@import "https://example.com/reset.css";"#;
        let out = process_style(&settings(), BASE, css);
        assert!(out.contains("/owner!job/https://example.com/reset.css"));
    }

    #[test]
    fn preserves_data_urls() {
        let css = r#"body { background: url(data:image/png;base64,abc); }"#;
        let out = process_style(&settings(), BASE, css);
        assert!(out.contains("data:image/png;base64,abc"));
        assert!(!out.contains("owner!job/data:"));
    }

    #[test]
    fn fragment_references_untouched() {
        let css = r#".c { clip-path: url(#clip); }"#;
        let out = process_style(&settings(), BASE, css);
        assert!(out.contains("#clip"));
        assert!(!out.contains("owner!job"));
    }
}
