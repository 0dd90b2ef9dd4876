// retrace_interceptor::runtime::sandbox::doc_write
//
// document.write/writeln interception.  Multi-call sequences arrive bounded
// by the begin/end marker arguments the transformer appends; partial markup
// is buffered and only hits the real document as one atomic flush.
//
// Outside a marked sequence, flushing is gated on two heuristics: a
// page-HTML check (the write replaces the whole document) and a
// well-formedness tokenizer.  The tokenizer is deliberately approximate
// (tag stack, void elements, optional self-closing) and ignores most real
// HTML5 parsing rules; downstream buffering depends on exactly this
// false-negative profile, so it must not be made smarter.

use std::sync::OnceLock;

use log::debug;
use regex::Regex;

use crate::pagemark;
use crate::runtime::value::Value;
use crate::runtime::{Notification, Runtime, WindowId};
use crate::transform::instruction::{DOCUMENT_WRITE_BEGIN, DOCUMENT_WRITE_END};

use super::dom::{DocOverrideState, VOID_ELEMENTS};

#[derive(Debug, Default)]
pub struct WriteBuffer {
    pending: String,
    /// Nesting depth of begin markers; nothing flushes while > 0.
    marker_depth: u32,
}

impl WriteBuffer {
    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn is_buffering(&self) -> bool {
        !self.pending.is_empty()
    }
}

fn page_html_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)^\s*(<\s*!doctype|<\s*html(\s|>))").unwrap())
}

pub fn is_page_html(markup: &str) -> bool {
    page_html_re().is_match(markup)
}

// ---------------------------------------------------------------------------
// write / writeln / open / close
// ---------------------------------------------------------------------------

pub fn write(rt: &mut Runtime, win: WindowId, mut args: Vec<Value>, newline: bool) {
    super::dom::ensure_overrides(rt, win);

    let mut begin = false;
    let mut end = false;
    while let Some(marker) = args.last().and_then(Value::as_str) {
        match marker {
            DOCUMENT_WRITE_BEGIN => begin = true,
            DOCUMENT_WRITE_END => end = true,
            _ => break,
        }
        args.pop();
    }

    let mut chunk: String = args.iter().map(Value::to_display_string).collect();
    if newline {
        chunk.push('\n');
    }

    {
        let buffer = &mut rt.win_mut(win).write_buffer;
        if begin {
            buffer.marker_depth += 1;
        }
        buffer.pending.push_str(&chunk);
        if end {
            buffer.marker_depth = buffer.marker_depth.saturating_sub(1);
        }
    }

    maybe_flush(rt, win, end);
}

pub fn writeln(rt: &mut Runtime, win: WindowId, args: Vec<Value>) {
    write(rt, win, args, true);
}

/// document.open clears the document and drops any buffered markup.
pub fn open(rt: &mut Runtime, win: WindowId) {
    rt.win_mut(win).write_buffer = WriteBuffer::default();
    rt.win_mut(win).dom.clear_document();
    rt.win_mut(win).doc_state = DocOverrideState::Cleaned;
    rt.notify(Notification::DocumentCleaned(win));
}

/// document.close flushes whatever is buffered, complete or not.
pub fn close(rt: &mut Runtime, win: WindowId) {
    let pending = std::mem::take(&mut rt.win_mut(win).write_buffer.pending);
    rt.win_mut(win).write_buffer.marker_depth = 0;
    if !pending.is_empty() {
        flush(rt, win, &pending);
    }
}

// ---------------------------------------------------------------------------
// Flushing
// ---------------------------------------------------------------------------

fn maybe_flush(rt: &mut Runtime, win: WindowId, end_seen: bool) {
    {
        let buffer = &rt.win(win).write_buffer;
        if buffer.marker_depth > 0 || buffer.pending.is_empty() {
            return;
        }
        let pending = buffer.pending.as_str();
        if !(end_seen || is_page_html(pending) || is_well_formed_html(pending)) {
            debug!("document.write buffered {} bytes", pending.len());
            return;
        }
    }
    let pending = std::mem::take(&mut rt.win_mut(win).write_buffer.pending);
    flush(rt, win, &pending);
}

fn flush(rt: &mut Runtime, win: WindowId, markup: &str) {
    let base = super::dom::base_url(rt, win);
    let settings = rt.settings.clone();

    if is_page_html(markup) {
        // Whole-page write: the engine rebuilds the document around it.
        rt.win_mut(win).dom.clear_document();
        rt.win_mut(win).doc_state = DocOverrideState::Cleaned;
        rt.notify(Notification::DocumentCleaned(win));

        let processed = pagemark::process_html(&settings, &base, strip_doctype(markup));
        let doc = rt.win(win).dom.document();
        super::dom::import_html(rt, win, doc, &processed);
        return;
    }

    let processed = pagemark::process_html(&settings, &base, markup);
    let target = rt.win(win).dom.body().unwrap_or_else(|| rt.win(win).dom.document());
    super::dom::import_html(rt, win, target, &processed);

    if rt.quirks.write_recreates_document {
        // Some engines rebuild document state on any write; re-check the
        // hooks and let the cleaned pipeline restore them.
        super::dom::ensure_overrides(rt, win);
    }
}

fn strip_doctype(markup: &str) -> &str {
    let trimmed = markup.trim_start();
    if trimmed.len() >= 2 && trimmed[..2].eq_ignore_ascii_case("<!") {
        if let Some(end) = trimmed.find('>') {
            return &trimmed[end + 1..];
        }
    }
    markup
}

// ---------------------------------------------------------------------------
// Well-formedness tokenizer
// ---------------------------------------------------------------------------

/// True when every opened tag is closed.  Simplified on purpose: quoted
/// attribute values, raw-text elements and implied end tags are not
/// modelled.
pub fn is_well_formed_html(input: &str) -> bool {
    let bytes = input.as_bytes();
    let mut stack: Vec<String> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        if input[i..].starts_with("<!--") {
            match input[i..].find("-->") {
                Some(end) => {
                    i += end + 3;
                    continue;
                }
                None => return false,
            }
        }
        if input[i..].starts_with("<!") || input[i..].starts_with("<?") {
            match input[i..].find('>') {
                Some(end) => {
                    i += end + 1;
                    continue;
                }
                None => return false,
            }
        }

        let closing = input[i..].starts_with("</");
        let name_start = i + if closing { 2 } else { 1 };
        let name: String = input[name_start..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect::<String>()
            .to_ascii_lowercase();
        if name.is_empty() {
            // A bare '<' is text, not a tag.
            i += 1;
            continue;
        }
        let tag_end = match input[i..].find('>') {
            Some(end) => i + end,
            None => return false,
        };
        let self_closed = input[..tag_end].ends_with('/');

        if closing {
            match stack.iter().rposition(|open| *open == name) {
                Some(pos) => stack.truncate(pos),
                None => return false,
            }
        } else if !self_closed && !VOID_ELEMENTS.contains(&name.as_str()) {
            stack.push(name);
        }
        i = tag_end + 1;
    }

    stack.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::*;

    fn s(text: &str) -> Value {
        Value::Str(text.to_string())
    }

    #[test]
    fn tokenizer_accepts_balanced_markup() {
        assert!(is_well_formed_html("plain text"));
        assert!(is_well_formed_html("<div><span>x</span></div>"));
        assert!(is_well_formed_html("<br><img src='x'>"));
        assert!(is_well_formed_html("<p/><p></p>"));
        assert!(is_well_formed_html("<!-- <div> --><b>x</b>"));
    }

    #[test]
    fn tokenizer_rejects_partial_markup() {
        assert!(!is_well_formed_html("<div>"));
        assert!(!is_well_formed_html("<div><div></div>"));
        assert!(!is_well_formed_html("</div>"));
        assert!(!is_well_formed_html("<div"));
        assert!(!is_well_formed_html("<!-- unterminated"));
    }

    #[test]
    fn page_html_detection() {
        assert!(is_page_html("<!DOCTYPE html><html></html>"));
        assert!(is_page_html("  <html lang=\"en\">"));
        assert!(!is_page_html("<div>html</div>"));
    }

    #[test]
    fn marked_sequence_is_atomic() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();

        write(&mut rt, win, vec![s("<div>"), s(DOCUMENT_WRITE_BEGIN)], false);
        assert!(rt.win(win).dom.elements_by_tag(body, "div").is_empty());
        assert!(rt.win(win).write_buffer.is_buffering());

        write(&mut rt, win, vec![s("</div>"), s(DOCUMENT_WRITE_END)], false);
        assert_eq!(rt.win(win).dom.elements_by_tag(body, "div").len(), 1);
        assert!(!rt.win(win).write_buffer.is_buffering());
    }

    #[test]
    fn unmarked_partial_markup_buffers_until_complete() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();

        write(&mut rt, win, vec![s("<ul><li>a</li>")], false);
        assert!(rt.win(win).dom.elements_by_tag(body, "ul").is_empty());

        write(&mut rt, win, vec![s("<li>b</li></ul>")], false);
        let uls = rt.win(win).dom.elements_by_tag(body, "ul");
        assert_eq!(uls.len(), 1);
        assert_eq!(rt.win(win).dom.elements_by_tag(uls[0], "li").len(), 2);
    }

    #[test]
    fn complete_fragment_flushes_immediately() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        write(&mut rt, win, vec![s("<span>hi</span>")], false);
        assert_eq!(rt.win(win).dom.elements_by_tag(body, "span").len(), 1);
    }

    #[test]
    fn flushed_urls_are_proxied() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        write(
            &mut rt,
            win,
            vec![s(r#"<img src="https://example.com/x.png">"#)],
            false,
        );
        let imgs = rt.win(win).dom.elements_by_tag(body, "img");
        assert_eq!(imgs.len(), 1);
        let src = rt.win(win).dom.get_attribute(imgs[0], "src").unwrap();
        assert!(src.contains("owner!job"));
    }

    #[test]
    fn page_html_write_recreates_document() {
        let (mut rt, _) = test_runtime_with_body();
        let win = rt.top_window();
        write(
            &mut rt,
            win,
            vec![s("<html><body><p>new</p></body></html>")],
            false,
        );
        rt.run_until_idle();
        assert_eq!(rt.win(win).doc_state, DocOverrideState::Overridden);
        let doc = rt.win(win).dom.document();
        assert_eq!(rt.win(win).dom.elements_by_tag(doc, "p").len(), 1);
    }

    #[test]
    fn close_flushes_incomplete_markup() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        write(&mut rt, win, vec![s("<div>dangling")], false);
        assert!(rt.win(win).dom.elements_by_tag(body, "div").is_empty());
        close(&mut rt, win);
        assert_eq!(rt.win(win).dom.elements_by_tag(body, "div").len(), 1);
    }
}
