// retrace_interceptor::pagemark
//
// Processor for markup entering the DOM as a raw string (document.write
// flushes, innerHTML writes, insertAdjacentHTML).  Walks the fragment with
// kuchikiki and applies the same attribute policy the DOM sandbox applies to
// live elements:
//
//   ● URL attributes → proxy URL, original kept in a stored attribute
//   ● inline event handlers → instrumented through the script transformer
//   ● <script> bodies → instrumented; src tagged `script`
//   ● <iframe> src tagged `iframe`; sandbox attr downgraded to keep scripts
//     runnable
//   ● autocomplete forced off, target="_blank" downgraded
//   ● srcset / <meta refresh> / <style> bodies rewritten
//   ● shadow-UI elements skipped entirely

use html5ever::serialize::{serialize, SerializeOpts};
use kuchikiki::traits::*;
use kuchikiki::{parse_fragment, NodeData, NodeRef};
use markup5ever::{local_name, ns, namespace_url, QualName};

use crate::settings::ProxySettings;
use crate::styles::process_style;
use crate::transform;
use crate::urlx::{get_proxy_url, is_supported_protocol, resolve_url, ResourceType};

/// Class marking DOM elements injected by the proxy runtime itself; they
/// must stay invisible to page-observable processing.
pub const SHADOW_UI_CLASS: &str = "retrace-shadow-ui";

/// Suffix of the shadow attribute holding an original, pre-rewrite value.
const STORED_ATTR_SUFFIX: &str = "-retrace-stored";

pub fn stored_attr_name(attr: &str) -> String {
    format!("{}{}", attr, STORED_ATTR_SUFFIX)
}

pub fn is_stored_attr(attr: &str) -> bool {
    attr.ends_with(STORED_ATTR_SUFFIX)
}

/// URL-bearing attributes, per tag.
pub fn is_url_attr(tag: &str, attr: &str) -> bool {
    match attr {
        "src" => matches!(
            tag,
            "script" | "img" | "iframe" | "frame" | "input" | "embed" | "audio" | "video"
                | "source" | "track"
        ),
        "href" => matches!(tag, "a" | "link" | "base" | "area"),
        "action" => tag == "form",
        "formaction" => matches!(tag, "button" | "input"),
        "poster" => tag == "video",
        "data" => tag == "object",
        "background" => matches!(tag, "body" | "table" | "td"),
        "manifest" => tag == "html",
        "cite" => matches!(tag, "blockquote" | "q" | "del" | "ins"),
        _ => false,
    }
}

pub fn is_event_attr(attr: &str) -> bool {
    attr.starts_with("on") && attr.len() > 2
}

/// Attributes whose page-set value must be preserved in a stored attribute
/// because the native value is substituted.
pub fn needs_stored_attr(tag: &str, attr: &str) -> bool {
    is_url_attr(tag, attr)
        || is_event_attr(attr)
        || attr == "autocomplete"
        || (tag == "iframe" && attr == "sandbox")
        || attr == "target"
}

/// Resource type a proxied URL gets for a given tag/attr pair.
pub fn resource_type_for(tag: &str, attr: &str) -> Option<ResourceType> {
    match (tag, attr) {
        ("script", "src") => Some(ResourceType::Script),
        ("iframe", "src") | ("frame", "src") => Some(ResourceType::Iframe),
        _ => None,
    }
}

/// Compute the substituted native value for an attribute write, or `None`
/// when the value goes to the DOM untouched.  The caller is responsible for
/// keeping the original under [`stored_attr_name`].
pub fn rewrite_attr_value(
    settings: &ProxySettings,
    base_url: &str,
    tag: &str,
    attr: &str,
    value: &str,
) -> Option<String> {
    if is_url_attr(tag, attr) {
        if value.is_empty() || !is_supported_protocol(value) {
            return None;
        }
        let resolved = resolve_url(base_url, value);
        return Some(get_proxy_url(
            &resolved,
            settings,
            resource_type_for(tag, attr),
        ));
    }

    if is_event_attr(attr) {
        return Some(transform::process(value, false));
    }

    if attr == "style" {
        let rewritten = process_style(settings, base_url, value);
        if rewritten != value {
            return Some(rewritten);
        }
        return None;
    }

    if attr == "autocomplete" {
        // Recorded pages must not leak saved form data.
        return Some("off".to_string());
    }

    if tag == "iframe" && attr == "sandbox" {
        return Some(downgrade_sandbox(value));
    }

    if attr == "target" && value == "_blank" {
        // Popping a new window would escape the proxy.
        return Some("_self".to_string());
    }

    None
}

/// The runtime must be able to run inside sandboxed iframes, so
/// `allow-scripts` and `allow-same-origin` are forced in while the page
/// still observes its own value through the stored attribute.
fn downgrade_sandbox(value: &str) -> String {
    let mut tokens: Vec<&str> = value.split_whitespace().collect();
    for required in ["allow-scripts", "allow-same-origin"] {
        if !tokens.contains(&required) {
            tokens.push(required);
        }
    }
    tokens.join(" ")
}

// ---------------------------------------------------------------------------
// Fragment processing
// ---------------------------------------------------------------------------

/// Rewrite an HTML fragment.  `base_url` is the page's origin URL used for
/// relative resolution.
pub fn process_html(settings: &ProxySettings, base_url: &str, html: &str) -> String {
    let ctx = QualName::new(None, ns!(html), local_name!("body"));
    let doc = parse_fragment(ctx, vec![]).one(html);

    walk(&doc, settings, base_url);

    let mut buf = Vec::new();
    let root = match doc.first_child() {
        Some(root) => root,
        None => return html.to_string(),
    };
    let result = serialize(
        &mut buf,
        &root,
        SerializeOpts {
            scripting_enabled: true,
            traversal_scope: html5ever::serialize::TraversalScope::ChildrenOnly(None),
            create_missing_parent: false,
        },
    );
    if result.is_err() {
        return html.to_string();
    }
    String::from_utf8(buf).unwrap_or_else(|_| html.to_string())
}

fn walk(node: &NodeRef, settings: &ProxySettings, base: &str) {
    if let NodeData::Element(ref el) = *node.data() {
        let tag = el.name.local.to_string().to_ascii_lowercase();
        {
            let attrs = el.attributes.borrow();
            if attrs
                .get("class")
                .map(|c| c.split_whitespace().any(|t| t == SHADOW_UI_CLASS))
                .unwrap_or(false)
            {
                return;
            }
        }

        let mut attrs = el.attributes.borrow_mut();

        let names: Vec<String> = attrs
            .map
            .keys()
            .map(|k| k.local.to_string())
            .collect();
        for attr in names {
            if is_stored_attr(&attr) {
                continue;
            }
            let value = match attrs.get(attr.as_str()) {
                Some(v) => v.to_string(),
                None => continue,
            };
            if let Some(substituted) = rewrite_attr_value(settings, base, &tag, &attr, &value) {
                if substituted != value {
                    attrs.insert(stored_attr_name(&attr), value);
                    attrs.insert(attr.clone(), substituted);
                }
            }
        }

        // srcset: comma-separated url/descriptor pairs.
        if let Some(srcset) = attrs.get("srcset").map(|s| s.to_string()) {
            let rewritten = rewrite_srcset(settings, base, &srcset);
            if rewritten != srcset {
                attrs.insert(stored_attr_name("srcset"), srcset);
                attrs.insert("srcset".to_string(), rewritten);
            }
        }

        if tag == "meta" {
            rewrite_meta_refresh(&mut attrs, settings, base);
        }

        if let Some(style) = attrs.get("style").map(|s| s.to_string()) {
            let rewritten = process_style(settings, base, &style);
            if rewritten != style {
                attrs.insert("style".to_string(), rewritten);
            }
        }

        drop(attrs);

        if tag == "style" {
            replace_text_content(node, |text| process_style(settings, base, text));
        }
        if tag == "script" && is_instrumentable_script(node) {
            replace_text_content(node, |text| transform::process(text, false));
        }
    }

    for child in node.children() {
        walk(&child, settings, base);
    }
}

/// Only classic and module scripts get instrumented; JSON payloads and
/// templates keep their bodies.
fn is_instrumentable_script(node: &NodeRef) -> bool {
    if let NodeData::Element(ref el) = *node.data() {
        let attrs = el.attributes.borrow();
        match attrs.get("type") {
            None => true,
            Some(t) => {
                let t = t.trim().to_ascii_lowercase();
                t.is_empty()
                    || t == "module"
                    || t.contains("javascript")
                    || t.contains("ecmascript")
            }
        }
    } else {
        false
    }
}

fn replace_text_content(node: &NodeRef, f: impl Fn(&str) -> String) {
    let mut text = String::new();
    for child in node.children() {
        if let NodeData::Text(ref t) = *child.data() {
            text.push_str(&t.borrow());
        }
    }
    if text.is_empty() {
        return;
    }
    let rewritten = f(&text);
    if rewritten == text {
        return;
    }
    for child in node.children() {
        child.detach();
    }
    node.append(NodeRef::new_text(rewritten));
}

pub fn rewrite_srcset(settings: &ProxySettings, base: &str, srcset: &str) -> String {
    srcset
        .split(',')
        .map(|entry| {
            let parts: Vec<&str> = entry.trim().splitn(2, char::is_whitespace).collect();
            match parts.as_slice() {
                [url, descriptor] => {
                    let encoded = proxy_or_original(settings, base, url);
                    format!("{} {}", encoded, descriptor.trim())
                }
                [url] => proxy_or_original(settings, base, url),
                _ => entry.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn proxy_or_original(settings: &ProxySettings, base: &str, url: &str) -> String {
    if url.is_empty() || !is_supported_protocol(url) {
        return url.to_string();
    }
    get_proxy_url(&resolve_url(base, url), settings, None)
}

fn rewrite_meta_refresh(
    attrs: &mut kuchikiki::Attributes,
    settings: &ProxySettings,
    base: &str,
) {
    let is_refresh = attrs
        .get("http-equiv")
        .map(|v| v.eq_ignore_ascii_case("refresh"))
        .unwrap_or(false);
    if !is_refresh {
        return;
    }
    if let Some(content) = attrs.get("content").map(|s| s.to_string()) {
        if let Some(idx) = content.to_ascii_lowercase().find("url=") {
            let (prefix, url_part) = content.split_at(idx + 4);
            let encoded = proxy_or_original(settings, base, url_part.trim());
            attrs.insert("content".to_string(), format!("{}{}", prefix, encoded));
        }
    }
}

// ---------------------------------------------------------------------------
// kuchikiki attribute helpers
// ---------------------------------------------------------------------------

trait AttrsExt {
    fn get(&self, name: &str) -> Option<&str>;
    fn insert(&mut self, name: String, value: String);
}

impl AttrsExt for kuchikiki::Attributes {
    fn get(&self, name: &str) -> Option<&str> {
        self.map
            .get(&kuchikiki::ExpandedName::new(
                ns!(),
                markup5ever::LocalName::from(name),
            ))
            .map(|a| a.value.as_str())
    }

    fn insert(&mut self, name: String, value: String) {
        let key = kuchikiki::ExpandedName::new(ns!(), markup5ever::LocalName::from(name.as_str()));
        match self.map.get_mut(&key) {
            Some(attr) => attr.value = value,
            None => {
                self.map.insert(
                    key,
                    kuchikiki::Attribute {
                        prefix: None,
                        value,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ProxySettings {
        ProxySettings::new("localhost", 1337, "owner", "job")
    }

    const BASE: &str = "https://example.com/page.html";

    #[test]
    fn rewrites_img_src_and_stores_original() {
        let out = process_html(
            &settings(),
            BASE,
            r#"<img src="https://example.com/img.png">"#,
        );
        assert!(out.contains("/owner!job/https://example.com/img.png"));
        assert!(out.contains(&stored_attr_name("src")));
        assert!(out.contains(r#"https://example.com/img.png""#));
    }

    #[test]
    fn script_src_tagged_script() {
        let out = process_html(&settings(), BASE, r#"<script src="/app.js"></script>"#);
        assert!(out.contains("/owner!job!script/https://example.com/app.js"));
    }

    #[test]
    fn iframe_src_tagged_iframe() {
        let out = process_html(&settings(), BASE, r#"<iframe src="/frame.html"></iframe>"#);
        assert!(out.contains("/owner!job!iframe/https://example.com/frame.html"));
    }

    #[test]
    fn inline_script_instrumented() {
        let out = process_html(&settings(), BASE, "<script>var a = location;</script>");
        assert!(out.contains(crate::transform::instruction::GET_LOCATION));
    }

    #[test]
    fn json_script_untouched() {
        let out = process_html(
            &settings(),
            BASE,
            r#"<script type="application/json">{"a":1}</script>"#,
        );
        assert!(out.contains(r#"{"a":1}"#));
    }

    #[test]
    fn inline_handler_instrumented_and_stored() {
        let out = process_html(
            &settings(),
            BASE,
            r#"<a onclick="location.href='x.html'">go</a>"#,
        );
        assert!(out.contains(crate::transform::instruction::GET_LOCATION));
        assert!(out.contains(&stored_attr_name("onclick")));
    }

    #[test]
    fn sandbox_downgraded() {
        let out = process_html(
            &settings(),
            BASE,
            r#"<iframe sandbox="allow-scripts"></iframe>"#,
        );
        assert!(out.contains("allow-scripts allow-same-origin"));
        assert!(out.contains(&stored_attr_name("sandbox")));
    }

    #[test]
    fn autocomplete_forced_off() {
        let out = process_html(&settings(), BASE, r#"<input autocomplete="name">"#);
        assert!(out.contains(r#"autocomplete="off""#));
        assert!(out.contains(&stored_attr_name("autocomplete")));
    }

    #[test]
    fn target_blank_downgraded() {
        let out = process_html(&settings(), BASE, r#"<a target="_blank" href="/n">n</a>"#);
        assert!(out.contains(r#"target="_self""#));
    }

    #[test]
    fn shadow_ui_elements_skipped() {
        let html = format!(
            r#"<div class="{}"><img src="https://example.com/i.png"></div>"#,
            SHADOW_UI_CLASS
        );
        let out = process_html(&settings(), BASE, &html);
        assert!(!out.contains("owner!job"));
    }

    #[test]
    fn srcset_rewritten() {
        let out = process_html(
            &settings(),
            BASE,
            r#"<img srcset="/a.png 1x, /b.png 2x">"#,
        );
        assert!(out.contains("/owner!job/https://example.com/a.png 1x"));
        assert!(out.contains("/owner!job/https://example.com/b.png 2x"));
    }

    #[test]
    fn meta_refresh_rewritten() {
        let out = process_html(
            &settings(),
            BASE,
            r#"<meta http-equiv="refresh" content="5;url=/next.html">"#,
        );
        assert!(out.contains("/owner!job/https://example.com/next.html"));
    }

    #[test]
    fn javascript_href_untouched() {
        let out = process_html(&settings(), BASE, r#"<a href="javascript:void(0)">x</a>"#);
        assert!(out.contains("javascript:void(0)"));
        assert!(!out.contains(&stored_attr_name("href")));
    }
}
