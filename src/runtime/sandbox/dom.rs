// retrace_interceptor::runtime::sandbox::dom
//
// Document/element overrides.  Every element created, cloned, or inserted
// goes through `process_element`, which applies the same attribute policy
// the server-side fragment processor uses: URL attributes proxied with the
// original kept in a stored attribute, event handlers instrumented,
// security-sensitive attributes downgraded.
//
// Document lifecycle per window:
//
//   Native ──init──▶ Overridden ──engine reset──▶ Cleaned ──reapply──▶ Overridden
//
// Engine resets (document.open recreating the environment) are detected by
// comparing live methods against the Native Method Registry, never assumed
// away: some engines rebuild the document on write.

use kuchikiki::traits::*;
use kuchikiki::{parse_fragment, NodeData, NodeRef};
use log::debug;
use markup5ever::{local_name, namespace_url, ns, QualName};

use crate::pagemark;
use crate::runtime::dom::{NodeId, NodeKind};
use crate::runtime::{Notification, Runtime, WindowId};
use crate::urlx::to_origin_url;

use super::{shadow_ui, upload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocOverrideState {
    Native,
    Overridden,
    Cleaned,
}

/// Elements with no closing tag.
pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

/// Origin base URL of a window, for relative resolution.
pub fn base_url(rt: &Runtime, win: WindowId) -> String {
    to_origin_url(&rt.win(win).location)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

pub fn init_document(rt: &mut Runtime, win: WindowId) {
    let dom = &rt.win(win).dom;
    let natives = crate::runtime::natives::NativeMethodTable::capture(dom);
    let state = rt.win_mut(win);
    state.natives = natives;
    state.doc_state = DocOverrideState::Overridden;
    debug!("document overrides installed for window {:?}", win);
}

/// Defensive recreation check, run before any overridden operation.  When
/// the engine rebuilt the document the overrides are gone; move to Cleaned
/// and let the notification pipeline re-apply them.
pub fn ensure_overrides(rt: &mut Runtime, win: WindowId) {
    let intact = {
        let state = rt.win(win);
        state.natives.is_document_intact(&state.dom)
    };
    if !intact && rt.win(win).doc_state == DocOverrideState::Overridden {
        rt.win_mut(win).doc_state = DocOverrideState::Cleaned;
        rt.notify(Notification::DocumentCleaned(win));
    }
}

/// documentCleaned handler: re-capture natives and re-install overrides.
pub fn reapply_overrides(rt: &mut Runtime, win: WindowId) {
    {
        let state = rt.win_mut(win);
        let generation_dom = &state.dom;
        state.natives.refresh_document_meths(generation_dom);
        state.doc_state = DocOverrideState::Overridden;
        // Handler chains belong to the old document.
        state.listening.clear();
    }
    let doc = rt.win(win).dom.document();
    process_subtree(rt, win, doc);
    debug!("document overrides re-applied for window {:?}", win);
}

// ---------------------------------------------------------------------------
// Element processing
// ---------------------------------------------------------------------------

pub fn create_element(rt: &mut Runtime, win: WindowId, tag: &str) -> NodeId {
    ensure_overrides(rt, win);
    let node = rt.win_mut(win).dom.create_element(tag);
    process_element(rt, win, node);
    node
}

pub fn clone_node(rt: &mut Runtime, win: WindowId, node: NodeId) -> NodeId {
    let copy = rt.win_mut(win).dom.clone_node(node);
    process_subtree(rt, win, copy);
    process_element(rt, win, copy);
    copy
}

/// Re-process an element for this window context: rewrite its attributes
/// and mark it so it is not wrapped twice.
pub fn process_element(rt: &mut Runtime, win: WindowId, node: NodeId) {
    let marker = rt.win(win).context_marker;
    match rt.win(win).dom.element(node) {
        Some(el) if el.processed_context != Some(marker) => {}
        _ => return,
    }

    let tag = rt
        .win(win)
        .dom
        .tag_name(node)
        .map(|t| t.to_string())
        .unwrap_or_default();
    let base = base_url(rt, win);
    let settings = rt.settings.clone();

    for attr in rt.win(win).dom.attribute_names(node) {
        if pagemark::is_stored_attr(&attr) {
            continue;
        }
        let value = match rt.win(win).dom.get_attribute(node, &attr) {
            Some(v) => v.to_string(),
            None => continue,
        };
        if let Some(substituted) =
            pagemark::rewrite_attr_value(&settings, &base, &tag, &attr, &value)
        {
            if substituted != value {
                let dom = &mut rt.win_mut(win).dom;
                dom.set_attribute(node, &pagemark::stored_attr_name(&attr), &value);
                dom.set_attribute(node, &attr, &substituted);
            }
        }
    }

    if let Some(el) = rt.win_mut(win).dom.element_mut(node) {
        el.processed_context = Some(marker);
    }
}

pub fn process_subtree(rt: &mut Runtime, win: WindowId, root: NodeId) {
    let descendants = rt.win(win).dom.descendants(root);
    for node in descendants {
        if rt.win(win).dom.element(node).is_some() {
            process_element(rt, win, node);
        }
    }
}

// ---------------------------------------------------------------------------
// Tree mutation overrides
// ---------------------------------------------------------------------------

pub fn append_child(rt: &mut Runtime, win: WindowId, parent: NodeId, child: NodeId) {
    ensure_overrides(rt, win);
    process_element(rt, win, child);
    process_subtree(rt, win, child);
    rt.win_mut(win).dom.append_child(parent, child);
    super::iframe::on_element_inserted(rt, win, child);
}

pub fn insert_before(
    rt: &mut Runtime,
    win: WindowId,
    parent: NodeId,
    child: NodeId,
    reference: Option<NodeId>,
) {
    ensure_overrides(rt, win);
    process_element(rt, win, child);
    process_subtree(rt, win, child);
    rt.win_mut(win).dom.insert_before(parent, child, reference);
    super::iframe::on_element_inserted(rt, win, child);
}

/// removeChild also tears down upload records rooted at the removed
/// subtree.
pub fn remove_child(rt: &mut Runtime, win: WindowId, parent: NodeId, child: NodeId) -> bool {
    upload::remove_upload_info_under(rt, win, child);
    rt.win_mut(win).dom.remove_child(parent, child)
}

// ---------------------------------------------------------------------------
// Attribute overrides
// ---------------------------------------------------------------------------

/// setAttribute: the DOM receives the substituted value; the page's value
/// survives in the stored attribute.
pub fn set_attribute(rt: &mut Runtime, win: WindowId, node: NodeId, name: &str, value: &str) {
    ensure_overrides(rt, win);
    let tag = rt
        .win(win)
        .dom
        .tag_name(node)
        .map(|t| t.to_string())
        .unwrap_or_default();
    let base = base_url(rt, win);
    let settings = rt.settings.clone();
    let name = name.to_ascii_lowercase();

    match pagemark::rewrite_attr_value(&settings, &base, &tag, &name, value) {
        Some(substituted) if substituted != value => {
            let dom = &mut rt.win_mut(win).dom;
            dom.set_attribute(node, &pagemark::stored_attr_name(&name), value);
            dom.set_attribute(node, &name, &substituted);
        }
        _ => {
            let dom = &mut rt.win_mut(win).dom;
            dom.remove_attribute(node, &pagemark::stored_attr_name(&name));
            dom.set_attribute(node, &name, value);
        }
    }
}

/// getAttribute inverts the substitution so page code always reads back
/// exactly what it wrote.
pub fn get_attribute(rt: &Runtime, win: WindowId, node: NodeId, name: &str) -> Option<String> {
    let name = name.to_ascii_lowercase();
    let dom = &rt.win(win).dom;
    if let Some(stored) = dom.get_attribute(node, &pagemark::stored_attr_name(&name)) {
        return Some(stored.to_string());
    }
    dom.get_attribute(node, &name).map(|v| v.to_string())
}

/// The value actually sitting in the DOM, bypassing the stored-attribute
/// inversion.  This is what the proxy itself serializes.
pub fn native_get_attribute(
    rt: &Runtime,
    win: WindowId,
    node: NodeId,
    name: &str,
) -> Option<String> {
    rt.win(win)
        .dom
        .get_attribute(node, &name.to_ascii_lowercase())
        .map(|v| v.to_string())
}

pub fn remove_attribute(rt: &mut Runtime, win: WindowId, node: NodeId, name: &str) {
    let name = name.to_ascii_lowercase();
    let dom = &mut rt.win_mut(win).dom;
    dom.remove_attribute(node, &pagemark::stored_attr_name(&name));
    dom.remove_attribute(node, &name);
}

// ---------------------------------------------------------------------------
// innerHTML and raw-markup entry points
// ---------------------------------------------------------------------------

pub fn set_inner_html(rt: &mut Runtime, win: WindowId, node: NodeId, html: &str) {
    ensure_overrides(rt, win);
    let base = base_url(rt, win);
    let settings = rt.settings.clone();
    let processed = pagemark::process_html(&settings, &base, html);

    let children: Vec<NodeId> = rt.win(win).dom.children(node).to_vec();
    for child in children {
        remove_child(rt, win, node, child);
    }
    import_html(rt, win, node, &processed);

    // Replacing the body/html content re-roots the page; interested
    // observers (the server, the shadow UI) are told on a fresh turn.
    let tag = rt.win(win).dom.tag_name(node).map(|t| t.to_string());
    if matches!(tag.as_deref(), Some("body") | Some("html")) {
        rt.scheduler.set_timeout(
            0,
            Box::new(move |rt| rt.notify(Notification::BodyContentChanged(win))),
        );
    }
}

pub fn insert_adjacent_html(
    rt: &mut Runtime,
    win: WindowId,
    node: NodeId,
    position: &str,
    html: &str,
) {
    ensure_overrides(rt, win);
    let base = base_url(rt, win);
    let settings = rt.settings.clone();
    let processed = pagemark::process_html(&settings, &base, html);

    match position.to_ascii_lowercase().as_str() {
        "afterbegin" => {
            let first = rt.win(win).dom.children(node).first().copied();
            let imported = import_detached(rt, win, &processed);
            for child in imported {
                rt.win_mut(win).dom.insert_before(node, child, first);
                super::iframe::on_element_inserted(rt, win, child);
            }
        }
        _ => import_html(rt, win, node, &processed),
    }
}

/// Serialize a subtree back to markup, de-substituting stored attributes so
/// the page observes its own values.  Elements the proxy injected never
/// appear in the output.
pub fn get_inner_html(rt: &Runtime, win: WindowId, node: NodeId) -> String {
    let mut out = String::new();
    for child in shadow_ui::filtered_children(rt, win, node) {
        serialize_node(rt, win, child, &mut out);
    }
    out
}

fn serialize_node(rt: &Runtime, win: WindowId, node: NodeId, out: &mut String) {
    let dom = &rt.win(win).dom;
    match &dom.node(node).kind {
        NodeKind::Text(text) => out.push_str(text),
        NodeKind::Document => {
            for child in shadow_ui::filtered_children(rt, win, node) {
                serialize_node(rt, win, child, out);
            }
        }
        NodeKind::Element(el) => {
            if shadow_ui::is_shadow_element(rt, win, node) {
                return;
            }
            let tag = el.tag.clone();
            out.push('<');
            out.push_str(&tag);
            for attr in dom.attribute_names(node) {
                if pagemark::is_stored_attr(&attr) {
                    continue;
                }
                if let Some(value) = get_attribute(rt, win, node, &attr) {
                    out.push(' ');
                    out.push_str(&attr);
                    out.push_str("=\"");
                    out.push_str(&value.replace('&', "&amp;").replace('"', "&quot;"));
                    out.push('"');
                }
            }
            out.push('>');
            if !VOID_ELEMENTS.contains(&tag.as_str()) {
                for &child in dom.children(node) {
                    serialize_node(rt, win, child, out);
                }
                out.push_str("</");
                out.push_str(&tag);
                out.push('>');
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTML import (already-processed markup into the arena)
// ---------------------------------------------------------------------------

/// Parse a processed fragment and append its nodes under `parent`.
pub fn import_html(rt: &mut Runtime, win: WindowId, parent: NodeId, html: &str) {
    let imported = import_detached(rt, win, html);
    for child in imported {
        rt.win_mut(win).dom.append_child(parent, child);
        super::iframe::on_element_inserted(rt, win, child);
    }
}

fn import_detached(rt: &mut Runtime, win: WindowId, html: &str) -> Vec<NodeId> {
    let ctx = QualName::new(None, ns!(html), local_name!("body"));
    let doc = parse_fragment(ctx, vec![]).one(html);
    let root = match doc.first_child() {
        Some(r) => r,
        None => return Vec::new(),
    };
    let mut out = Vec::new();
    for child in root.children() {
        if let Some(node) = convert(rt, win, &child) {
            out.push(node);
        }
    }
    out
}

fn convert(rt: &mut Runtime, win: WindowId, node: &NodeRef) -> Option<NodeId> {
    match *node.data() {
        NodeData::Element(ref el) => {
            let tag = el.name.local.to_string();
            let id = rt.win_mut(win).dom.create_element(&tag);
            {
                let attrs = el.attributes.borrow();
                for (name, attr) in attrs.map.iter() {
                    rt.win_mut(win).dom.set_attribute(
                        id,
                        &name.local.to_string(),
                        attr.value.as_str(),
                    );
                }
            }
            let marker = rt.win(win).context_marker;
            if let Some(data) = rt.win_mut(win).dom.element_mut(id) {
                // The fragment was already rewritten by the page processor.
                data.processed_context = Some(marker);
            }
            for child in node.children() {
                if let Some(child_id) = convert(rt, win, &child) {
                    rt.win_mut(win).dom.append_child(id, child_id);
                }
            }
            Some(id)
        }
        NodeData::Text(ref text) => {
            let content = text.borrow().to_string();
            Some(rt.win_mut(win).dom.create_text(&content))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::*;

    #[test]
    fn created_element_is_marked_processed() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let el = create_element(&mut rt, win, "div");
        let marker = rt.win(win).context_marker;
        assert_eq!(
            rt.win(win).dom.element(el).unwrap().processed_context,
            Some(marker)
        );
    }

    #[test]
    fn attribute_shadowing_round_trip() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let img = create_element(&mut rt, win, "img");
        append_child(&mut rt, win, body, img);

        let original = "https://example.com/pic.png";
        set_attribute(&mut rt, win, img, "src", original);

        // The page reads back its own value…
        assert_eq!(get_attribute(&rt, win, img, "src").as_deref(), Some(original));
        // …while the DOM holds the proxy URL.
        let native = native_get_attribute(&rt, win, img, "src").unwrap();
        assert_ne!(native, original);
        assert!(native.contains("/owner!job/https://example.com/pic.png"));
    }

    #[test]
    fn sandbox_attribute_downgraded_but_virtualized() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let iframe = create_element(&mut rt, win, "iframe");
        append_child(&mut rt, win, body, iframe);

        set_attribute(&mut rt, win, iframe, "sandbox", "allow-scripts");
        let native = native_get_attribute(&rt, win, iframe, "sandbox").unwrap();
        assert!(native.contains("allow-scripts"));
        assert!(native.contains("allow-same-origin"));
        assert_eq!(
            get_attribute(&rt, win, iframe, "sandbox").as_deref(),
            Some("allow-scripts")
        );
    }

    #[test]
    fn unsupported_protocol_attr_untouched() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let a = create_element(&mut rt, win, "a");
        append_child(&mut rt, win, body, a);
        set_attribute(&mut rt, win, a, "href", "javascript:void(0)");
        assert_eq!(
            native_get_attribute(&rt, win, a, "href").as_deref(),
            Some("javascript:void(0)")
        );
    }

    #[test]
    fn inserted_subtree_is_processed() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let wrap = rt.win_mut(win).dom.create_element("div");
        let img = rt.win_mut(win).dom.create_element("img");
        rt.win_mut(win)
            .dom
            .set_attribute(img, "src", "https://example.com/i.png");
        rt.win_mut(win).dom.append_child(wrap, img);

        append_child(&mut rt, win, body, wrap);
        let native = native_get_attribute(&rt, win, img, "src").unwrap();
        assert!(native.contains("owner!job"));
    }

    #[test]
    fn inner_html_processed_and_read_back() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        set_inner_html(
            &mut rt,
            win,
            body,
            r#"<img src="https://example.com/x.png">"#,
        );
        let imgs = rt.win(win).dom.elements_by_tag(body, "img");
        assert_eq!(imgs.len(), 1);
        let native = native_get_attribute(&rt, win, imgs[0], "src").unwrap();
        assert!(native.contains("owner!job"));
        // read-back shows the original
        let html = get_inner_html(&rt, win, body);
        assert!(html.contains(r#"src="https://example.com/x.png""#));
        assert!(!html.contains("owner!job"));
    }

    #[test]
    fn injected_ui_elements_hidden_from_inner_html() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        set_inner_html(&mut rt, win, body, "<p>page</p>");

        let toolbar = rt.win_mut(win).dom.create_element("div");
        rt.win_mut(win)
            .dom
            .set_attribute(toolbar, "class", pagemark::SHADOW_UI_CLASS);
        let label = rt.win_mut(win).dom.create_text("proxy toolbar");
        rt.win_mut(win).dom.append_child(toolbar, label);
        rt.win_mut(win).dom.append_child(body, toolbar);

        let html = get_inner_html(&rt, win, body);
        assert!(html.contains("<p>page</p>"));
        assert!(!html.contains(pagemark::SHADOW_UI_CLASS));
        assert!(!html.contains("proxy toolbar"));
    }

    #[test]
    fn recreated_document_is_detected_and_reoverridden() {
        let (mut rt, _) = test_runtime_with_body();
        let win = rt.top_window();
        assert_eq!(rt.win(win).doc_state, DocOverrideState::Overridden);
        // Engine rebuilds the document environment.
        rt.win_mut(win).dom.clear_document();
        ensure_overrides(&mut rt, win);
        rt.run_until_idle();
        assert_eq!(rt.win(win).doc_state, DocOverrideState::Overridden);
        let state = rt.win(win);
        assert!(state.natives.is_document_intact(&state.dom));
    }

    #[test]
    fn remove_child_clears_upload_records() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let input = create_element(&mut rt, win, "input");
        set_attribute(&mut rt, win, input, "type", "file");
        append_child(&mut rt, win, body, input);
        rt.win_mut(win).uploads.insert(
            input,
            crate::runtime::sandbox::upload::UploadInfo::default(),
        );
        remove_child(&mut rt, win, body, input);
        assert!(!rt.win(win).uploads.contains_key(&input));
    }
}
