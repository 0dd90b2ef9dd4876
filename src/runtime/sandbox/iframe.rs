// retrace_interceptor::runtime::sandbox::iframe
//
// Same-origin, src-less iframes get the whole runtime injected into them.
// Each one walks a stage machine as its document materializes:
//
//   NotReady ──documentElement──▶ DocumentCreated ──▶ ReadyToInit ──inject──▶ Initialized
//
// and is re-entrant: some engines recreate the iframe's document after a
// write call, wiping the injected hooks.  That is detected by comparing
// the document's method identity to the captured native one, and answered
// by re-binding the existing per-iframe state from the registry kept on
// the top window, never by initializing from scratch.

use log::debug;

use crate::runtime::dom::NodeId;
use crate::runtime::{IframeRecord, Notification, Runtime, WindowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IframeStage {
    NotReady,
    DocumentCreated,
    ReadyToInit,
    Initialized,
}

/// Only iframes the runtime can reach synchronously are injected into:
/// no src, or a same-document pseudo URL.
pub fn is_injectable(src: Option<&str>) -> bool {
    match src {
        None => true,
        Some(s) => {
            let s = s.trim();
            s.is_empty() || s.eq_ignore_ascii_case("about:blank") || s.starts_with("javascript:")
        }
    }
}

/// Subtree-insertion hook from the DOM sandbox: bind every injectable
/// iframe in the inserted subtree.
pub fn on_element_inserted(rt: &mut Runtime, win: WindowId, node: NodeId) {
    let mut candidates = Vec::new();
    if rt.win(win).dom.tag_name(node) == Some("iframe") {
        candidates.push(node);
    }
    for id in rt.win(win).dom.descendants(node) {
        if rt.win(win).dom.tag_name(id) == Some("iframe") {
            candidates.push(id);
        }
    }
    for element in candidates {
        bind_iframe(rt, win, element);
    }
}

fn bind_iframe(rt: &mut Runtime, win: WindowId, element: NodeId) {
    if rt.win(win).iframes.contains_key(&element) {
        return;
    }
    let src = rt
        .win(win)
        .dom
        .get_attribute(element, "src")
        .map(|s| s.to_string());
    if !is_injectable(src.as_deref()) {
        return;
    }

    let location = rt.win(win).location.clone();
    let content = rt.create_child_window(win, element, location);
    rt.win_mut(win).iframes.insert(element, IframeStage::NotReady);
    rt.iframe_registry.push(IframeRecord {
        parent: win,
        element,
        content_window: content,
    });
    debug!("iframe bound: window {:?} under {:?}", content, win);

    // The engine materializes the iframe document on a later turn.
    rt.scheduler.set_timeout(
        0,
        Box::new(move |rt| mature(rt, win, element)),
    );
}

/// Walk the stage machine as far as the iframe document allows.
pub fn mature(rt: &mut Runtime, win: WindowId, element: NodeId) {
    let content = match content_window(rt, win, element) {
        Some(w) => w,
        None => return,
    };

    loop {
        let stage = match rt.win(win).iframes.get(&element) {
            Some(stage) => *stage,
            None => return,
        };
        let next = match stage {
            IframeStage::NotReady => {
                ensure_document_element(rt, content);
                IframeStage::DocumentCreated
            }
            IframeStage::DocumentCreated => IframeStage::ReadyToInit,
            IframeStage::ReadyToInit => {
                super::dom::init_document(rt, content);
                debug!("runtime injected into iframe window {:?}", content);
                IframeStage::Initialized
            }
            IframeStage::Initialized => return,
        };
        rt.win_mut(win).iframes.insert(element, next);
    }
}

fn ensure_document_element(rt: &mut Runtime, content: WindowId) {
    let doc = rt.win(content).dom.document();
    if rt.win(content).dom.children(doc).is_empty() {
        let html = rt.win_mut(content).dom.create_element("html");
        rt.win_mut(content).dom.append_child(doc, html);
    }
}

pub fn content_window(rt: &Runtime, win: WindowId, element: NodeId) -> Option<WindowId> {
    rt.iframe_registry
        .iter()
        .find(|r| r.parent == win && r.element == element)
        .map(|r| r.content_window)
}

pub fn host_of(rt: &Runtime, content: WindowId) -> Option<(WindowId, NodeId)> {
    rt.win(content).host_element
}

/// Recreation probe, run before any operation that relies on the injected
/// hooks.  Write identity no longer matching the captured native means the
/// engine rebuilt the document behind our back.
pub fn check_recreated(rt: &mut Runtime, win: WindowId, element: NodeId) {
    let content = match content_window(rt, win, element) {
        Some(w) => w,
        None => return,
    };
    if rt.win(win).iframes.get(&element) != Some(&IframeStage::Initialized) {
        return;
    }
    let intact = {
        let state = rt.win(content);
        state.natives.is_document_intact(&state.dom)
    };
    if !intact {
        rt.notify(Notification::DocumentRecreated(content));
    }
}

/// documentRecreated handler: reconnect the existing iframe state to the
/// fresh document instead of re-initializing from scratch.
pub fn rebind_recreated_document(rt: &mut Runtime, content: WindowId) {
    let record = rt
        .iframe_registry
        .iter()
        .copied()
        .find(|r| r.content_window == content);
    let record = match record {
        Some(r) => r,
        None => return,
    };

    {
        let state = rt.win_mut(content);
        let generation_dom = &state.dom;
        state.natives.refresh_document_meths(generation_dom);
        state.listening.clear();
    }
    let doc = rt.win(content).dom.document();
    super::dom::process_subtree(rt, content, doc);
    rt.win_mut(record.parent)
        .iframes
        .insert(record.element, IframeStage::Initialized);
    debug!("iframe window {:?} re-bound after document recreation", content);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sandbox::dom::{append_child, create_element, set_attribute};
    use crate::runtime::test_support::*;

    fn insert_iframe(rt: &mut Runtime) -> (WindowId, NodeId) {
        let win = rt.top_window();
        let body = rt.win(win).dom.body().unwrap();
        let iframe = create_element(rt, win, "iframe");
        append_child(rt, win, body, iframe);
        (win, iframe)
    }

    #[test]
    fn injectable_src_values() {
        assert!(is_injectable(None));
        assert!(is_injectable(Some("")));
        assert!(is_injectable(Some("about:blank")));
        assert!(is_injectable(Some("javascript:void(0)")));
        assert!(!is_injectable(Some("https://other.example/page")));
    }

    #[test]
    fn srcless_iframe_reaches_initialized() {
        let (mut rt, _) = test_runtime_with_body();
        let (win, iframe) = insert_iframe(&mut rt);
        assert_eq!(rt.win(win).iframes.get(&iframe), Some(&IframeStage::NotReady));
        rt.run_until_idle();
        assert_eq!(
            rt.win(win).iframes.get(&iframe),
            Some(&IframeStage::Initialized)
        );
        let content = content_window(&rt, win, iframe).unwrap();
        assert_eq!(rt.win(content).parent, Some(win));
        assert_eq!(host_of(&rt, content), Some((win, iframe)));
    }

    #[test]
    fn cross_origin_iframe_is_not_bound() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let iframe = create_element(&mut rt, win, "iframe");
        set_attribute(&mut rt, win, iframe, "src", "https://other.example/page");
        append_child(&mut rt, win, body, iframe);
        rt.run_until_idle();
        assert!(rt.win(win).iframes.is_empty());
        assert!(content_window(&rt, win, iframe).is_none());
    }

    #[test]
    fn recreated_document_is_rebound_not_reinitialized() {
        let (mut rt, _) = test_runtime_with_body();
        let (win, iframe) = insert_iframe(&mut rt);
        rt.run_until_idle();
        let content = content_window(&rt, win, iframe).unwrap();
        let records_before = rt.iframe_registry.len();

        // Engine rebuilds the iframe document after a write.
        rt.win_mut(content).dom.clear_document();
        check_recreated(&mut rt, win, iframe);
        rt.run_until_idle();

        assert_eq!(rt.iframe_registry.len(), records_before);
        assert_eq!(
            rt.win(win).iframes.get(&iframe),
            Some(&IframeStage::Initialized)
        );
        let state = rt.win(content);
        assert!(state.natives.is_document_intact(&state.dom));
    }

    #[test]
    fn nested_subtree_insertion_binds_inner_iframes() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let wrap = rt.win_mut(win).dom.create_element("div");
        let inner = rt.win_mut(win).dom.create_element("iframe");
        rt.win_mut(win).dom.append_child(wrap, inner);
        append_child(&mut rt, win, body, wrap);
        rt.run_until_idle();
        assert!(content_window(&rt, win, inner).is_some());
    }
}
