// retrace_interceptor::runtime::sandbox::shadow_ui
//
// The proxy injects its own UI elements into the page; queries and child
// walks the page performs must never surface them.

use crate::pagemark::SHADOW_UI_CLASS;
use crate::runtime::dom::NodeId;
use crate::runtime::{Runtime, WindowId};

pub fn is_shadow_element(rt: &Runtime, win: WindowId, node: NodeId) -> bool {
    rt.win(win)
        .dom
        .get_attribute(node, "class")
        .map(|classes| classes.split_ascii_whitespace().any(|c| c == SHADOW_UI_CLASS))
        .unwrap_or(false)
}

/// children with the proxy's own elements filtered out.
pub fn filtered_children(rt: &Runtime, win: WindowId, node: NodeId) -> Vec<NodeId> {
    rt.win(win)
        .dom
        .children(node)
        .iter()
        .copied()
        .filter(|&child| !is_shadow_element(rt, win, child))
        .collect()
}

/// getElementsByTagName with shadow elements (and their subtrees) removed.
pub fn filtered_elements_by_tag(
    rt: &Runtime,
    win: WindowId,
    root: NodeId,
    tag: &str,
) -> Vec<NodeId> {
    rt.win(win)
        .dom
        .elements_by_tag(root, tag)
        .into_iter()
        .filter(|&node| !in_shadow_subtree(rt, win, node))
        .collect()
}

fn in_shadow_subtree(rt: &Runtime, win: WindowId, node: NodeId) -> bool {
    let mut current = Some(node);
    while let Some(id) = current {
        if is_shadow_element(rt, win, id) {
            return true;
        }
        current = rt.win(win).dom.node(id).parent;
    }
    false
}
