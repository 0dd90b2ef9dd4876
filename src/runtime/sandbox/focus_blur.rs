// retrace_interceptor::runtime::sandbox::focus_blur
//
// Focus/blur state machine.  Focusing an element may require blurring the
// active element of another window first, and crossing an iframe boundary
// means focusing/blurring the host iframe element itself; those boundary
// dispatches run with handlers suppressed so the page never sees a
// double-fire.
//
// Engines that fire focus/blur handlers asynchronously (legacy IE) keep
// the internal in-flight flag alive across that delay; cleanup is deferred
// through a double timeout so it lands after the engine's own deferral.

use log::debug;

use crate::runtime::dom::NodeId;
use crate::runtime::sandbox::event;
use crate::runtime::value::Value;
use crate::runtime::{Runtime, WindowId};

pub fn active_element(rt: &Runtime, win: WindowId) -> Option<NodeId> {
    rt.win(win).active_element
}

pub fn focus(rt: &mut Runtime, win: WindowId, node: NodeId) {
    focus_inner(rt, win, node, false);
}

pub fn blur(rt: &mut Runtime, win: WindowId, node: NodeId) {
    blur_inner(rt, win, node, false);
}

fn focus_inner(rt: &mut Runtime, win: WindowId, node: NodeId, without_handlers: bool) {
    if rt.win(win).active_element == Some(node) && rt.active_window == win {
        return;
    }

    // Leaving another window: blur its active element, then walk the host
    // iframe chain of the target window, focusing each boundary element
    // silently.
    if rt.active_window != win {
        let prev_win = rt.active_window;
        if let Some(prev) = rt.win(prev_win).active_element {
            blur_inner(rt, prev_win, prev, false);
        }
        focus_host_chain(rt, win);
        rt.active_window = win;
    }

    if let Some(prev) = rt.win(win).active_element {
        if prev != node {
            blur_inner(rt, win, prev, without_handlers);
        }
    }

    rt.win_mut(win).active_element = Some(node);
    raise(rt, win, node, "focus", without_handlers);
}

fn blur_inner(rt: &mut Runtime, win: WindowId, node: NodeId, without_handlers: bool) {
    if rt.win(win).active_element != Some(node) {
        return;
    }
    // Blurring falls back to the body, as the engine does.
    rt.win_mut(win).active_element = rt.win(win).dom.body();
    raise(rt, win, node, "blur", without_handlers);
}

/// Focus every host iframe element between the top window and `win`,
/// outermost first, with handlers suppressed.
fn focus_host_chain(rt: &mut Runtime, win: WindowId) {
    let mut chain = Vec::new();
    let mut current = win;
    while let Some((host_win, host_el)) = rt.win(current).host_element {
        chain.push((host_win, host_el));
        current = host_win;
    }
    for (host_win, host_el) in chain.into_iter().rev() {
        debug!("focusing host iframe element silently in {:?}", host_win);
        rt.win_mut(host_win).active_element = Some(host_el);
        raise(rt, host_win, host_el, "focus", true);
    }
}

fn raise(rt: &mut Runtime, win: WindowId, node: NodeId, event_type: &str, without_handlers: bool) {
    rt.win_mut(win).focus_event_flag = true;
    if !without_handlers {
        event::dispatch(rt, win, node, event_type, Value::Undefined);
    }
    clear_flag(rt, win);
}

/// Drop the in-flight flag.  With async handler timing the engine delivers
/// handlers on a later turn, so the cleanup itself is pushed two turns out.
fn clear_flag(rt: &mut Runtime, win: WindowId) {
    if rt.quirks.async_focus_blur {
        rt.scheduler.set_timeout(
            0,
            Box::new(move |rt| {
                rt.scheduler.set_timeout(
                    0,
                    Box::new(move |rt| rt.win_mut(win).focus_event_flag = false),
                );
            }),
        );
    } else {
        rt.win_mut(win).focus_event_flag = false;
    }
}
