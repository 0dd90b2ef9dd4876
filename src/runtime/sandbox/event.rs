// retrace_interceptor::runtime::sandbox::event
//
// Event interception.  Every (node, event type) pair carries a listening
// context with two handler chains: internal handlers (ours) and outer
// handlers (the page's).  Internal handlers always run strictly before
// outer ones, and can cancel the outer chain for the current dispatch
// cycle only.

use std::rc::Rc;

use log::debug;

use crate::runtime::dom::NodeId;
use crate::runtime::value::Value;
use crate::runtime::{Notification, Runtime, WindowId};

pub type EventHandler = Rc<dyn Fn(&mut Runtime, &mut EventDispatch)>;

/// Internal-handler id reserved for the beforeunload guard; it must stay
/// the last internal handler so it observes every page handler's effect.
pub const BEFOREUNLOAD_GUARD_ID: u64 = u64::MAX;

#[derive(Default)]
pub struct ListeningCtx {
    pub internal_handlers: Vec<(u64, EventHandler)>,
    pub outer_handlers: Vec<OuterHandler>,
    /// Set by an internal handler to suppress the outer chain; valid for
    /// one dispatch cycle.
    pub cancel_outer: bool,
}

impl ListeningCtx {
    pub fn clear(&mut self) {
        self.internal_handlers.clear();
        self.outer_handlers.clear();
        self.cancel_outer = false;
    }
}

impl std::fmt::Debug for ListeningCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListeningCtx")
            .field("internal", &self.internal_handlers.len())
            .field("outer", &self.outer_handlers.len())
            .field("cancel_outer", &self.cancel_outer)
            .finish()
    }
}

pub struct OuterHandler {
    pub listener_id: u64,
    pub capture: bool,
    pub handler: EventHandler,
}

/// One dispatch cycle's mutable event state.
#[derive(Clone)]
pub struct EventDispatch {
    pub event_type: String,
    pub window: WindowId,
    pub target: NodeId,
    pub data: Value,
    pub default_prevented: bool,
    pub propagation_stopped: bool,
    /// True when raised by the action simulator, not the engine.
    pub synthetic: bool,
}

impl EventDispatch {
    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }

    pub fn stop_propagation(&mut self) {
        self.propagation_stopped = true;
    }
}

fn ctx_mut<'a>(
    rt: &'a mut Runtime,
    win: WindowId,
    node: NodeId,
    event_type: &str,
) -> &'a mut ListeningCtx {
    rt.win_mut(win)
        .listening
        .entry((node, event_type.to_string()))
        .or_default()
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

pub fn add_internal_handler(
    rt: &mut Runtime,
    win: WindowId,
    node: NodeId,
    event_type: &str,
    id: u64,
    handler: EventHandler,
) {
    ctx_mut(rt, win, node, event_type)
        .internal_handlers
        .push((id, handler));
}

/// Internal handler that must observe the event before any other internal
/// handler (the focus/blur bookkeeping uses this).
pub fn add_first_internal_handler(
    rt: &mut Runtime,
    win: WindowId,
    node: NodeId,
    event_type: &str,
    id: u64,
    handler: EventHandler,
) {
    ctx_mut(rt, win, node, event_type)
        .internal_handlers
        .insert(0, (id, handler));
}

/// The overridden addEventListener.  Duplicate (listener, capture) pairs
/// are ignored, exactly as the native method does.
pub fn add_event_listener(
    rt: &mut Runtime,
    win: WindowId,
    node: NodeId,
    event_type: &str,
    listener_id: u64,
    capture: bool,
    handler: EventHandler,
) {
    {
        let ctx = ctx_mut(rt, win, node, event_type);
        let duplicate = ctx
            .outer_handlers
            .iter()
            .any(|o| o.listener_id == listener_id && o.capture == capture);
        if duplicate {
            return;
        }
        ctx.outer_handlers.push(OuterHandler {
            listener_id,
            capture,
            handler,
        });
    }
    rt.notify(Notification::EventListenerAttached {
        window: win,
        node,
        event_type: event_type.to_string(),
    });
}

pub fn remove_event_listener(
    rt: &mut Runtime,
    win: WindowId,
    node: NodeId,
    event_type: &str,
    listener_id: u64,
    capture: bool,
) {
    if let Some(ctx) = rt
        .win_mut(win)
        .listening
        .get_mut(&(node, event_type.to_string()))
    {
        ctx.outer_handlers
            .retain(|o| !(o.listener_id == listener_id && o.capture == capture));
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Run one dispatch cycle on a single target: internal handlers first, then
/// outer handlers unless an internal one cancelled them.  The cancel flag
/// never outlives the cycle.
pub fn dispatch(
    rt: &mut Runtime,
    win: WindowId,
    node: NodeId,
    event_type: &str,
    data: Value,
) -> EventDispatch {
    dispatch_inner(rt, win, node, event_type, data, false)
}

pub fn dispatch_synthetic(
    rt: &mut Runtime,
    win: WindowId,
    node: NodeId,
    event_type: &str,
    data: Value,
) -> EventDispatch {
    dispatch_inner(rt, win, node, event_type, data, true)
}

fn dispatch_inner(
    rt: &mut Runtime,
    win: WindowId,
    node: NodeId,
    event_type: &str,
    data: Value,
    synthetic: bool,
) -> EventDispatch {
    let key = (node, event_type.to_string());
    let (internals, outers) = match rt.win_mut(win).listening.get_mut(&key) {
        Some(ctx) => {
            ctx.cancel_outer = false;
            (
                ctx.internal_handlers.clone(),
                ctx.outer_handlers
                    .iter()
                    .map(|o| o.handler.clone())
                    .collect::<Vec<_>>(),
            )
        }
        None => (Vec::new(), Vec::new()),
    };

    let mut ev = EventDispatch {
        event_type: event_type.to_string(),
        window: win,
        target: node,
        data,
        default_prevented: false,
        propagation_stopped: false,
        synthetic,
    };

    for (_, handler) in &internals {
        handler(rt, &mut ev);
        if ev.propagation_stopped {
            break;
        }
    }

    let cancelled = rt
        .win(win)
        .listening
        .get(&key)
        .map(|ctx| ctx.cancel_outer)
        .unwrap_or(false);
    if cancelled {
        debug!("outer handlers cancelled for {} dispatch", event_type);
    }

    if !cancelled && !ev.propagation_stopped {
        for handler in &outers {
            handler(rt, &mut ev);
            if ev.propagation_stopped {
                break;
            }
        }
    }

    if let Some(ctx) = rt.win_mut(win).listening.get_mut(&key) {
        ctx.cancel_outer = false;
    }
    ev
}

/// Suppress the outer chain for the dispatch cycle currently running.
pub fn cancel_outer_handlers(rt: &mut Runtime, win: WindowId, node: NodeId, event_type: &str) {
    ctx_mut(rt, win, node, event_type).cancel_outer = true;
}

// ---------------------------------------------------------------------------
// beforeunload guard
// ---------------------------------------------------------------------------

/// Install the beforeunload guard handler; kept as the last internal
/// handler at all times.
pub fn set_beforeunload_guard(
    rt: &mut Runtime,
    win: WindowId,
    node: NodeId,
    handler: EventHandler,
) {
    let ctx = ctx_mut(rt, win, node, "beforeunload");
    ctx.internal_handlers
        .retain(|(id, _)| *id != BEFOREUNLOAD_GUARD_ID);
    ctx.internal_handlers.push((BEFOREUNLOAD_GUARD_ID, handler));
}

/// A page attached a beforeunload listener; move the guard back to the end
/// of the internal chain so it still runs after everything we own.
pub fn reattach_beforeunload_guard(rt: &mut Runtime, win: WindowId, node: NodeId) {
    let ctx = match rt
        .win_mut(win)
        .listening
        .get_mut(&(node, "beforeunload".to_string()))
    {
        Some(ctx) => ctx,
        None => return,
    };
    let pos = ctx
        .internal_handlers
        .iter()
        .position(|(id, _)| *id == BEFOREUNLOAD_GUARD_ID);
    if let Some(pos) = pos {
        if pos + 1 != ctx.internal_handlers.len() {
            let guard = ctx.internal_handlers.remove(pos);
            ctx.internal_handlers.push(guard);
        }
    }
}
