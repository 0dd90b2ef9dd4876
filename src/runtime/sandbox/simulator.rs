// retrace_interceptor::runtime::sandbox::simulator
//
// Event simulation.  Builds a native-shaped event for a logical event name
// and dispatches it through the event sandbox, preserving the
// button/which/buttons triple each event constructor family expects.
// Synthetic dispatches carry a flag so cancellation logic can tell them
// from engine-raised events.

use log::debug;

use crate::runtime::dom::NodeId;
use crate::runtime::sandbox::event::{self, EventDispatch};
use crate::runtime::value::Value;
use crate::runtime::{Runtime, WindowId};

/// Constructor family available for pointer-class events, probed in
/// fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCtor {
    Pointer,
    MsPointer,
    Mouse,
}

/// Which engine-level constructors exist.  Modern engines have all three;
/// legacy ones only the older entries.
#[derive(Debug, Clone, Copy)]
pub struct CtorSupport {
    pub pointer_events: bool,
    pub ms_pointer_events: bool,
}

impl Default for CtorSupport {
    fn default() -> Self {
        CtorSupport {
            pointer_events: true,
            ms_pointer_events: false,
        }
    }
}

/// PointerEvent -> MSPointerEvent -> MouseEvent.
pub fn pick_ctor(support: CtorSupport) -> EventCtor {
    if support.pointer_events {
        EventCtor::Pointer
    } else if support.ms_pointer_events {
        EventCtor::MsPointer
    } else {
        EventCtor::Mouse
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

/// The `(button, which, buttons)` triple for a pressed button.  `which` is
/// 1-based, `buttons` is the held-buttons bitmask; they do not follow the
/// same numbering as `button`.
pub fn button_triple(button: MouseButton) -> (u8, u8, u8) {
    match button {
        MouseButton::Left => (0, 1, 1),
        MouseButton::Middle => (1, 2, 4),
        MouseButton::Right => (2, 3, 2),
    }
}

/// `(button, which, buttons)` for move/over events with nothing held.
pub const NO_BUTTON_TRIPLE: (u8, u8, u8) = (0, 0, 0);

#[derive(Debug, Clone)]
pub struct SimulatedEvent {
    pub event_type: String,
    pub ctor: EventCtor,
    pub button: u8,
    pub which: u8,
    pub buttons: u8,
    pub client_x: f64,
    pub client_y: f64,
}

fn is_pointer_class(event_type: &str) -> bool {
    matches!(
        event_type,
        "click" | "dblclick" | "contextmenu" | "mousedown" | "mouseup" | "mousemove"
            | "mouseover" | "mouseout" | "mouseenter" | "mouseleave"
    )
}

fn pressed_button(event_type: &str, button: MouseButton) -> (u8, u8, u8) {
    match event_type {
        "mousemove" | "mouseover" | "mouseout" | "mouseenter" | "mouseleave" => NO_BUTTON_TRIPLE,
        _ => button_triple(button),
    }
}

/// Build the event a real interaction would produce.
pub fn build_event(
    support: CtorSupport,
    event_type: &str,
    button: MouseButton,
    client_x: f64,
    client_y: f64,
) -> SimulatedEvent {
    let ctor = if is_pointer_class(event_type) {
        pick_ctor(support)
    } else {
        EventCtor::Mouse
    };
    let (button, which, buttons) = pressed_button(event_type, button);
    SimulatedEvent {
        event_type: event_type.to_string(),
        ctor,
        button,
        which,
        buttons,
        client_x,
        client_y,
    }
}

/// Dispatch a simulated event on a node.  The dispatch runs through the
/// listening context like any engine event, but flagged synthetic.
pub fn simulate(
    rt: &mut Runtime,
    win: WindowId,
    node: NodeId,
    event_type: &str,
    button: MouseButton,
) -> EventDispatch {
    let event = build_event(ctor_support(rt), event_type, button, 0.0, 0.0);
    debug!("simulating {} via {:?}", event.event_type, event.ctor);
    let data = Value::List(vec![
        Value::Number(event.button as f64),
        Value::Number(event.which as f64),
        Value::Number(event.buttons as f64),
    ]);
    event::dispatch_synthetic(rt, win, node, event_type, data)
}

/// click = mousedown, mouseup, click, each a full dispatch cycle.
pub fn simulate_click(rt: &mut Runtime, win: WindowId, node: NodeId) -> EventDispatch {
    simulate(rt, win, node, "mousedown", MouseButton::Left);
    simulate(rt, win, node, "mouseup", MouseButton::Left);
    simulate(rt, win, node, "click", MouseButton::Left)
}

fn ctor_support(rt: &Runtime) -> CtorSupport {
    CtorSupport {
        pointer_events: !rt.quirks.ms_pointer_only && !rt.quirks.mouse_events_only,
        ms_pointer_events: rt.quirks.ms_pointer_only,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn ctor_fallback_order() {
        let all = CtorSupport {
            pointer_events: true,
            ms_pointer_events: true,
        };
        assert_eq!(pick_ctor(all), EventCtor::Pointer);
        let ms_only = CtorSupport {
            pointer_events: false,
            ms_pointer_events: true,
        };
        assert_eq!(pick_ctor(ms_only), EventCtor::MsPointer);
        let neither = CtorSupport {
            pointer_events: false,
            ms_pointer_events: false,
        };
        assert_eq!(pick_ctor(neither), EventCtor::Mouse);
    }

    #[test]
    fn button_mapping_differs_per_field() {
        assert_eq!(button_triple(MouseButton::Left), (0, 1, 1));
        assert_eq!(button_triple(MouseButton::Middle), (1, 2, 4));
        assert_eq!(button_triple(MouseButton::Right), (2, 3, 2));
    }

    #[test]
    fn move_events_carry_no_button() {
        let ev = build_event(
            CtorSupport::default(),
            "mousemove",
            MouseButton::Left,
            10.0,
            20.0,
        );
        assert_eq!((ev.button, ev.which, ev.buttons), NO_BUTTON_TRIPLE);
    }

    #[test]
    fn keyboard_events_never_use_pointer_ctor() {
        let ev = build_event(CtorSupport::default(), "keydown", MouseButton::Left, 0.0, 0.0);
        assert_eq!(ev.ctor, EventCtor::Mouse);
    }

    #[test]
    fn simulated_dispatch_is_flagged_synthetic() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let synthetic_seen = Rc::new(RefCell::new(None));
        {
            let seen = synthetic_seen.clone();
            crate::runtime::sandbox::event::add_event_listener(
                &mut rt,
                win,
                body,
                "click",
                1,
                false,
                Rc::new(move |_, ev| *seen.borrow_mut() = Some(ev.synthetic)),
            );
        }
        let ev = simulate(&mut rt, win, body, "click", MouseButton::Left);
        assert!(ev.synthetic);
        assert_eq!(*synthetic_seen.borrow(), Some(true));
    }

    #[test]
    fn click_runs_three_dispatch_cycles() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let log = Rc::new(RefCell::new(Vec::new()));
        for ty in ["mousedown", "mouseup", "click"] {
            let log = log.clone();
            crate::runtime::sandbox::event::add_event_listener(
                &mut rt,
                win,
                body,
                ty,
                1,
                false,
                Rc::new(move |_, ev| log.borrow_mut().push(ev.event_type.clone())),
            );
        }
        simulate_click(&mut rt, win, body);
        assert_eq!(&*log.borrow(), &["mousedown", "mouseup", "click"]);
    }
}
