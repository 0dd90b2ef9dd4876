// retrace_interceptor::runtime::sandbox::message
//
// Cross-window messaging.  Everything travels in one envelope shape and is
// classified SERVICE or USER on arrival: SERVICE envelopes feed the
// internal command dispatch (ping resolution first), USER envelopes are
// forwarded to the page's own onmessage after the target-origin check,
// with origin and payload rewritten back to what the sender's page wrote.
//
// Windows sharing a top-level window never touch real postMessage; the
// envelope is handed to the receiver's same-realm entry point instead,
// behind a zero timeout so delivery stays observably asynchronous.

use std::rc::Rc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::runtime::scheduler::TimerId;
use crate::runtime::{Notification, Runtime, WindowId};
use crate::urlx::{parse_origin_url, to_origin_url};

use super::transport::ServiceMsg;

pub const PING_RETRY_MS: u64 = 200;
pub const PING_TIMEOUT_MS: u64 = 7_000;
pub const PING_SHORT_WAIT_TIMEOUT_MS: u64 = 100;

pub const SERVICE_TYPE: &str = "retrace|service";
pub const USER_TYPE: &str = "retrace|user";

pub const BODY_CHANGED_CMD: &str = "retrace|cmd|body-changed";
pub const UNCAUGHT_ERROR_CMD: &str = "retrace|cmd|uncaught-js-error";
pub const PING_PONG_CMD: &str = "retrace|cmd|ping-pong";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: serde_json::Value,
    #[serde(rename = "originUrl")]
    pub origin_url: String,
    #[serde(rename = "targetUrl")]
    pub target_url: String,
    #[serde(rename = "isStringMessage")]
    pub is_string_message: bool,
}

/// The event handed to the page's onmessage.
#[derive(Debug, Clone, PartialEq)]
pub struct UserMessageEvent {
    pub data: serde_json::Value,
    pub origin: String,
    pub source: WindowId,
}

/// A service envelope broadcast to internal subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceMsgEvent {
    pub message: serde_json::Value,
    pub source: WindowId,
}

fn window_origin(rt: &Runtime, win: WindowId) -> String {
    let origin_url = to_origin_url(&rt.win(win).location);
    parse_origin_url(&origin_url)
        .map(|info| info.origin())
        .unwrap_or(origin_url)
}

// ---------------------------------------------------------------------------
// postMessage
// ---------------------------------------------------------------------------

/// The overridden window.postMessage.
pub fn post_message(
    rt: &mut Runtime,
    from: WindowId,
    to: WindowId,
    data: serde_json::Value,
    target_origin: &str,
) {
    let origin_url = window_origin(rt, from);
    let is_string_message = data.is_string();

    // Engines that only clone strings get a stringified payload on the
    // wire; the flag lets the receiver undo it.
    let wire_data = if rt.quirks.string_only_messages && !is_string_message {
        match serde_json::to_string(&data) {
            Ok(s) => serde_json::Value::String(s),
            Err(_) => data,
        }
    } else {
        data
    };

    let envelope = MessageEnvelope {
        kind: USER_TYPE.to_string(),
        message: wire_data,
        origin_url,
        target_url: target_origin.to_string(),
        is_string_message,
    };

    // Same-realm family gets the direct entry-point call; everything else
    // the engine channel.  Both stay observably asynchronous, so both are
    // a zero-timeout hop here.
    if rt.same_top(from, to) {
        debug!("same-top delivery, bypassing the engine message channel");
    }
    rt.scheduler.set_timeout(
        0,
        Box::new(move |rt| deliver(rt, from, to, envelope)),
    );
}

/// Receiver-side classification and dispatch.
pub fn deliver(rt: &mut Runtime, source: WindowId, to: WindowId, envelope: MessageEnvelope) {
    if envelope.kind == SERVICE_TYPE {
        dispatch_service(rt, source, to, envelope);
        return;
    }
    if envelope.kind != USER_TYPE {
        debug!("dropping envelope with unknown type {:?}", envelope.kind);
        return;
    }

    // targetUrl gate: '*' or same origin as the receiving page.
    let receiver_origin = window_origin(rt, to);
    if envelope.target_url != "*" {
        let target_origin = parse_origin_url(&envelope.target_url)
            .map(|info| info.origin())
            .unwrap_or_else(|_| envelope.target_url.clone());
        if target_origin != receiver_origin {
            debug!(
                "user message dropped: target {} != receiver {}",
                target_origin, receiver_origin
            );
            return;
        }
    }

    let data = if !envelope.is_string_message {
        match &envelope.message {
            // Payload was stringified for the wire; restore its shape.
            serde_json::Value::String(raw) => {
                serde_json::from_str(raw).unwrap_or(envelope.message.clone())
            }
            other => other.clone(),
        }
    } else {
        envelope.message.clone()
    };

    let event = UserMessageEvent {
        data,
        origin: parse_origin_url(&envelope.origin_url)
            .map(|info| info.origin())
            .unwrap_or(envelope.origin_url),
        source,
    };

    let handler = rt.win(to).onmessage.clone();
    if let Some(handler) = handler {
        handler(rt, &event);
    }
}

fn dispatch_service(rt: &mut Runtime, source: WindowId, _to: WindowId, envelope: MessageEnvelope) {
    // A pong for an in-flight ping resolves it and is consumed here;
    // requests carry the same cmd but not the response flag.
    if envelope.message["isResponse"] == json!(true) {
        if let Some(id) = envelope.message["id"].as_i64() {
            resolve_ping(rt, id);
            return;
        }
    }
    debug!("service envelope: {:?}", envelope.message["cmd"]);
    rt.service_msgs.emit(&ServiceMsgEvent {
        message: envelope.message,
        source,
    });
}

// ---------------------------------------------------------------------------
// Ping
// ---------------------------------------------------------------------------

pub type PingCallback = Rc<dyn Fn(&mut Runtime, bool)>;

pub struct PingState {
    pub cmd: String,
    pub target: WindowId,
    pub done: bool,
    pub attempts: u32,
    retry_timer: Option<TimerId>,
    timeout_timer: Option<TimerId>,
    callback: Option<PingCallback>,
}

impl std::fmt::Debug for PingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingState")
            .field("cmd", &self.cmd)
            .field("done", &self.done)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Start pinging a window.  The callback fires exactly once: with `false`
/// when a pong arrives, with `true` when the timeout expires first.
pub fn ping_window(
    rt: &mut Runtime,
    target: WindowId,
    cmd: &str,
    short_wait: bool,
    callback: PingCallback,
) -> i64 {
    let id = rt.next_ping_id();
    rt.pings.insert(
        id,
        PingState {
            cmd: cmd.to_string(),
            target,
            done: false,
            attempts: 0,
            retry_timer: None,
            timeout_timer: None,
            callback: Some(callback),
        },
    );

    send_ping_attempt(rt, id);
    schedule_retry(rt, id);

    let timeout = if short_wait {
        PING_SHORT_WAIT_TIMEOUT_MS
    } else {
        PING_TIMEOUT_MS
    };
    let timer = rt
        .scheduler
        .set_timeout(timeout, Box::new(move |rt| finish_ping(rt, id, true)));
    if let Some(ping) = rt.pings.get_mut(&id) {
        ping.timeout_timer = Some(timer);
    }
    id
}

/// A pong arrived for `id`.
pub fn resolve_ping(rt: &mut Runtime, id: i64) {
    finish_ping(rt, id, false);
}

fn send_ping_attempt(rt: &mut Runtime, id: i64) {
    let (target, cmd) = match rt.pings.get_mut(&id) {
        Some(ping) if !ping.done => {
            ping.attempts += 1;
            (ping.target, ping.cmd.clone())
        }
        _ => return,
    };
    let top = rt.top_window();
    let envelope = MessageEnvelope {
        kind: SERVICE_TYPE.to_string(),
        message: json!({ "cmd": cmd, "id": id, "isResponse": false }),
        origin_url: window_origin(rt, top),
        target_url: "*".to_string(),
        is_string_message: false,
    };
    debug!("ping {id} attempt to {:?}", target);
    rt.scheduler
        .set_timeout(0, Box::new(move |rt| deliver(rt, top, target, envelope)));
}

fn schedule_retry(rt: &mut Runtime, id: i64) {
    let timer = rt.scheduler.set_timeout(
        PING_RETRY_MS,
        Box::new(move |rt| {
            let live = rt.pings.get(&id).map(|p| !p.done).unwrap_or(false);
            if live {
                send_ping_attempt(rt, id);
                schedule_retry(rt, id);
            }
        }),
    );
    if let Some(ping) = rt.pings.get_mut(&id) {
        ping.retry_timer = Some(timer);
    }
}

// Timers are cleared on completion so neither path can fire twice.
fn finish_ping(rt: &mut Runtime, id: i64, timed_out: bool) {
    let (callback, retry, timeout) = match rt.pings.get_mut(&id) {
        Some(ping) if !ping.done => {
            ping.done = true;
            (
                ping.callback.take(),
                ping.retry_timer.take(),
                ping.timeout_timer.take(),
            )
        }
        _ => return,
    };
    if let Some(timer) = retry {
        rt.scheduler.clear_timeout(timer);
    }
    if let Some(timer) = timeout {
        rt.scheduler.clear_timeout(timer);
    }
    if let Some(callback) = callback {
        callback(rt, timed_out);
    }
}

// ---------------------------------------------------------------------------
// Service notifications
// ---------------------------------------------------------------------------

pub fn send_body_changed_notification(rt: &mut Runtime, win: WindowId) {
    let msg = ServiceMsg::new(BODY_CHANGED_CMD, json!({ "window": win.0 }));
    if let Err(err) = rt.transport.send(msg) {
        warn!("body-changed notification not delivered: {err}");
    }
}

/// Uncaught errors bubble frame by frame to the top window, which records
/// them and reports to the server.
pub fn propagate_uncaught_error(rt: &mut Runtime, win: WindowId, message: &str) {
    if let Some(parent) = rt.win(win).parent {
        rt.notify(Notification::UncaughtJsError {
            window: parent,
            message: message.to_string(),
        });
        return;
    }
    rt.uncaught_errors.push(message.to_string());
    let msg = ServiceMsg::new(UNCAUGHT_ERROR_CMD, json!({ "message": message }));
    if let Err(err) = rt.transport.send(msg) {
        warn!("uncaught-error report not delivered: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::*;
    use std::cell::RefCell;

    fn capture_onmessage(
        rt: &mut Runtime,
        win: WindowId,
    ) -> Rc<RefCell<Vec<UserMessageEvent>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        rt.win_mut(win).onmessage = Some(Rc::new(move |_, ev| sink.borrow_mut().push(ev.clone())));
        seen
    }

    #[test]
    fn delivery_is_asynchronous() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let seen = capture_onmessage(&mut rt, win);
        post_message(&mut rt, win, win, json!({"k": 1}), "*");
        assert!(seen.borrow().is_empty());
        rt.run_until_idle();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn origin_rewritten_to_sender_page_origin() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let seen = capture_onmessage(&mut rt, win);
        post_message(&mut rt, win, win, json!("hi"), "*");
        rt.run_until_idle();
        let events = seen.borrow();
        assert_eq!(events[0].origin, "https://example.com");
        assert_eq!(events[0].data, json!("hi"));
    }

    #[test]
    fn target_origin_mismatch_drops_message() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let seen = capture_onmessage(&mut rt, win);
        post_message(&mut rt, win, win, json!(1), "https://other.example");
        post_message(&mut rt, win, win, json!(2), "https://example.com");
        rt.run_until_idle();
        let events = seen.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, json!(2));
    }

    #[test]
    fn string_only_engines_round_trip_structured_payloads() {
        let mut rt = test_runtime();
        rt.quirks.string_only_messages = true;
        let win = rt.top_window();
        let seen = capture_onmessage(&mut rt, win);
        post_message(&mut rt, win, win, json!({"deep": [1, 2]}), "*");
        rt.run_until_idle();
        assert_eq!(seen.borrow()[0].data, json!({"deep": [1, 2]}));
    }

    #[test]
    fn ping_resolves_once_on_pong() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let sink = outcomes.clone();
        let id = ping_window(
            &mut rt,
            win,
            PING_PONG_CMD,
            false,
            Rc::new(move |_, timed_out| sink.borrow_mut().push(timed_out)),
        );
        resolve_ping(&mut rt, id);
        resolve_ping(&mut rt, id);
        rt.run_until_idle();
        assert_eq!(&*outcomes.borrow(), &[false]);
    }

    #[test]
    fn ping_times_out_exactly_once() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let sink = outcomes.clone();
        ping_window(
            &mut rt,
            win,
            PING_PONG_CMD,
            true,
            Rc::new(move |_, timed_out| sink.borrow_mut().push(timed_out)),
        );
        rt.run_until_idle();
        assert_eq!(&*outcomes.borrow(), &[true]);
    }

    #[test]
    fn ping_retries_until_timeout() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let id = ping_window(&mut rt, win, PING_PONG_CMD, false, Rc::new(|_, _| {}));
        rt.run_for(PING_RETRY_MS * 3);
        let attempts = rt.pings.get(&id).unwrap().attempts;
        // Initial send plus one per elapsed retry interval.
        assert_eq!(attempts, 4);
    }

    #[test]
    fn pong_envelope_resolves_inflight_ping() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let sink = outcomes.clone();
        let id = ping_window(
            &mut rt,
            win,
            PING_PONG_CMD,
            false,
            Rc::new(move |_, timed_out| sink.borrow_mut().push(timed_out)),
        );
        let pong = MessageEnvelope {
            kind: SERVICE_TYPE.to_string(),
            message: json!({ "cmd": PING_PONG_CMD, "id": id, "isResponse": true }),
            origin_url: "https://example.com/".to_string(),
            target_url: "*".to_string(),
            is_string_message: false,
        };
        deliver(&mut rt, win, win, pong);
        rt.run_until_idle();
        assert_eq!(&*outcomes.borrow(), &[false]);
    }

    #[test]
    fn unconsumed_service_envelopes_are_broadcast() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = seen.clone();
            rt.service_msgs
                .on(move |ev: &ServiceMsgEvent| seen.borrow_mut().push(ev.clone()));
        }
        let envelope = MessageEnvelope {
            kind: SERVICE_TYPE.to_string(),
            message: json!({ "cmd": "retrace|cmd|cookie-sync" }),
            origin_url: "https://example.com/".to_string(),
            target_url: "*".to_string(),
            is_string_message: false,
        };
        deliver(&mut rt, win, win, envelope);
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].message["cmd"], "retrace|cmd|cookie-sync");
    }

    #[test]
    fn uncaught_error_bubbles_to_top_and_server() {
        let (mut rt, body) = test_runtime_with_body();
        let top = rt.top_window();
        let iframe = crate::runtime::sandbox::dom::create_element(&mut rt, top, "iframe");
        crate::runtime::sandbox::dom::append_child(&mut rt, top, body, iframe);
        rt.run_until_idle();
        let child = crate::runtime::sandbox::iframe::content_window(&rt, top, iframe).unwrap();

        rt.raise_uncaught_js_error(child, "deep failure");
        rt.run_until_idle();
        assert_eq!(rt.uncaught_errors, vec!["deep failure".to_string()]);
        assert!(rt
            .transport
            .sent
            .iter()
            .any(|req| req.msg.cmd == UNCAUGHT_ERROR_CMD));
    }

    #[test]
    fn body_changed_sends_service_message() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        send_body_changed_notification(&mut rt, win);
        assert_eq!(rt.transport.sent[0].msg.cmd, BODY_CHANGED_CMD);
    }
}
