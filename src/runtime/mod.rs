// retrace_interceptor::runtime
//
// The client-runtime model: a deterministic, single-threaded environment
// holding the window tree, the instrumentation bridge, and the sandboxes.
// The embedder (or a test) drives it through the scheduler; "concurrency"
// is overlapping callback chains, never real parallelism.
//
// Initialization order matters and is explicit: natives are captured before
// any override is installed, and overrides before any page code dispatches
// through the bridge.

pub mod bridge;
pub mod dom;
pub mod emitter;
pub mod location;
pub mod natives;
pub mod sandbox;
pub mod scheduler;
pub mod value;

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use crate::settings::ProxySettings;
use dom::{Dom, NodeId};
use natives::NativeMethodTable;
use emitter::Emitter;
use sandbox::doc_write::WriteBuffer;
use sandbox::event::ListeningCtx;
use sandbox::iframe::IframeStage;
use sandbox::message::{PingState, ServiceMsgEvent, UserMessageEvent};
use sandbox::transport::Transport;
use sandbox::upload::UploadInfo;
use scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub usize);

/// Feature-detection flags for engine-specific legacy behavior.  Explicit
/// conditional compatibility modes, not user-agent sniffing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineQuirks {
    /// Engine fires focus/blur handlers after a delay (legacy IE); the
    /// internal flag cleanup is deferred through a double timeout.
    pub async_focus_blur: bool,
    /// postMessage payloads must be strings.
    pub string_only_messages: bool,
    /// document.write of a non-page fragment needs an init prologue to
    /// re-establish hooks (Firefox/IE recreate document state).
    pub write_recreates_document: bool,
    /// Engine exposes MSPointerEvent but not PointerEvent.
    pub ms_pointer_only: bool,
    /// Engine predates pointer events entirely.
    pub mouse_events_only: bool,
}

pub type PageMessageHandler = Rc<dyn Fn(&mut Runtime, &UserMessageEvent)>;
/// Page `onerror`; returns `true` to suppress the error.
pub type PageErrorHandler = Rc<dyn Fn(&mut Runtime, &str) -> bool>;

/// Per-window state.  Windows form a tree rooted at the top window; iframe
/// windows keep a back-reference to their host element.
pub struct WindowState {
    pub id: WindowId,
    pub parent: Option<WindowId>,
    pub dom: Dom,
    pub natives: NativeMethodTable,
    /// The real (proxied) location URL of this window.
    pub location: String,
    pub doc_state: sandbox::dom::DocOverrideState,
    pub listening: HashMap<(NodeId, String), ListeningCtx>,
    pub write_buffer: WriteBuffer,
    pub uploads: HashMap<NodeId, UploadInfo>,
    pub iframes: HashMap<NodeId, IframeStage>,
    pub active_element: Option<NodeId>,
    /// Set while a focus/blur raised by us is in flight; internal handlers
    /// use it to tell our dispatches from the page's.
    pub focus_event_flag: bool,
    pub onmessage: Option<PageMessageHandler>,
    pub onerror: Option<PageErrorHandler>,
    pub cookie: String,
    /// Marker identifying elements already processed for this window.
    pub context_marker: u64,
    /// Host element when this window is an iframe's content window.
    pub host_element: Option<(WindowId, NodeId)>,
}

impl WindowState {
    fn new(id: WindowId, parent: Option<WindowId>, location: String) -> Self {
        let dom = Dom::new();
        let natives = NativeMethodTable::capture(&dom);
        WindowState {
            id,
            parent,
            dom,
            natives,
            location,
            doc_state: sandbox::dom::DocOverrideState::Native,
            listening: HashMap::new(),
            write_buffer: WriteBuffer::default(),
            uploads: HashMap::new(),
            iframes: HashMap::new(),
            active_element: None,
            focus_event_flag: false,
            onmessage: None,
            onerror: None,
            cookie: String::new(),
            context_marker: id.0 as u64 + 1,
            host_element: None,
        }
    }
}

/// Cross-sandbox notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    DocumentCleaned(WindowId),
    DocumentRecreated(WindowId),
    BodyContentChanged(WindowId),
    EventListenerAttached {
        window: WindowId,
        node: NodeId,
        event_type: String,
    },
    UncaughtJsError {
        window: WindowId,
        message: String,
    },
}

/// Record of an iframe and the sandbox window bound to it, kept on the top
/// same-origin window so a recreated document can be re-bound instead of
/// re-initialized from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IframeRecord {
    pub parent: WindowId,
    pub element: NodeId,
    pub content_window: WindowId,
}

pub struct Runtime {
    pub settings: ProxySettings,
    pub quirks: EngineQuirks,
    pub scheduler: Scheduler,
    pub windows: Vec<WindowState>,
    pub transport: Transport,
    pub pings: HashMap<i64, PingState>,
    next_ping_id: i64,
    pub iframe_registry: Vec<IframeRecord>,
    /// Service envelopes not consumed by the ping machinery.
    pub service_msgs: Emitter<ServiceMsgEvent>,
    pub active_window: WindowId,
    /// Uncaught page errors that reached the top window.
    pub uncaught_errors: Vec<String>,
    notifications: Vec<Notification>,
}

impl Runtime {
    /// Build a runtime for a page at `origin_url`.  Captures natives and
    /// installs the document overrides on the top window before returning,
    /// so no page code can ever observe the native environment.
    pub fn new(settings: ProxySettings, origin_url: &str) -> Self {
        let location = crate::urlx::get_proxy_url(origin_url, &settings, None);
        let top = WindowState::new(WindowId(0), None, location);
        let mut rt = Runtime {
            settings,
            quirks: EngineQuirks::default(),
            scheduler: Scheduler::new(),
            windows: vec![top],
            transport: Transport::new(),
            pings: HashMap::new(),
            next_ping_id: i64::MIN,
            iframe_registry: Vec::new(),
            service_msgs: Emitter::new(),
            active_window: WindowId(0),
            uncaught_errors: Vec::new(),
            notifications: Vec::new(),
        };
        sandbox::dom::init_document(&mut rt, WindowId(0));
        rt
    }

    pub fn top_window(&self) -> WindowId {
        WindowId(0)
    }

    /// Allocate a window nested under `parent`, hosted by `host_element`.
    pub fn create_child_window(
        &mut self,
        parent: WindowId,
        host_element: NodeId,
        location: String,
    ) -> WindowId {
        let id = WindowId(self.windows.len());
        let mut state = WindowState::new(id, Some(parent), location);
        state.host_element = Some((parent, host_element));
        self.windows.push(state);
        id
    }

    pub fn is_top(&self, win: WindowId) -> bool {
        self.win(win).parent.is_none()
    }

    pub fn win(&self, id: WindowId) -> &WindowState {
        &self.windows[id.0]
    }

    pub fn win_mut(&mut self, id: WindowId) -> &mut WindowState {
        &mut self.windows[id.0]
    }

    /// Both windows share one top-level window (same process, same realm
    /// family) — the condition for the direct-call message fast path.
    pub fn same_top(&self, a: WindowId, b: WindowId) -> bool {
        self.top_of(a) == self.top_of(b)
    }

    fn top_of(&self, mut win: WindowId) -> WindowId {
        while let Some(parent) = self.win(win).parent {
            win = parent;
        }
        win
    }

    pub fn next_ping_id(&mut self) -> i64 {
        let id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        id
    }

    // ---- event loop ------------------------------------------------------

    /// Run tasks until the queue drains.
    pub fn run_until_idle(&mut self) {
        loop {
            self.drain_notifications();
            let task = match self.scheduler.pop_next() {
                Some(t) => t,
                None => break,
            };
            task(self);
        }
        self.drain_notifications();
    }

    /// Run tasks due within the next `ms` of virtual time.
    pub fn run_for(&mut self, ms: u64) {
        let limit = self.scheduler.now() + ms;
        loop {
            self.drain_notifications();
            let task = match self.scheduler.pop_next_until(limit) {
                Some(t) => t,
                None => break,
            };
            task(self);
        }
        self.drain_notifications();
    }

    // ---- notifications ---------------------------------------------------

    pub fn notify(&mut self, notification: Notification) {
        debug!("notification: {:?}", notification);
        self.notifications.push(notification);
    }

    fn drain_notifications(&mut self) {
        while let Some(notification) = {
            if self.notifications.is_empty() {
                None
            } else {
                Some(self.notifications.remove(0))
            }
        } {
            self.handle_notification(notification);
        }
    }

    fn handle_notification(&mut self, notification: Notification) {
        match notification {
            Notification::DocumentCleaned(win) => {
                sandbox::dom::reapply_overrides(self, win);
            }
            Notification::DocumentRecreated(win) => {
                sandbox::iframe::rebind_recreated_document(self, win);
            }
            Notification::BodyContentChanged(win) => {
                sandbox::message::send_body_changed_notification(self, win);
            }
            Notification::EventListenerAttached {
                window,
                node,
                event_type,
            } => {
                if event_type == "beforeunload" {
                    sandbox::event::reattach_beforeunload_guard(self, window, node);
                }
            }
            Notification::UncaughtJsError { window, message } => {
                sandbox::message::propagate_uncaught_error(self, window, &message);
            }
        }
    }

    /// Route an uncaught page error: the page's own `onerror` gets the
    /// first chance to suppress it; otherwise it bubbles to the top window.
    pub fn raise_uncaught_js_error(&mut self, win: WindowId, message: &str) {
        let handler = self.win(win).onerror.clone();
        if let Some(handler) = handler {
            if handler(self, message) {
                return;
            }
        }
        self.notify(Notification::UncaughtJsError {
            window: win,
            message: message.to_string(),
        });
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("windows", &self.windows.len())
            .field("scheduler", &self.scheduler)
            .field("active_window", &self.active_window)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn test_runtime() -> Runtime {
        let settings = ProxySettings::new("localhost", 1337, "owner", "job");
        Runtime::new(settings, "https://example.com/page.html")
    }

    /// A runtime whose top document already has html/body elements.
    pub fn test_runtime_with_body() -> (Runtime, NodeId) {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let doc = rt.win(win).dom.document();
        let html = rt.win_mut(win).dom.create_element("html");
        let body = rt.win_mut(win).dom.create_element("body");
        rt.win_mut(win).dom.append_child(doc, html);
        rt.win_mut(win).dom.append_child(html, body);
        (rt, body)
    }
}
