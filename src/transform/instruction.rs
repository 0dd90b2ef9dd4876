// retrace_interceptor::transform::instruction
//
// Stable names of the runtime bridge functions the transformer emits calls
// to, plus the property/method sets that need wrapping.  These strings are
// installed on `window` by the injected runtime and must not collide with
// page globals.

/// `__get$(owner, propName)`
pub const GET_PROPERTY: &str = "__get$";
/// `__set$(owner, propName, value)`
pub const SET_PROPERTY: &str = "__set$";
/// `__call$(owner, methodName, args)`
pub const CALL_METHOD: &str = "__call$";
/// `__get$Loc(location)`
pub const GET_LOCATION: &str = "__get$Loc";
/// `__set$Loc(location, value)`
pub const SET_LOCATION: &str = "__set$Loc";
/// `__proc$Script(code)`
pub const PROCESS_SCRIPT: &str = "__proc$Script";

/// Trailing marker argument opening a multi-call document.write sequence.
pub const DOCUMENT_WRITE_BEGIN: &str = "__begin$";
/// Trailing marker argument closing a multi-call document.write sequence.
pub const DOCUMENT_WRITE_END: &str = "__end$";

/// Temporary loop variable used by the for-in rewrite.
pub const FOR_IN_TEMP_VAR: &str = "__set$temp";

/// Property names whose get/set must go through the bridge.
pub const WRAPPABLE_PROPERTIES: &[&str] = &[
    "action",
    "activeElement",
    "attributes",
    "autocomplete",
    "background",
    "backgroundImage",
    "borderImage",
    "cookie",
    "cssText",
    "cursor",
    "data",
    "domain",
    "files",
    "firstChild",
    "firstElementChild",
    "host",
    "hostname",
    "href",
    "innerHTML",
    "innerText",
    "lastChild",
    "lastElementChild",
    "length",
    "listStyle",
    "listStyleImage",
    "location",
    "manifest",
    "onbeforeunload",
    "onerror",
    "onmessage",
    "origin",
    "pathname",
    "port",
    "postMessage",
    "protocol",
    "referrer",
    "sandbox",
    "search",
    "src",
    "style",
    "target",
    "text",
    "textContent",
    "URL",
    "value",
    "which",
];

/// Method names whose calls must go through the bridge.
pub const WRAPPABLE_METHODS: &[&str] = &["postMessage", "write", "writeln"];

pub fn should_instrument_property(name: &str) -> bool {
    WRAPPABLE_PROPERTIES.contains(&name)
}

pub fn should_instrument_method(name: &str) -> bool {
    WRAPPABLE_METHODS.contains(&name)
}
