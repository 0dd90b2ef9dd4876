// retrace_interceptor::runtime::bridge
//
// The dispatch functions behind the names the transformer emits.  Each
// intercepted property has one descriptor keyed by name; selection is a
// pure predicate over the owner's runtime shape (node-ness, tag, document,
// window, location, style), never identity-based type checks, because
// owners can come from another frame's realm.
//
// Anything a descriptor does not claim falls back to native behavior, and
// error messages mirror the engine's own wording so page code that matches
// on them keeps working.

use std::collections::HashMap;
use std::sync::OnceLock;

use thiserror::Error;

use crate::pagemark;
use crate::runtime::dom::NodeId;
use crate::runtime::sandbox::{doc_write, dom, message, upload};
use crate::runtime::value::{self, Value};
use crate::runtime::{location, Runtime, WindowId};
use crate::styles;
use crate::transform;

#[derive(Debug, Error, PartialEq)]
pub enum BridgeError {
    #[error("Cannot read properties of {kind} (reading '{name}')")]
    ReadOfNullish { kind: &'static str, name: String },
    #[error("Cannot set properties of {kind} (setting '{name}')")]
    SetOfNullish { kind: &'static str, name: String },
    #[error("{name} is not a function")]
    NotAFunction { name: String },
}

fn nullish_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        _ => "undefined",
    }
}

/// Outcome of a method dispatch: either the wrapped implementation handled
/// it, or the embedder must invoke the native method.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Handled(Value),
    Native,
}

// ---------------------------------------------------------------------------
// Descriptor table
// ---------------------------------------------------------------------------

type Condition = fn(&Runtime, &Value) -> bool;
type Getter = fn(&mut Runtime, &Value) -> Value;
type Setter = fn(&mut Runtime, &Value, Value) -> Value;

pub struct Accessor {
    pub name: &'static str,
    pub condition: Condition,
    pub get: Getter,
    pub set: Setter,
}

pub struct AccessorRegistry {
    entries: HashMap<&'static str, Accessor>,
}

impl AccessorRegistry {
    pub fn lookup(&self, name: &str) -> Option<&Accessor> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn registry() -> &'static AccessorRegistry {
    static REGISTRY: OnceLock<AccessorRegistry> = OnceLock::new();
    REGISTRY.get_or_init(build_registry)
}

fn node_of(value: &Value) -> Option<(WindowId, NodeId)> {
    match value {
        Value::Node(win, node) => Some((*win, *node)),
        _ => None,
    }
}

fn node_of_style(value: &Value) -> Option<(WindowId, NodeId)> {
    match value {
        Value::Style(win, node) => Some((*win, *node)),
        _ => None,
    }
}

fn is_node(_: &Runtime, value: &Value) -> bool {
    value::is_dom_node(value)
}

fn is_doc(_: &Runtime, value: &Value) -> bool {
    value::is_document(value)
}

fn is_loc(_: &Runtime, value: &Value) -> bool {
    value::is_location(value)
}

fn is_window_or_doc(_: &Runtime, value: &Value) -> bool {
    value::is_window(value) || value::is_document(value)
}

fn is_style(_: &Runtime, value: &Value) -> bool {
    value::is_style(value)
}

fn is_file_input(rt: &Runtime, value: &Value) -> bool {
    node_of(value).is_some_and(|(win, node)| {
        rt.win(win).dom.tag_name(node) == Some("input")
            && rt
                .win(win)
                .dom
                .get_attribute(node, "type")
                .is_some_and(|t| t.eq_ignore_ascii_case("file"))
    })
}

fn value_as_string(value: &Value) -> String {
    value.to_display_string()
}

/// Style-property write: the page's value survives in a stored expando
/// while the live declaration carries proxied URLs.
fn set_style_property(rt: &mut Runtime, win: WindowId, node: NodeId, name: &str, value: &str) {
    let base = dom::base_url(rt, win);
    let settings = rt.settings.clone();
    let processed = styles::process_style(&settings, &base, value);
    let dom = &mut rt.win_mut(win).dom;
    dom.set_expando(node, &pagemark::stored_attr_name(name), value.to_string());
    dom.set_expando(node, name, processed);
}

// Attribute-backed descriptor: reads invert the stored-attribute
// substitution, writes go through the rewrite policy.
macro_rules! attr_descriptor {
    ($name:literal) => {
        Accessor {
            name: $name,
            condition: is_node,
            get: |rt, owner| match node_of(owner) {
                Some((win, node)) => dom::get_attribute(rt, win, node, $name)
                    .map(Value::Str)
                    .unwrap_or(Value::Undefined),
                None => Value::Undefined,
            },
            set: |rt, owner, value| {
                if let Some((win, node)) = node_of(owner) {
                    dom::set_attribute(rt, win, node, $name, &value_as_string(&value));
                }
                value
            },
        }
    };
}

// Style-property descriptor: writes route through the CSS rewriter, reads
// return the page's own value.  An untouched property reads as the empty
// string, like CSSStyleDeclaration.
macro_rules! style_descriptor {
    ($name:literal) => {
        Accessor {
            name: $name,
            condition: is_style,
            get: |rt, owner| match node_of_style(owner) {
                Some((win, node)) => {
                    let dom = &rt.win(win).dom;
                    dom.get_expando(node, &pagemark::stored_attr_name($name))
                        .or_else(|| dom.get_expando(node, $name))
                        .map(|v| Value::Str(v.to_string()))
                        .unwrap_or(Value::Str(String::new()))
                }
                None => Value::Undefined,
            },
            set: |rt, owner, value| {
                if let Some((win, node)) = node_of_style(owner) {
                    set_style_property(rt, win, node, $name, &value_as_string(&value));
                }
                value
            },
        }
    };
}

macro_rules! location_getter {
    ($name:literal, $func:path) => {
        Accessor {
            name: $name,
            condition: is_loc,
            get: |rt, owner| match value::owner_window(owner) {
                Some(win) => Value::Str($func(rt, win)),
                None => Value::Undefined,
            },
            set: |_, _, value| value,
        }
    };
    ($name:literal, $func:path, $set:path) => {
        Accessor {
            name: $name,
            condition: is_loc,
            get: |rt, owner| match value::owner_window(owner) {
                Some(win) => Value::Str($func(rt, win)),
                None => Value::Undefined,
            },
            set: |rt, owner, value| {
                if let Some(win) = value::owner_window(owner) {
                    $set(rt, win, &value_as_string(&value));
                }
                value
            },
        }
    };
}

fn build_registry() -> AccessorRegistry {
    let descriptors = vec![
        // url/security attributes on elements
        attr_descriptor!("src"),
        attr_descriptor!("action"),
        attr_descriptor!("target"),
        attr_descriptor!("sandbox"),
        attr_descriptor!("autocomplete"),
        // innerHTML
        Accessor {
            name: "innerHTML",
            condition: is_node,
            get: |rt, owner| match node_of(owner) {
                Some((win, node)) => Value::Str(dom::get_inner_html(rt, win, node)),
                None => Value::Undefined,
            },
            set: |rt, owner, value| {
                if let Some((win, node)) = node_of(owner) {
                    dom::set_inner_html(rt, win, node, &value_as_string(&value));
                }
                value
            },
        },
        // element style object; the declaration block lives in the style
        // attribute, so cssText rides the stored-attribute inversion
        Accessor {
            name: "style",
            condition: is_node,
            get: |_, owner| match node_of(owner) {
                Some((win, node)) => Value::Style(win, node),
                None => Value::Undefined,
            },
            set: |rt, owner, value| {
                // A string assigned to `style` replaces the declaration block.
                if let Some((win, node)) = node_of(owner) {
                    dom::set_attribute(rt, win, node, "style", &value_as_string(&value));
                }
                value
            },
        },
        Accessor {
            name: "cssText",
            condition: is_style,
            get: |rt, owner| match node_of_style(owner) {
                Some((win, node)) => Value::Str(
                    dom::get_attribute(rt, win, node, "style").unwrap_or_default(),
                ),
                None => Value::Undefined,
            },
            set: |rt, owner, value| {
                if let Some((win, node)) = node_of_style(owner) {
                    dom::set_attribute(rt, win, node, "style", &value_as_string(&value));
                }
                value
            },
        },
        style_descriptor!("background"),
        style_descriptor!("backgroundImage"),
        style_descriptor!("borderImage"),
        style_descriptor!("cursor"),
        style_descriptor!("listStyle"),
        style_descriptor!("listStyleImage"),
        // file-input virtualization
        Accessor {
            name: "value",
            condition: is_file_input,
            get: |rt, owner| match node_of(owner) {
                Some((win, node)) => Value::Str(upload::get_value(rt, win, node)),
                None => Value::Undefined,
            },
            set: |_, _, value| value,
        },
        Accessor {
            name: "files",
            condition: is_file_input,
            get: |rt, owner| match node_of(owner) {
                Some((win, node)) => Value::List(
                    upload::get_files(rt, win, node)
                        .into_iter()
                        .map(|f| Value::Str(f.name))
                        .collect(),
                ),
                None => Value::Undefined,
            },
            set: |_, _, value| value,
        },
        // document
        Accessor {
            name: "cookie",
            condition: is_doc,
            get: |rt, owner| match value::owner_window(owner) {
                Some(win) => Value::Str(rt.win(win).cookie.clone()),
                None => Value::Undefined,
            },
            set: |rt, owner, value| {
                if let Some(win) = value::owner_window(owner) {
                    rt.win_mut(win).cookie = value_as_string(&value);
                }
                value
            },
        },
        Accessor {
            name: "activeElement",
            condition: is_doc,
            get: |rt, owner| match value::owner_window(owner) {
                Some(win) => rt
                    .win(win)
                    .active_element
                    .map(|node| Value::Node(win, node))
                    .unwrap_or(Value::Null),
                None => Value::Undefined,
            },
            set: |_, _, value| value,
        },
        Accessor {
            name: "domain",
            condition: is_doc,
            get: |rt, owner| match value::owner_window(owner) {
                Some(win) => Value::Str(location::hostname(rt, win)),
                None => Value::Undefined,
            },
            set: |_, _, value| value,
        },
        // window/document location
        Accessor {
            name: "location",
            condition: is_window_or_doc,
            get: |_, owner| match value::owner_window(owner) {
                Some(win) => Value::Location(win),
                None => Value::Undefined,
            },
            set: |rt, owner, value| {
                if let Some(win) = value::owner_window(owner) {
                    location::set_href(rt, win, &value_as_string(&value));
                }
                value
            },
        },
        // location wrapper surface
        location_getter!("origin", location::origin),
        location_getter!("protocol", location::protocol),
        location_getter!("host", location::host),
        location_getter!("hostname", location::hostname),
        location_getter!("port", location::port),
        location_getter!("pathname", location::pathname),
        location_getter!("search", location::search, location::set_search),
        location_getter!("hash", location::hash, location::set_hash),
    ];

    let mut entries: HashMap<&'static str, Accessor> = HashMap::new();
    for descriptor in descriptors {
        entries.insert(descriptor.name, descriptor);
    }
    // href serves both anchors and the location wrapper; one entry that
    // branches on the owner shape keeps the table keyed by name.
    entries.insert(
        "href",
        Accessor {
            name: "href",
            condition: |rt, owner| is_node(rt, owner) || is_loc(rt, owner),
            get: |rt, owner| {
                if let Some((win, node)) = node_of(owner) {
                    return dom::get_attribute(rt, win, node, "href")
                        .map(Value::Str)
                        .unwrap_or(Value::Undefined);
                }
                match value::owner_window(owner) {
                    Some(win) => Value::Str(location::href(rt, win)),
                    None => Value::Undefined,
                }
            },
            set: |rt, owner, value| {
                if let Some((win, node)) = node_of(owner) {
                    dom::set_attribute(rt, win, node, "href", &value_as_string(&value));
                } else if let Some(win) = value::owner_window(owner) {
                    location::set_href(rt, win, &value_as_string(&value));
                }
                value
            },
        },
    );

    AccessorRegistry { entries }
}

// ---------------------------------------------------------------------------
// The six dispatch functions
// ---------------------------------------------------------------------------

/// get-property dispatch.
pub fn get_prop(rt: &mut Runtime, owner: &Value, name: &str) -> Result<Value, BridgeError> {
    if owner.is_nullish() {
        return Err(BridgeError::ReadOfNullish {
            kind: nullish_kind(owner),
            name: name.to_string(),
        });
    }
    if let Some(descriptor) = registry().lookup(name) {
        if (descriptor.condition)(rt, owner) {
            return Ok((descriptor.get)(rt, owner));
        }
    }
    Ok(native_get(rt, owner, name))
}

/// set-property dispatch.  Returns the assigned value, as the rewritten
/// assignment expression must still evaluate to it.
pub fn set_prop(
    rt: &mut Runtime,
    owner: &Value,
    name: &str,
    value: Value,
) -> Result<Value, BridgeError> {
    if owner.is_nullish() {
        return Err(BridgeError::SetOfNullish {
            kind: nullish_kind(owner),
            name: name.to_string(),
        });
    }
    if let Some(descriptor) = registry().lookup(name) {
        if (descriptor.condition)(rt, owner) {
            return Ok((descriptor.set)(rt, owner, value));
        }
    }
    Ok(native_set(rt, owner, name, value))
}

/// call-method dispatch: the wrapped set is handled here, everything else
/// is the embedder's native call.
pub fn call_method(
    rt: &mut Runtime,
    owner: &Value,
    name: &str,
    args: Vec<Value>,
) -> Result<CallOutcome, BridgeError> {
    if owner.is_nullish() {
        return Err(BridgeError::ReadOfNullish {
            kind: nullish_kind(owner),
            name: name.to_string(),
        });
    }
    match name {
        "postMessage" if value::is_window(owner) => {
            let to = match value::owner_window(owner) {
                Some(win) => win,
                None => return Ok(CallOutcome::Native),
            };
            let data = args.first().map(value_to_json).unwrap_or(serde_json::Value::Null);
            let target_origin = args
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("*")
                .to_string();
            let from = rt.active_window;
            message::post_message(rt, from, to, data, &target_origin);
            Ok(CallOutcome::Handled(Value::Undefined))
        }
        "write" | "writeln" if value::is_document(owner) => {
            let win = match value::owner_window(owner) {
                Some(win) => win,
                None => return Ok(CallOutcome::Native),
            };
            doc_write::write(rt, win, args, name == "writeln");
            Ok(CallOutcome::Handled(Value::Undefined))
        }
        _ => Ok(CallOutcome::Native),
    }
}

/// get-location: anything already carrying the wrapper marker stays as is,
/// windows and documents yield their wrapper; other values pass through
/// untouched (the page may shadow `location`).
pub fn get_loc(_rt: &Runtime, value: &Value) -> Value {
    if value::is_location(value) {
        return value.clone();
    }
    match value::owner_window(value) {
        Some(win) if value::is_window(value) || value::is_document(value) => Value::Location(win),
        _ => value.clone(),
    }
}

/// set-location: true when the wrapper consumed the write; false tells the
/// generated code to fall back to the real assignment.
pub fn set_loc(rt: &mut Runtime, target: &Value, new_value: &Value) -> bool {
    let win = match target {
        Value::Location(win) => *win,
        _ => return false,
    };
    match new_value {
        Value::Str(url) => {
            location::set_href(rt, win, url);
            true
        }
        _ => false,
    }
}

/// process-script: no-op for non-strings, otherwise the transformer runs
/// synchronously on the dynamic code.
pub fn process_script(value: &Value) -> Value {
    match value {
        Value::Str(source) => Value::Str(transform::process(source, false)),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Native fallbacks
// ---------------------------------------------------------------------------

// The unwrapped read: element attributes and expandos model `owner[name]`.
fn native_get(rt: &mut Runtime, owner: &Value, name: &str) -> Value {
    match node_of(owner) {
        Some((win, node)) => {
            if let Some(expando) = rt.win(win).dom.get_expando(node, name) {
                return Value::Str(expando.to_string());
            }
            rt.win(win)
                .dom
                .get_attribute(node, name)
                .map(|v| Value::Str(v.to_string()))
                .unwrap_or(Value::Undefined)
        }
        None => Value::Undefined,
    }
}

fn native_set(rt: &mut Runtime, owner: &Value, name: &str, value: Value) -> Value {
    if let Some((win, node)) = node_of(owner) {
        rt.win_mut(win)
            .dom
            .set_expando(node, name, value_as_string(&value));
    }
    value
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Undefined | Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        _ => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sandbox::dom::{append_child, create_element, native_get_attribute};
    use crate::runtime::test_support::*;
    use crate::transform::is_script_processed;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn nullish_owner_errors_use_native_wording() {
        let mut rt = test_runtime();
        let err = get_prop(&mut rt, &Value::Null, "href").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot read properties of null (reading 'href')"
        );
        let err = set_prop(&mut rt, &Value::Undefined, "src", Value::Str("x".into())).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot set properties of undefined (setting 'src')"
        );
    }

    #[test]
    fn window_location_yields_the_wrapper() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let loc = get_prop(&mut rt, &Value::Window(win), "location").unwrap();
        assert!(value::is_location(&loc));
        let href = get_prop(&mut rt, &loc, "href").unwrap();
        assert_eq!(href, Value::Str("https://example.com/page.html".into()));
        let origin = get_prop(&mut rt, &loc, "origin").unwrap();
        assert_eq!(origin, Value::Str("https://example.com".into()));
    }

    #[test]
    fn location_href_write_proxies() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let loc = Value::Location(win);
        set_prop(&mut rt, &loc, "href", Value::Str("/next".into())).unwrap();
        assert!(rt.win(win).location.contains("owner!job/"));
        assert_eq!(
            get_prop(&mut rt, &loc, "href").unwrap(),
            Value::Str("https://example.com/next".into())
        );
    }

    #[test]
    fn element_src_goes_through_rewrite_policy() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let img = create_element(&mut rt, win, "img");
        append_child(&mut rt, win, body, img);
        let owner = Value::Node(win, img);

        set_prop(&mut rt, &owner, "src", Value::Str("https://example.com/p.png".into())).unwrap();
        let native = native_get_attribute(&rt, win, img, "src").unwrap();
        assert!(native.contains("owner!job"));
        assert_eq!(
            get_prop(&mut rt, &owner, "src").unwrap(),
            Value::Str("https://example.com/p.png".into())
        );
    }

    #[test]
    fn unwrapped_property_uses_native_path() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let owner = Value::Node(win, body);
        set_prop(&mut rt, &owner, "customProp", Value::Str("x".into())).unwrap();
        assert_eq!(
            get_prop(&mut rt, &owner, "customProp").unwrap(),
            Value::Str("x".into())
        );
    }

    #[test]
    fn cookie_virtualized_per_window() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let doc = Value::Document(win);
        set_prop(&mut rt, &doc, "cookie", Value::Str("a=1".into())).unwrap();
        assert_eq!(get_prop(&mut rt, &doc, "cookie").unwrap(), Value::Str("a=1".into()));
    }

    #[test]
    fn inner_html_bridge_rewrites_urls() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let owner = Value::Node(win, body);
        set_prop(
            &mut rt,
            &owner,
            "innerHTML",
            Value::Str(r#"<img src="https://example.com/x.png">"#.into()),
        )
        .unwrap();
        let read_back = get_prop(&mut rt, &owner, "innerHTML").unwrap();
        let html = read_back.as_str().unwrap();
        assert!(html.contains("https://example.com/x.png"));
        assert!(!html.contains("owner!job"));
    }

    #[test]
    fn style_reads_yield_the_style_object() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let style = get_prop(&mut rt, &Value::Node(win, body), "style").unwrap();
        assert!(value::is_style(&style));
        assert_eq!(style.to_display_string(), "[object CSSStyleDeclaration]");
    }

    #[test]
    fn css_text_write_goes_through_style_rewriter() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let div = create_element(&mut rt, win, "div");
        append_child(&mut rt, win, body, div);
        let style = get_prop(&mut rt, &Value::Node(win, div), "style").unwrap();

        let css = "background: url(https://example.com/bg.png)";
        set_prop(&mut rt, &style, "cssText", Value::Str(css.into())).unwrap();

        let native = native_get_attribute(&rt, win, div, "style").unwrap();
        assert!(native.contains("/owner!job/https://example.com/bg.png"));
        assert_eq!(
            get_prop(&mut rt, &style, "cssText").unwrap(),
            Value::Str(css.into())
        );
    }

    #[test]
    fn style_property_write_proxies_urls_but_reads_back_raw() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let style = get_prop(&mut rt, &Value::Node(win, body), "style").unwrap();

        let value = "url(https://example.com/bg.png) no-repeat";
        set_prop(&mut rt, &style, "backgroundImage", Value::Str(value.into())).unwrap();

        assert_eq!(
            get_prop(&mut rt, &style, "backgroundImage").unwrap(),
            Value::Str(value.into())
        );
        let live = rt.win(win).dom.get_expando(body, "backgroundImage").unwrap();
        assert!(live.contains("/owner!job/https://example.com/bg.png"));
        // untouched properties read as empty, like CSSStyleDeclaration
        assert_eq!(
            get_prop(&mut rt, &style, "cursor").unwrap(),
            Value::Str(String::new())
        );
    }

    #[test]
    fn post_message_routes_through_message_sandbox() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let seen = Rc::new(RefCell::new(0));
        {
            let seen = seen.clone();
            rt.win_mut(win).onmessage = Some(Rc::new(move |_, _| *seen.borrow_mut() += 1));
        }
        let outcome = call_method(
            &mut rt,
            &Value::Window(win),
            "postMessage",
            vec![Value::Str("hello".into()), Value::Str("*".into())],
        )
        .unwrap();
        assert_eq!(outcome, CallOutcome::Handled(Value::Undefined));
        rt.run_until_idle();
        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn document_write_routes_through_write_buffer() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        call_method(
            &mut rt,
            &Value::Document(win),
            "write",
            vec![Value::Str("<b>x</b>".into())],
        )
        .unwrap();
        assert_eq!(rt.win(win).dom.elements_by_tag(body, "b").len(), 1);
    }

    #[test]
    fn unwrapped_method_is_native() {
        let (mut rt, body) = test_runtime_with_body();
        let win = rt.top_window();
        let outcome =
            call_method(&mut rt, &Value::Node(win, body), "getBoundingClientRect", vec![])
                .unwrap();
        assert_eq!(outcome, CallOutcome::Native);
    }

    #[test]
    fn get_loc_and_set_loc_pair() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let loc = get_loc(&rt, &Value::Window(win));
        assert!(value::is_location(&loc));
        // Shadowed locals pass through.
        let shadow = Value::Str("not-a-location".into());
        assert_eq!(get_loc(&rt, &shadow), shadow);

        assert!(set_loc(&mut rt, &loc, &Value::Str("/next".into())));
        assert!(!set_loc(&mut rt, &shadow, &Value::Str("/next".into())));
        assert!(rt.win(win).location.ends_with("/next"));
    }

    #[test]
    fn process_script_transforms_strings_only() {
        let out = process_script(&Value::Str("var a = obj.href;".into()));
        assert!(is_script_processed(out.as_str().unwrap()));
        let n = Value::Number(5.0);
        assert_eq!(process_script(&n), n);
    }

    #[test]
    fn post_message_structured_payload_survives() {
        let mut rt = test_runtime();
        let win = rt.top_window();
        let seen = Rc::new(RefCell::new(json!(null)));
        {
            let seen = seen.clone();
            rt.win_mut(win).onmessage =
                Some(Rc::new(move |_, ev| *seen.borrow_mut() = ev.data.clone()));
        }
        call_method(
            &mut rt,
            &Value::Window(win),
            "postMessage",
            vec![
                Value::List(vec![Value::Number(1.0), Value::Str("two".into())]),
                Value::Str("*".into()),
            ],
        )
        .unwrap();
        rt.run_until_idle();
        assert_eq!(*seen.borrow(), json!([1.0, "two"]));
    }
}
