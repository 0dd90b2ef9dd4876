// retrace_interceptor::runtime::value
//
// The value model crossing the instrumentation bridge.  Page-observable
// values are plain data; DOM objects are handles into a window's arena.
//
// Type checks are duck-typing predicates, never variant identity alone:
// objects can originate from another realm (an iframe's window), so the
// original system could not rely on `instanceof` and neither does the
// wrapper contract here.

use crate::runtime::dom::NodeId;
use crate::runtime::WindowId;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    List(Vec<Value>),
    /// An element or text node inside a window's DOM.
    Node(WindowId, NodeId),
    Window(WindowId),
    Document(WindowId),
    /// The location wrapper.  Identity is this marker variant, checked via
    /// [`is_location`], never via pointer identity.
    Location(WindowId),
    /// A CSS style object owned by an element.
    Style(WindowId, NodeId),
}

impl Value {
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    /// JS truthiness.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Value::Str(s) => s.clone(),
            Value::List(items) => items
                .iter()
                .map(Value::to_display_string)
                .collect::<Vec<_>>()
                .join(","),
            Value::Node(..) => "[object Node]".to_string(),
            Value::Window(_) => "[object Window]".to_string(),
            Value::Document(_) => "[object Document]".to_string(),
            Value::Location(_) => "[object Location]".to_string(),
            Value::Style(..) => "[object CSSStyleDeclaration]".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Duck-typing predicates
// ---------------------------------------------------------------------------

/// "Has a `.top`" — the capability that defines window-ness.
pub fn is_window(value: &Value) -> bool {
    matches!(value, Value::Window(_))
}

pub fn is_document(value: &Value) -> bool {
    matches!(value, Value::Document(_))
}

/// Location wrappers carry the internal marker variant; real `Location`
/// objects from any realm never reach this layer unwrapped.
pub fn is_location(value: &Value) -> bool {
    matches!(value, Value::Location(_))
}

pub fn is_style(value: &Value) -> bool {
    matches!(value, Value::Style(..))
}

pub fn is_dom_node(value: &Value) -> bool {
    matches!(value, Value::Node(..))
}

/// Window the value belongs to, when it belongs to one.
pub fn owner_window(value: &Value) -> Option<WindowId> {
    match value {
        Value::Node(win, _)
        | Value::Window(win)
        | Value::Document(win)
        | Value::Location(win)
        | Value::Style(win, _) => Some(*win),
        _ => None,
    }
}
