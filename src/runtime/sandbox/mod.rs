// retrace_interceptor::runtime::sandbox
//
// The interception sandboxes.  Each one wraps a slice of the platform
// surface: DOM mutation, document.write, events, iframes, cross-window
// messaging, uploads, and the service-message transport.  They share state
// through `Runtime` and talk to each other via notifications only.

pub mod doc_write;
pub mod dom;
pub mod event;
pub mod focus_blur;
pub mod iframe;
pub mod message;
pub mod shadow_ui;
pub mod simulator;
pub mod transport;
pub mod upload;
