// retrace_interceptor
//
// Interception layer for the Retrace recording/replay proxy: the AST-based
// script transformer, the page/style rewriters, and the client-runtime
// model with its sandboxes.
//
// The crate is compiled as a `cdylib` so the proxy server can call the
// rewriters via FFI.
//
// Exposed functions:
//   process_script(input: *const c_char) -> *mut c_char
//   process_page(input: *const c_char) -> *mut c_char
//   process_stylesheet(input: *const c_char) -> *mut c_char
//
// Input is a JSON-encoded envelope:
//   { "settings": { "proxy_hostname": "…", "proxy_port": 1337,
//                   "owner_token": "…", "job_uid": "…" },
//     "base_url": "…", "content": "…" }
//
// Return value is a NUL-terminated C string allocated with CString.
// The caller MUST free it by calling `free_string`.

pub mod pagemark;
pub mod runtime;
pub mod settings;
pub mod styles;
pub mod transform;
pub mod urlx;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use serde::Deserialize;

use settings::ProxySettings;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    settings: ProxySettings,
    #[serde(default)]
    base_url: String,
    content: String,
}

fn parse_input(json: &str) -> Option<Envelope> {
    serde_json::from_str(json).ok()
}

/// Convert a Rust String into a heap-allocated C string.
fn to_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Read a `*const c_char` into a `&str`.  Returns `None` on null or invalid
/// UTF-8.
unsafe fn read_c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

// ---------------------------------------------------------------------------
// C ABI exports
// ---------------------------------------------------------------------------

/// Instrument a JavaScript source.
///
/// Returns the transformed source, or null on error.  Inputs that fail to
/// parse come back unchanged by contract, never as an error.
#[no_mangle]
pub unsafe extern "C" fn process_script(input: *const c_char) -> *mut c_char {
    let json = match read_c_str(input) {
        Some(s) => s,
        None => return ptr::null_mut(),
    };
    let envelope = match parse_input(json) {
        Some(e) => e,
        None => return ptr::null_mut(),
    };

    to_c_string(transform::process(&envelope.content, false))
}

/// Rewrite an HTML fragment: URL attributes proxied, inline scripts
/// instrumented, inline styles rewritten.
#[no_mangle]
pub unsafe extern "C" fn process_page(input: *const c_char) -> *mut c_char {
    let json = match read_c_str(input) {
        Some(s) => s,
        None => return ptr::null_mut(),
    };
    let envelope = match parse_input(json) {
        Some(e) => e,
        None => return ptr::null_mut(),
    };

    let result = pagemark::process_html(&envelope.settings, &envelope.base_url, &envelope.content);
    to_c_string(result)
}

/// Rewrite a CSS stylesheet / fragment.
#[no_mangle]
pub unsafe extern "C" fn process_stylesheet(input: *const c_char) -> *mut c_char {
    let json = match read_c_str(input) {
        Some(s) => s,
        None => return ptr::null_mut(),
    };
    let envelope = match parse_input(json) {
        Some(e) => e,
        None => return ptr::null_mut(),
    };

    let result = styles::process_style(&envelope.settings, &envelope.base_url, &envelope.content);
    to_c_string(result)
}

/// Free a C string previously returned by one of the process_* functions.
///
/// The caller MUST use this, never its own allocator.
#[no_mangle]
pub unsafe extern "C" fn free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        let _ = CString::from_raw(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_with_default_base() {
        let envelope = parse_input(
            r#"{"settings":{"proxy_hostname":"localhost","proxy_port":1337,
                "owner_token":"owner","job_uid":"job"},
                "content":"var a = 1;"}"#,
        )
        .unwrap();
        assert_eq!(envelope.settings.proxy_hostname, "localhost");
        assert!(envelope.base_url.is_empty());
        assert_eq!(envelope.content, "var a = 1;");
    }

    #[test]
    fn bad_envelope_is_rejected() {
        assert!(parse_input("not json").is_none());
        assert!(parse_input(r#"{"content":"x"}"#).is_none());
    }
}
