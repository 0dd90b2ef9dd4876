// retrace_interceptor::runtime::location
//
// The location wrapper.  Page code never touches the real (proxied)
// location: reads come back as the origin URL, writes are translated to
// proxy URLs before they hit the engine.  `origin` is synthesized from the
// origin resource info carried inside the proxy URL, never from the proxy
// host.

use log::debug;

use crate::runtime::{Runtime, WindowId};
use crate::urlx::{
    self, get_proxy_url, parse_origin_url, resolve_url, to_origin_url, OriginInfo, ResourceType,
};

fn origin_info(rt: &Runtime, win: WindowId) -> Option<OriginInfo> {
    parse_origin_url(&to_origin_url(&rt.win(win).location)).ok()
}

/// href is the un-proxied URL; about:blank stays about:blank.
pub fn href(rt: &Runtime, win: WindowId) -> String {
    let origin_url = to_origin_url(&rt.win(win).location);
    if origin_url.eq_ignore_ascii_case("about:blank") {
        return origin_url;
    }
    origin_url
}

pub fn to_string(rt: &Runtime, win: WindowId) -> String {
    href(rt, win)
}

pub fn origin(rt: &Runtime, win: WindowId) -> String {
    origin_info(rt, win)
        .map(|info| info.origin())
        .unwrap_or_default()
}

pub fn protocol(rt: &Runtime, win: WindowId) -> String {
    origin_info(rt, win).map(|i| i.protocol).unwrap_or_default()
}

pub fn host(rt: &Runtime, win: WindowId) -> String {
    origin_info(rt, win).map(|i| i.host).unwrap_or_default()
}

pub fn hostname(rt: &Runtime, win: WindowId) -> String {
    origin_info(rt, win).map(|i| i.hostname).unwrap_or_default()
}

pub fn port(rt: &Runtime, win: WindowId) -> String {
    origin_info(rt, win).map(|i| i.port).unwrap_or_default()
}

pub fn pathname(rt: &Runtime, win: WindowId) -> String {
    origin_info(rt, win).map(|i| i.pathname).unwrap_or_default()
}

pub fn search(rt: &Runtime, win: WindowId) -> String {
    origin_info(rt, win).map(|i| i.search).unwrap_or_default()
}

pub fn hash(rt: &Runtime, win: WindowId) -> String {
    origin_info(rt, win).map(|i| i.hash).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Navigation
// ---------------------------------------------------------------------------

/// Iframe windows get the iframe resource marker so the server rewrites
/// the response for frame consumption; the top window gets none.
fn resource_type_for(rt: &Runtime, win: WindowId) -> Option<ResourceType> {
    if rt.is_top(win) {
        None
    } else {
        Some(ResourceType::Iframe)
    }
}

/// Resolve a page-supplied URL against the current origin document and
/// write the proxied form to the real location.
pub fn set_href(rt: &mut Runtime, win: WindowId, value: &str) {
    let value = value.trim();
    if !urlx::is_supported_protocol(value) {
        // javascript: and friends keep engine semantics.
        debug!("location write with unsupported protocol left alone: {value}");
        return;
    }
    let base = to_origin_url(&rt.win(win).location);
    let resolved = resolve_url(&base, value);
    let settings = rt.settings.clone();
    let proxied = get_proxy_url(&resolved, &settings, resource_type_for(rt, win));
    debug!("navigating window {:?} to {proxied}", win);
    rt.win_mut(win).location = proxied;
}

pub fn assign(rt: &mut Runtime, win: WindowId, value: &str) {
    set_href(rt, win, value);
}

/// replace navigates without a history entry; history is not modelled, so
/// it differs from assign only in intent.
pub fn replace(rt: &mut Runtime, win: WindowId, value: &str) {
    set_href(rt, win, value);
}

pub fn reload(rt: &mut Runtime, win: WindowId) {
    let current = href(rt, win);
    set_href(rt, win, &current);
}

pub fn set_search(rt: &mut Runtime, win: WindowId, value: &str) {
    let mut info = match origin_info(rt, win) {
        Some(info) => info,
        None => return,
    };
    info.search = if value.is_empty() || value.starts_with('?') {
        value.to_string()
    } else {
        format!("?{value}")
    };
    let target = info.href();
    set_href(rt, win, &target);
}

pub fn set_hash(rt: &mut Runtime, win: WindowId, value: &str) {
    let mut info = match origin_info(rt, win) {
        Some(info) => info,
        None => return,
    };
    info.hash = if value.is_empty() || value.starts_with('#') {
        value.to_string()
    } else {
        format!("#{value}")
    };
    let target = info.href();
    set_href(rt, win, &target);
}
