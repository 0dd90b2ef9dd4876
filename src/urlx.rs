// retrace_interceptor::urlx
//
// URL/Location virtualizer.  Maps real resource URLs to and from proxy URLs.
// Every URL crossing the interception boundary is either a valid proxy URL
// or explicitly excluded (javascript:, data:, blob:, mailto:, about:, …).
//
// Proxy URL layout:
//
//   scheme://proxyHost:proxyPort/{ownerToken}!{jobUid}[!{resourceType}]/{originUrl}
//
// The origin URL keeps its own scheme and a lowercased host, so decoding is
// a pure string split on the job-info path segment.

use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use thiserror::Error;
use url::Url;

use crate::settings::ProxySettings;

/// Characters that would corrupt the job-info path segment: the separator,
/// the segment terminator, and anything a URL parser would eat.
const JOB_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'!')
    .add(b'/')
    .add(b'?')
    .add(b'#')
    .add(b'%');

/// Resource-type tag attached to a proxy URL.  Influences how both ends
/// treat the fetched resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Iframe,
    Script,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Iframe => "iframe",
            ResourceType::Script => "script",
        }
    }

    pub fn parse(s: &str) -> Option<ResourceType> {
        match s {
            "iframe" => Some(ResourceType::Iframe),
            "script" => Some(ResourceType::Script),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session/job identifiers carried in the proxy URL path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub owner_token: String,
    pub uid: String,
}

/// Parsed pieces of the original (un-proxied) resource URL, in the shape the
/// location wrapper exposes.  Kept as plain strings because the values are
/// handed straight back to page code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginInfo {
    /// Scheme with trailing colon, e.g. `"https:"`.
    pub protocol: String,
    /// Lowercased host name without port.
    pub hostname: String,
    /// Port as written, empty when the URL carries none.
    pub port: String,
    /// `hostname[:port]`.
    pub host: String,
    /// Path starting with `/`.
    pub pathname: String,
    /// Query including the leading `?`, or empty.
    pub search: String,
    /// Fragment including the leading `#`, or empty.
    pub hash: String,
}

impl OriginInfo {
    /// `protocol + "//" + host` — the origin the page believes it runs on.
    pub fn origin(&self) -> String {
        format!("{}//{}", self.protocol, self.host)
    }

    pub fn href(&self) -> String {
        format!(
            "{}//{}{}{}{}",
            self.protocol, self.host, self.pathname, self.search, self.hash
        )
    }
}

/// Result of decoding a proxy URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedProxyUrl {
    pub origin_url: String,
    pub origin_resource_info: OriginInfo,
    pub job_info: JobInfo,
    pub resource_type: Option<ResourceType>,
}

#[derive(Debug, Error)]
pub enum UrlError {
    #[error("\"{0}\" is not a valid proxy URL")]
    NotAProxyUrl(String),
    #[error("cannot parse origin URL \"{0}\"")]
    BadOriginUrl(String),
}

/// Protocols that are never routed through the proxy.  Proxying them is
/// either unsafe or meaningless; they pass through untouched.
const UNSUPPORTED_PROTOCOLS: &[&str] = &[
    "javascript:",
    "data:",
    "blob:",
    "mailto:",
    "about:",
    "vbscript:",
    "file:",
    "chrome-extension:",
];

/// True when `url` uses a scheme the proxy can carry.
pub fn is_supported_protocol(url: &str) -> bool {
    let trimmed = url.trim();
    let lower = trimmed.to_ascii_lowercase();
    !UNSUPPORTED_PROTOCOLS.iter().any(|p| lower.starts_with(p))
}

/// Lowercase the host portion of an absolute URL, leaving the rest intact.
pub fn normalize_host(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => {
            if let Some(host) = parsed.host_str() {
                let lower = host.to_ascii_lowercase();
                if lower != host {
                    // url::Url already lowercases on parse; this branch only
                    // fires for inputs Url leaves alone.
                    return url.replacen(host, &lower, 1);
                }
            }
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// Resolve `raw` against `base`, returning `raw` unchanged when resolution
/// is impossible.
pub fn resolve_url(base: &str, raw: &str) -> String {
    match Url::parse(base) {
        Ok(base_url) => match base_url.join(raw) {
            Ok(full) => full.to_string(),
            Err(_) => raw.to_string(),
        },
        Err(_) => raw.to_string(),
    }
}

/// Wrap an origin URL into a proxy URL.
///
/// Unsupported protocols and values that are not absolute URLs come back
/// untouched — the caller must resolve relative URLs first.  Already-proxied
/// URLs are returned as-is so double wrapping cannot happen.
pub fn get_proxy_url(
    url: &str,
    settings: &ProxySettings,
    resource_type: Option<ResourceType>,
) -> String {
    let trimmed = url.trim();
    if trimmed.is_empty() || !is_supported_protocol(trimmed) {
        return trimmed.to_string();
    }
    if parse_proxy_url_with(trimmed, settings).is_ok() {
        return trimmed.to_string();
    }

    let absolute = if trimmed.starts_with("//") {
        format!("https:{}", trimmed)
    } else {
        trimmed.to_string()
    };
    let normalized = match Url::parse(&absolute) {
        Ok(_) => normalize_host(&absolute),
        Err(_) => return trimmed.to_string(),
    };

    let owner = utf8_percent_encode(&settings.owner_token, JOB_SEGMENT);
    let uid = utf8_percent_encode(&settings.job_uid, JOB_SEGMENT);
    let job_segment = match resource_type {
        Some(rt) => format!("{}!{}!{}", owner, uid, rt),
        None => format!("{}!{}", owner, uid),
    };

    format!("{}/{}/{}", settings.proxy_origin(), job_segment, normalized)
}

/// Decode a proxy URL produced by [`get_proxy_url`].
pub fn parse_proxy_url(url: &str) -> Result<ParsedProxyUrl, UrlError> {
    // Decoding is a raw string split so the embedded origin URL survives
    // byte-for-byte.  Shape after the authority:
    //   /{ownerToken}!{jobUid}[!{resourceType}]/{originUrl}
    let scheme_end = url
        .find("://")
        .ok_or_else(|| UrlError::NotAProxyUrl(url.to_string()))?;
    let authority = &url[scheme_end + 3..];
    let slash = authority
        .find('/')
        .ok_or_else(|| UrlError::NotAProxyUrl(url.to_string()))?;
    let after_host = &authority[slash + 1..];
    let seg_end = after_host
        .find('/')
        .ok_or_else(|| UrlError::NotAProxyUrl(url.to_string()))?;
    if !after_host[..seg_end].contains('!') {
        return Err(UrlError::NotAProxyUrl(url.to_string()));
    }
    let job_segment = &after_host[..seg_end];
    let origin_url = &after_host[seg_end + 1..];

    let mut parts = job_segment.split('!');
    let owner_token = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| UrlError::NotAProxyUrl(url.to_string()))?;
    let uid = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| UrlError::NotAProxyUrl(url.to_string()))?;
    let resource_type = match parts.next() {
        Some(tag) => Some(
            ResourceType::parse(tag).ok_or_else(|| UrlError::NotAProxyUrl(url.to_string()))?,
        ),
        None => None,
    };

    if !origin_url.contains("://") {
        return Err(UrlError::NotAProxyUrl(url.to_string()));
    }
    let origin_resource_info = parse_origin_url(origin_url)?;

    Ok(ParsedProxyUrl {
        origin_url: origin_url.to_string(),
        origin_resource_info,
        job_info: JobInfo {
            owner_token: percent_decode_str(owner_token).decode_utf8_lossy().into_owned(),
            uid: percent_decode_str(uid).decode_utf8_lossy().into_owned(),
        },
        resource_type,
    })
}

/// Like [`parse_proxy_url`] but also checks the URL actually points at the
/// proxy described by `settings`.
pub fn parse_proxy_url_with(
    url: &str,
    settings: &ProxySettings,
) -> Result<ParsedProxyUrl, UrlError> {
    let parsed = Url::parse(url).map_err(|_| UrlError::NotAProxyUrl(url.to_string()))?;
    let host_matches = parsed.host_str() == Some(settings.proxy_hostname.as_str())
        && parsed.port_or_known_default() == Some(settings.proxy_port);
    if !host_matches {
        return Err(UrlError::NotAProxyUrl(url.to_string()));
    }
    parse_proxy_url(url)
}

/// Break an absolute origin URL into the location-shaped pieces.
pub fn parse_origin_url(url: &str) -> Result<OriginInfo, UrlError> {
    let parsed = Url::parse(url).map_err(|_| UrlError::BadOriginUrl(url.to_string()))?;
    let hostname = parsed
        .host_str()
        .ok_or_else(|| UrlError::BadOriginUrl(url.to_string()))?
        .to_ascii_lowercase();
    let port = parsed.port().map(|p| p.to_string()).unwrap_or_default();
    let host = if port.is_empty() {
        hostname.clone()
    } else {
        format!("{}:{}", hostname, port)
    };
    Ok(OriginInfo {
        protocol: format!("{}:", parsed.scheme()),
        hostname,
        port,
        host,
        pathname: parsed.path().to_string(),
        search: parsed
            .query()
            .map(|q| format!("?{}", q))
            .unwrap_or_default(),
        hash: parsed
            .fragment()
            .map(|f| format!("#{}", f))
            .unwrap_or_default(),
    })
}

/// Convert a proxy URL back to its origin URL, passing through anything that
/// is not a proxy URL.
pub fn to_origin_url(url: &str) -> String {
    match parse_proxy_url(url) {
        Ok(parsed) => parsed.origin_url,
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ProxySettings {
        ProxySettings::new("localhost", 1337, "ownerToken", "jobUid")
    }

    #[test]
    fn wraps_absolute_url() {
        let proxied = get_proxy_url("https://Example.com/page?q=1", &settings(), None);
        assert_eq!(
            proxied,
            "http://localhost:1337/ownerToken!jobUid/https://example.com/page?q=1"
        );
    }

    #[test]
    fn resource_type_tag_present() {
        let proxied = get_proxy_url(
            "https://example.com/app.js",
            &settings(),
            Some(ResourceType::Script),
        );
        assert!(proxied.contains("/ownerToken!jobUid!script/"));
    }

    #[test]
    fn round_trip() {
        let origin = "https://example.com/path?q=1";
        let proxied = get_proxy_url(origin, &settings(), Some(ResourceType::Iframe));
        let parsed = parse_proxy_url(&proxied).unwrap();
        assert_eq!(parsed.origin_url, normalize_host(origin));
        assert_eq!(parsed.job_info.owner_token, "ownerToken");
        assert_eq!(parsed.job_info.uid, "jobUid");
        assert_eq!(parsed.resource_type, Some(ResourceType::Iframe));
        assert_eq!(parsed.origin_resource_info.host, "example.com");
    }

    #[test]
    fn job_tokens_with_reserved_characters_round_trip() {
        let settings = ProxySettings::new("localhost", 1337, "owner/team!a", "job 7");
        let proxied = get_proxy_url("https://example.com/", &settings, None);
        assert!(proxied.contains("owner%2Fteam%21a!job%207/"));
        let parsed = parse_proxy_url(&proxied).unwrap();
        assert_eq!(parsed.job_info.owner_token, "owner/team!a");
        assert_eq!(parsed.job_info.uid, "job 7");
    }

    #[test]
    fn unsupported_protocols_pass_through() {
        for u in [
            "javascript:void(0)",
            "data:text/html,<h1>hi</h1>",
            "mailto:dev@example.com",
            "about:blank",
            "blob:https://example.com/abc",
        ] {
            assert_eq!(get_proxy_url(u, &settings(), None), u);
        }
    }

    #[test]
    fn already_proxied_not_rewrapped() {
        let once = get_proxy_url("https://example.com/", &settings(), None);
        let twice = get_proxy_url(&once, &settings(), None);
        assert_eq!(once, twice);
    }

    #[test]
    fn protocol_relative_assumed_https() {
        let proxied = get_proxy_url("//cdn.example.com/lib.js", &settings(), None);
        assert!(proxied.contains("/https://cdn.example.com/lib.js"));
    }

    #[test]
    fn parse_rejects_plain_urls() {
        assert!(parse_proxy_url("https://example.com/no-job-info").is_err());
    }

    #[test]
    fn origin_info_fields() {
        let info = parse_origin_url("https://example.com:8443/a/b?x=1#frag").unwrap();
        assert_eq!(info.protocol, "https:");
        assert_eq!(info.host, "example.com:8443");
        assert_eq!(info.hostname, "example.com");
        assert_eq!(info.port, "8443");
        assert_eq!(info.pathname, "/a/b");
        assert_eq!(info.search, "?x=1");
        assert_eq!(info.hash, "#frag");
        assert_eq!(info.origin(), "https://example.com:8443");
    }

    #[test]
    fn resolve_relative_against_base() {
        assert_eq!(
            resolve_url("https://example.com/dir/page.html", "../img.png"),
            "https://example.com/img.png"
        );
    }

    #[test]
    fn to_origin_url_passes_through_non_proxy() {
        assert_eq!(to_origin_url("https://example.com/"), "https://example.com/");
    }
}
