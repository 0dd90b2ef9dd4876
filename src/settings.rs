// retrace_interceptor::settings
//
// Explicitly constructed proxy/session context.  Every component receives a
// reference to this struct instead of reading module-level state; the
// embedding server builds one per proxied session and threads it through the
// FFI envelope.

use serde::{Deserialize, Serialize};

/// Per-session proxy parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Hostname of the intercepting proxy, e.g. `"localhost"`.
    pub proxy_hostname: String,
    /// Port of the intercepting proxy.
    pub proxy_port: u16,
    /// Scheme the proxy is served over (`"http"` or `"https"`).
    #[serde(default = "default_scheme")]
    pub proxy_scheme: String,
    /// Token identifying the session owner.
    pub owner_token: String,
    /// Uid of the recording/replay job this page belongs to.
    pub job_uid: String,
}

fn default_scheme() -> String {
    "http".to_string()
}

impl ProxySettings {
    pub fn new(
        proxy_hostname: impl Into<String>,
        proxy_port: u16,
        owner_token: impl Into<String>,
        job_uid: impl Into<String>,
    ) -> Self {
        ProxySettings {
            proxy_hostname: proxy_hostname.into(),
            proxy_port,
            proxy_scheme: default_scheme(),
            owner_token: owner_token.into(),
            job_uid: job_uid.into(),
        }
    }

    /// Origin of the proxy itself, e.g. `"http://localhost:1337"`.
    pub fn proxy_origin(&self) -> String {
        format!(
            "{}://{}:{}",
            self.proxy_scheme, self.proxy_hostname, self.proxy_port
        )
    }

    /// `host:port` authority of the proxy.
    pub fn proxy_host(&self) -> String {
        format!("{}:{}", self.proxy_hostname, self.proxy_port)
    }

    /// Endpoint service messages are POSTed to.
    pub fn service_msg_url(&self) -> String {
        format!("{}/messaging", self.proxy_origin())
    }
}
