// retrace_interceptor::runtime::sandbox::transport
//
// Service-message transport.  Messages go out over the worker protocol
// when the channel is up; failed deliveries land in a durable
// localStorage-modelled queue and are replayed on the next page load via
// batch_update.  The queue is read-modified-written inside one synchronous
// call so reentrant script (nested document.write) can never observe or
// produce a lost update.

use std::collections::HashMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::ProxySettings;

const QUEUE_STORAGE_KEY: &str = "retrace|service-msg-queue";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("service message {0:?} rejected by transport")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMsg {
    pub cmd: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// When set, a delivery failure surfaces to the caller instead of
    /// being parked in the durable queue.
    #[serde(rename = "allowRejecting", default)]
    pub allow_rejecting: bool,
}

impl ServiceMsg {
    pub fn new(cmd: &str, data: serde_json::Value) -> Self {
        ServiceMsg {
            cmd: cmd.to_string(),
            data,
            allow_rejecting: false,
        }
    }
}

// ---- worker protocol ------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum WorkerCommand {
    #[serde(rename = "SET_INITIAL_WORKER_SETTINGS")]
    SetInitialSettings {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "serviceMsgUrl")]
        service_msg_url: String,
    },
    /// Port handoff for nested frames sharing the top window's channel.
    #[serde(rename = "HANDLE_PORT")]
    HandlePort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: i64,
    pub queued: bool,
    pub msg: ServiceMsg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: i64,
    pub result: WorkerResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub err: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

// ---- transport ------------------------------------------------------------

pub struct Transport {
    next_msg_id: i64,
    /// Requests that reached the wire, in send order.
    pub sent: Vec<WorkerRequest>,
    /// The durable key/value store backing the retry queue.
    storage: HashMap<String, String>,
    /// Fault knob modelling the XHR delivery failure classes.
    pub delivery_fails: bool,
}

impl Transport {
    pub fn new() -> Self {
        Transport {
            next_msg_id: 0,
            sent: Vec::new(),
            storage: HashMap::new(),
            delivery_fails: false,
        }
    }

    /// The first worker message after boot.
    pub fn initial_worker_settings(settings: &ProxySettings) -> WorkerCommand {
        WorkerCommand::SetInitialSettings {
            session_id: settings.owner_token.clone(),
            service_msg_url: settings.service_msg_url(),
        }
    }

    /// Send a service message, parking it durably when delivery fails and
    /// the message does not allow rejection.
    pub fn send(&mut self, msg: ServiceMsg) -> Result<(), TransportError> {
        self.send_inner(msg, false)
    }

    fn send_inner(&mut self, msg: ServiceMsg, queued: bool) -> Result<(), TransportError> {
        if self.delivery_fails {
            if msg.allow_rejecting {
                warn!("service message {} rejected", msg.cmd);
                return Err(TransportError::Rejected(msg.cmd));
            }
            self.park(msg);
            return Ok(());
        }
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        debug!("service message {} sent (id {id})", msg.cmd);
        self.sent.push(WorkerRequest { id, queued, msg });
        Ok(())
    }

    /// Replay parked messages; called once per page load.
    pub fn batch_update(&mut self) -> usize {
        let parked = self.take_queue();
        let count = parked.len();
        for msg in parked {
            // A replay that fails again just parks again.
            let _ = self.send_inner(msg, true);
        }
        count
    }

    pub fn parked_len(&self) -> usize {
        self.load_queue().len()
    }

    // One synchronous read-modify-write; never split across turns.
    fn park(&mut self, msg: ServiceMsg) {
        let mut queue = self.load_queue();
        queue.push(msg);
        match serde_json::to_string(&queue) {
            Ok(serialized) => {
                self.storage.insert(QUEUE_STORAGE_KEY.to_string(), serialized);
            }
            Err(err) => warn!("failed to persist service-msg queue: {err}"),
        }
    }

    fn load_queue(&self) -> Vec<ServiceMsg> {
        self.storage
            .get(QUEUE_STORAGE_KEY)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    fn take_queue(&mut self) -> Vec<ServiceMsg> {
        let queue = self.load_queue();
        self.storage.remove(QUEUE_STORAGE_KEY);
        queue
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("sent", &self.sent.len())
            .field("parked", &self.parked_len())
            .field("delivery_fails", &self.delivery_fails)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sent_messages_get_increasing_ids() {
        let mut transport = Transport::new();
        transport.send(ServiceMsg::new("a", json!(null))).unwrap();
        transport.send(ServiceMsg::new("b", json!(null))).unwrap();
        assert_eq!(transport.sent[0].id, 0);
        assert_eq!(transport.sent[1].id, 1);
        assert!(!transport.sent[0].queued);
    }

    #[test]
    fn failed_delivery_parks_durably() {
        let mut transport = Transport::new();
        transport.delivery_fails = true;
        transport
            .send(ServiceMsg::new("body-changed", json!({"n": 1})))
            .unwrap();
        assert!(transport.sent.is_empty());
        assert_eq!(transport.parked_len(), 1);
    }

    #[test]
    fn batch_update_replays_parked_messages() {
        let mut transport = Transport::new();
        transport.delivery_fails = true;
        transport.send(ServiceMsg::new("a", json!(1))).unwrap();
        transport.send(ServiceMsg::new("b", json!(2))).unwrap();

        transport.delivery_fails = false;
        assert_eq!(transport.batch_update(), 2);
        assert_eq!(transport.parked_len(), 0);
        assert_eq!(transport.sent.len(), 2);
        assert!(transport.sent.iter().all(|req| req.queued));
        assert_eq!(transport.sent[0].msg.cmd, "a");
    }

    #[test]
    fn allow_rejecting_surfaces_the_failure() {
        let mut transport = Transport::new();
        transport.delivery_fails = true;
        let mut msg = ServiceMsg::new("critical", json!(null));
        msg.allow_rejecting = true;
        assert!(transport.send(msg).is_err());
        assert_eq!(transport.parked_len(), 0);
    }

    #[test]
    fn worker_protocol_wire_names() {
        let settings = ProxySettings::new("localhost", 1337, "owner", "job");
        let cmd = Transport::initial_worker_settings(&settings);
        let wire = serde_json::to_value(&cmd).unwrap();
        assert_eq!(wire["cmd"], "SET_INITIAL_WORKER_SETTINGS");
        assert_eq!(wire["sessionId"], "owner");
        assert!(wire["serviceMsgUrl"]
            .as_str()
            .unwrap()
            .ends_with("/messaging"));

        let response: WorkerResponse = serde_json::from_value(json!({
            "id": 3,
            "result": {"err": null, "data": {"ok": true}}
        }))
        .unwrap();
        assert_eq!(response.id, 3);
        assert!(response.result.err.is_none());
    }
}
