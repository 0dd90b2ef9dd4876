// retrace_interceptor::runtime::sandbox::upload
//
// File-input virtualization.  A file input's files/value never come from
// the engine; they live in a per-window map keyed by the input element,
// filled either by an intercepted user upload or by server-provided file
// content.  The map is mirrored into a hidden form field as JSON so the
// state survives form serialization, and the page's change handlers only
// fire after the file-info round trip to the server completes.

use base64::prelude::*;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::runtime::dom::NodeId;
use crate::runtime::sandbox::{event, transport::ServiceMsg};
use crate::runtime::value::Value;
use crate::runtime::{Runtime, WindowId};

/// Name of the hidden input mirroring upload state.
pub const HIDDEN_INFO_INPUT_NAME: &str = "retrace|upload-info";
pub const UPLOAD_FILES_CMD: &str = "retrace|cmd|upload-files";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub mime: String,
    pub size: usize,
    /// base64 content.
    pub data: String,
}

impl FileRecord {
    pub fn new(name: &str, mime: &str, content: &[u8]) -> Self {
        FileRecord {
            name: name.to_string(),
            mime: mime.to_string(),
            size: content.len(),
            data: BASE64_STANDARD.encode(content),
        }
    }

    pub fn content(&self) -> Option<Vec<u8>> {
        BASE64_STANDARD.decode(&self.data).ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub files: Vec<FileRecord>,
    /// The `input.value` the page observes (fakepath form).
    pub value: String,
    /// True while the file-info round trip is outstanding; the page sees
    /// no change event until it clears.
    #[serde(skip)]
    pub pending: bool,
}

fn fakepath_value(files: &[FileRecord]) -> String {
    files
        .first()
        .map(|f| format!("C:\\fakepath\\{}", f.name))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Virtualized getters
// ---------------------------------------------------------------------------

pub fn get_files(rt: &Runtime, win: WindowId, input: NodeId) -> Vec<FileRecord> {
    rt.win(win)
        .uploads
        .get(&input)
        .map(|info| info.files.clone())
        .unwrap_or_default()
}

pub fn get_value(rt: &Runtime, win: WindowId, input: NodeId) -> String {
    rt.win(win)
        .uploads
        .get(&input)
        .map(|info| info.value.clone())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Population paths
// ---------------------------------------------------------------------------

/// Intercepted user upload: the engine's change event was suppressed, the
/// file content captured.  Stores the info, mirrors it, ships the metadata
/// to the server, and only then re-fires a synthetic change the page can
/// see.
pub fn on_file_input_change(rt: &mut Runtime, win: WindowId, input: NodeId, files: Vec<FileRecord>) {
    store(rt, win, input, files.clone(), true);

    let metadata: Vec<serde_json::Value> = files
        .iter()
        .map(|f| json!({ "name": f.name, "type": f.mime, "size": f.size }))
        .collect();
    let msg = ServiceMsg::new(UPLOAD_FILES_CMD, json!({ "files": metadata }));
    if let Err(err) = rt.transport.send(msg) {
        warn!("upload metadata not delivered: {err}");
    }

    // Round trip completes on a later turn; the page's change fires then.
    rt.scheduler.set_timeout(
        0,
        Box::new(move |rt| {
            if let Some(info) = rt.win_mut(win).uploads.get_mut(&input) {
                info.pending = false;
            }
            event::dispatch_synthetic(rt, win, input, "change", Value::Undefined);
        }),
    );
}

/// Server-provided file content (replay path).
pub fn set_files(rt: &mut Runtime, win: WindowId, input: NodeId, files: Vec<FileRecord>) {
    store(rt, win, input, files, false);
    event::dispatch_synthetic(rt, win, input, "change", Value::Undefined);
}

fn store(rt: &mut Runtime, win: WindowId, input: NodeId, files: Vec<FileRecord>, pending: bool) {
    let value = fakepath_value(&files);
    debug!("upload info stored for input {:?} ({} files)", input, files.len());
    rt.win_mut(win).uploads.insert(
        input,
        UploadInfo {
            files,
            value,
            pending,
        },
    );
    mirror_hidden_field(rt, win, input);
}

/// Keep a hidden sibling input whose value is the JSON-serialized upload
/// state, so the state survives form serialization.
fn mirror_hidden_field(rt: &mut Runtime, win: WindowId, input: NodeId) {
    let serialized = rt
        .win(win)
        .uploads
        .get(&input)
        .and_then(|info| serde_json::to_string(info).ok())
        .unwrap_or_default();

    let parent = match rt.win(win).dom.node(input).parent {
        Some(p) => p,
        None => return,
    };
    let existing = rt
        .win(win)
        .dom
        .children(parent)
        .iter()
        .copied()
        .find(|&c| {
            rt.win(win).dom.get_attribute(c, "name") == Some(HIDDEN_INFO_INPUT_NAME)
        });
    let hidden = match existing {
        Some(h) => h,
        None => {
            let h = rt.win_mut(win).dom.create_element("input");
            rt.win_mut(win).dom.set_attribute(h, "type", "hidden");
            rt.win_mut(win).dom.set_attribute(h, "name", HIDDEN_INFO_INPUT_NAME);
            rt.win_mut(win).dom.append_child(parent, h);
            h
        }
    };
    rt.win_mut(win).dom.set_attribute(hidden, "value", &serialized);
}

/// The internal change guard: while a round trip is outstanding, the
/// engine's own change event never reaches the page.
pub fn install_change_guard(rt: &mut Runtime, win: WindowId, input: NodeId) {
    event::add_internal_handler(
        rt,
        win,
        input,
        "change",
        1,
        std::rc::Rc::new(move |rt, ev| {
            let pending = rt
                .win(ev.window)
                .uploads
                .get(&ev.target)
                .map(|info| info.pending)
                .unwrap_or(false);
            if pending || !ev.synthetic {
                ev.prevent_default();
                event::cancel_outer_handlers(rt, ev.window, ev.target, "change");
            }
        }),
    );
}

/// Drop upload records rooted at a subtree about to be removed.
pub fn remove_upload_info_under(rt: &mut Runtime, win: WindowId, root: NodeId) {
    let doomed: Vec<NodeId> = rt
        .win(win)
        .uploads
        .keys()
        .copied()
        .filter(|&input| rt.win(win).dom.contains(root, input))
        .collect();
    for input in doomed {
        rt.win_mut(win).uploads.remove(&input);
    }
}
