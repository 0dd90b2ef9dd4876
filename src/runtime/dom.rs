// retrace_interceptor::runtime::dom
//
// Arena DOM model the sandboxes operate on.  Nodes live in an owned arena
// and are addressed by index, with parent/children back-references; the
// platform binding object the sandboxes wrap sits behind this struct rather
// than behind shared mutable prototypes.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone)]
pub enum NodeKind {
    Document,
    Element(ElementData),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct ElementData {
    pub tag: String,
    attrs: Vec<(String, String)>,
    /// Window-context marker set once the element's per-instance methods
    /// have been replaced; prevents double wrapping.
    pub processed_context: Option<u64>,
}

impl ElementData {
    fn new(tag: &str) -> Self {
        ElementData {
            tag: tag.to_ascii_lowercase(),
            attrs: Vec::new(),
            processed_context: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
}

#[derive(Debug)]
pub struct Dom {
    nodes: Vec<Node>,
    document: NodeId,
    /// Bumped whenever the engine recreates the document environment
    /// (document.open); the sandboxes compare captured generations against
    /// this to detect that their overrides were wiped.
    pub method_generation: u64,
    /// Per-element expando properties the page sets that have no attribute
    /// reflection.
    expandos: HashMap<(NodeId, String), String>,
}

impl Dom {
    pub fn new() -> Self {
        let document = Node {
            parent: None,
            children: Vec::new(),
            kind: NodeKind::Document,
        };
        Dom {
            nodes: vec![document],
            document: NodeId(0),
            method_generation: 0,
            expandos: HashMap::new(),
        }
    }

    pub fn document(&self) -> NodeId {
        self.document
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn element(&self, id: NodeId) -> Option<&ElementData> {
        match &self.node(id).kind {
            NodeKind::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut ElementData> {
        match &mut self.node_mut(id).kind {
            NodeKind::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn tag_name(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(|el| el.tag.as_str())
    }

    // ---- construction ----------------------------------------------------

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(Node {
            parent: None,
            children: Vec::new(),
            kind: NodeKind::Element(ElementData::new(tag)),
        })
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(Node {
            parent: None,
            children: Vec::new(),
            kind: NodeKind::Text(text.to_string()),
        })
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Deep clone of a subtree.  Cloned elements lose their processed
    /// context marker: they have not been wrapped for any window yet.
    pub fn clone_node(&mut self, id: NodeId) -> NodeId {
        let mut kind = self.node(id).kind.clone();
        if let NodeKind::Element(el) = &mut kind {
            el.processed_context = None;
        }
        let children = self.node(id).children.clone();
        let copy = self.push(Node {
            parent: None,
            children: Vec::new(),
            kind,
        });
        for child in children {
            let child_copy = self.clone_node(child);
            self.append_child(copy, child_copy);
        }
        copy
    }

    // ---- tree mutation ---------------------------------------------------

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.node_mut(parent).children.push(child);
        self.node_mut(child).parent = Some(parent);
    }

    pub fn insert_before(&mut self, parent: NodeId, child: NodeId, reference: Option<NodeId>) {
        self.detach(child);
        let index = match reference {
            Some(r) => self
                .node(parent)
                .children
                .iter()
                .position(|&c| c == r)
                .unwrap_or(self.node(parent).children.len()),
            None => self.node(parent).children.len(),
        };
        self.node_mut(parent).children.insert(index, child);
        self.node_mut(child).parent = Some(parent);
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> bool {
        let children = &mut self.node_mut(parent).children;
        match children.iter().position(|&c| c == child) {
            Some(index) => {
                children.remove(index);
                self.node_mut(child).parent = None;
                true
            }
            None => false,
        }
    }

    fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.node(id).parent {
            self.remove_child(parent, id);
        }
    }

    /// Remove all document children, as `document.open` does.  Also bumps
    /// the method generation: the engine recreates the document methods,
    /// wiping any overrides.
    pub fn clear_document(&mut self) {
        let doc = self.document;
        let children = std::mem::take(&mut self.node_mut(doc).children);
        for child in children {
            self.node_mut(child).parent = None;
        }
        self.method_generation += 1;
    }

    // ---- attributes ------------------------------------------------------

    pub fn get_attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id).and_then(|el| {
            el.attrs
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }

    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) {
        if let Some(el) = self.element_mut(id) {
            let lower = name.to_ascii_lowercase();
            match el.attrs.iter_mut().find(|(n, _)| *n == lower) {
                Some(entry) => entry.1 = value.to_string(),
                None => el.attrs.push((lower, value.to_string())),
            }
        }
    }

    pub fn remove_attribute(&mut self, id: NodeId, name: &str) -> bool {
        if let Some(el) = self.element_mut(id) {
            let lower = name.to_ascii_lowercase();
            let before = el.attrs.len();
            el.attrs.retain(|(n, _)| *n != lower);
            return el.attrs.len() != before;
        }
        false
    }

    pub fn attribute_names(&self, id: NodeId) -> Vec<String> {
        self.element(id)
            .map(|el| el.attrs.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default()
    }

    // ---- expandos --------------------------------------------------------

    pub fn get_expando(&self, id: NodeId, name: &str) -> Option<&str> {
        self.expandos.get(&(id, name.to_string())).map(|s| s.as_str())
    }

    pub fn set_expando(&mut self, id: NodeId, name: &str, value: String) {
        self.expandos.insert((id, name.to_string()), value);
    }

    // ---- traversal -------------------------------------------------------

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.node(id).children.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.node(next).children.iter().rev().copied());
        }
        out
    }

    pub fn elements_by_tag(&self, root: NodeId, tag: &str) -> Vec<NodeId> {
        self.descendants(root)
            .into_iter()
            .filter(|&id| self.tag_name(id) == Some(&tag.to_ascii_lowercase()))
            .collect()
    }

    /// First `<body>` under the document, if any.
    pub fn body(&self) -> Option<NodeId> {
        self.elements_by_tag(self.document, "body")
            .into_iter()
            .next()
    }

    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        if let NodeKind::Text(t) = &self.node(id).kind {
            out.push_str(t);
        }
        for child in self.descendants(id) {
            if let NodeKind::Text(t) = &self.node(child).kind {
                out.push_str(t);
            }
        }
        out
    }

    /// True when `ancestor` contains `id` (or is `id`).
    pub fn contains(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = self.node(node).parent;
        }
        false
    }
}

impl Default for Dom {
    fn default() -> Self {
        Self::new()
    }
}
