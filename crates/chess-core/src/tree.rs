//! Position tree for drill games.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. A parent owns its
//! children; the stored `parent` id is only a lookup aid for path queries.
//! Ids are never reused, so an id from a destroyed subtree stays invalid.

use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct PositionNode {
    pub fen: String,
    /// Move (UCI) that produced this node; `None` only for the root.
    pub uci: Option<String>,
    /// SAN label of `uci`.
    pub san: Option<String>,
    pub children: Vec<NodeId>,
    pub main_child: Option<NodeId>,
    pub parent: Option<NodeId>,
    pub ply: usize,
}

impl PositionNode {
    pub fn is_root(&self) -> bool {
        self.uci.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct PositionTree {
    nodes: Vec<Option<PositionNode>>,
    root: NodeId,
}

impl PositionTree {
    pub fn new(root_fen: &str) -> Self {
        let root = PositionNode {
            fen: root_fen.to_string(),
            uci: None,
            san: None,
            children: Vec::new(),
            main_child: None,
            parent: None,
            ply: 0,
        };
        Self {
            nodes: vec![Some(root)],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&PositionNode> {
        self.nodes.get(id.0).and_then(|slot| slot.as_ref())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fen(&self, id: NodeId) -> Option<&str> {
        self.get(id).map(|node| node.fen.as_str())
    }

    pub fn find_child(&self, parent: NodeId, uci: &str) -> Option<NodeId> {
        let node = self.get(parent)?;
        node.children
            .iter()
            .copied()
            .find(|child| self.get(*child).and_then(|c| c.uci.as_deref()) == Some(uci))
    }

    /// Add `uci` as the main continuation of `parent`.
    ///
    /// An existing child with the same move is returned untouched. Returns
    /// `None` only when `parent` is not a live node.
    pub fn add_main_move(&mut self, parent: NodeId, fen: &str, uci: &str, san: &str) -> Option<NodeId> {
        let ply = self.get(parent)?.ply + 1;
        if let Some(existing) = self.find_child(parent, uci) {
            return Some(existing);
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(PositionNode {
            fen: fen.to_string(),
            uci: Some(uci.to_string()),
            san: Some(san.to_string()),
            children: Vec::new(),
            main_child: None,
            parent: Some(parent),
            ply,
        }));

        let node = self.nodes[parent.0].as_mut()?;
        node.children.push(id);
        node.main_child = Some(id);
        Some(id)
    }

    /// Destroy every descendant of `id`. There is no undo.
    pub fn remove_all_children(&mut self, id: NodeId) {
        let children = match self.nodes.get_mut(id.0).and_then(|slot| slot.as_mut()) {
            Some(node) => {
                node.main_child = None;
                std::mem::take(&mut node.children)
            }
            None => return,
        };

        let mut stack = children;
        while let Some(next) = stack.pop() {
            if let Some(removed) = self.nodes.get_mut(next.0).and_then(|slot| slot.take()) {
                stack.extend(removed.children);
            }
        }
    }

    /// Root followed by every main child in turn.
    pub fn main_line(&self) -> Vec<NodeId> {
        let mut line = Vec::new();
        let mut current = Some(self.root);
        while let Some(id) = current {
            let Some(node) = self.get(id) else { break };
            line.push(id);
            current = node.main_child;
        }
        line
    }

    /// Root-to-node path, inclusive. Empty when `id` is not a live node.
    pub fn path(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(next) = current {
            let Some(node) = self.get(next) else {
                return Vec::new();
            };
            path.push(next);
            current = node.parent;
        }
        path.reverse();
        path
    }

    /// Main-line nodes strictly after `from`, or nothing if `from` is off the main line.
    pub fn main_line_after(&self, from: NodeId) -> Vec<NodeId> {
        let line = self.main_line();
        match line.iter().position(|id| *id == from) {
            Some(idx) => line[idx + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Nested JSON view for the rendering layer.
    pub fn to_json(&self) -> JsonValue {
        self.node_to_json(self.root)
    }

    fn node_to_json(&self, id: NodeId) -> JsonValue {
        let Some(node) = self.get(id) else {
            return JsonValue::Null;
        };
        let children: Vec<JsonValue> = node
            .children
            .iter()
            .map(|child| self.node_to_json(*child))
            .collect();

        serde_json::json!({
            "id": id.0,
            "move": node.uci,
            "san": node.san,
            "fen": node.fen,
            "ply": node.ply,
            "main": node.main_child.map(|c| c.0),
            "children": children,
        })
    }
}
