//! Hierarchical key/value sessions.
//!
//! Sessions live in a [`SessionArena`] keyed by [`SessionId`]. Parent and
//! child links are ids, never owning pointers, so detaching a session is a
//! map edit. Each node keeps its local map behind its own `RwLock`, so writes
//! to different nodes never contend. Structural edits take the arena lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, TroupeError};
use crate::types::SessionId;

/// Where a looked-up value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    Inherited,
}

/// A value together with the session that holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedValue {
    pub value: Value,
    pub scope: Scope,
    pub origin: SessionId,
}

#[derive(Debug, Default)]
struct Links {
    parent: Option<SessionId>,
    children: Vec<SessionId>,
}

#[derive(Debug)]
struct SessionNode {
    inherit_context: bool,
    links: RwLock<Links>,
    data: RwLock<HashMap<String, Value>>,
}

impl SessionNode {
    fn new(parent: Option<SessionId>, inherit_context: bool, data: HashMap<String, Value>) -> Self {
        Self {
            inherit_context,
            links: RwLock::new(Links {
                parent,
                children: Vec::new(),
            }),
            data: RwLock::new(data),
        }
    }

    fn parent(&self) -> Option<SessionId> {
        self.links.read().parent.clone()
    }
}

/// Arena holding every session of one orchestration run.
#[derive(Debug, Default)]
pub struct SessionArena {
    nodes: RwLock<HashMap<SessionId, Arc<SessionNode>>>,
}

impl SessionArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, id: &SessionId) -> Option<Arc<SessionNode>> {
        self.nodes.read().get(id).cloned()
    }

    fn require(&self, id: &SessionId) -> Result<Arc<SessionNode>> {
        self.node(id)
            .ok_or_else(|| TroupeError::UnknownSession(id.to_string()))
    }

    /// Create a session with no parent.
    pub fn create_root(&self) -> SessionId {
        let id = SessionId::new();
        self.nodes
            .write()
            .insert(id.clone(), Arc::new(SessionNode::new(None, false, HashMap::new())));
        debug!(session = %id, "Created root session");
        id
    }

    /// Create a child session registered on `parent`.
    pub fn create_child(&self, parent: &SessionId, inherit_context: bool) -> Result<SessionId> {
        let mut nodes = self.nodes.write();
        let parent_node = nodes
            .get(parent)
            .cloned()
            .ok_or_else(|| TroupeError::UnknownSession(parent.to_string()))?;

        let id = SessionId::new();
        nodes.insert(
            id.clone(),
            Arc::new(SessionNode::new(
                Some(parent.clone()),
                inherit_context,
                HashMap::new(),
            )),
        );
        parent_node.links.write().children.push(id.clone());
        debug!(session = %id, parent = %parent, inherit_context, "Created child session");
        Ok(id)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.nodes.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn parent(&self, id: &SessionId) -> Option<SessionId> {
        self.node(id).and_then(|n| n.parent())
    }

    pub fn children(&self, id: &SessionId) -> Vec<SessionId> {
        self.node(id)
            .map(|n| n.links.read().children.clone())
            .unwrap_or_default()
    }

    pub fn inherits(&self, id: &SessionId) -> bool {
        self.node(id).map(|n| n.inherit_context).unwrap_or(false)
    }

    /// Set a value in the session's local map.
    pub fn set(&self, id: &SessionId, key: impl Into<String>, value: Value) -> Result<()> {
        let node = self.require(id)?;
        node.data.write().insert(key.into(), value);
        Ok(())
    }

    pub fn get(&self, id: &SessionId, key: &str) -> Option<Value> {
        self.get_with_scope(id, key).map(|v| v.value)
    }

    /// Look up a key locally, then through ancestors while the chain keeps
    /// inheriting. A missing or detached parent ends the walk.
    pub fn get_with_scope(&self, id: &SessionId, key: &str) -> Option<ScopedValue> {
        let nodes = self.nodes.read();
        let mut current_id = id.clone();
        let mut scope = Scope::Local;

        loop {
            let node = nodes.get(&current_id)?;
            if let Some(value) = node.data.read().get(key) {
                return Some(ScopedValue {
                    value: value.clone(),
                    scope,
                    origin: current_id,
                });
            }
            if !node.inherit_context {
                return None;
            }
            current_id = node.parent()?;
            scope = Scope::Inherited;
        }
    }

    pub fn has(&self, id: &SessionId, key: &str) -> bool {
        self.get_with_scope(id, key).is_some()
    }

    /// Whether the key is present in the local map only.
    pub fn has_local(&self, id: &SessionId, key: &str) -> bool {
        self.node(id)
            .map(|n| n.data.read().contains_key(key))
            .unwrap_or(false)
    }

    /// Remove a key from the local map. Ancestors are never touched.
    pub fn delete(&self, id: &SessionId, key: &str) -> Result<Option<Value>> {
        let node = self.require(id)?;
        let removed = node.data.write().remove(key);
        Ok(removed)
    }

    /// Copy a local value into the parent session.
    pub fn promote(&self, id: &SessionId, key: &str) -> Result<bool> {
        let node = self.require(id)?;
        let Some(value) = node.data.read().get(key).cloned() else {
            return Ok(false);
        };
        let Some(parent) = node.parent() else {
            return Ok(false);
        };
        self.set(&parent, key, value)?;
        Ok(true)
    }

    /// Deep-copy the local map into a new sibling with the same parent and
    /// inheritance flag.
    pub fn fork(&self, id: &SessionId) -> Result<SessionId> {
        let mut nodes = self.nodes.write();
        let source = nodes
            .get(id)
            .cloned()
            .ok_or_else(|| TroupeError::UnknownSession(id.to_string()))?;
        let data = source.data.read().clone();
        let parent = source.parent();

        let fork_id = SessionId::new();
        nodes.insert(
            fork_id.clone(),
            Arc::new(SessionNode::new(parent.clone(), source.inherit_context, data)),
        );
        if let Some(parent_node) = parent.as_ref().and_then(|p| nodes.get(p)) {
            parent_node.links.write().children.push(fork_id.clone());
        }
        debug!(session = %fork_id, source = %id, "Forked session");
        Ok(fork_id)
    }

    /// Sever the parent link. Detaching a root or an already-detached
    /// session is a no-op.
    pub fn detach(&self, id: &SessionId) -> Result<()> {
        let nodes = self.nodes.write();
        let node = nodes
            .get(id)
            .ok_or_else(|| TroupeError::UnknownSession(id.to_string()))?;
        let parent = node.links.write().parent.take();
        if let Some(parent_node) = parent.as_ref().and_then(|p| nodes.get(p)) {
            parent_node.links.write().children.retain(|c| c != id);
        }
        Ok(())
    }

    /// Drop a session and all of its descendants from the arena.
    pub fn remove(&self, id: &SessionId) -> Result<()> {
        self.detach(id)?;
        let mut nodes = self.nodes.write();
        let mut pending = vec![id.clone()];
        let mut removed = 0usize;
        while let Some(current) = pending.pop() {
            if let Some(node) = nodes.remove(&current) {
                pending.extend(node.links.read().children.iter().cloned());
                removed += 1;
            }
        }
        debug!(session = %id, removed, "Removed session subtree");
        Ok(())
    }

    /// Merged view of every key visible from this session; local values win.
    pub fn snapshot(&self, id: &SessionId) -> HashMap<String, Value> {
        let nodes = self.nodes.read();
        let mut chain = Vec::new();
        let mut current = Some(id.clone());
        while let Some(current_id) = current {
            let Some(node) = nodes.get(&current_id) else {
                break;
            };
            chain.push(node.clone());
            current = if node.inherit_context {
                node.parent()
            } else {
                None
            };
        }

        let mut merged = HashMap::new();
        for node in chain.iter().rev() {
            for (k, v) in node.data.read().iter() {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

/// Cheap handle pairing an arena with one session id.
#[derive(Debug, Clone)]
pub struct Session {
    arena: Arc<SessionArena>,
    id: SessionId,
}

impl Session {
    /// Create a new root session in `arena`.
    pub fn root(arena: &Arc<SessionArena>) -> Self {
        let id = arena.create_root();
        Self {
            arena: arena.clone(),
            id,
        }
    }

    /// Wrap an existing session id.
    pub fn attach(arena: &Arc<SessionArena>, id: SessionId) -> Result<Self> {
        if !arena.contains(&id) {
            return Err(TroupeError::UnknownSession(id.to_string()));
        }
        Ok(Self {
            arena: arena.clone(),
            id,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn arena(&self) -> &Arc<SessionArena> {
        &self.arena
    }

    pub fn child(&self, inherit_context: bool) -> Result<Session> {
        let id = self.arena.create_child(&self.id, inherit_context)?;
        Ok(Self {
            arena: self.arena.clone(),
            id,
        })
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<()> {
        self.arena.set(&self.id, key, value)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.arena.get(&self.id, key)
    }

    pub fn get_with_scope(&self, key: &str) -> Option<ScopedValue> {
        self.arena.get_with_scope(&self.id, key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.arena.has(&self.id, key)
    }

    pub fn delete(&self, key: &str) -> Result<Option<Value>> {
        self.arena.delete(&self.id, key)
    }

    pub fn promote(&self, key: &str) -> Result<bool> {
        self.arena.promote(&self.id, key)
    }

    pub fn fork(&self) -> Result<Session> {
        let id = self.arena.fork(&self.id)?;
        Ok(Self {
            arena: self.arena.clone(),
            id,
        })
    }

    pub fn detach(&self) -> Result<()> {
        self.arena.detach(&self.id)
    }

    pub fn parent(&self) -> Option<SessionId> {
        self.arena.parent(&self.id)
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.arena.snapshot(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arena() -> Arc<SessionArena> {
        Arc::new(SessionArena::new())
    }

    #[test]
    fn inherited_lookup_crosses_parent() {
        let arena = arena();
        let root = Session::root(&arena);
        root.set("topic", json!("rust")).unwrap();

        let child = root.child(true).unwrap();
        assert_eq!(child.get("topic"), Some(json!("rust")));

        let scoped = child.get_with_scope("topic").unwrap();
        assert_eq!(scoped.scope, Scope::Inherited);
        assert_eq!(&scoped.origin, root.id());
    }

    #[test]
    fn isolated_lookup_stops_at_boundary() {
        let arena = arena();
        let root = Session::root(&arena);
        root.set("topic", json!("rust")).unwrap();

        let child = root.child(false).unwrap();
        assert_eq!(child.get("topic"), None);
        assert!(!child.has("topic"));
    }

    #[test]
    fn child_writes_stay_local_until_promoted() {
        let arena = arena();
        let root = Session::root(&arena);
        let child = root.child(true).unwrap();

        child.set("draft", json!("v1")).unwrap();
        assert_eq!(root.get("draft"), None);
        assert_eq!(
            child.get_with_scope("draft").map(|v| v.scope),
            Some(Scope::Local)
        );

        assert!(child.promote("draft").unwrap());
        assert_eq!(root.get("draft"), Some(json!("v1")));
        assert!(!child.promote("missing").unwrap());
    }

    #[test]
    fn local_value_shadows_parent() {
        let arena = arena();
        let root = Session::root(&arena);
        root.set("k", json!(1)).unwrap();
        let child = root.child(true).unwrap();
        child.set("k", json!(2)).unwrap();
        assert_eq!(child.get("k"), Some(json!(2)));

        // delete is local: the parent's value shows through again
        assert_eq!(child.delete("k").unwrap(), Some(json!(2)));
        assert_eq!(child.get("k"), Some(json!(1)));
        assert_eq!(root.get("k"), Some(json!(1)));
    }

    #[test]
    fn grandparent_values_visible_through_chain() {
        let arena = arena();
        let root = Session::root(&arena);
        root.set("org", json!("acme")).unwrap();
        let mid = root.child(true).unwrap();
        let leaf = mid.child(true).unwrap();
        assert_eq!(leaf.get("org"), Some(json!("acme")));

        // a non-inheriting middle node blocks the walk
        let sealed = root.child(false).unwrap();
        let below = sealed.child(true).unwrap();
        assert_eq!(below.get("org"), None);
    }

    #[test]
    fn fork_copies_local_and_shares_parent() {
        let arena = arena();
        let root = Session::root(&arena);
        root.set("shared", json!(true)).unwrap();
        let child = root.child(true).unwrap();
        child.set("notes", json!(["a"])).unwrap();

        let fork = child.fork().unwrap();
        assert_eq!(fork.parent(), Some(root.id().clone()));
        assert_eq!(fork.get("notes"), Some(json!(["a"])));
        assert_eq!(fork.get("shared"), Some(json!(true)));

        fork.set("notes", json!(["b"])).unwrap();
        assert_eq!(child.get("notes"), Some(json!(["a"])));
        assert_eq!(arena.children(root.id()).len(), 2);
    }

    #[test]
    fn detach_severs_inheritance() {
        let arena = arena();
        let root = Session::root(&arena);
        root.set("k", json!("v")).unwrap();
        let child = root.child(true).unwrap();

        child.detach().unwrap();
        assert_eq!(child.get("k"), None);
        assert!(child.parent().is_none());
        assert!(arena.children(root.id()).is_empty());

        // detaching twice is fine
        child.detach().unwrap();
    }

    #[test]
    fn remove_drops_subtree() {
        let arena = arena();
        let root = Session::root(&arena);
        let child = root.child(true).unwrap();
        let grandchild = child.child(true).unwrap();
        assert_eq!(arena.len(), 3);

        arena.remove(child.id()).unwrap();
        assert_eq!(arena.len(), 1);
        assert!(!arena.contains(grandchild.id()));
        assert!(arena.children(root.id()).is_empty());
        assert!(grandchild.set("k", json!(1)).is_err());
    }

    #[test]
    fn snapshot_merges_visible_keys() {
        let arena = arena();
        let root = Session::root(&arena);
        root.set("a", json!(1)).unwrap();
        root.set("b", json!(1)).unwrap();
        let child = root.child(true).unwrap();
        child.set("b", json!(2)).unwrap();

        let snap = child.snapshot();
        assert_eq!(snap.get("a"), Some(&json!(1)));
        assert_eq!(snap.get("b"), Some(&json!(2)));
    }

    #[test]
    fn unknown_session_errors() {
        let arena = arena();
        let ghost = SessionId::from_string("ghost");
        assert!(arena.set(&ghost, "k", json!(1)).is_err());
        assert!(arena.create_child(&ghost, true).is_err());
        assert_eq!(arena.get(&ghost, "k"), None);
    }

    #[test]
    fn concurrent_writes_to_one_node() {
        let arena = arena();
        let root = Session::root(&arena);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let session = root.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        session.set(format!("k{}_{}", i, j), json!(j)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(root.snapshot().len(), 400);
    }
}
