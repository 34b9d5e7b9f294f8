use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{ResourceError, Result};

/// Caller-chosen resource identifier.
pub type Handle = u64;

/// One node of an ownership tree.
///
/// Parent and children are stored as handles, never as references, so a stale link can only
/// ever resolve to "not found".
pub struct Resource<T> {
    handle: Handle,
    links: Mutex<Links>,
    payload: T,
}

#[derive(Default)]
struct Links {
    parent: Option<Handle>,
    // Newest child first.
    children: VecDeque<Handle>,
}

impl<T> Resource<T> {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn parent(&self) -> Option<Handle> {
        self.links().parent
    }

    /// Child handles, most recently created first.
    pub fn children(&self) -> Vec<Handle> {
        self.links().children.iter().copied().collect()
    }

    fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let links = self.links();
        f.debug_struct("Resource")
            .field("handle", &self.handle)
            .field("parent", &links.parent)
            .field("children", &links.children)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Process-wide table of resources.
///
/// Lock order is always table, then parent, then child. `create` and `destroy` run entirely
/// under the table lock, so other threads never observe a node that is inserted but not yet
/// linked, or a subtree that is half torn down.
pub struct ResourceTable<T> {
    nodes: Mutex<HashMap<Handle, Arc<Resource<T>>>>,
}

impl<T> Default for ResourceTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResourceTable<T> {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<Handle, Arc<Resource<T>>>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.nodes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes().is_empty()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.nodes().contains_key(&handle)
    }

    /// Insert a new resource, optionally owned by `parent`.
    pub fn create(
        &self,
        handle: Handle,
        parent: Option<Handle>,
        payload: T,
    ) -> Result<Arc<Resource<T>>> {
        let mut nodes = self.nodes();
        if nodes.contains_key(&handle) {
            return Err(ResourceError::AlreadyExists(handle));
        }
        let parent_node = match parent {
            Some(parent) => Some(
                nodes
                    .get(&parent)
                    .cloned()
                    .ok_or(ResourceError::ParentNotFound(parent))?,
            ),
            None => None,
        };

        let node = Arc::new(Resource {
            handle,
            links: Mutex::new(Links {
                parent,
                children: VecDeque::new(),
            }),
            payload,
        });
        if let Some(parent_node) = parent_node {
            parent_node.links().children.push_front(handle);
        }
        nodes.insert(handle, Arc::clone(&node));

        tracing::trace!(handle, ?parent, "resource created");
        Ok(node)
    }

    pub fn lookup(&self, handle: Handle) -> Result<Arc<Resource<T>>> {
        self.nodes()
            .get(&handle)
            .cloned()
            .ok_or(ResourceError::NotFound(handle))
    }

    /// Destroy `handle` and everything it owns.
    ///
    /// Descendants go first (depth-first, post-order). The removed nodes are returned in that
    /// same order so callers can release whatever their payloads stand for.
    pub fn destroy(&self, handle: Handle) -> Result<Vec<Arc<Resource<T>>>> {
        let mut nodes = self.nodes();
        let root = nodes
            .get(&handle)
            .cloned()
            .ok_or(ResourceError::NotFound(handle))?;

        let order = post_order(&nodes, root);

        if let Some(parent) = order.last().and_then(|root| root.links().parent) {
            if let Some(parent_node) = nodes.get(&parent) {
                parent_node.links().children.retain(|&child| child != handle);
            }
        }
        for node in &order {
            nodes.remove(&node.handle);
        }

        tracing::trace!(handle, removed = order.len(), "resource destroyed");
        Ok(order)
    }
}

fn post_order<T>(
    nodes: &HashMap<Handle, Arc<Resource<T>>>,
    root: Arc<Resource<T>>,
) -> Vec<Arc<Resource<T>>> {
    let mut out = Vec::new();
    let mut stack = vec![(root, false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            out.push(node);
            continue;
        }
        let children = node.children();
        stack.push((node, true));
        // Reverse so the newest child is visited first.
        for child in children.into_iter().rev() {
            if let Some(child) = nodes.get(&child) {
                stack.push((Arc::clone(child), false));
            }
        }
    }
    out
}
