//! Node-revision storage with an in-memory LRU cache
//!
//! Node-revisions are immutable once written, so cached entries never need
//! invalidation.

use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::db::{self, Db};
use crate::error::{FsError, Result};
use crate::object::{NodeRevision, ObjectId};

pub struct NodeStore {
    db: Arc<Db>,
    cache: Mutex<LruCache<ObjectId, Arc<NodeRevision>>>,
}

impl NodeStore {
    pub fn new(db: Arc<Db>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            db,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Load a node-revision; a dangling id means the store is damaged
    pub fn get(&self, id: &ObjectId) -> Result<Arc<NodeRevision>> {
        if let Some(node) = self.cache.lock().get(id) {
            return Ok(Arc::clone(node));
        }

        let data = {
            let conn = self.db.read();
            db::conn_get_node(&conn, id)?
        };
        let data = data.ok_or(FsError::NoSuchNode(*id))?;
        let node = Arc::new(NodeRevision::from_bytes(&data)?);
        self.cache.lock().put(*id, Arc::clone(&node));
        Ok(node)
    }

    /// Write a node-revision through `conn` (normally a commit's SQLite
    /// transaction) and return its id
    pub fn put(&self, conn: &Connection, node: NodeRevision) -> Result<ObjectId> {
        let data = node.to_bytes()?;
        let id = ObjectId::from_data(&data);
        db::conn_put_node(conn, &id, &data)?;
        // Cached only after the write; a rolled-back commit leaves an entry
        // that no revision references, which is harmless.
        self.cache.lock().put(id, Arc::new(node));
        Ok(id)
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}
