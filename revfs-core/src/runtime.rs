//! Process-wide runtime state
//!
//! Opening the same store directory twice in one process must yield one
//! shared instance: one commit section, one node cache. The registry maps
//! canonical store paths to weak handles of the live instances.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use crate::error::Result;
use crate::store::StoreInner;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

pub struct Runtime {
    stores: Mutex<HashMap<PathBuf, Weak<StoreInner>>>,
}

/// Initialize process-wide state. Idempotent; store open and create call it
/// implicitly.
pub fn initialize_runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        tracing::debug!("revfs runtime initialized");
        Runtime {
            stores: Mutex::new(HashMap::new()),
        }
    })
}

impl Runtime {
    /// Return the live instance for `root` or open a new one. The registry
    /// lock is held while opening so concurrent openers share one instance.
    pub(crate) fn open_or_share(
        &self,
        root: &Path,
        open: impl FnOnce() -> Result<Arc<StoreInner>>,
    ) -> Result<Arc<StoreInner>> {
        let mut stores = self.stores.lock();
        if let Some(inner) = stores.get(root).and_then(Weak::upgrade) {
            return Ok(inner);
        }
        let inner = open()?;
        stores.insert(root.to_path_buf(), Arc::downgrade(&inner));
        Ok(inner)
    }

    /// True while some handle, transaction or reader keeps the store open
    pub fn is_open(&self, root: &Path) -> bool {
        let mut stores = self.stores.lock();
        match stores.get(root).map(Weak::strong_count) {
            Some(0) => {
                stores.remove(root);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Number of live store instances
    pub fn open_stores(&self) -> usize {
        let mut stores = self.stores.lock();
        stores.retain(|_, weak| weak.strong_count() > 0);
        stores.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let a = initialize_runtime() as *const Runtime;
        let b = initialize_runtime() as *const Runtime;
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_path_is_not_open() {
        let rt = initialize_runtime();
        assert!(!rt.is_open(Path::new("/definitely/not/a/store")));
    }
}
