//! Per-URID lookups: a process-wide, append-only interning table from
//! URI string to a small integer. Plugins see only `map(uri) -> Urid` and
//! `unmap(urid) -> uri`; nothing is ever removed, so a `Urid` obtained once
//! stays valid for the host's lifetime.

use std::collections::HashMap;
use std::sync::RwLock;

pub type Urid = u32;

pub struct UridMap {
    inner: RwLock<UridMapInner>,
}

struct UridMapInner {
    by_uri: HashMap<String, Urid>,
    by_urid: Vec<String>,
}

impl Default for UridMap {
    fn default() -> Self {
        Self::new()
    }
}

impl UridMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(UridMapInner {
                    by_uri: HashMap::new(),
                    by_urid: Vec::new(),
            }),
        }
    }

    /// Interns `uri`, returning its existing id or minting the next one.
    /// Ids start at 1; 0 is reserved to mean "no URID" at call sites that
    /// need a sentinel.
    pub fn map(&self, uri: &str) -> Urid {
        if let Some(id) = self.inner.read().unwrap().by_uri.get(uri) {
            return *id;
        }
        let mut inner = self.inner.write().unwrap();
        // Re-check: another thread may have interned `uri` while we waited
        // for the write lock.
        if let Some(id) = inner.by_uri.get(uri) {
            return *id;
        }
        let id = (inner.by_urid.len() as Urid) + 1;
        inner.by_urid.push(uri.to_string());
        inner.by_uri.insert(uri.to_string(), id);
        id
    }

    pub fn unmap(&self, urid: Urid) -> Option<String> {
        if urid == 0 {
            return None;
        }
        self.inner
        .read()
        .unwrap()
        .by_urid
        .get((urid - 1) as usize)
        .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_urid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
