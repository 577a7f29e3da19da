//! Collation registry
//!
//! The compiler only deals with collation *identity*: resolving a name to an
//! id and back, and knowing whether a collation orders strings the same way
//! their bytes do (needed by the LIKE range rewrite). Comparison functions
//! live in the execution engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

/// Collation identifier. [`COLL_NONE`] means "no collation".
pub type CollId = u32;

pub const COLL_NONE: CollId = 0;
pub const COLL_UNICODE: CollId = 1;
pub const COLL_UNICODE_CI: CollId = 2;
pub const COLL_BINARY: CollId = 3;

/// How a collation orders strings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollKind {
    /// No collation: byte order
    None,
    /// memcmp order
    Binary,
    /// ICU-like locale order
    Icu,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collation {
    pub id: CollId,
    pub name: String,
    pub kind: CollKind,
    pub case_sensitive: bool,
}

impl Collation {
    /// Orders strings by their bytes
    pub fn is_byte_order(&self) -> bool {
        matches!(self.kind, CollKind::None | CollKind::Binary)
    }
}

struct Registry {
    by_name: HashMap<String, Arc<Collation>>,
    by_id: Vec<Arc<Collation>>,
}

impl Registry {
    fn with_builtins() -> Self {
        let mut reg = Registry {
            by_name: HashMap::new(),
            by_id: Vec::new(),
        };
        reg.add("none", CollKind::None, true);
        reg.add("unicode", CollKind::Icu, true);
        reg.add("unicode_ci", CollKind::Icu, false);
        reg.add("binary", CollKind::Binary, true);
        reg
    }

    fn add(&mut self, name: &str, kind: CollKind, case_sensitive: bool) -> CollId {
        let key = normalize_name(name);
        if let Some(existing) = self.by_name.get(&key) {
            return existing.id;
        }
        let coll = Arc::new(Collation {
            id: self.by_id.len() as CollId,
            name: key.clone(),
            kind,
            case_sensitive,
        });
        self.by_id.push(Arc::clone(&coll));
        self.by_name.insert(key, Arc::clone(&coll));
        coll.id
    }
}

lazy_static! {
    static ref COLLATIONS: Mutex<Registry> = Mutex::new(Registry::with_builtins());
}

fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Register a collation, returning its id. Registering an existing name
/// returns the id it already has.
pub fn register_collation(name: &str, kind: CollKind, case_sensitive: bool) -> CollId {
    let mut registry = COLLATIONS.lock().unwrap_or_else(|e| e.into_inner());
    registry.add(name, kind, case_sensitive)
}

pub fn collation_by_name(name: &str) -> Option<Arc<Collation>> {
    let registry = COLLATIONS.lock().unwrap_or_else(|e| e.into_inner());
    registry.by_name.get(&normalize_name(name)).cloned()
}

pub fn collation_by_id(id: CollId) -> Option<Arc<Collation>> {
    let registry = COLLATIONS.lock().unwrap_or_else(|e| e.into_inner());
    registry.by_id.get(id as usize).cloned()
}

/// Name of a collation id, `None` for [`COLL_NONE`] or unknown ids.
pub fn collation_name(id: CollId) -> Option<String> {
    if id == COLL_NONE {
        return None;
    }
    collation_by_id(id).map(|c| c.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_collations() {
        let binary = collation_by_name("BINARY").unwrap();
        assert_eq!(binary.id, COLL_BINARY);
        assert!(binary.is_byte_order());
        let ci = collation_by_id(COLL_UNICODE_CI).unwrap();
        assert_eq!(ci.name, "unicode_ci");
        assert!(!ci.case_sensitive);
        assert_eq!(collation_name(COLL_NONE), None);
    }

    #[test]
    fn test_register_collation_is_idempotent() {
        let a = register_collation("test_coll_x", CollKind::Icu, true);
        let b = register_collation("TEST_COLL_X", CollKind::Icu, true);
        assert_eq!(a, b);
        assert_eq!(collation_name(a).as_deref(), Some("test_coll_x"));
    }
}
