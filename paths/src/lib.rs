//! Paths in the engine are opaque strings. This crate interns them so the graph can refer to a path
//! by a small integer, and provides the handful of string operations the engine needs (joining
//! relative paths onto a working directory and walking ancestors for directory creation).

use std::collections::{hash_map::Entry, HashMap};

pub type PathRef = usize;

#[derive(Debug, Default)]
pub struct PathCache {
    paths: Vec<String>,
    map: HashMap<String, PathRef>,
}

// Rough translation of HashMap entry API to be more ergonomic.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum InsertResult {
    AlreadyExists(PathRef),
    Inserted(PathRef),
}

impl PathCache {
    pub fn new() -> PathCache {
        PathCache::default()
    }

    /// The same path always returns the same ref. Callers that care about collisions (output
    /// registration) match on the result.
    pub fn insert<P: Into<String>>(&mut self, path: P) -> InsertResult {
        let path = path.into();
        match self.map.entry(path) {
            Entry::Occupied(e) => InsertResult::AlreadyExists(*e.get()),
            Entry::Vacant(e) => {
                let idx = self.paths.len();
                self.paths.push(e.key().clone());
                e.insert(idx);
                InsertResult::Inserted(idx)
            }
        }
    }

    pub fn insert_and_get<P: Into<String>>(&mut self, path: P) -> PathRef {
        match self.insert(path) {
            InsertResult::AlreadyExists(r) => r,
            InsertResult::Inserted(r) => r,
        }
    }

    pub fn lookup(&self, path: &str) -> Option<PathRef> {
        self.map.get(path).copied()
    }

    pub fn get(&self, rf: PathRef) -> &str {
        &self.paths[rf]
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Joins `path` onto `base` unless it is already absolute. An empty base leaves the path alone.
pub fn join(base: &str, path: &str) -> String {
    if is_absolute(path) || base.is_empty() {
        path.to_owned()
    } else if path.is_empty() {
        base.to_owned()
    } else if base.ends_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Everything before the last component, or None for a single component path.
pub fn parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&trimmed[..i]),
        None => None,
    }
}

pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

/// Every ancestor of `path` including itself, ordered from the root towards the leaf, so each
/// directory can be created before its children. Empty components (`a//b`, trailing slashes) are
/// dropped.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut current = if is_absolute(path) {
        String::from("/")
    } else {
        String::new()
    };
    let mut result = Vec::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(component);
        result.push(current.clone());
    }
    result
}
