//! Dependency Graph Module
//!
//! Tracks which entries depend on which, so that invalidating one key can
//! cascade to everything built from it.

use std::collections::{BTreeSet, HashMap, HashSet};

// == Cascade ==
/// Keys reached from an invalidation root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cascade {
    /// Root first, then dependents in depth-first discovery order
    pub keys: Vec<String>,
    /// First cycle found, as a closed path (`a -> b -> a`)
    pub cycle: Option<Vec<String>>,
}

struct Frame {
    key: String,
    children: Vec<String>,
    next: usize,
}

// == Dependency Graph ==
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// key -> keys it depends on
    depends_on: HashMap<String, BTreeSet<String>>,
    /// key -> keys that depend on it
    dependents: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds edges `key -> dep` for each dep, keeping existing ones.
    pub fn declare<I, S>(&mut self, key: &str, deps: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(key.to_string());
            self.depends_on.entry(key.to_string()).or_default().insert(dep);
        }
    }

    /// Replaces the outgoing edges of `key`.
    pub fn replace<I, S>(&mut self, key: &str, deps: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remove(key);
        self.declare(key, deps);
    }

    /// Drops the outgoing edges of `key`. Edges pointing at `key` stay, since
    /// they belong to the dependents.
    pub fn remove(&mut self, key: &str) {
        if let Some(deps) = self.depends_on.remove(key) {
            for dep in deps {
                if let Some(set) = self.dependents.get_mut(&dep) {
                    set.remove(key);
                    if set.is_empty() {
                        self.dependents.remove(&dep);
                    }
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.depends_on.clear();
        self.dependents.clear();
    }

    pub fn dependencies_of(&self, key: &str) -> BTreeSet<String> {
        self.depends_on.get(key).cloned().unwrap_or_default()
    }

    pub fn dependents_of(&self, key: &str) -> BTreeSet<String> {
        self.dependents.get(key).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.depends_on.is_empty()
    }

    // == Cascade ==
    /// Collects `root` and every key that transitively depends on it.
    ///
    /// Each key is visited once, so a cycle cannot cause unbounded work; the
    /// first cycle encountered is reported alongside the keys.
    pub fn cascade(&self, root: &str) -> Cascade {
        let mut visited: HashSet<String> = HashSet::new();
        let mut cascade = Cascade::default();
        let mut stack = vec![self.frame(root)];
        visited.insert(root.to_string());
        cascade.keys.push(root.to_string());

        loop {
            let next = match stack.last_mut() {
                None => break,
                Some(frame) if frame.next < frame.children.len() => {
                    frame.next += 1;
                    Some(frame.children[frame.next - 1].clone())
                }
                Some(_) => None,
            };

            let Some(child) = next else {
                stack.pop();
                continue;
            };

            if let Some(pos) = stack.iter().position(|f| f.key == child) {
                if cascade.cycle.is_none() {
                    let mut path: Vec<String> = stack[pos..].iter().map(|f| f.key.clone()).collect();
                    path.push(child);
                    cascade.cycle = Some(path);
                }
                continue;
            }

            if visited.insert(child.clone()) {
                cascade.keys.push(child.clone());
                stack.push(self.frame(&child));
            }
        }

        cascade
    }

    fn frame(&self, key: &str) -> Frame {
        Frame {
            key: key.to_string(),
            children: self.dependents_of(key).into_iter().collect(),
            next: 0,
        }
    }
}
