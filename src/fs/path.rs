//! Path namespace: volume paths to inodes and back
//!
//! A flat two-way table, like the rest of the gateway keyed by normalized
//! absolute paths.  Directory structure is implied by path prefixes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::fs::inode::Inode;

/// Visitor invoked for every component while walking a path, root first.
/// Used to remember the parent's identity during export.
pub trait PathVisitor {
    fn visit(&mut self, name: &str, inode: &Arc<RwLock<Inode>>);
}

/// Normalize a volume path: leading slash, no trailing slash, no empties
pub fn normalize(path: &str) -> String {
    let mut out = String::from("/");
    for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// Parent path of a normalized path ("/" is its own parent)
pub fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Final component of a normalized path
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Two-way table of volume paths and inodes
pub struct Namespace {
    by_path: RwLock<HashMap<String, Arc<RwLock<Inode>>>>,
}

impl Namespace {
    /// Create a namespace holding only the root directory
    pub fn new(root: Inode) -> Self {
        let mut by_path = HashMap::new();
        by_path.insert("/".to_string(), Arc::new(RwLock::new(root)));
        Self {
            by_path: RwLock::new(by_path),
        }
    }

    /// Look up an attached inode
    pub fn get(&self, path: &str) -> Option<Arc<RwLock<Inode>>> {
        self.by_path.read().unwrap().get(&normalize(path)).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.by_path.read().unwrap().contains_key(&normalize(path))
    }

    /// Attach an inode at a path.  The parent must exist.
    pub fn insert(&self, path: &str, inode: Inode) -> Result<Arc<RwLock<Inode>>> {
        let path = normalize(path);
        let parent = parent_of(&path);

        let mut table = self.by_path.write().unwrap();
        if !table.contains_key(&parent) {
            return Err(Error::NotFound(parent));
        }
        if table.contains_key(&path) {
            return Err(Error::AlreadyExists(path));
        }

        let arc = Arc::new(RwLock::new(inode));
        table.insert(path, Arc::clone(&arc));
        Ok(arc)
    }

    /// Detach an inode.  Directories must be empty.
    pub fn remove(&self, path: &str) -> Result<Arc<RwLock<Inode>>> {
        let path = normalize(path);
        if path == "/" {
            return Err(Error::InvalidArgument("cannot remove root".to_string()));
        }

        let mut table = self.by_path.write().unwrap();
        let prefix = format!("{}/", path);
        if table.keys().any(|k| k.starts_with(&prefix)) {
            return Err(Error::InvalidArgument(format!("{} is not empty", path)));
        }

        table.remove(&path).ok_or(Error::NotFound(path))
    }

    /// Rename a subtree
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize(from);
        let to = normalize(to);

        let mut table = self.by_path.write().unwrap();
        if !table.contains_key(&from) {
            return Err(Error::NotFound(from));
        }
        if table.contains_key(&to) {
            return Err(Error::AlreadyExists(to));
        }
        if !table.contains_key(&parent_of(&to)) {
            return Err(Error::NotFound(parent_of(&to)));
        }

        let prefix = format!("{}/", from);
        let moved: Vec<String> = table
            .keys()
            .filter(|k| **k == from || k.starts_with(&prefix))
            .cloned()
            .collect();

        for old_key in moved {
            let inode = table.remove(&old_key).unwrap();
            let new_key = format!("{}{}", to, &old_key[from.len()..]);
            table.insert(new_key, inode);
        }
        Ok(())
    }

    /// Immediate children names of a directory path
    pub fn list_children(&self, path: &str) -> Vec<String> {
        let path = normalize(path);
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };

        let table = self.by_path.read().unwrap();
        let mut names: Vec<String> = table
            .keys()
            .filter(|k| k.starts_with(&prefix) && **k != "/")
            .filter_map(|k| {
                let rest = &k[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        names.sort();
        names
    }

    /// Walk a path root-first, invoking the visitor on every component,
    /// and return the target inode.
    pub fn walk(&self, path: &str, visitor: &mut dyn PathVisitor) -> Result<Arc<RwLock<Inode>>> {
        let path = normalize(path);
        let table = self.by_path.read().unwrap();

        let root = table
            .get("/")
            .cloned()
            .ok_or_else(|| Error::NotFound("/".to_string()))?;
        visitor.visit("/", &root);

        if path == "/" {
            return Ok(root);
        }

        let mut current = String::new();
        let mut target = None;
        for part in path[1..].split('/') {
            current.push('/');
            current.push_str(part);
            let inode = table
                .get(&current)
                .cloned()
                .ok_or_else(|| Error::NotFound(current.clone()))?;
            visitor.visit(part, &inode);
            target = Some(inode);
        }

        Ok(target.unwrap_or(root))
    }

    /// Resolve a path along with its parent's identity, for export
    pub fn resolve_with_parent(&self, path: &str) -> Result<(Arc<RwLock<Inode>>, u64, String)> {
        struct RememberParent {
            parent_id: u64,
            parent_name: String,
            last_id: u64,
            last_name: String,
        }

        impl PathVisitor for RememberParent {
            fn visit(&mut self, name: &str, inode: &Arc<RwLock<Inode>>) {
                self.parent_id = self.last_id;
                self.parent_name = std::mem::take(&mut self.last_name);
                self.last_id = inode.read().unwrap().file_id();
                self.last_name = name.to_string();
            }
        }

        let mut rp = RememberParent {
            parent_id: 0,
            parent_name: String::new(),
            last_id: 0,
            last_name: String::new(),
        };

        let target = self.walk(path, &mut rp)?;
        Ok((target, rp.parent_id, rp.parent_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::inode::InodeType;

    fn inode(name: &str, itype: InodeType, file_id: u64) -> Inode {
        let mut i = Inode::new(itype, name, 1, 1, 0, 0o755);
        i.set_file_id(file_id);
        i
    }

    fn test_ns() -> Namespace {
        Namespace::new(inode("/", InodeType::Dir, 1))
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a/b/"), "/a/b");
        assert_eq!(normalize("a//b"), "/a/b");
        assert_eq!(normalize("/"), "/");
        assert_eq!(parent_of("/a/b"), "/a");
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(basename("/a/b"), "b");
    }

    #[test]
    fn test_insert_requires_parent() {
        let ns = test_ns();
        assert!(ns.insert("/a/b", inode("b", InodeType::File, 3)).is_err());
        ns.insert("/a", inode("a", InodeType::Dir, 2)).unwrap();
        ns.insert("/a/b", inode("b", InodeType::File, 3)).unwrap();
        assert!(ns.contains("/a/b"));
    }

    #[test]
    fn test_remove_refuses_nonempty() {
        let ns = test_ns();
        ns.insert("/a", inode("a", InodeType::Dir, 2)).unwrap();
        ns.insert("/a/b", inode("b", InodeType::File, 3)).unwrap();

        assert!(ns.remove("/a").is_err());
        ns.remove("/a/b").unwrap();
        ns.remove("/a").unwrap();
        assert!(!ns.contains("/a"));
    }

    #[test]
    fn test_rename_moves_subtree() {
        let ns = test_ns();
        ns.insert("/a", inode("a", InodeType::Dir, 2)).unwrap();
        ns.insert("/a/b", inode("b", InodeType::File, 3)).unwrap();

        ns.rename("/a", "/c").unwrap();
        assert!(ns.contains("/c/b"));
        assert!(!ns.contains("/a/b"));
    }

    #[test]
    fn test_list_children() {
        let ns = test_ns();
        ns.insert("/a", inode("a", InodeType::Dir, 2)).unwrap();
        ns.insert("/a/x", inode("x", InodeType::File, 3)).unwrap();
        ns.insert("/a/y", inode("y", InodeType::File, 4)).unwrap();
        ns.insert("/b", inode("b", InodeType::File, 5)).unwrap();

        assert_eq!(ns.list_children("/"), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            ns.list_children("/a"),
            vec!["x".to_string(), "y".to_string()]
        );
    }

    #[test]
    fn test_resolve_with_parent() {
        let ns = test_ns();
        ns.insert("/a", inode("a", InodeType::Dir, 2)).unwrap();
        ns.insert("/a/b", inode("b", InodeType::File, 3)).unwrap();

        let (target, parent_id, parent_name) = ns.resolve_with_parent("/a/b").unwrap();
        assert_eq!(target.read().unwrap().file_id(), 3);
        assert_eq!(parent_id, 2);
        assert_eq!(parent_name, "a");

        let (_, root_parent_id, _) = ns.resolve_with_parent("/a").unwrap();
        assert_eq!(root_parent_id, 1);
    }
}
