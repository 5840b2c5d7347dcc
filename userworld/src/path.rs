//! Path traversal (spec §4.2) and the `Root` object variant. The root (and
//! any directory resolved through the proxy) implements `DirectoryOps` by
//! delegating to the per-cartel proxy connection, in the style of
//! `devices::virtio::fs::macos::passthrough::PassthroughFs`'s
//! parent-handle + name lookup rather than whole-path string RPCs.

use std::sync::Arc;

use crate::error::{Result, Status};
use crate::flags::{OpenFlags, TraverseFlags, MAX_ARC_LEN, MAX_PATH_LEN, MAX_SYMLINK_DEPTH};
use crate::object::{ChildLookup, DirectoryOps, Object, ObjectOps, ObjectType};
use crate::proxy::ProxyConnection;

/// The `Root` object variant: the cartel's root directory, acquired via
/// the proxy (spec §4.2 rule 1). All directory traversal below the root
/// is done by the proxy's lookup-by-parent-handle RPC; a `Root` is simply
/// the well-known top-level handle for that same RPC surface.
#[derive(Debug)]
pub struct RootDir {
    proxy: Arc<ProxyConnection>,
}

impl RootDir {
    pub fn new(proxy: Arc<ProxyConnection>) -> Arc<Self> {
        Arc::new(Self { proxy })
    }
}

impl ObjectOps for RootDir {
    fn object_type(&self) -> ObjectType {
        ObjectType::Root
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn size(&self) -> Result<u64> {
        Ok(0)
    }

    fn as_directory(&self) -> Option<&dyn DirectoryOps> {
        Some(self)
    }

    fn to_string_repr(&self) -> String {
        "Root".to_string()
    }
}

impl DirectoryOps for RootDir {
    fn lookup_child(&self, name: &str, flags: OpenFlags) -> Result<ChildLookup> {
        self.proxy.lookup_root(name, flags)
    }

    fn create_child(&self, name: &str, flags: OpenFlags, mode: u32) -> Result<Object> {
        self.proxy.create_root(name, flags, mode)
    }

    fn unlink_child(&self, name: &str, is_dir_hint: bool) -> Result<()> {
        self.proxy.unlink_root(name, is_dir_hint)
    }

    fn rename_child(&self, name: &str, new_parent: &dyn DirectoryOps, new_name: &str) -> Result<()> {
        let _ = (new_parent, new_name);
        self.proxy.rename_root(name, new_name)
    }

    fn mkdir(&self, name: &str, mode: u32) -> Result<()> {
        self.proxy.mkdir_root(name, mode)
    }

    fn symlink(&self, name: &str, target: &str) -> Result<()> {
        self.proxy.symlink_root(name, target)
    }

    fn hardlink(&self, name: &str, _target: &dyn DirectoryOps, target_name: &str) -> Result<()> {
        self.proxy.hardlink_root(name, target_name)
    }

    fn readlink(&self, name: &str) -> Result<String> {
        self.proxy.readlink_root(name)
    }

    fn mknod(&self, name: &str, mode: u32, dev: u64) -> Result<()> {
        self.proxy.mknod_root(name, mode, dev)
    }
}

/// Result of resolving a path (spec §4.2 "Outputs").
pub enum Resolved {
    /// Fully resolved object that already existed (`arc == ""`).
    Object(Object),
    /// Last arc does not exist and creation was not requested: the parent
    /// directory object plus the unresolved final arc.
    Parent(Object, String),
    /// The final arc did not exist and was just created by this call
    /// (`OpenFlags::CREATE`) — distinct from `Object` so a caller can
    /// tell "already there" from "I just made this" (spec.md:84's
    /// `Create|Exclusive` only fails with `Exists` if the arc was
    /// *already present*, not when this very call created it).
    Created(Object),
}

/// Arc-by-arc resolution with symlink recursion (spec §4.2).
pub struct Traversal<'a> {
    root: &'a Object,
}

impl<'a> Traversal<'a> {
    pub fn new(root: &'a Object) -> Self {
        Self { root }
    }

    /// Resolves `path` starting at `start` (or `self.root` for absolute
    /// paths), per spec §4.2 rules 1-6.
    pub fn resolve(
        &self,
        start: &Object,
        path: &str,
        flags: OpenFlags,
        traverse: TraverseFlags,
        create_mode: u32,
    ) -> Result<Resolved> {
        if path.len() > MAX_PATH_LEN {
            return Err(Status::NameTooLong);
        }

        self.resolve_inner(start, path, flags, traverse, create_mode, 0)
    }

    fn resolve_inner(
        &self,
        start: &Object,
        path: &str,
        flags: OpenFlags,
        traverse: TraverseFlags,
        create_mode: u32,
        symlink_depth: u32,
    ) -> Result<Resolved> {
        if symlink_depth > MAX_SYMLINK_DEPTH {
            return Err(Status::IsSymlink);
        }

        let absolute = path.starts_with('/');
        let mut current = if absolute {
            self.root.clone()
        } else {
            start.clone()
        };

        // Rule 2: collapse consecutive slashes, split into arcs.
        let mut arcs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let had_trailing_slash = path.ends_with('/') && path.len() > 1;

        if arcs.is_empty() {
            // "/", "", or all-slashes: resolves to the starting directory.
            return Ok(Resolved::Object(current));
        }

        let final_arc_is_dir_marker = had_trailing_slash && !traverse.contains(TraverseFlags::IGN_TRAILING);
        let final_idx = arcs.len() - 1;
        let want_penultimate = traverse.contains(TraverseFlags::PENULTIMATE);

        let mut idx = 0;
        while idx < arcs.len() {
            let arc = arcs[idx];
            if arc.len() > MAX_ARC_LEN {
                return Err(Status::NameTooLong);
            }
            if arc == "." {
                idx += 1;
                continue;
            }

            let is_final = idx == final_idx;
            let stop_before_final = want_penultimate && is_final;

            if stop_before_final {
                return Ok(Resolved::Parent(current, arc.to_string()));
            }

            // Rule 3: non-final arcs must resolve through a directory.
            let dir = current
                .as_directory()
                .ok_or(Status::NotADirectory)?;

            let lookup_flags = if is_final {
                let mut f = flags;
                if final_arc_is_dir_marker {
                    f |= OpenFlags::DIRECTORY;
                }
                f
            } else {
                OpenFlags::STAT | OpenFlags::DIRECTORY
            };

            match dir.lookup_child(arc, lookup_flags)? {
                ChildLookup::Found(obj) => {
                    if is_final && final_arc_is_dir_marker && obj.as_directory().is_none() {
                        return Err(Status::NotADirectory);
                    }

                    // Rule 4: symlink recursion on the final arc only
                    // (intermediate arcs are resolved by the proxy's own
                    // lookup, which already follows links server-side).
                    if is_final
                        && !flags.contains(OpenFlags::NOFOLLOW)
                        && !traverse.contains(TraverseFlags::NO_FOLLOW)
                    {
                        if let Some(target) = self.try_read_symlink(&obj)? {
                            return self.follow_symlink(&current, &target, flags, traverse, create_mode, symlink_depth);
                        }
                    }

                    if is_final {
                        return Ok(Resolved::Object(obj));
                    }
                    current = obj;
                }
                ChildLookup::NotFound => {
                    if is_final {
                        if flags.contains(OpenFlags::CREATE) {
                            let created = dir.create_child(arc, flags, create_mode)?;
                            return Ok(Resolved::Created(created));
                        }
                        return Ok(Resolved::Parent(current, arc.to_string()));
                    }
                    return Err(Status::NotFound);
                }
            }

            idx += 1;
        }

        unreachable!("loop always returns on the final arc")
    }

    fn try_read_symlink(&self, obj: &Object) -> Result<Option<String>> {
        if let Some(proxy) = obj.as_proxy() {
            return proxy.read_symlink_if_any();
        }
        Ok(None)
    }

    fn follow_symlink(
        &self,
        current_dir: &Object,
        target: &str,
        flags: OpenFlags,
        traverse: TraverseFlags,
        create_mode: u32,
        symlink_depth: u32,
    ) -> Result<Resolved> {
        let (start, path) = if target.starts_with('/') {
            (self.root.clone(), target.to_string())
        } else {
            (current_dir.clone(), target.to_string())
        };
        self.resolve_inner(&start, &path, flags, traverse, create_mode, symlink_depth + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::tests::make_test_proxy;

    #[test]
    fn empty_path_resolves_to_start() {
        let proxy = make_test_proxy();
        let root = Object::new_root(RootDir::new(proxy), OpenFlags::STAT);
        let trav = Traversal::new(&root);
        match trav.resolve(&root, "", OpenFlags::STAT, TraverseFlags::empty(), 0) {
            Ok(Resolved::Object(obj)) => assert!(obj.ptr_eq(&root)),
            _ => panic!("expected Resolved::Object"),
        }
    }

    #[test]
    fn too_long_path_rejected() {
        let proxy = make_test_proxy();
        let root = Object::new_root(RootDir::new(proxy), OpenFlags::STAT);
        let trav = Traversal::new(&root);
        let long = "a".repeat(MAX_PATH_LEN + 1);
        assert_eq!(
            trav.resolve(&root, &long, OpenFlags::STAT, TraverseFlags::empty(), 0)
                .unwrap_err(),
            Status::NameTooLong
        );
    }

    #[test]
    fn not_found_without_create_returns_parent() {
        let proxy = make_test_proxy();
        let root = Object::new_root(RootDir::new(proxy), OpenFlags::STAT);
        let trav = Traversal::new(&root);
        match trav
            .resolve(&root, "/missing", OpenFlags::RDWR, TraverseFlags::empty(), 0)
            .unwrap()
        {
            Resolved::Parent(parent, arc) => {
                assert!(parent.ptr_eq(&root));
                assert_eq!(arc, "missing");
            }
            _ => panic!("expected Parent"),
        }
    }

    #[test]
    fn create_makes_a_new_file() {
        let proxy = make_test_proxy();
        let root = Object::new_root(RootDir::new(proxy), OpenFlags::STAT);
        let trav = Traversal::new(&root);
        match trav
            .resolve(
                &root,
                "/a",
                OpenFlags::CREATE | OpenFlags::RDWR,
                TraverseFlags::empty(),
                0o644,
            )
            .unwrap()
        {
            Resolved::Created(obj) => assert_eq!(obj.object_type(), crate::object::ObjectType::ProxyFile),
            Resolved::Object(_) | Resolved::Parent(..) => panic!("expected Created after create"),
        }
    }

    #[test]
    fn penultimate_stops_one_arc_early() {
        let proxy = make_test_proxy();
        let root = Object::new_root(RootDir::new(proxy), OpenFlags::STAT);
        let trav = Traversal::new(&root);
        match trav
            .resolve(
                &root,
                "/a",
                OpenFlags::RDWR,
                TraverseFlags::PENULTIMATE,
                0,
            )
            .unwrap()
        {
            Resolved::Parent(parent, arc) => {
                assert!(parent.ptr_eq(&root));
                assert_eq!(arc, "a");
            }
            _ => panic!("expected Parent under PENULTIMATE"),
        }
    }
}
