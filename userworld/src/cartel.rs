//! `Cartel`: the per-process (spec's "cartel") bundle of a descriptor
//! table, current-working-directory object, host-resource proxy
//! connection and identity, tying the other modules together the way
//! `original_source/user/userObj.c`'s `World_Cartel` struct does.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::CartelConfig;
use crate::descriptor_table::DescriptorTable;
use crate::error::{Result, Status};
use crate::flags::{OpenFlags, TraverseFlags};
use crate::identity::Identity;
use crate::ids::CartelId;
use crate::object::Object;
use crate::path::{Resolved, RootDir, Traversal};
use crate::proxy::ProxyConnection;
use crate::scheduler::Scheduler;

pub struct Cartel {
    pub id: CartelId,
    pub config: CartelConfig,
    pub descriptors: DescriptorTable,
    pub proxy: Arc<ProxyConnection>,
    pub scheduler: Arc<dyn Scheduler>,
    pub identity: Identity,
    root: Object,
    cwd: Mutex<Object>,
}

impl std::fmt::Debug for Cartel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cartel")
            .field("id", &self.id)
            .field("descriptors", &self.descriptors)
            .finish()
    }
}

impl Cartel {
    pub fn new(
        id: CartelId,
        config: CartelConfig,
        proxy: Arc<ProxyConnection>,
        scheduler: Arc<dyn Scheduler>,
        identity: Identity,
    ) -> Arc<Self> {
        let root = Object::new_root(RootDir::new(proxy.clone()), OpenFlags::STAT | OpenFlags::DIRECTORY);
        let cwd = root.clone();
        Arc::new(Self {
            descriptors: DescriptorTable::new(config.descriptor_table_capacity),
            id,
            config,
            proxy,
            scheduler,
            identity,
            root,
            cwd: Mutex::new(cwd),
        })
    }

    pub fn root(&self) -> Object {
        self.root.clone()
    }

    pub fn cwd(&self) -> Object {
        self.cwd.lock().clone()
    }

    /// `chdir`: the new directory must itself resolve to a directory
    /// object (spec §4.1).
    pub fn set_cwd(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path, OpenFlags::STAT | OpenFlags::DIRECTORY, TraverseFlags::empty(), 0)?;
        let Resolved::Object(obj) = resolved else {
            return Err(Status::NotFound);
        };
        if obj.as_directory().is_none() {
            return Err(Status::NotADirectory);
        }
        *self.cwd.lock() = obj;
        Ok(())
    }

    /// Resolves `path` relative to this cartel's current working
    /// directory (or the root, for an absolute path) — spec §4.2's
    /// traversal entry point as the rest of the crate actually calls it.
    pub fn resolve(
        &self,
        path: &str,
        flags: OpenFlags,
        traverse: TraverseFlags,
        create_mode: u32,
    ) -> Result<Resolved> {
        let trav = Traversal::new(&self.root);
        trav.resolve(&self.cwd(), path, flags, traverse, create_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::tests::make_test_proxy;
    use crate::scheduler::local::LocalScheduler;

    fn new_test_cartel() -> Arc<Cartel> {
        let proxy = make_test_proxy();
        let scheduler: Arc<dyn Scheduler> = LocalScheduler::new();
        Cartel::new(CartelId(1), CartelConfig::default(), proxy, scheduler, Identity::default())
    }

    #[test]
    fn fresh_cartel_cwd_is_root() {
        let cartel = new_test_cartel();
        assert!(cartel.cwd().ptr_eq(&cartel.root()));
    }

    #[test]
    fn resolve_creates_relative_to_cwd() {
        let cartel = new_test_cartel();
        let resolved = cartel
            .resolve("newfile", OpenFlags::CREATE | OpenFlags::RDWR, TraverseFlags::empty(), 0o644)
            .unwrap();
        assert!(matches!(resolved, Resolved::Created(_)));
    }
}
