//! Real/effective/saved uid/gid plus supplementary groups (spec §3
//! "Identity"). Every mutation is mirrored to the proxy before taking
//! effect locally; the proxy round trip is modeled behind
//! [`IdentitySink`] so this module stays testable without a live proxy
//! connection.

use crate::error::{Result, Status};

pub const MAX_SUPPLEMENTARY_GROUPS: usize = 32;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Identity {
    pub ruid: u32,
    pub euid: u32,
    pub suid: u32,
    pub rgid: u32,
    pub egid: u32,
    pub sgid: u32,
    ngids: usize,
    gids: [u32; MAX_SUPPLEMENTARY_GROUPS],
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            ruid: 0,
            euid: 0,
            suid: 0,
            rgid: 0,
            egid: 0,
            sgid: 0,
            ngids: 0,
            gids: [0; MAX_SUPPLEMENTARY_GROUPS],
        }
    }
}

/// The proxy-side mirror a mutation must reach before it takes effect
/// locally (spec §3: "Every mutation is mirrored to the proxy before
/// taking effect locally").
pub trait IdentitySink {
    fn set_uids(&self, ruid: u32, euid: u32, suid: u32) -> Result<()>;
    fn set_gids(&self, rgid: u32, egid: u32, sgid: u32) -> Result<()>;
    fn set_groups(&self, gids: &[u32]) -> Result<()>;
}

impl Identity {
    pub fn is_privileged(&self) -> bool {
        self.euid == 0
    }

    pub fn groups(&self) -> &[u32] {
        &self.gids[..self.ngids]
    }

    pub fn setresuid(
        &mut self,
        sink: &dyn IdentitySink,
        ruid: Option<u32>,
        euid: Option<u32>,
        suid: Option<u32>,
    ) -> Result<()> {
        if !self.is_privileged() {
            // Unprivileged worlds may only set each id to one of the three
            // existing ids (standard POSIX setresuid semantics).
            let allowed = |v: u32| v == self.ruid || v == self.euid || v == self.suid;
            if ruid.is_some_and(|v| !allowed(v))
                || euid.is_some_and(|v| !allowed(v))
                || suid.is_some_and(|v| !allowed(v))
            {
                return Err(Status::NoAccess);
            }
        }

        let new_ruid = ruid.unwrap_or(self.ruid);
        let new_euid = euid.unwrap_or(self.euid);
        let new_suid = suid.unwrap_or(self.suid);

        sink.set_uids(new_ruid, new_euid, new_suid)?;

        self.ruid = new_ruid;
        self.euid = new_euid;
        self.suid = new_suid;
        Ok(())
    }

    pub fn setresgid(
        &mut self,
        sink: &dyn IdentitySink,
        rgid: Option<u32>,
        egid: Option<u32>,
        sgid: Option<u32>,
    ) -> Result<()> {
        if !self.is_privileged() {
            let allowed = |v: u32| v == self.rgid || v == self.egid || v == self.sgid;
            if rgid.is_some_and(|v| !allowed(v))
                || egid.is_some_and(|v| !allowed(v))
                || sgid.is_some_and(|v| !allowed(v))
            {
                return Err(Status::NoAccess);
            }
        }

        let new_rgid = rgid.unwrap_or(self.rgid);
        let new_egid = egid.unwrap_or(self.egid);
        let new_sgid = sgid.unwrap_or(self.sgid);

        sink.set_gids(new_rgid, new_egid, new_sgid)?;

        self.rgid = new_rgid;
        self.egid = new_egid;
        self.sgid = new_sgid;
        Ok(())
    }

    /// `setgroups`-equivalent. The 32-entry cap comes from spec §3's data
    /// model (`gids: [32] u32`); rejecting an oversized list with
    /// `BadParam` is recovered from `original_source/user/linuxIdent.c`
    /// (see `SPEC_FULL.md` §10), which spec.md only implies via the fixed
    /// array size.
    pub fn setgroups(&mut self, sink: &dyn IdentitySink, gids: &[u32]) -> Result<()> {
        if !self.is_privileged() {
            return Err(Status::NoAccess);
        }
        if gids.len() > MAX_SUPPLEMENTARY_GROUPS {
            return Err(Status::BadParam);
        }

        sink.set_groups(gids)?;

        self.gids[..gids.len()].copy_from_slice(gids);
        self.ngids = gids.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<String>>,
    }

    impl IdentitySink for RecordingSink {
        fn set_uids(&self, ruid: u32, euid: u32, suid: u32) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("uids({ruid},{euid},{suid})"));
            Ok(())
        }
        fn set_gids(&self, rgid: u32, egid: u32, sgid: u32) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("gids({rgid},{egid},{sgid})"));
            Ok(())
        }
        fn set_groups(&self, gids: &[u32]) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("groups({gids:?})"));
            Ok(())
        }
    }

    #[test]
    fn unprivileged_setresuid_rejects_foreign_uid() {
        let mut id = Identity {
            ruid: 1,
            euid: 1,
            suid: 1,
            ..Default::default()
        };
        let sink = RecordingSink::default();
        assert_eq!(
            id.setresuid(&sink, Some(2), None, None),
            Err(Status::NoAccess)
        );
    }

    #[test]
    fn root_can_set_arbitrary_uid() {
        let mut id = Identity::default();
        let sink = RecordingSink::default();
        id.setresuid(&sink, Some(500), Some(500), None).unwrap();
        assert_eq!(id.ruid, 500);
        assert_eq!(id.euid, 500);
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn setgroups_rejects_oversized_list() {
        let mut id = Identity::default();
        let sink = RecordingSink::default();
        let gids: Vec<u32> = (0..40).collect();
        assert_eq!(id.setgroups(&sink, &gids), Err(Status::BadParam));
    }

    #[test]
    fn setgroups_unprivileged_denied() {
        let mut id = Identity {
            euid: 1,
            ..Default::default()
        };
        let sink = RecordingSink::default();
        assert_eq!(id.setgroups(&sink, &[1, 2]), Err(Status::NoAccess));
    }
}
