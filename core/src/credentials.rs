//! User credential resolution and the one-time privilege switch
//!
//! Resolution turns an account name (and optional group name) into a
//! numeric identity plus supplementary group list; switching applies that
//! identity to the calling process, once, before any role code runs.
//!
//! ## Group enumeration
//!
//! Resolution happens in the coordinating process so a freshly forked
//! worker never blocks on directory lookups. When the resolver runs as
//! super-user it also captures the target user's supplementary groups.
//! There is no portable "list groups for user X" primitive, so the
//! resolver saves its own group set, temporarily adopts the target user's
//! groups via the group-initialization primitive, reads the result back,
//! and restores the saved set. The saved set is restored unconditionally;
//! a failed restore turns the whole call into a failure.
//!
//! This group mutation is a process-wide side effect: callers must not run
//! any other privilege-sensitive operation concurrently with resolution.
//!
//! ## Switch order
//!
//! The switch order is fixed: primary group, supplementary groups, then
//! user id. The user id goes last; once it has changed the process can no
//! longer change its groups.

#![allow(unsafe_code)]

use crate::{platform, CoreError, Result};
use nix::errno::Errno;
use nix::unistd::{self, Gid, Uid};
use std::ffi::CString;
use tracing::{debug, error};

/// How the target user's supplementary groups will be established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupplementaryGroups {
    /// The exact group list, captured at resolution time by the
    /// save/adopt/read/restore sequence.
    Enumerated(Vec<Gid>),
    /// Enumeration was skipped (resolver not super-user) or unsupported
    /// (platform reported more groups than its hard cap); the switcher
    /// calls the group-initialization primitive in the target process
    /// instead.
    InitAtSwitch,
}

/// A resolved user identity, ready to be applied by [`apply_credential`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredential {
    /// The account name the identity was resolved from.
    pub user: String,
    pub uid: Uid,
    pub base_gid: Gid,
    pub groups: SupplementaryGroups,
}

/// Identity operations of the underlying platform.
///
/// [`SystemIdentity`] is the real implementation; [`MockIdentity`] records
/// calls and injects failures for tests. Lookup misses are `Ok(None)`;
/// `Err` means the query itself failed.
pub trait IdentityOps: Send + Sync {
    fn lookup_user(&self, name: &str) -> std::result::Result<Option<(Uid, Gid)>, Errno>;
    fn lookup_group(&self, name: &str) -> std::result::Result<Option<Gid>, Errno>;
    fn effective_uid(&self) -> Uid;
    /// Snapshot of the calling process's current supplementary groups.
    fn current_groups(&self) -> std::result::Result<Vec<Gid>, Errno>;
    fn set_groups(&self, groups: &[Gid]) -> std::result::Result<(), Errno>;
    fn init_groups(&self, user: &str, gid: Gid) -> std::result::Result<(), Errno>;
    fn set_gid(&self, gid: Gid) -> std::result::Result<(), Errno>;
    fn set_uid(&self, uid: Uid) -> std::result::Result<(), Errno>;
    /// Hard cap on supplementary groups the platform can report.
    fn max_groups(&self) -> usize;
}

/// Resolve a user name (and optional group name) against the system
/// directory.
///
/// # Errors
///
/// [`CoreError::UserNotFound`] / [`CoreError::GroupNotFound`] for clean
/// misses, [`CoreError::LookupFailed`] when the directory query errored,
/// [`CoreError::GroupEnumeration`] when the super-user group capture
/// failed part-way.
pub fn resolve_credential(user: &str, group: Option<&str>) -> Result<UserCredential> {
    resolve_with(&SystemIdentity, user, group)
}

/// Apply a resolved credential to the calling process.
///
/// Called at most once per process, before any untrusted code executes.
/// Any failure must be treated as fatal by the caller: the sequence never
/// leaves a usable half-switched identity behind.
pub fn apply_credential(cred: &UserCredential) -> Result<()> {
    apply_with(&SystemIdentity, cred)
}

/// [`resolve_credential`] over any [`IdentityOps`] implementation.
pub fn resolve_with(ops: &dyn IdentityOps, user: &str, group: Option<&str>) -> Result<UserCredential> {
    let (uid, mut base_gid) = match ops.lookup_user(user) {
        Ok(Some(ids)) => ids,
        Ok(None) => {
            error!("getpwnam(\"{}\") failed, user \"{}\" not found", user, user);
            return Err(CoreError::UserNotFound(user.to_string()));
        }
        Err(errno) => {
            error!("getpwnam(\"{}\") failed: {}", user, errno);
            return Err(CoreError::LookupFailed {
                name: user.to_string(),
                errno,
            });
        }
    };

    if let Some(group) = group.filter(|g| !g.is_empty()) {
        base_gid = match ops.lookup_group(group) {
            Ok(Some(gid)) => gid,
            Ok(None) => {
                error!("getgrnam(\"{}\") failed, group \"{}\" not found", group, group);
                return Err(CoreError::GroupNotFound(group.to_string()));
            }
            Err(errno) => {
                error!("getgrnam(\"{}\") failed: {}", group, errno);
                return Err(CoreError::LookupFailed {
                    name: group.to_string(),
                    errno,
                });
            }
        };
    }

    // Group enumeration for another identity is privileged; skip it
    // entirely when the resolver is not super-user.
    let groups = if ops.effective_uid().is_root() {
        enumerate_groups(ops, user, base_gid)?
    } else {
        debug!("not super-user, deferring group setup for \"{}\" to switch time", user);
        SupplementaryGroups::InitAtSwitch
    };

    Ok(UserCredential {
        user: user.to_string(),
        uid,
        base_gid,
        groups,
    })
}

/// Capture `user`'s supplementary groups by temporarily adopting them.
///
/// Mutates the calling process's live group set; the saved set is put
/// back before returning, and a failed restore overrides any earlier
/// success.
fn enumerate_groups(ops: &dyn IdentityOps, user: &str, base_gid: Gid) -> Result<SupplementaryGroups> {
    let saved = ops.current_groups().map_err(|errno| {
        error!("getgroups() failed: {}", errno);
        CoreError::GroupEnumeration(format!("getgroups() failed: {}", errno))
    })?;

    debug!("saved {} supplementary groups", saved.len());

    if saved.len() > ops.max_groups() {
        // The platform reports more groups than its own cap, so a
        // read-back through getgroups cannot be trusted here. Fall back
        // to switch-time initialization rather than guessing.
        debug!(
            "group set ({}) exceeds platform cap ({}), enumeration unsupported here",
            saved.len(),
            ops.max_groups()
        );
        return Ok(SupplementaryGroups::InitAtSwitch);
    }

    let captured = ops
        .init_groups(user, base_gid)
        .map_err(|errno| {
            error!("initgroups({}, {}) failed: {}", user, base_gid, errno);
            CoreError::GroupEnumeration(format!(
                "initgroups({}, {}) failed: {}",
                user, base_gid, errno
            ))
        })
        .and_then(|()| {
            ops.current_groups().map_err(|errno| {
                error!("getgroups() failed: {}", errno);
                CoreError::GroupEnumeration(format!("getgroups() failed: {}", errno))
            })
        });

    // Restore the resolver's own groups unconditionally, even if the
    // adopt or read-back step failed above.
    if let Err(errno) = ops.set_groups(&saved) {
        error!("setgroups({}) failed restoring saved groups: {}", saved.len(), errno);
        return Err(CoreError::GroupEnumeration(format!(
            "setgroups({}) failed restoring saved groups: {}",
            saved.len(),
            errno
        )));
    }

    let gids = captured?;
    debug!(
        "user \"{}\" cred: base gid {}, {} supplementary groups",
        user,
        base_gid,
        gids.len()
    );

    Ok(SupplementaryGroups::Enumerated(gids))
}

/// [`apply_credential`] over any [`IdentityOps`] implementation.
pub fn apply_with(ops: &dyn IdentityOps, cred: &UserCredential) -> Result<()> {
    debug!(
        "user cred set: \"{}\" uid {} base gid {}",
        cred.user, cred.uid, cred.base_gid
    );

    ops.set_gid(cred.base_gid).map_err(|errno| {
        error!("setgid({}) failed: {}", cred.base_gid, errno);
        CoreError::PrivilegeSwitch(format!("setgid({}) failed: {}", cred.base_gid, errno))
    })?;

    match &cred.groups {
        SupplementaryGroups::Enumerated(gids) => {
            ops.set_groups(gids).map_err(|errno| {
                error!("setgroups({}) failed: {}", gids.len(), errno);
                CoreError::PrivilegeSwitch(format!("setgroups({}) failed: {}", gids.len(), errno))
            })?;
        }
        SupplementaryGroups::InitAtSwitch => {
            ops.init_groups(&cred.user, cred.base_gid).map_err(|errno| {
                error!("initgroups({}, {}) failed: {}", cred.user, cred.base_gid, errno);
                CoreError::PrivilegeSwitch(format!(
                    "initgroups({}, {}) failed: {}",
                    cred.user, cred.base_gid, errno
                ))
            })?;
        }
    }

    ops.set_uid(cred.uid).map_err(|errno| {
        error!("setuid({}) failed: {}", cred.uid, errno);
        CoreError::PrivilegeSwitch(format!("setuid({}) failed: {}", cred.uid, errno))
    })?;

    Ok(())
}

/// Real identity operations backed by the platform directory and
/// credential syscalls.
///
/// The group calls go through raw libc: their signatures differ across
/// platforms, and the width of the count argument is left to inference.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemIdentity;

impl IdentityOps for SystemIdentity {
    fn lookup_user(&self, name: &str) -> std::result::Result<Option<(Uid, Gid)>, Errno> {
        let user = unistd::User::from_name(name)?;
        Ok(user.map(|u| (u.uid, u.gid)))
    }

    fn lookup_group(&self, name: &str) -> std::result::Result<Option<Gid>, Errno> {
        let group = unistd::Group::from_name(name)?;
        Ok(group.map(|g| g.gid))
    }

    fn effective_uid(&self) -> Uid {
        unistd::geteuid()
    }

    fn current_groups(&self) -> std::result::Result<Vec<Gid>, Errno> {
        let count = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
        if count < 0 {
            return Err(Errno::last());
        }
        let mut buf = vec![0 as libc::gid_t; count as usize];
        let filled = unsafe { libc::getgroups(count, buf.as_mut_ptr()) };
        if filled < 0 {
            return Err(Errno::last());
        }
        buf.truncate(filled as usize);
        Ok(buf.into_iter().map(Gid::from_raw).collect())
    }

    fn set_groups(&self, groups: &[Gid]) -> std::result::Result<(), Errno> {
        let raw: Vec<libc::gid_t> = groups.iter().map(|g| g.as_raw()).collect();
        let rc = unsafe { libc::setgroups(raw.len() as _, raw.as_ptr()) };
        if rc != 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    fn init_groups(&self, user: &str, gid: Gid) -> std::result::Result<(), Errno> {
        let user = CString::new(user).map_err(|_| Errno::EINVAL)?;
        let rc = unsafe { libc::initgroups(user.as_ptr(), gid.as_raw() as _) };
        if rc != 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    fn set_gid(&self, gid: Gid) -> std::result::Result<(), Errno> {
        unistd::setgid(gid)
    }

    fn set_uid(&self, uid: Uid) -> std::result::Result<(), Errno> {
        unistd::setuid(uid)
    }

    fn max_groups(&self) -> usize {
        platform::max_supplementary_groups()
    }
}

/// Recorded identity operation, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityCall {
    LookupUser(String),
    LookupGroup(String),
    CurrentGroups,
    SetGroups(Vec<Gid>),
    InitGroups(String, Gid),
    SetGid(Gid),
    SetUid(Uid),
}

/// Mock identity backend for tests: an in-memory account directory, a
/// live group set, call recording, and per-operation failure injection.
#[derive(Debug, Default)]
pub struct MockIdentity {
    users: std::collections::HashMap<String, (Uid, Gid)>,
    group_db: std::collections::HashMap<String, Gid>,
    /// Groups `init_groups` installs per user name.
    user_groups: std::collections::HashMap<String, Vec<Gid>>,
    euid: u32,
    max_groups: usize,
    live_groups: std::sync::Mutex<Vec<Gid>>,
    calls: std::sync::Mutex<Vec<IdentityCall>>,
    failing: std::sync::Mutex<std::collections::HashSet<&'static str>>,
}

impl MockIdentity {
    pub fn new() -> Self {
        Self {
            max_groups: 65536,
            ..Self::default()
        }
    }

    pub fn with_euid(mut self, euid: u32) -> Self {
        self.euid = euid;
        self
    }

    pub fn with_user(mut self, name: &str, uid: u32, gid: u32) -> Self {
        self.users
            .insert(name.to_string(), (Uid::from_raw(uid), Gid::from_raw(gid)));
        self
    }

    pub fn with_group(mut self, name: &str, gid: u32) -> Self {
        self.group_db.insert(name.to_string(), Gid::from_raw(gid));
        self
    }

    pub fn with_user_groups(mut self, name: &str, gids: &[u32]) -> Self {
        self.user_groups.insert(
            name.to_string(),
            gids.iter().copied().map(Gid::from_raw).collect(),
        );
        self
    }

    pub fn with_live_groups(self, gids: &[u32]) -> Self {
        *self.live_groups.lock().unwrap() = gids.iter().copied().map(Gid::from_raw).collect();
        self
    }

    pub fn with_max_groups(mut self, max: usize) -> Self {
        self.max_groups = max;
        self
    }

    /// Make the named operation fail with `EPERM` from now on.
    pub fn fail_on(self, op: &'static str) -> Self {
        self.failing.lock().unwrap().insert(op);
        self
    }

    pub fn calls(&self) -> Vec<IdentityCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn live_groups(&self) -> Vec<Gid> {
        self.live_groups.lock().unwrap().clone()
    }

    fn record(&self, call: IdentityCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, op: &'static str) -> std::result::Result<(), Errno> {
        if self.failing.lock().unwrap().contains(op) {
            return Err(Errno::EPERM);
        }
        Ok(())
    }
}

impl IdentityOps for MockIdentity {
    fn lookup_user(&self, name: &str) -> std::result::Result<Option<(Uid, Gid)>, Errno> {
        self.record(IdentityCall::LookupUser(name.to_string()));
        self.check("lookup_user").map_err(|_| Errno::EIO)?;
        Ok(self.users.get(name).copied())
    }

    fn lookup_group(&self, name: &str) -> std::result::Result<Option<Gid>, Errno> {
        self.record(IdentityCall::LookupGroup(name.to_string()));
        self.check("lookup_group").map_err(|_| Errno::EIO)?;
        Ok(self.group_db.get(name).copied())
    }

    fn effective_uid(&self) -> Uid {
        Uid::from_raw(self.euid)
    }

    fn current_groups(&self) -> std::result::Result<Vec<Gid>, Errno> {
        self.record(IdentityCall::CurrentGroups);
        self.check("current_groups")?;
        Ok(self.live_groups())
    }

    fn set_groups(&self, groups: &[Gid]) -> std::result::Result<(), Errno> {
        self.record(IdentityCall::SetGroups(groups.to_vec()));
        self.check("set_groups")?;
        *self.live_groups.lock().unwrap() = groups.to_vec();
        Ok(())
    }

    fn init_groups(&self, user: &str, gid: Gid) -> std::result::Result<(), Errno> {
        self.record(IdentityCall::InitGroups(user.to_string(), gid));
        self.check("init_groups")?;
        let mut installed = self.user_groups.get(user).cloned().unwrap_or_default();
        if !installed.contains(&gid) {
            installed.push(gid);
        }
        *self.live_groups.lock().unwrap() = installed;
        Ok(())
    }

    fn set_gid(&self, gid: Gid) -> std::result::Result<(), Errno> {
        self.record(IdentityCall::SetGid(gid));
        self.check("set_gid")
    }

    fn set_uid(&self, uid: Uid) -> std::result::Result<(), Errno> {
        self.record(IdentityCall::SetUid(uid));
        self.check("set_uid")
    }

    fn max_groups(&self) -> usize {
        self.max_groups
    }
}
