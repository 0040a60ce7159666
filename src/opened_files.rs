use std::sync::Mutex;

use crate::ftp::listing::PathStyle;

/// What a worker intends to do with a server file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Delete,
    Rename,
}

impl AccessType {
    /// Two concurrent accesses are compatible only when both just read.
    fn compatible_with(self, other: AccessType) -> bool {
        self == AccessType::Read && other == AccessType::Read
    }
}

#[derive(Debug, Clone)]
struct OpenedFile {
    uid: u32,
    access: AccessType,
    user: String,
    host: String,
    port: u16,
    path: String,
    style: PathStyle,
    name: String,
}

struct Inner {
    /// Slot array with a reclaimed free-list to avoid allocator churn; the
    /// registry stays tiny (at most one entry per active item).
    slots: Vec<Option<OpenedFile>>,
    free: Vec<usize>,
    next_uid: u32,
}

/// Registry of server files this client currently works on. FTP servers
/// happily run conflicting operations in parallel; self-policing across our
/// own workers is the only defence.
pub struct OpenedFiles {
    inner: Mutex<Inner>,
}

impl Default for OpenedFiles {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenedFiles {
    pub fn new() -> Self {
        OpenedFiles { inner: Mutex::new(Inner { slots: Vec::new(), free: Vec::new(), next_uid: 1 }) }
    }

    /// Try to register an access. Returns the lock uid, or None when another
    /// worker already holds the file with an incompatible access.
    #[allow(clippy::too_many_arguments)]
    pub fn open_file(
        &self,
        user: &str,
        host: &str,
        port: u16,
        path: &str,
        style: PathStyle,
        name: &str,
        access: AccessType,
    ) -> Option<u32> {
        let mut inner = self.inner.lock().expect("opened-files lock");
        for slot in inner.slots.iter().flatten() {
            if slot.host == host
                && slot.port == port
                && slot.user == user
                && slot.style == style
                && slot.path == path
                && slot.name == name
                && !slot.access.compatible_with(access)
            {
                return None;
            }
        }
        let uid = inner.next_uid;
        inner.next_uid += 1;
        let record = OpenedFile {
            uid,
            access,
            user: user.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
            style,
            name: name.to_string(),
        };
        if let Some(idx) = inner.free.pop() {
            inner.slots[idx] = Some(record);
        } else {
            inner.slots.push(Some(record));
        }
        Some(uid)
    }

    /// Release a lock; the slot is reclaimed for reuse.
    pub fn close_file(&self, uid: u32) {
        let mut inner = self.inner.lock().expect("opened-files lock");
        for idx in 0..inner.slots.len() {
            if inner.slots[idx].as_ref().is_some_and(|s| s.uid == uid) {
                inner.slots[idx] = None;
                inner.free.push(idx);
                return;
            }
        }
    }

    pub fn active_count(&self) -> usize {
        let inner = self.inner.lock().expect("opened-files lock");
        inner.slots.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(reg: &OpenedFiles, name: &str, access: AccessType) -> Option<u32> {
        reg.open_file("joe", "ftp.example.com", 21, "/in", PathStyle::Unix, name, access)
    }

    #[test]
    fn concurrent_reads_are_allowed() {
        let reg = OpenedFiles::new();
        let a = open(&reg, "a.txt", AccessType::Read).unwrap();
        let b = open(&reg, "a.txt", AccessType::Read).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn write_conflicts_with_everything() {
        let reg = OpenedFiles::new();
        let _w = open(&reg, "a.txt", AccessType::Write).unwrap();
        assert!(open(&reg, "a.txt", AccessType::Read).is_none());
        assert!(open(&reg, "a.txt", AccessType::Write).is_none());
        assert!(open(&reg, "a.txt", AccessType::Delete).is_none());
        assert!(open(&reg, "a.txt", AccessType::Rename).is_none());
    }

    #[test]
    fn different_names_do_not_conflict() {
        let reg = OpenedFiles::new();
        let _w = open(&reg, "a.txt", AccessType::Write).unwrap();
        assert!(open(&reg, "b.txt", AccessType::Write).is_some());
    }

    #[test]
    fn close_releases_the_conflict() {
        let reg = OpenedFiles::new();
        let uid = open(&reg, "a.txt", AccessType::Delete).unwrap();
        assert!(open(&reg, "a.txt", AccessType::Read).is_none());
        reg.close_file(uid);
        assert!(open(&reg, "a.txt", AccessType::Read).is_some());
    }

    #[test]
    fn slots_are_reclaimed() {
        let reg = OpenedFiles::new();
        let uid = open(&reg, "a.txt", AccessType::Read).unwrap();
        reg.close_file(uid);
        let _ = open(&reg, "b.txt", AccessType::Read).unwrap();
        assert_eq!(reg.active_count(), 1);
        let inner = reg.inner.lock().unwrap();
        assert_eq!(inner.slots.len(), 1);
    }
}
