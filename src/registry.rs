//! In-use-file registry: the concurrency boundary for PUT.
//!
//! Owned exclusively by the event thread — workers never see it, so unlike
//! `storage.rs` in a cache server this needs no internal locking. At most
//! one record exists per resource; a PUT record always has count 1, a GET
//! record has count >= 1, and the two kinds never coexist on the same
//! resource.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::connection::Method;

/// Outcome of checking whether a new request may proceed against a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// No record exists yet; the caller should insert one with count 1.
    AllowedNew,
    /// A GET record already exists and the requester is also a GET; the
    /// caller should increment its count.
    AllowedExisting,
    /// Either the requester or the holder is a PUT; reject with 403.
    Denied,
}

#[derive(Debug)]
struct FileRecord {
    method: Method,
    count: u32,
}

/// Tracks which resources are currently open and for which method.
#[derive(Debug, Default)]
pub struct FileRegistry {
    records: HashMap<PathBuf, FileRecord>,
}

impl FileRegistry {
    pub fn new() -> Self {
        FileRegistry::default()
    }

    /// Checks whether `method` may begin operating on `resource`.
    ///
    /// Does not mutate the registry — callers apply the corresponding
    /// `insert` or `acquire_existing` only once the file has actually been
    /// opened, so that a 404 on open never leaves a phantom record behind.
    pub fn verify(&self, resource: &Path, method: Method) -> Admission {
        match self.records.get(resource) {
            None => Admission::AllowedNew,
            Some(rec) if rec.method == Method::Get && method == Method::Get => {
                Admission::AllowedExisting
            }
            Some(_) => Admission::Denied,
        }
    }

    /// Inserts a fresh record for a resource with no prior holders.
    pub fn insert(&mut self, resource: PathBuf, method: Method) {
        self.records.insert(resource, FileRecord { method, count: 1 });
    }

    /// Increments the holder count on an existing GET record.
    pub fn acquire_existing(&mut self, resource: &Path) {
        if let Some(rec) = self.records.get_mut(resource) {
            rec.count += 1;
        }
    }

    /// Releases one holder's claim on `resource`, removing the record once
    /// the last holder releases it.
    pub fn release(&mut self, resource: &Path) {
        if let Some(rec) = self.records.get_mut(resource) {
            rec.count -= 1;
            if rec.count == 0 {
                self.records.remove(resource);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn new_resource_is_allowed_new() {
        let reg = FileRegistry::new();
        assert_eq!(reg.verify(&path("/a"), Method::Get), Admission::AllowedNew);
        assert_eq!(reg.verify(&path("/a"), Method::Put), Admission::AllowedNew);
    }

    #[test]
    fn concurrent_gets_are_allowed() {
        let mut reg = FileRegistry::new();
        reg.insert(path("/a"), Method::Get);
        assert_eq!(
            reg.verify(&path("/a"), Method::Get),
            Admission::AllowedExisting
        );
        reg.acquire_existing(&path("/a"));

        reg.release(&path("/a"));
        assert_eq!(reg.len(), 1);
        reg.release(&path("/a"));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn put_denies_everything_else() {
        let mut reg = FileRegistry::new();
        reg.insert(path("/a"), Method::Put);

        assert_eq!(reg.verify(&path("/a"), Method::Get), Admission::Denied);
        assert_eq!(reg.verify(&path("/a"), Method::Put), Admission::Denied);
    }

    #[test]
    fn get_in_flight_denies_put() {
        let mut reg = FileRegistry::new();
        reg.insert(path("/a"), Method::Get);

        assert_eq!(reg.verify(&path("/a"), Method::Put), Admission::Denied);
    }

    #[test]
    fn release_removes_record_only_at_zero() {
        let mut reg = FileRegistry::new();
        reg.insert(path("/a"), Method::Get);
        reg.acquire_existing(&path("/a"));
        reg.acquire_existing(&path("/a"));
        assert_eq!(reg.len(), 1);

        reg.release(&path("/a"));
        assert_eq!(reg.len(), 1);
        reg.release(&path("/a"));
        assert_eq!(reg.len(), 1);
        reg.release(&path("/a"));
        assert_eq!(reg.len(), 0);
    }
}
