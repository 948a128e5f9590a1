//! Reference-counted attachment registry.
//!
//! Containers in the same VM usually share most of their read-only layers.
//! The registry makes the first container's attach do the real work and
//! every later one only take a reference; the real detach happens when the
//! last reference is released.
//!
//! Entries are keyed by the lexically normalized host path, so `a/../base`
//! and `base` resolve to the same attachment whether or not the path exists.
//! When the path does exist, its filesystem-resolved form is recorded as an
//! alias, so a symlinked spelling of an attached layer also finds the entry.
//! The key never depends on whether the path exists at lookup time, so a
//! layer that appears or disappears between attach and detach is still
//! released.
//!
//! The registry lock is held across the attach and detach callbacks, which
//! makes count changes atomic with respect to the host operation they guard.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use strata_common::error::{HostError, HostResult};
use strata_common::types::AttachmentKind;

#[derive(Debug)]
struct Entry<V> {
    refs: usize,
    value: V,
}

/// Outcome of releasing one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other references remain; carries the remaining count.
    Retained(usize),
    /// The last reference was dropped and the resource detached.
    Detached,
}

/// Values already attached, handed to attach callbacks so they can pick a
/// free slot without re-entering the registry lock.
#[derive(Debug)]
pub struct Attached<'a, V> {
    entries: &'a HashMap<PathBuf, Entry<V>>,
}

impl<'a, V> Attached<'a, V> {
    /// Iterates the values of every live attachment.
    pub fn values(&self) -> impl Iterator<Item = &'a V> + 'a {
        self.entries.values().map(|e| &e.value)
    }
}

#[derive(Debug)]
struct Entries<V> {
    by_key: HashMap<PathBuf, Entry<V>>,
    /// Filesystem-resolved path to the key it was attached under.
    aliases: HashMap<PathBuf, PathBuf>,
}

impl<V> Entries<V> {
    fn key_for(&self, path: &Path) -> PathBuf {
        let key = lexical_key(path);
        if self.by_key.contains_key(&key) {
            return key;
        }
        std::fs::canonicalize(path)
            .ok()
            .and_then(|real| self.aliases.get(&real).cloned())
            .unwrap_or(key)
    }
}

/// Map from normalized host path to a reference-counted attachment.
#[derive(Debug)]
pub struct RefRegistry<V> {
    kind: AttachmentKind,
    entries: Mutex<Entries<V>>,
}

impl<V: Clone> RefRegistry<V> {
    /// Creates an empty registry for attachments of the given kind.
    #[must_use]
    pub fn new(kind: AttachmentKind) -> Self {
        Self {
            kind,
            entries: Mutex::new(Entries {
                by_key: HashMap::new(),
                aliases: HashMap::new(),
            }),
        }
    }

    /// Takes a reference to the attachment for `path`, calling `attach`
    /// with the normalized path if this is the first reference.
    ///
    /// # Errors
    ///
    /// Returns the error from `attach`, in which case no reference is taken,
    /// or [`HostError::Poisoned`] if the registry lock is poisoned.
    pub fn acquire<F>(&self, path: &Path, attach: F) -> HostResult<V>
    where
        F: FnOnce(&Path, Attached<'_, V>) -> HostResult<V>,
    {
        let mut entries = self.lock()?;
        let key = entries.key_for(path);
        if let Some(entry) = entries.by_key.get_mut(&key) {
            entry.refs += 1;
            tracing::debug!(
                kind = %self.kind,
                path = %key.display(),
                refs = entry.refs,
                "attachment reference added"
            );
            return Ok(entry.value.clone());
        }

        let value = attach(
            &key,
            Attached {
                entries: &entries.by_key,
            },
        )?;
        tracing::debug!(kind = %self.kind, path = %key.display(), "attached");
        if let Ok(real) = std::fs::canonicalize(path) {
            let _ = entries.aliases.insert(real, key.clone());
        }
        let _ = entries.by_key.insert(
            key,
            Entry {
                refs: 1,
                value: value.clone(),
            },
        );
        Ok(value)
    }

    /// Drops a reference to the attachment for `path`, calling `detach`
    /// when it is the last one.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NotAttached`] if `path` holds no reference, or
    /// the error from `detach`. A failed detach keeps the last reference so
    /// the release can be retried.
    pub fn release<F>(&self, path: &Path, detach: F) -> HostResult<Release>
    where
        F: FnOnce(&V) -> HostResult<()>,
    {
        let mut entries = self.lock()?;
        let key = entries.key_for(path);
        let Some(entry) = entries.by_key.get_mut(&key) else {
            return Err(HostError::NotAttached {
                kind: self.kind,
                path: key,
            });
        };

        if entry.refs > 1 {
            entry.refs -= 1;
            tracing::debug!(
                kind = %self.kind,
                path = %key.display(),
                refs = entry.refs,
                "attachment reference dropped"
            );
            return Ok(Release::Retained(entry.refs));
        }

        detach(&entry.value)?;
        let _ = entries.by_key.remove(&key);
        entries.aliases.retain(|_, k| *k != key);
        tracing::debug!(kind = %self.kind, path = %key.display(), "detached");
        Ok(Release::Detached)
    }

    /// Returns the value attached for `path`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Poisoned`] if the registry lock is poisoned.
    pub fn get(&self, path: &Path) -> HostResult<Option<V>> {
        let entries = self.lock()?;
        let key = entries.key_for(path);
        Ok(entries.by_key.get(&key).map(|e| e.value.clone()))
    }

    /// Returns the number of references held for `path`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Poisoned`] if the registry lock is poisoned.
    pub fn ref_count(&self, path: &Path) -> HostResult<usize> {
        let entries = self.lock()?;
        let key = entries.key_for(path);
        Ok(entries.by_key.get(&key).map_or(0, |e| e.refs))
    }

    /// Returns the number of distinct live attachments.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Poisoned`] if the registry lock is poisoned.
    pub fn len(&self) -> HostResult<usize> {
        Ok(self.lock()?.by_key.len())
    }

    /// Returns whether no attachment is live.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Poisoned`] if the registry lock is poisoned.
    pub fn is_empty(&self) -> HostResult<bool> {
        Ok(self.lock()?.by_key.is_empty())
    }

    fn lock(&self) -> HostResult<MutexGuard<'_, Entries<V>>> {
        self.entries.lock().map_err(|_| HostError::Poisoned {
            resource: "attachment registry",
        })
    }
}

/// Normalizes `path` without touching the filesystem.
///
/// `.` is dropped and `..` cancels the preceding normal component. A `..`
/// with nothing left to cancel is kept, except directly under the root
/// where it is dropped.
#[must_use]
pub fn lexical_key(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    let _ = out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                Some(Component::CurDir | Component::ParentDir) | None => out.push(component),
            },
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn registry() -> RefRegistry<u32> {
        RefRegistry::new(AttachmentKind::SharedFolder)
    }

    #[test]
    fn first_acquire_attaches_later_ones_only_count() {
        let reg = registry();
        let attaches = Cell::new(0);
        for _ in 0..3 {
            let v = reg
                .acquire(Path::new("layers/base"), |_, _| {
                    attaches.set(attaches.get() + 1);
                    Ok(7)
                })
                .expect("acquire");
            assert_eq!(v, 7);
        }
        assert_eq!(attaches.get(), 1);
        assert_eq!(reg.ref_count(Path::new("layers/base")).expect("count"), 3);
    }

    #[test]
    fn detach_only_runs_on_last_release() {
        let reg = registry();
        let path = Path::new("layers/base");
        let _ = reg.acquire(path, |_, _| Ok(1)).expect("acquire");
        let _ = reg.acquire(path, |_, _| Ok(1)).expect("acquire");

        let detaches = Cell::new(0);
        let detach = |_: &u32| {
            detaches.set(detaches.get() + 1);
            Ok(())
        };
        assert_eq!(reg.release(path, detach).expect("release"), Release::Retained(1));
        assert_eq!(detaches.get(), 0);
        assert_eq!(reg.release(path, detach).expect("release"), Release::Detached);
        assert_eq!(detaches.get(), 1);
        assert!(reg.is_empty().expect("empty"));
    }

    #[test]
    fn failed_attach_takes_no_reference() {
        let reg = registry();
        let result = reg.acquire(Path::new("bad"), |_, _| {
            Err(HostError::Rejected {
                operation: "add share",
                message: "denied".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(reg.len().expect("len"), 0);
    }

    #[test]
    fn failed_detach_keeps_the_last_reference() {
        let reg = registry();
        let path = Path::new("layers/base");
        let _ = reg.acquire(path, |_, _| Ok(1)).expect("acquire");
        let result = reg.release(path, |_| {
            Err(HostError::Rejected {
                operation: "remove share",
                message: "busy".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(reg.ref_count(path).expect("count"), 1);
        assert_eq!(reg.release(path, |_| Ok(())).expect("retry"), Release::Detached);
    }

    #[test]
    fn releasing_unknown_path_is_not_attached() {
        let err = registry()
            .release(Path::new("never"), |_| Ok(()))
            .expect_err("unknown");
        assert!(matches!(err, HostError::NotAttached { .. }));
    }

    #[test]
    fn equivalent_paths_share_one_entry() {
        let reg = registry();
        let _ = reg
            .acquire(Path::new("missing-root/layers/base"), |_, _| Ok(1))
            .expect("acquire");
        let _ = reg
            .acquire(Path::new("missing-root/./layers/x/../base"), |_, _| Ok(2))
            .expect("acquire");
        assert_eq!(reg.len().expect("len"), 1);
        assert_eq!(
            reg.ref_count(Path::new("missing-root/layers/base")).expect("count"),
            2
        );
    }

    #[test]
    fn unmatched_parent_components_are_kept() {
        assert_eq!(lexical_key(Path::new("../../x")), PathBuf::from("../../x"));
        assert_eq!(lexical_key(Path::new("a/../../x")), PathBuf::from("../x"));
        assert_eq!(lexical_key(Path::new("/../x")), PathBuf::from("/x"));
        assert_ne!(
            lexical_key(Path::new("../../missing-root/base")),
            lexical_key(Path::new("missing-root/base"))
        );
    }

    #[test]
    fn layers_outside_the_working_directory_stay_distinct() {
        let reg = registry();
        let _ = reg
            .acquire(Path::new("../../missing-root/base"), |_, _| Ok(1))
            .expect("acquire");
        let _ = reg
            .acquire(Path::new("missing-root/base"), |_, _| Ok(2))
            .expect("acquire");
        assert_eq!(reg.len().expect("len"), 2);
        assert_eq!(
            reg.get(Path::new("missing-root/base")).expect("get"),
            Some(2)
        );
    }

    #[test]
    fn release_finds_a_layer_created_after_attach() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layer = dir.path().join("base");
        let reg = registry();
        let _ = reg.acquire(&layer, |_, _| Ok(1)).expect("acquire");

        std::fs::create_dir(&layer).expect("mkdir");
        assert_eq!(reg.release(&layer, |_| Ok(())).expect("release"), Release::Detached);
        assert!(reg.is_empty().expect("empty"));
    }

    #[test]
    fn release_finds_a_layer_removed_after_attach() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layer = dir.path().join("base");
        std::fs::create_dir(&layer).expect("mkdir");
        let reg = registry();
        let _ = reg.acquire(&layer, |_, _| Ok(1)).expect("acquire");

        std::fs::remove_dir(&layer).expect("rmdir");
        assert_eq!(reg.release(&layer, |_| Ok(())).expect("release"), Release::Detached);
        assert!(reg.is_empty().expect("empty"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_spelling_shares_the_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let real = dir.path().join("base");
        let link = dir.path().join("alias");
        std::fs::create_dir(&real).expect("mkdir");
        std::os::unix::fs::symlink(&real, &link).expect("symlink");

        let reg = registry();
        let _ = reg.acquire(&real, |_, _| Ok(1)).expect("acquire");
        let _ = reg.acquire(&link, |_, _| Ok(2)).expect("acquire via link");
        assert_eq!(reg.len().expect("len"), 1);
        assert_eq!(reg.ref_count(&link).expect("count"), 2);

        let _ = reg.release(&link, |_| Ok(())).expect("release");
        assert_eq!(reg.release(&real, |_| Ok(())).expect("release"), Release::Detached);
        assert!(reg.is_empty().expect("empty"));
    }

    #[test]
    fn attach_callback_sees_live_values() {
        let reg = registry();
        let _ = reg.acquire(Path::new("a"), |_, _| Ok(0)).expect("acquire");
        let _ = reg.acquire(Path::new("b"), |_, _| Ok(1)).expect("acquire");
        let next = reg
            .acquire(Path::new("c"), |_, live| {
                let used: Vec<u32> = live.values().copied().collect();
                Ok((0..).find(|s| !used.contains(s)).unwrap_or_default())
            })
            .expect("acquire");
        assert_eq!(next, 2);
    }
}
