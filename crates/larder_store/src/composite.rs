use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use larder_build::{BuildAction, BuildContext, TaskHandler};
use larder_manifest::ManifestDigest;

use crate::{ImplementationStore, StoreError, StoreKind};

/// Combines several stores into one.
///
/// Reads prefer the first store that has an implementation. Additions are tried on the last store
/// first, falling back to earlier ones when a store cannot be written. Typically the list runs from
/// the most specific to the most shared location, so that implementations are added to a shared
/// system store whenever possible.
pub struct CompositeStore {
    children: Vec<Arc<dyn ImplementationStore>>,
    cache: DashMap<ManifestDigest, bool>,
}

impl CompositeStore {
    /// Creates a composite of `children`, in order of read preference.
    pub fn new(children: Vec<Arc<dyn ImplementationStore>>) -> Self {
        Self {
            children,
            cache: DashMap::new(),
        }
    }

    /// The stores this composite is made of.
    pub fn children(&self) -> &[Arc<dyn ImplementationStore>] {
        &self.children
    }

    /// Forgets all cached [`ImplementationStore::contains`] results. Needed when another process
    /// modified one of the stores.
    pub fn flush_cache(&self) {
        self.cache.clear();
    }

    fn writable_children(&self) -> impl Iterator<Item = &Arc<dyn ImplementationStore>> {
        self.children
            .iter()
            .filter(|child| !matches!(child.kind(), StoreKind::ReadOnly | StoreKind::Service))
    }
}

impl ImplementationStore for CompositeStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Composite
    }

    fn path(&self) -> Option<&Path> {
        None
    }

    fn contains(&self, digest: &ManifestDigest) -> bool {
        if let Some(found) = self.cache.get(digest) {
            return *found;
        }
        let found = self.children.iter().any(|child| child.contains(digest));
        self.cache.insert(digest.clone(), found);
        found
    }

    fn get_path(&self, digest: &ManifestDigest) -> Option<PathBuf> {
        self.children.iter().find_map(|child| child.get_path(digest))
    }

    fn list_all(&self) -> Result<Vec<ManifestDigest>, StoreError> {
        let mut all = BTreeMap::new();
        for child in &self.children {
            all.extend(child.list_all()?.into_iter().map(|digest| (digest.to_string(), digest)));
        }
        Ok(all.into_values().collect())
    }

    fn list_temp(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut temp = Vec::new();
        for child in &self.children {
            temp.extend(child.list_temp()?);
        }
        Ok(temp)
    }

    fn add(
        &self,
        digest: &ManifestDigest,
        action: &dyn BuildAction,
        context: &BuildContext<'_>,
    ) -> Result<PathBuf, StoreError> {
        self.flush_cache();
        if self.children.iter().any(|child| child.contains(digest)) {
            return Err(StoreError::AlreadyInStore(digest.clone()));
        }

        let mut last_error = None;
        for child in self.children.iter().rev() {
            match child.add(digest, action, context) {
                Ok(path) => {
                    self.flush_cache();
                    return Ok(path);
                }
                Err(e) if e.is_fall_through() => {
                    tracing::debug!(
                        "failed to add {digest} to {}, trying the next store: {e}",
                        child
                            .path()
                            .map_or_else(|| "a store".to_string(), |p| p.display().to_string())
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            StoreError::NotSupported("there are no stores to add implementations to".to_string())
        }))
    }

    fn verify(&self, digest: &ManifestDigest, handler: &dyn TaskHandler) -> Result<(), StoreError> {
        let mut found = false;
        for child in self.children.iter().filter(|child| child.contains(digest)) {
            found = true;
            child.verify(digest, handler)?;
        }
        if !found {
            return Err(StoreError::NotFound(digest.clone()));
        }
        Ok(())
    }

    fn remove(&self, digest: &ManifestDigest, handler: &dyn TaskHandler) -> Result<bool, StoreError> {
        let mut removed = false;
        let result = self
            .children
            .iter()
            .filter(|child| child.contains(digest))
            .try_for_each(|child| {
                removed |= child.remove(digest, handler)?;
                Ok(())
            });
        self.flush_cache();
        result.map(|()| removed)
    }

    fn purge(&self, handler: &dyn TaskHandler) -> Result<(), StoreError> {
        let mut failures = Vec::new();
        let mut result = Ok(());
        for child in self.writable_children() {
            match child.purge(handler) {
                Ok(()) => {}
                Err(StoreError::PurgeIncomplete(child_failures)) => failures.extend(child_failures),
                Err(e) => {
                    tracing::warn!("{e}");
                    result = Err(e);
                }
            }
        }
        self.flush_cache();
        if !failures.is_empty() {
            return Err(StoreError::PurgeIncomplete(failures));
        }
        result
    }

    fn optimise(&self, handler: &dyn TaskHandler) -> Result<u64, StoreError> {
        let mut saved = 0;
        for child in self.writable_children() {
            match child.optimise(handler) {
                Ok(bytes) => saved += bytes,
                Err(StoreError::NotAdmin(path)) => {
                    tracing::debug!("skipping read-only store {}", path.display());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(saved)
    }
}
