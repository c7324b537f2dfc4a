use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::layers::FeatureMap;

/// Receives tensors flowing through one layer of the classifier.
///
/// `on_forward` sees the layer output during every pass; `on_backward` sees
/// the gradient of the seeded score with respect to that same output, and only
/// fires during traced passes that are propagated back to this layer.
pub trait LayerObserver: Send + Sync {
    fn on_forward(&self, output: &FeatureMap);

    fn on_backward(&self, grad_output: &FeatureMap);
}

#[derive(Clone)]
struct HookEntry {
    id: usize,
    layer: usize,
    observer: Arc<dyn LayerObserver>,
}

#[derive(Default)]
pub(crate) struct HookRegistry {
    entries: RwLock<Vec<HookEntry>>,
    next_id: AtomicUsize,
}

impl HookRegistry {
    pub(crate) fn attach(&self, layer: usize, observer: Arc<dyn LayerObserver>) -> HookHandle<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(HookEntry {
                id,
                layer,
                observer,
            });
        HookHandle { registry: self, id }
    }

    /// Observers attached to `layer`, cloned out so none are called under the lock.
    pub(crate) fn observers(&self, layer: usize) -> Vec<Arc<dyn LayerObserver>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.layer == layer)
            .map(|entry| entry.observer.clone())
            .collect()
    }

    pub(crate) fn lowest_hooked_layer(&self) -> Option<usize> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| entry.layer)
            .min()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn detach(&self, id: usize) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| entry.id != id);
    }
}

/// Keeps an observer attached until dropped.
#[must_use]
pub struct HookHandle<'a> {
    registry: &'a HookRegistry,
    id: usize,
}

impl Drop for HookHandle<'_> {
    fn drop(&mut self) {
        self.registry.detach(self.id);
    }
}
