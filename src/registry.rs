use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::slide::{Slide, SlideId};

#[derive(Default)]
struct Slots {
    registered: IndexMap<SlideId, Arc<Slide>>,
    loading: HashMap<SlideId, Arc<Slide>>,
}

/// Authoritative id → slide map, shared between the manager and the show
/// loop. The lock is only ever held for the map operation itself.
#[derive(Clone, Default)]
pub struct SlideRegistry {
    slots: Arc<Mutex<Slots>>,
}

impl SlideRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a loaded slide. Returns false if the id is already present.
    pub fn add(&self, slide: Arc<Slide>) -> bool {
        let mut slots = self.slots.lock();
        if slots.registered.contains_key(slide.id()) {
            warn!(slide = %slide.id(), "slide already registered");
            return false;
        }
        slots.loading.remove(slide.id());
        debug!(slide = %slide.id(), "registered slide");
        slots.registered.insert(slide.id().clone(), slide);
        true
    }

    pub fn remove(&self, id: &SlideId) -> Option<Arc<Slide>> {
        self.slots.lock().registered.shift_remove(id)
    }

    pub fn get(&self, id: &SlideId) -> Option<Arc<Slide>> {
        self.slots.lock().registered.get(id).cloned()
    }

    /// Registered slides in insertion order.
    pub fn list(&self) -> Vec<Arc<Slide>> {
        self.slots.lock().registered.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<SlideId> {
        self.slots.lock().registered.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims `slide`'s id for an in-flight add. If the id is already known
    /// (registered or loading) the existing slide is returned instead.
    pub fn reserve(&self, slide: Arc<Slide>) -> Result<(), Arc<Slide>> {
        let mut slots = self.slots.lock();
        if let Some(existing) = slots.registered.get(slide.id()) {
            return Err(Arc::clone(existing));
        }
        if let Some(existing) = slots.loading.get(slide.id()) {
            return Err(Arc::clone(existing));
        }
        slots.loading.insert(slide.id().clone(), slide);
        Ok(())
    }

    /// Drops `slide`'s reservation. A newer reservation under the same id is
    /// left alone.
    pub fn cancel_reservation(&self, slide: &Arc<Slide>) -> bool {
        let mut slots = self.slots.lock();
        match slots.loading.get(slide.id()) {
            Some(reserved) if Arc::ptr_eq(reserved, slide) => {
                slots.loading.remove(slide.id());
                true
            }
            _ => false,
        }
    }

    pub fn is_loading(&self, id: &SlideId) -> bool {
        self.slots.lock().loading.contains_key(id)
    }

    /// Finds a slide whether it is registered or still loading.
    pub fn lookup(&self, id: &SlideId) -> Option<Arc<Slide>> {
        let slots = self.slots.lock();
        slots
            .registered
            .get(id)
            .or_else(|| slots.loading.get(id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slide::SlideMetadata;

    fn slide(id: &str) -> Arc<Slide> {
        Slide::pending(SlideMetadata {
            id: SlideId::new(id),
            url: format!("file:///{id}.zip"),
            duration: 1.0,
            priority: 0,
            transition: Default::default(),
            timestamp: "1".into(),
            mode: SlideMetadata::DEFAULT_MODE.to_string(),
        })
    }

    #[test]
    fn rejects_duplicates_and_keeps_insertion_order() {
        let registry = SlideRegistry::new();
        assert!(registry.add(slide("b")));
        assert!(registry.add(slide("a")));
        assert!(!registry.add(slide("b")));
        assert!(registry.add(slide("c")));
        assert_eq!(
            registry.ids(),
            vec![SlideId::new("b"), SlideId::new("a"), SlideId::new("c")]
        );

        assert!(registry.remove(&SlideId::new("a")).is_some());
        assert!(registry.remove(&SlideId::new("a")).is_none());
        assert_eq!(registry.ids(), vec![SlideId::new("b"), SlideId::new("c")]);
    }

    #[test]
    fn reservations_are_visible_to_lookup_only() {
        let registry = SlideRegistry::new();
        let pending = slide("x");
        registry.reserve(Arc::clone(&pending)).unwrap();
        assert!(registry.is_loading(&SlideId::new("x")));
        assert!(registry.get(&SlideId::new("x")).is_none());
        assert!(registry.lookup(&SlideId::new("x")).is_some());

        let second = registry.reserve(slide("x")).unwrap_err();
        assert!(Arc::ptr_eq(&second, &pending));

        assert!(registry.add(pending));
        assert!(!registry.is_loading(&SlideId::new("x")));
        assert!(registry.get(&SlideId::new("x")).is_some());
    }

    #[test]
    fn cancelled_reservation_frees_the_id() {
        let registry = SlideRegistry::new();
        let first = slide("y");
        registry.reserve(Arc::clone(&first)).unwrap();
        assert!(registry.cancel_reservation(&first));
        assert!(registry.lookup(&SlideId::new("y")).is_none());

        let second = slide("y");
        registry.reserve(Arc::clone(&second)).unwrap();
        assert!(!registry.cancel_reservation(&first));
        assert!(Arc::ptr_eq(&registry.lookup(&SlideId::new("y")).unwrap(), &second));
    }
}
