//! Factory records for registered plugin classes
//!
//! A [`MetaObject`] pairs the constructor for one derived class with the
//! identity of its base trait, the library that registered it, and the set of
//! loaders allowed to use it. The registry owns every `MetaObject`
//! exclusively; loaders appear in the owner set only as plain ids, which
//! breaks the loader/factory reference cycle.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identity of a loader for owner-set membership and log attribution.
///
/// Ids are allocated from a process-global counter and never reused, so a
/// stale id in an owner set can never alias a newer loader.
pub(crate) type LoaderId = u64;

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh, never-reused loader id.
pub(crate) fn next_loader_id() -> LoaderId {
    NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Typed constructor stored behind the registry's type-erased slot.
///
/// The function pointer lives in the plugin's code; it may only be invoked
/// while that library is resident.
pub(crate) struct FactoryFn<B: ?Sized + 'static> {
    pub construct: fn() -> Box<B>,
}

/// One registered class factory.
pub(crate) struct MetaObject {
    class_name: String,
    base_name: String,
    base_key: TypeId,
    base_type_name: &'static str,
    library_path: String,
    owners: Vec<LoaderId>,
    factory: Box<dyn Any + Send + Sync>,
}

impl MetaObject {
    /// Build a record for `class_name` constructing through base `B`.
    ///
    /// `library_path` starts empty and is stamped exactly once from the
    /// loading context by the registry.
    pub(crate) fn new<B: ?Sized + 'static>(
        class_name: &str,
        base_name: &str,
        construct: fn() -> Box<B>,
    ) -> Self {
        MetaObject {
            class_name: class_name.to_string(),
            // The macro hands us the literal base type; strip the `dyn`
            // keyword so logs read like the trait name plugin authors wrote.
            base_name: base_name.trim_start_matches("dyn ").to_string(),
            base_key: TypeId::of::<B>(),
            base_type_name: std::any::type_name::<B>(),
            library_path: String::new(),
            owners: Vec::new(),
            factory: Box::new(FactoryFn::<B> { construct }),
        }
    }

    pub(crate) fn class_name(&self) -> &str {
        &self.class_name
    }

    pub(crate) fn base_name(&self) -> &str {
        &self.base_name
    }

    pub(crate) fn base_key(&self) -> TypeId {
        self.base_key
    }

    pub(crate) fn base_type_name(&self) -> &'static str {
        self.base_type_name
    }

    pub(crate) fn library_path(&self) -> &str {
        &self.library_path
    }

    pub(crate) fn set_library_path(&mut self, library_path: &str) {
        debug_assert!(self.library_path.is_empty());
        self.library_path = library_path.to_string();
    }

    pub(crate) fn add_owner(&mut self, loader: LoaderId) {
        if !self.owners.contains(&loader) {
            self.owners.push(loader);
        }
    }

    pub(crate) fn remove_owner(&mut self, loader: LoaderId) {
        self.owners.retain(|id| *id != loader);
    }

    pub(crate) fn is_owned_by(&self, loader: LoaderId) -> bool {
        self.owners.contains(&loader)
    }

    pub(crate) fn is_owned_by_anybody(&self) -> bool {
        !self.owners.is_empty()
    }

    /// Recover the typed constructor, or `None` when `B` is not the base this
    /// record was registered under.
    pub(crate) fn constructor<B: ?Sized + 'static>(&self) -> Option<fn() -> Box<B>> {
        self.factory
            .downcast_ref::<FactoryFn<B>>()
            .map(|f| f.construct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Animal {
        fn noise(&self) -> &'static str;
    }

    trait Machine {
        fn rpm(&self) -> u32;
    }

    #[derive(Default)]
    struct Dog;

    impl Animal for Dog {
        fn noise(&self) -> &'static str {
            "woof"
        }
    }

    fn dog_meta() -> MetaObject {
        MetaObject::new::<dyn Animal>("Dog", "dyn Animal", || Box::new(Dog))
    }

    #[test]
    fn test_identity_fields() {
        let meta = dog_meta();
        assert_eq!(meta.class_name(), "Dog");
        assert_eq!(meta.base_name(), "Animal");
        assert_eq!(meta.base_key(), TypeId::of::<dyn Animal>());
        assert!(meta.base_type_name().contains("Animal"));
        assert_eq!(meta.library_path(), "");
    }

    #[test]
    fn test_owner_set() {
        let mut meta = dog_meta();
        assert!(!meta.is_owned_by_anybody());

        meta.add_owner(7);
        meta.add_owner(9);
        meta.add_owner(7); // no duplicates
        assert!(meta.is_owned_by(7));
        assert!(meta.is_owned_by(9));
        assert!(!meta.is_owned_by(11));

        meta.remove_owner(7);
        assert!(!meta.is_owned_by(7));
        assert!(meta.is_owned_by_anybody());

        meta.remove_owner(9);
        assert!(!meta.is_owned_by_anybody());
    }

    #[test]
    fn test_typed_constructor_roundtrip() {
        let meta = dog_meta();

        let construct = meta.constructor::<dyn Animal>().expect("matching base");
        let dog = construct();
        assert_eq!(dog.noise(), "woof");

        // Asking for the wrong base must not produce a factory.
        assert!(meta.constructor::<dyn Machine>().is_none());
    }
}
