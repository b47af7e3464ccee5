//! Aggregated loading across several libraries
//!
//! A [`MultiLoader`] owns one [`Loader`] per registered library path and
//! routes class lookups across them. The one-argument `create_*` operations
//! walk the children in registration order and use the first loader that can
//! provide the class; the `*_from` forms target one library explicitly.

use std::sync::Mutex;

use log::debug;

use crate::error::{KedgeError, Result};
use crate::instance::{SharedInstance, UniqueInstance};
use crate::loader::Loader;

/// A class loader aggregating several libraries under one query surface.
pub struct MultiLoader {
    on_demand: bool,
    loaders: Mutex<Vec<Loader>>,
}

impl MultiLoader {
    /// Create an aggregator. The `on_demand` policy is fixed here and
    /// propagated to every child loader.
    pub fn new(on_demand: bool) -> Self {
        MultiLoader {
            on_demand,
            loaders: Mutex::new(Vec::new()),
        }
    }

    /// Whether child loaders are created in on-demand mode.
    pub fn is_on_demand(&self) -> bool {
        self.on_demand
    }

    /// Register `library_path` with this aggregator, creating a child
    /// loader for it. Registering the same path twice has no effect.
    pub fn load_library(&self, library_path: &str) -> Result<()> {
        let mut loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        if loaders.iter().any(|l| l.library_path() == library_path) {
            return Ok(());
        }
        loaders.push(Loader::new(library_path, self.on_demand)?);
        Ok(())
    }

    /// Unload `library_path` within this aggregator's scope.
    ///
    /// Returns the number of further calls needed to fully unbind the
    /// library; once that reaches zero the child loader is discarded. An
    /// unregistered path returns zero.
    pub fn unload_library(&self, library_path: &str) -> Result<i32> {
        let mut loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        let idx = match loaders.iter().position(|l| l.library_path() == library_path) {
            Some(idx) => idx,
            None => return Ok(0),
        };
        let remaining = loaders[idx].unload_library()?;
        if remaining == 0 {
            loaders.remove(idx);
        }
        Ok(remaining)
    }

    /// Library paths registered with this aggregator, in registration order.
    pub fn registered_libraries(&self) -> Vec<String> {
        let loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        loaders.iter().map(|l| l.library_path().to_string()).collect()
    }

    /// Whether `library_path` is registered with this aggregator.
    pub fn is_library_registered(&self, library_path: &str) -> bool {
        let loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        loaders.iter().any(|l| l.library_path() == library_path)
    }

    /// Classes derived from `B` available through any child loader,
    /// concatenated in child registration order.
    pub fn available_classes<B: ?Sized + 'static>(&self) -> Vec<String> {
        let loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        let mut classes = Vec::new();
        for loader in loaders.iter() {
            classes.extend(loader.available_classes::<B>());
        }
        classes
    }

    /// Classes derived from `B` available through the loader bound to
    /// `library_path`.
    pub fn available_classes_in_library<B: ?Sized + 'static>(
        &self,
        library_path: &str,
    ) -> Result<Vec<String>> {
        let loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Self::loader_for_library(&loaders, library_path)?.available_classes::<B>())
    }

    /// Whether some child loader can create `class_name` (derived from `B`).
    pub fn is_class_available<B: ?Sized + 'static>(&self, class_name: &str) -> bool {
        let loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        loaders
            .iter()
            .any(|l| l.is_class_available::<B>(class_name))
    }

    /// Create a shared instance of `class_name` from the first child loader
    /// that provides it.
    pub fn create_shared<B: ?Sized + 'static>(&self, class_name: &str) -> Result<SharedInstance<B>> {
        debug!("Attempting to create shared instance of class '{}'", class_name);
        let loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        Self::loader_for_class::<B>(&loaders, class_name)?.create_shared::<B>(class_name)
    }

    /// Create a shared instance of `class_name` from the library at
    /// `library_path`.
    pub fn create_shared_from<B: ?Sized + 'static>(
        &self,
        class_name: &str,
        library_path: &str,
    ) -> Result<SharedInstance<B>> {
        let loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        Self::loader_for_library(&loaders, library_path)?.create_shared::<B>(class_name)
    }

    /// Create a single-owner instance of `class_name` from the first child
    /// loader that provides it.
    pub fn create_unique<B: ?Sized + 'static>(&self, class_name: &str) -> Result<UniqueInstance<B>> {
        debug!("Attempting to create unique instance of class '{}'", class_name);
        let loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        Self::loader_for_class::<B>(&loaders, class_name)?.create_unique::<B>(class_name)
    }

    /// Create a single-owner instance of `class_name` from the library at
    /// `library_path`.
    pub fn create_unique_from<B: ?Sized + 'static>(
        &self,
        class_name: &str,
        library_path: &str,
    ) -> Result<UniqueInstance<B>> {
        let loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        Self::loader_for_library(&loaders, library_path)?.create_unique::<B>(class_name)
    }

    /// Create an untracked instance of `class_name` from the first child
    /// loader that provides it. See [`Loader::create_unmanaged`] for the
    /// process-wide consequences.
    pub fn create_unmanaged<B: ?Sized + 'static>(&self, class_name: &str) -> Result<Box<B>> {
        let loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        Self::loader_for_class::<B>(&loaders, class_name)?.create_unmanaged::<B>(class_name)
    }

    /// Create an untracked instance of `class_name` from the library at
    /// `library_path`.
    pub fn create_unmanaged_from<B: ?Sized + 'static>(
        &self,
        class_name: &str,
        library_path: &str,
    ) -> Result<Box<B>> {
        let loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        Self::loader_for_library(&loaders, library_path)?.create_unmanaged::<B>(class_name)
    }

    /// First child (in registration order) whose library provides
    /// `class_name`, loading candidate libraries on the way.
    fn loader_for_class<'a, B: ?Sized + 'static>(
        loaders: &'a [Loader],
        class_name: &str,
    ) -> Result<&'a Loader> {
        for loader in loaders {
            if !loader.is_library_loaded() {
                loader.load_library()?;
            }
            if loader.is_class_available::<B>(class_name) {
                return Ok(loader);
            }
        }
        Err(KedgeError::create_class(format!(
            "no factory for class '{}' exists in any library registered with this MultiLoader; \
             make sure the defining library was loaded through MultiLoader::load_library",
            class_name
        )))
    }

    fn loader_for_library<'a>(loaders: &'a [Loader], library_path: &str) -> Result<&'a Loader> {
        loaders
            .iter()
            .find(|l| l.library_path() == library_path)
            .ok_or_else(|| {
                KedgeError::no_class_loader(format!(
                    "no loader in this MultiLoader is bound to library {}; \
                     call MultiLoader::load_library first",
                    library_path
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_bookkeeping() {
        let multi = MultiLoader::new(true);
        assert!(multi.is_on_demand());
        assert!(multi.registered_libraries().is_empty());

        multi.load_library("/kedge-test/multi-a.so").unwrap();
        multi.load_library("/kedge-test/multi-b.so").unwrap();
        // Duplicate registration has no effect.
        multi.load_library("/kedge-test/multi-a.so").unwrap();

        assert_eq!(
            multi.registered_libraries(),
            vec!["/kedge-test/multi-a.so", "/kedge-test/multi-b.so"]
        );
        assert!(multi.is_library_registered("/kedge-test/multi-b.so"));
        assert!(!multi.is_library_registered("/kedge-test/multi-c.so"));
    }

    #[test]
    fn test_unknown_library_paths() {
        trait Marker {}
        let multi = MultiLoader::new(true);

        // Unloading a path that was never registered is a quiet zero.
        assert_eq!(multi.unload_library("/kedge-test/unknown.so").unwrap(), 0);

        let err = multi
            .available_classes_in_library::<dyn Marker>("/kedge-test/unknown.so")
            .unwrap_err();
        assert!(matches!(err, KedgeError::NoClassLoaderExists(_)));
    }
}
