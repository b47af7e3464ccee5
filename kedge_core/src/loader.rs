//! Scoped library loading and class instantiation
//!
//! A [`Loader`] binds one shared-library path to a visibility scope: only
//! classes registered by that library (or adopted from it while it was
//! already resident) can be instantiated through the loader. The loader
//! counts repeated loads and outstanding instances, and arbitrates when the
//! library may actually be closed.
//!
//! # Example
//!
//! ```rust,ignore
//! use kedge_core::Loader;
//!
//! let loader = Loader::new("/opt/plugins/libwidgets.so", false)?;
//! for class in loader.available_classes::<dyn Widget>() {
//!     println!("available: {class}");
//! }
//! let widget = loader.create_shared::<dyn Widget>("GearWidget")?;
//! widget.poll();
//! drop(widget);
//! loader.unload_library()?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::error::Result;
use crate::instance::{InstanceGuard, SharedInstance, UniqueInstance};
use crate::meta_object::{next_loader_id, LoaderId};
use crate::registry;

/// One-way latch: set the first time any loader hands out an unmanaged
/// instance. The engine can no longer observe every live instance after
/// that, so on-demand unload is disabled for the rest of the process.
static UNMANAGED_INSTANCE_CREATED: AtomicBool = AtomicBool::new(false);

pub(crate) fn unmanaged_instance_created() -> bool {
    UNMANAGED_INSTANCE_CREATED.load(Ordering::SeqCst)
}

/// A class loader scoped to a single shared library.
///
/// Instance handles keep the loader's internal state alive, so dropping the
/// `Loader` while instances are outstanding is safe: the library stays
/// resident and, in on-demand mode, the last handle release still performs
/// the deferred unload.
#[derive(Debug)]
pub struct Loader {
    inner: Arc<LoaderInner>,
}

#[derive(Debug)]
pub(crate) struct LoaderInner {
    id: LoaderId,
    library_path: String,
    on_demand: bool,
    load_count: Mutex<i32>,
    live_instances: Mutex<i32>,
}

impl Loader {
    /// Bind a loader to `library_path`.
    ///
    /// With `on_demand == false` the library is opened immediately and
    /// construction fails if the open fails. With `on_demand == true` the
    /// open is deferred to the first `create_*` call and the library is
    /// closed again when the last managed instance is released.
    ///
    /// The empty path names the link-time pseudo-library: nothing is ever
    /// opened or closed for it.
    pub fn new(library_path: impl Into<String>, on_demand: bool) -> Result<Self> {
        let inner = Arc::new(LoaderInner {
            id: next_loader_id(),
            library_path: library_path.into(),
            on_demand,
            load_count: Mutex::new(0),
            live_instances: Mutex::new(0),
        });
        debug!(
            "Constructing loader {} bound to library '{}'",
            inner.id, inner.library_path
        );
        let loader = Loader { inner };
        if !on_demand {
            loader.load_library()?;
        }
        Ok(loader)
    }

    /// The library path this loader is bound to.
    pub fn library_path(&self) -> &str {
        &self.inner.library_path
    }

    /// Whether on-demand (lazy) load/unload is active.
    pub fn is_on_demand(&self) -> bool {
        self.inner.on_demand
    }

    /// Number of managed instances created by this loader and not yet
    /// released.
    pub fn live_instance_count(&self) -> i32 {
        *self
            .inner
            .live_instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Load the library (no-op beyond bookkeeping if this loader already
    /// holds it). Each call must be balanced by one `unload_library` call.
    pub fn load_library(&self) -> Result<()> {
        self.inner.load_library()
    }

    /// Unload the library within this loader's scope.
    ///
    /// Returns the number of further `unload_library` calls required to
    /// fully unbind the library from this loader. With instances still
    /// alive the call logs a severe warning and changes nothing.
    pub fn unload_library(&self) -> Result<i32> {
        let live = self
            .inner
            .live_instances
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        self.inner.unload_with_live(*live)
    }

    /// True if the library is resident and its classes are reachable
    /// through this loader (a library that registered no classes counts as
    /// reachable).
    pub fn is_library_loaded(&self) -> bool {
        registry::is_library_loaded(&self.inner.library_path, self.inner.id)
    }

    /// True if any loader in the process holds the library open.
    pub fn is_library_loaded_by_anyone(&self) -> bool {
        registry::is_library_loaded_by_anybody(&self.inner.library_path)
    }

    /// Names of the classes derived from `B` that this loader can create,
    /// owned classes first (in registration order) followed by ownerless
    /// ones.
    pub fn available_classes<B: ?Sized + 'static>(&self) -> Vec<String> {
        registry::available_classes::<B>(self.inner.id)
    }

    /// Whether `class_name` (derived from `B`) can be created by this
    /// loader.
    pub fn is_class_available<B: ?Sized + 'static>(&self, class_name: &str) -> bool {
        registry::is_class_available::<B>(class_name, self.inner.id)
    }

    /// Every library path that currently has a factory owned by this
    /// loader.
    pub fn libraries_in_use(&self) -> Vec<String> {
        registry::libraries_owned_by(self.inner.id)
    }

    /// Create `class_name` through base `B` as a clonable shared handle.
    ///
    /// The library is loaded first if necessary. Releasing the last clone
    /// decrements the live-instance count and, in on-demand mode, unloads
    /// the library (unless an unmanaged instance was ever created in this
    /// process).
    pub fn create_shared<B: ?Sized + 'static>(&self, class_name: &str) -> Result<SharedInstance<B>> {
        let instance = self.inner.create_raw::<B>(class_name, true)?;
        Ok(SharedInstance::new(
            instance,
            InstanceGuard::new(self.inner.clone()),
        ))
    }

    /// Create `class_name` through base `B` as a single-owner handle with
    /// the same lifetime accounting as [`Loader::create_shared`].
    pub fn create_unique<B: ?Sized + 'static>(&self, class_name: &str) -> Result<UniqueInstance<B>> {
        let instance = self.inner.create_raw::<B>(class_name, true)?;
        Ok(UniqueInstance::new(
            instance,
            InstanceGuard::new(self.inner.clone()),
        ))
    }

    /// Create `class_name` through base `B` without lifetime tracking.
    ///
    /// The returned box is invisible to the loader. Because the engine can
    /// no longer prove when the library's code stops being referenced, this
    /// permanently disables on-demand unload for the whole process.
    pub fn create_unmanaged<B: ?Sized + 'static>(&self, class_name: &str) -> Result<Box<B>> {
        UNMANAGED_INSTANCE_CREATED.store(true, Ordering::SeqCst);
        self.inner.create_raw::<B>(class_name, false)
    }
}

impl LoaderInner {
    fn load_library(&self) -> Result<()> {
        if self.library_path.is_empty() {
            return Ok(());
        }
        let mut count = self.load_count.lock().unwrap_or_else(|e| e.into_inner());
        if *count == 0 {
            registry::load_library(&self.library_path, self.id)?;
        }
        *count += 1;
        Ok(())
    }

    /// Unload with the caller's view of the live-instance count. The caller
    /// holds the live-instance lock (or knows no instance can appear), so
    /// the instance-before-load lock order is preserved.
    fn unload_with_live(&self, live: i32) -> Result<i32> {
        if self.library_path.is_empty() {
            return Ok(0);
        }
        let mut count = self.load_count.lock().unwrap_or_else(|e| e.into_inner());
        if live > 0 {
            warn!(
                "SEVERE: attempting to unload library '{}' while {} instance(s) created by \
                 this loader are still alive. Release them first; the library will NOT be \
                 unloaded.",
                self.library_path, live
            );
            return Ok(*count);
        }
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                registry::unload_library(&self.library_path, self.id)?;
            }
        }
        Ok(*count)
    }

    fn create_raw<B: ?Sized + 'static>(&self, class_name: &str, managed: bool) -> Result<Box<B>> {
        if managed && self.on_demand && unmanaged_instance_created() {
            info!(
                "Creating a managed instance of '{}', but an unmanaged instance exists in \
                 this process: the library will not be closed automatically when the last \
                 managed instance goes away.",
                class_name
            );
        }
        if !registry::is_library_loaded(&self.library_path, self.id) {
            self.load_library()?;
        }
        let instance = registry::create_instance::<B>(class_name, self.id)?;
        if managed {
            let mut live = self.live_instances.lock().unwrap_or_else(|e| e.into_inner());
            *live += 1;
        }
        Ok(instance)
    }

    /// Called from an instance guard when a managed instance is destroyed.
    pub(crate) fn release_instance(&self) {
        let mut live = self.live_instances.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(*live > 0);
        *live -= 1;
        debug!(
            "Released instance for loader {} ('{}'); {} still alive",
            self.id, self.library_path, *live
        );
        if *live == 0 && self.on_demand {
            if unmanaged_instance_created() {
                info!(
                    "Not unloading library '{}' on last instance release: an unmanaged \
                     instance was created in this process.",
                    self.library_path
                );
            } else if let Err(e) = self.unload_with_live(0) {
                warn!(
                    "On-demand unload of library '{}' failed: {}",
                    self.library_path, e
                );
            }
        }
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        debug!(
            "Destroying loader {}, unloading library '{}'",
            self.inner.id, self.inner.library_path
        );
        let live = self
            .inner
            .live_instances
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.inner.unload_with_live(*live) {
            warn!(
                "Failed to unload library '{}' during loader teardown: {}",
                self.inner.library_path, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_path_is_a_noop_library() {
        let loader = Loader::new("", false).unwrap();
        assert!(!loader.is_library_loaded());
        assert!(!loader.is_library_loaded_by_anyone());
        loader.load_library().unwrap();
        assert_eq!(loader.unload_library().unwrap(), 0);
    }

    #[test]
    fn test_on_demand_construction_defers_load() {
        // No opener is consulted at construction time, so even a bogus path
        // constructs fine in on-demand mode.
        let loader = Loader::new("/kedge-test/never-opened.so", true).unwrap();
        assert!(loader.is_on_demand());
        assert!(!loader.is_library_loaded());
        assert_eq!(loader.live_instance_count(), 0);
    }
}
