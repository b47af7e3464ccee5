//! Global factory registry
//!
//! This module is the internal engine behind [`Loader`](crate::loader::Loader):
//! a process-global table of class factories keyed by base-trait identity,
//! the graveyard for factories orphaned by unload, the open-library table,
//! and the loading context used to hand a freshly opened library's
//! self-registrations to the loader that triggered the open.
//!
//! Plugins call [`register_factory`] from load-time constructors (normally
//! through the [`register_class!`](crate::register_class) macro). Everything
//! else here is crate-internal plumbing.
//!
//! # Locking
//!
//! Lock order is loading → libraries → registry. The per-loader locks in
//! [`loader`](crate::loader) nest strictly outside these: nothing in this
//! module ever takes a loader lock, so a loader holding its own locks may
//! call in freely. No lock is held while plugin code runs: library
//! initializers fire under the load serializer only, and factory
//! constructors run after every registry lock is released, so callbacks that
//! re-enter the registry cannot deadlock.

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, info, warn};

use crate::dylib::{library_opener, SharedLibrary};
use crate::error::{KedgeError, Result};
use crate::meta_object::{LoaderId, MetaObject};

/// Insertion-ordered factory table for one base trait, keyed by class name.
///
/// Plugins per base are few, so lookups scan; what matters is that
/// registration order is preserved, since `available_classes` exposes it.
#[derive(Default)]
struct FactoryMap {
    entries: Vec<MetaObject>,
}

impl FactoryMap {
    fn get(&self, class_name: &str) -> Option<&MetaObject> {
        self.entries.iter().find(|m| m.class_name() == class_name)
    }

    /// Insert, overwriting an existing record for the same class in place.
    fn insert(&mut self, meta: MetaObject) -> Option<MetaObject> {
        match self
            .entries
            .iter_mut()
            .find(|m| m.class_name() == meta.class_name())
        {
            Some(slot) => Some(std::mem::replace(slot, meta)),
            None => {
                self.entries.push(meta);
                None
            }
        }
    }
}

/// Registry proper plus the graveyard: one lock domain, because factories
/// move between the two.
#[derive(Default)]
struct Registry {
    factories: HashMap<TypeId, FactoryMap>,
    graveyard: Vec<MetaObject>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

struct OpenLibrary {
    path: String,
    handle: Arc<dyn SharedLibrary>,
}

static OPEN_LIBRARIES: OnceLock<Mutex<Vec<OpenLibrary>>> = OnceLock::new();

fn open_libraries() -> &'static Mutex<Vec<OpenLibrary>> {
    OPEN_LIBRARIES.get_or_init(|| Mutex::new(Vec::new()))
}

/// The "currently loading" handoff channel between [`load_library`] and the
/// registrations fired by the library's initializers.
#[derive(Default)]
struct LoadingContext {
    active_loader: Option<LoaderId>,
    library_path: String,
}

static LOADING_CONTEXT: OnceLock<Mutex<LoadingContext>> = OnceLock::new();

fn loading_context() -> &'static Mutex<LoadingContext> {
    LOADING_CONTEXT.get_or_init(|| Mutex::new(LoadingContext::default()))
}

/// Held across the OS open call so only one library load is in flight and the
/// loading context is unambiguous.
static LOAD_SERIALIZER: OnceLock<Mutex<()>> = OnceLock::new();

fn load_serializer() -> &'static Mutex<()> {
    LOAD_SERIALIZER.get_or_init(|| Mutex::new(()))
}

/// One-way latch: raised when a registration arrives outside any known load.
/// Once raised, no library in this process can be unloaded safely.
static NON_PURE: AtomicBool = AtomicBool::new(false);

pub(crate) fn non_pure_library_opened() -> bool {
    NON_PURE.load(Ordering::SeqCst)
}

pub(crate) fn set_loading_context(loader: LoaderId, library_path: &str) {
    let mut ctx = loading_context().lock().unwrap_or_else(|e| e.into_inner());
    ctx.active_loader = Some(loader);
    ctx.library_path = library_path.to_string();
}

pub(crate) fn clear_loading_context() {
    let mut ctx = loading_context().lock().unwrap_or_else(|e| e.into_inner());
    ctx.active_loader = None;
    ctx.library_path.clear();
}

fn current_loading_context() -> (Option<LoaderId>, String) {
    let ctx = loading_context().lock().unwrap_or_else(|e| e.into_inner());
    (ctx.active_loader, ctx.library_path.clone())
}

/// Publish a factory for `class_name`, constructing through base `B`.
///
/// This is the registration entry point a plugin's load-time constructors
/// call; the [`register_class!`](crate::register_class) macro generates the
/// call. The record is stamped with the library currently being loaded and
/// owned by the loader driving that load. A registration arriving outside
/// any load is tolerated (the factory stays ownerless and usable), but it
/// raises the process-wide non-pure latch, after which no library can be
/// unloaded.
pub fn register_factory<B: ?Sized + 'static>(
    class_name: &str,
    base_name: &str,
    construct: fn() -> Box<B>,
) {
    let (active_loader, loading_path) = current_loading_context();
    debug!(
        "Registering factory for class '{}' (base {}, loader {:?}, library '{}')",
        class_name,
        type_name::<B>(),
        active_loader,
        loading_path
    );

    if active_loader.is_none() {
        info!(
            "A library containing plugin factories was opened outside of any Loader \
             (class '{}'). The factory stays usable, but since the engine cannot tell \
             what else that library exported, unloading is now disabled process-wide.",
            class_name
        );
        NON_PURE.store(true, Ordering::SeqCst);
    }

    let mut meta = MetaObject::new::<B>(class_name, base_name, construct);
    meta.set_library_path(&loading_path);
    if let Some(loader) = active_loader {
        meta.add_owner(loader);
    }

    let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    let map = reg.factories.entry(meta.base_key()).or_default();
    if map.get(class_name).is_some() {
        warn!(
            "Namespace collision: a factory for class '{}' under base {} already exists; \
             the new factory OVERWRITES it. This happens when two loaded libraries export \
             the same class, or when a plugin library is also linked into the executable.",
            class_name,
            meta.base_type_name()
        );
    }
    map.insert(meta);
}

/// Create an instance of `class_name` through base `B`, on behalf of
/// `loader`.
///
/// The factory must list `loader` as an owner; an ownerless factory (from a
/// library opened outside the engine) is accepted with an informational log.
/// The plugin constructor runs with no registry lock held.
pub(crate) fn create_instance<B: ?Sized + 'static>(
    class_name: &str,
    loader: LoaderId,
) -> Result<Box<B>> {
    let construct = {
        let reg = registry().lock().unwrap_or_else(|e| e.into_inner());
        match reg
            .factories
            .get(&TypeId::of::<B>())
            .and_then(|map| map.get(class_name))
        {
            Some(meta) if meta.is_owned_by(loader) => meta.constructor::<B>(),
            Some(meta) if !meta.is_owned_by_anybody() => {
                info!(
                    "A factory for class '{}' exists but has no owning loader; its library \
                     was opened outside of the engine and can never be shut down cleanly.",
                    class_name
                );
                meta.constructor::<B>()
            }
            Some(_) => None,
            None => {
                log::error!(
                    "No factory registered for class '{}' under base {}",
                    class_name,
                    type_name::<B>()
                );
                None
            }
        }
    };

    let construct = construct.ok_or_else(|| {
        KedgeError::create_class(format!(
            "could not create instance of class '{}' (base {})",
            class_name,
            type_name::<B>()
        ))
    })?;

    // No core lock is held here: plugin constructors are free to allocate,
    // log, or call back into the engine.
    let instance = construct();
    debug!("Created instance of class '{}'", class_name);
    Ok(instance)
}

/// Classes under base `B` visible to `loader`: owned classes in registration
/// order, then ownerless classes. The partition order is a contract.
pub(crate) fn available_classes<B: ?Sized + 'static>(loader: LoaderId) -> Vec<String> {
    let reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    let mut owned = Vec::new();
    let mut ownerless = Vec::new();
    if let Some(map) = reg.factories.get(&TypeId::of::<B>()) {
        for meta in &map.entries {
            if meta.is_owned_by(loader) {
                owned.push(meta.class_name().to_string());
            } else if !meta.is_owned_by_anybody() {
                ownerless.push(meta.class_name().to_string());
            }
        }
    }
    owned.extend(ownerless);
    owned
}

pub(crate) fn is_class_available<B: ?Sized + 'static>(class_name: &str, loader: LoaderId) -> bool {
    available_classes::<B>(loader).iter().any(|c| c == class_name)
}

/// Every library path with at least one factory owned by `loader`.
pub(crate) fn libraries_owned_by(loader: LoaderId) -> Vec<String> {
    let reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    let mut paths: Vec<String> = Vec::new();
    for map in reg.factories.values() {
        for meta in &map.entries {
            if meta.is_owned_by(loader) && !paths.iter().any(|p| p == meta.library_path()) {
                paths.push(meta.library_path().to_string());
            }
        }
    }
    paths
}

pub(crate) fn is_library_loaded_by_anybody(path: &str) -> bool {
    let libs = open_libraries().lock().unwrap_or_else(|e| e.into_inner());
    libs.iter().any(|lib| lib.path == path)
}

/// Loaded within `loader`'s scope: resident, and either the library has no
/// factories at all or at least one of them is owned by `loader`.
pub(crate) fn is_library_loaded(path: &str, loader: LoaderId) -> bool {
    if !is_library_loaded_by_anybody(path) {
        return false;
    }
    let reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    let (total, owned) = library_stats_locked(&reg, path, loader);
    total == 0 || owned > 0
}

fn library_stats_locked(reg: &Registry, path: &str, loader: LoaderId) -> (usize, usize) {
    let mut total = 0;
    let mut owned = 0;
    for map in reg.factories.values() {
        for meta in &map.entries {
            if meta.library_path() == path {
                total += 1;
                if meta.is_owned_by(loader) {
                    owned += 1;
                }
            }
        }
    }
    (total, owned)
}

fn any_factories_for_library_locked(reg: &Registry, path: &str) -> bool {
    reg.factories
        .values()
        .any(|map| map.entries.iter().any(|m| m.library_path() == path))
}

fn add_owner_for_library(path: &str, loader: LoaderId) {
    let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    for map in reg.factories.values_mut() {
        for meta in &mut map.entries {
            if meta.library_path() == path {
                debug!(
                    "Tagging existing factory for class '{}' (library {}) with loader {}",
                    meta.class_name(),
                    path,
                    loader
                );
                meta.add_owner(loader);
            }
        }
    }
}

/// Remove `loader` from every factory of `path`; factories left ownerless
/// are evicted from the registry and parked in the graveyard.
fn drop_library_locked(reg: &mut Registry, path: &str, loader: LoaderId) {
    for map in reg.factories.values_mut() {
        let mut idx = 0;
        while idx < map.entries.len() {
            let meta = &mut map.entries[idx];
            if meta.library_path() == path && meta.is_owned_by(loader) {
                meta.remove_owner(loader);
                if !meta.is_owned_by_anybody() {
                    let parked = map.entries.remove(idx);
                    debug!(
                        "Parking factory for class '{}' (library {}) in the graveyard",
                        parked.class_name(),
                        path
                    );
                    reg.graveyard.push(parked);
                    continue;
                }
            }
            idx += 1;
        }
    }
}

/// Re-register every parked factory of `path` under `loader`.
///
/// Used when a reload of `path` registered nothing: the OS reused a resident
/// image whose initializers did not re-run, so the factories from the
/// previous load cycle are still the live ones.
fn revive_graveyard_locked(reg: &mut Registry, path: &str, loader: LoaderId) {
    let (revived, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut reg.graveyard)
        .into_iter()
        .partition(|m| m.library_path() == path);
    reg.graveyard = kept;

    for mut meta in revived {
        debug!(
            "Reviving factory for class '{}' from the graveyard (library {}, loader {})",
            meta.class_name(),
            path,
            loader
        );
        meta.add_owner(loader);
        let map = reg.factories.entry(meta.base_key()).or_default();
        map.insert(meta);
    }
}

/// Drop every parked factory of `path`: a fresh load registered replacements,
/// so the parked ones are obsolete.
fn purge_graveyard_locked(reg: &mut Registry, path: &str) {
    reg.graveyard.retain(|meta| {
        if meta.library_path() == path {
            debug!(
                "Purging obsolete factory for class '{}' (library {}) from the graveyard",
                meta.class_name(),
                path
            );
            false
        } else {
            true
        }
    });
}

/// Load `path` on behalf of `loader`.
///
/// A library already resident is not opened a second time; `loader` simply
/// becomes an additional owner of its factories. Otherwise the open is
/// serialized, the loading context is published for the duration of the OS
/// call, and the library's initializers register their factories into this
/// loader's scope.
pub(crate) fn load_library(path: &str, loader: LoaderId) -> Result<()> {
    debug!("Attempting to load library {} on behalf of loader {}", path, loader);

    if is_library_loaded_by_anybody(path) {
        debug!(
            "Library {} already resident; binding its factories to loader {}",
            path, loader
        );
        add_owner_for_library(path, loader);
        return Ok(());
    }

    let serializer = load_serializer().lock().unwrap_or_else(|e| e.into_inner());

    // Another thread may have completed the same load while we waited.
    if is_library_loaded_by_anybody(path) {
        add_owner_for_library(path, loader);
        return Ok(());
    }

    set_loading_context(loader, path);
    let opened = library_opener().open(path);
    clear_loading_context();
    let handle = opened?;

    debug!("Successfully loaded library {}", path);

    {
        let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());
        if any_factories_for_library_locked(&reg, path) {
            debug!(
                "Library {} registered fresh factories on load; purging stale graveyard entries",
                path
            );
            purge_graveyard_locked(&mut reg, path);
        } else {
            debug!(
                "Library {} registered no factories on load; checking the graveyard for \
                 factories from a previous load cycle",
                path
            );
            revive_graveyard_locked(&mut reg, path, loader);
        }
    }

    open_libraries()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(OpenLibrary {
            path: path.to_string(),
            handle,
        });

    drop(serializer);
    Ok(())
}

/// Unload `path` on behalf of `loader`.
///
/// The loader's ownership of the library's factories is dropped either way;
/// the OS handle is closed only when no factory for `path` remains in the
/// registry (i.e. no other loader still needs it). With the non-pure latch
/// raised the call logs and keeps everything resident.
pub(crate) fn unload_library(path: &str, loader: LoaderId) -> Result<()> {
    if non_pure_library_opened() {
        warn!(
            "Cannot unload {} (or any other library): a library registered factories \
             outside of a known load, so the engine cannot prove any unload is safe.",
            path
        );
        return Ok(());
    }

    debug!("Unloading library {} on behalf of loader {}", path, loader);

    let handle = {
        let mut libs = open_libraries().lock().unwrap_or_else(|e| e.into_inner());
        let idx = match libs.iter().position(|lib| lib.path == path) {
            Some(idx) => idx,
            None => {
                debug!(
                    "Attempt to unload library {} that is not loaded or already unloaded",
                    path
                );
                return Ok(());
            }
        };

        {
            let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());
            drop_library_locked(&mut reg, path, loader);
            if any_factories_for_library_locked(&reg, path) {
                debug!(
                    "Factories of {} still owned by other loaders; keeping the library resident",
                    path
                );
                return Ok(());
            }
        }

        debug!("No factories left for {}; closing the library", path);
        libs.remove(idx).handle
    };

    // Closed outside the libraries lock: static destructors are plugin code
    // and may re-enter the engine.
    handle.close()
}

/// Write the open-library and factory tables to the debug log.
pub fn log_debug_state() {
    {
        let libs = open_libraries().lock().unwrap_or_else(|e| e.into_inner());
        debug!("Open libraries ({}):", libs.len());
        for lib in libs.iter() {
            debug!("  {}", lib.path);
        }
    }

    let reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    let total: usize = reg.factories.values().map(|m| m.entries.len()).sum();
    debug!("Registered factories ({}):", total);
    for map in reg.factories.values() {
        for meta in &map.entries {
            debug!(
                "  class '{}' (base {}, library '{}', owners {})",
                meta.class_name(),
                meta.base_name(),
                meta.library_path(),
                if meta.is_owned_by_anybody() { "yes" } else { "none" }
            );
        }
    }
    debug!("Graveyard entries: {}", reg.graveyard.len());
}
