//! Shared-library seam
//!
//! The platform dynamic loader is an external collaborator: the engine only
//! needs "open a shared object by path" and "close it again". Those two
//! operations are expressed as the [`LibraryOpener`] / [`SharedLibrary`]
//! traits so that embedders (and the in-tree test harness) can substitute the
//! OS loader. The default implementation, [`NativeOpener`], is backed by
//! `libloading`.
//!
//! Opening a library runs its load-time constructors; that is the moment a
//! plugin hands its factories to the registry. Closing it runs the library's
//! destructors, which is why the engine never closes a library while
//! instances created from it are still alive.

use std::sync::{Arc, Mutex, OnceLock, RwLock};

use libloading::Library;
use log::debug;

use crate::error::{KedgeError, Result};

/// A shared object held open by the engine.
///
/// Handles are `Arc`-shared; the registry's open-library table holds the
/// entry that keeps the OS object resident.
pub trait SharedLibrary: Send + Sync + std::fmt::Debug {
    /// The path this library was opened from.
    fn path(&self) -> &str;

    /// Close the library, running its static destructors.
    ///
    /// Closing an already-closed handle is a no-op.
    fn close(&self) -> Result<()>;
}

/// Opens shared objects on behalf of the engine.
pub trait LibraryOpener: Send + Sync {
    /// Open `path`, triggering all of its load-time initializers.
    fn open(&self, path: &str) -> Result<Arc<dyn SharedLibrary>>;
}

/// [`SharedLibrary`] over a real OS handle.
#[derive(Debug)]
pub struct NativeLibrary {
    path: String,
    library: Mutex<Option<Library>>,
}

impl SharedLibrary for NativeLibrary {
    fn path(&self) -> &str {
        &self.path
    }

    fn close(&self) -> Result<()> {
        let taken = self
            .library
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match taken {
            Some(library) => library
                .close()
                .map_err(|e| KedgeError::library_unload(format!("{}: {}", self.path, e))),
            None => Ok(()),
        }
    }
}

/// [`LibraryOpener`] over the platform dynamic loader.
pub struct NativeOpener;

impl LibraryOpener for NativeOpener {
    fn open(&self, path: &str) -> Result<Arc<dyn SharedLibrary>> {
        debug!("Opening shared library {}", path);
        // SAFETY: loading a shared object executes its initializers. That is
        // the entire point of a plugin library; the caller vouches for the
        // file it points the engine at.
        let library = unsafe { Library::new(path) }
            .map_err(|e| KedgeError::library_load(format!("{}: {}", path, e)))?;
        Ok(Arc::new(NativeLibrary {
            path: path.to_string(),
            library: Mutex::new(Some(library)),
        }))
    }
}

static OPENER: OnceLock<RwLock<Arc<dyn LibraryOpener>>> = OnceLock::new();

fn opener_slot() -> &'static RwLock<Arc<dyn LibraryOpener>> {
    OPENER.get_or_init(|| RwLock::new(Arc::new(NativeOpener)))
}

/// Replace the process-wide library opener.
///
/// The engine routes every OS open through the installed opener. Embedders
/// with a custom module loader install theirs here; the test harness installs
/// a stub. Libraries already opened through the previous opener keep their
/// original handles.
pub fn set_library_opener(opener: Arc<dyn LibraryOpener>) {
    *opener_slot().write().unwrap_or_else(|e| e.into_inner()) = opener;
}

pub(crate) fn library_opener() -> Arc<dyn LibraryOpener> {
    opener_slot()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Shape a bare library name into the platform's file name.
///
/// Prepends the platform library prefix (`lib` on unix-likes, nothing on
/// Windows) and appends the platform dynamic-library suffix.
///
/// ```
/// # use kedge_core::dylib::system_library_format;
/// let name = system_library_format("widgets");
/// #[cfg(target_os = "linux")]
/// assert_eq!(name, "libwidgets.so");
/// #[cfg(target_os = "macos")]
/// assert_eq!(name, "libwidgets.dylib");
/// #[cfg(windows)]
/// assert_eq!(name, "widgets.dll");
/// ```
pub fn system_library_format(library_name: &str) -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        library_name,
        std::env::consts::DLL_SUFFIX
    )
}
