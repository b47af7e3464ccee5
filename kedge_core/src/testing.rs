//! Test harness for exercising the engine without real shared objects
//!
//! Loader behavior is almost entirely about bookkeeping around the OS
//! loader, so the tests script that collaborator instead: [`StubOpener`]
//! implements the [`LibraryOpener`](crate::dylib::LibraryOpener) seam with
//! in-memory libraries whose "static initializers" are plain closures. An
//! initializer typically calls
//! [`register_factory`](crate::registry::register_factory), which is exactly
//! what the expansion of [`register_class!`](crate::register_class) does when
//! a real library is mapped.
//!
//! The harness is process-global (the opener seam is process-global); tests
//! stay independent by giving every test its own library paths via
//! [`unique_library_path`].
//!
//! # Example
//!
//! ```rust,ignore
//! let stub = StubOpener::install();
//! let path = unique_library_path("widgets");
//! stub.add_initializer(&path, || {
//!     register_factory::<dyn Widget>("GearWidget", "Widget", || Box::new(GearWidget::default()));
//! });
//!
//! let loader = Loader::new(&path, false)?;
//! assert!(stub.is_resident(&path));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::dylib::{set_library_opener, LibraryOpener, SharedLibrary};
use crate::error::{KedgeError, Result};

static TEST_LIBRARY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A library path no other test in this process will use.
pub fn unique_library_path(tag: &str) -> String {
    let n = TEST_LIBRARY_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/kedge-test/lib{}-{}.so", tag, n)
}

type Initializer = Arc<dyn Fn() + Send + Sync>;

struct StubSpec {
    initializers: Vec<Initializer>,
    /// Real images rerun their initializers when reloaded after a true
    /// unload; set this to `false` to emulate an OS-cached image (the
    /// graveyard-revival scenario).
    rerun_initializers: bool,
    ever_opened: bool,
    resident: bool,
    open_count: u64,
    fail_next_open: bool,
    fail_next_close: bool,
}

impl Default for StubSpec {
    fn default() -> Self {
        StubSpec {
            initializers: Vec::new(),
            rerun_initializers: true,
            ever_opened: false,
            resident: false,
            open_count: 0,
            fail_next_open: false,
            fail_next_close: false,
        }
    }
}

/// Scriptable stand-in for the platform dynamic loader.
pub struct StubOpener {
    specs: Mutex<HashMap<String, StubSpec>>,
}

static STUB: OnceLock<Arc<StubOpener>> = OnceLock::new();

impl StubOpener {
    /// Install the process-wide stub opener (idempotent) and return it.
    pub fn install() -> Arc<StubOpener> {
        STUB.get_or_init(|| {
            let stub = Arc::new(StubOpener {
                specs: Mutex::new(HashMap::new()),
            });
            set_library_opener(stub.clone());
            stub
        })
        .clone()
    }

    /// Declare `path` as an openable library with no initializers (a
    /// library that registers nothing).
    pub fn define_library(&self, path: &str) {
        let mut specs = self.specs.lock().unwrap_or_else(|e| e.into_inner());
        specs.entry(path.to_string()).or_default();
    }

    /// Append a load-time initializer to `path`, declaring the library if
    /// needed.
    pub fn add_initializer(&self, path: &str, init: impl Fn() + Send + Sync + 'static) {
        let mut specs = self.specs.lock().unwrap_or_else(|e| e.into_inner());
        specs
            .entry(path.to_string())
            .or_default()
            .initializers
            .push(Arc::new(init));
    }

    /// Choose whether reopening `path` reruns its initializers (`true`,
    /// the default, like a freshly mapped image) or skips them (`false`,
    /// like an image the OS kept resident).
    pub fn set_rerun_initializers(&self, path: &str, rerun: bool) {
        let mut specs = self.specs.lock().unwrap_or_else(|e| e.into_inner());
        specs.entry(path.to_string()).or_default().rerun_initializers = rerun;
    }

    /// Make the next open of `path` fail.
    pub fn fail_next_open(&self, path: &str) {
        let mut specs = self.specs.lock().unwrap_or_else(|e| e.into_inner());
        specs.entry(path.to_string()).or_default().fail_next_open = true;
    }

    /// Make the next close of `path` fail.
    pub fn fail_next_close(&self, path: &str) {
        let mut specs = self.specs.lock().unwrap_or_else(|e| e.into_inner());
        specs.entry(path.to_string()).or_default().fail_next_close = true;
    }

    /// How many times `path` has been opened.
    pub fn open_count(&self, path: &str) -> u64 {
        let specs = self.specs.lock().unwrap_or_else(|e| e.into_inner());
        specs.get(path).map(|s| s.open_count).unwrap_or(0)
    }

    /// Whether `path` is currently open at the stub-OS level.
    pub fn is_resident(&self, path: &str) -> bool {
        let specs = self.specs.lock().unwrap_or_else(|e| e.into_inner());
        specs.get(path).map(|s| s.resident).unwrap_or(false)
    }

    fn mark_closed(&self, path: &str) -> Result<()> {
        let mut specs = self.specs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(spec) = specs.get_mut(path) {
            if spec.fail_next_close {
                spec.fail_next_close = false;
                return Err(KedgeError::library_unload(format!(
                    "{}: simulated close failure",
                    path
                )));
            }
            spec.resident = false;
        }
        Ok(())
    }
}

impl LibraryOpener for StubOpener {
    fn open(&self, path: &str) -> Result<Arc<dyn SharedLibrary>> {
        let initializers = {
            let mut specs = self.specs.lock().unwrap_or_else(|e| e.into_inner());
            let spec = specs.get_mut(path).ok_or_else(|| {
                KedgeError::library_load(format!("{}: unknown test library", path))
            })?;
            if spec.fail_next_open {
                spec.fail_next_open = false;
                return Err(KedgeError::library_load(format!(
                    "{}: simulated open failure",
                    path
                )));
            }
            spec.open_count += 1;
            let run = spec.rerun_initializers || !spec.ever_opened;
            spec.ever_opened = true;
            spec.resident = true;
            if run {
                spec.initializers.clone()
            } else {
                Vec::new()
            }
        };

        // Initializers run after the bookkeeping lock is released, just as
        // real static initializers run outside any harness state.
        for init in initializers {
            init();
        }

        Ok(Arc::new(StubLibrary {
            path: path.to_string(),
            opener: StubOpener::install(),
        }))
    }
}

/// Handle to an open stub library.
pub struct StubLibrary {
    path: String,
    opener: Arc<StubOpener>,
}

impl std::fmt::Debug for StubLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubLibrary").field("path", &self.path).finish()
    }
}

impl SharedLibrary for StubLibrary {
    fn path(&self) -> &str {
        &self.path
    }

    fn close(&self) -> Result<()> {
        self.opener.mark_closed(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_paths_are_unique() {
        assert_ne!(unique_library_path("a"), unique_library_path("a"));
    }

    #[test]
    fn test_open_runs_initializers_and_tracks_residency() {
        let stub = StubOpener::install();
        let path = unique_library_path("stub-basic");
        let fired = Arc::new(AtomicU64::new(0));

        let counter = fired.clone();
        stub.add_initializer(&path, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let handle = stub.open(&path).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(stub.is_resident(&path));
        assert_eq!(stub.open_count(&path), 1);

        handle.close().unwrap();
        assert!(!stub.is_resident(&path));
    }

    #[test]
    fn test_cached_image_skips_initializers() {
        let stub = StubOpener::install();
        let path = unique_library_path("stub-cached");
        let fired = Arc::new(AtomicU64::new(0));

        let counter = fired.clone();
        stub.add_initializer(&path, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        stub.set_rerun_initializers(&path, false);

        stub.open(&path).unwrap().close().unwrap();
        stub.open(&path).unwrap();
        // Second open reused the "resident image": no initializer rerun.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(stub.open_count(&path), 2);
    }

    #[test]
    fn test_scripted_failures() {
        let stub = StubOpener::install();
        let path = unique_library_path("stub-fail");
        stub.define_library(&path);

        stub.fail_next_open(&path);
        assert!(matches!(
            stub.open(&path),
            Err(KedgeError::LibraryLoad(_))
        ));

        let handle = stub.open(&path).unwrap();
        stub.fail_next_close(&path);
        assert!(matches!(handle.close(), Err(KedgeError::LibraryUnload(_))));
        // The failed close left the library resident; the retry succeeds.
        assert!(stub.is_resident(&path));
        handle.close().unwrap();
        assert!(!stub.is_resident(&path));
    }
}
