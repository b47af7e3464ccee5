//! Managed instance handles
//!
//! Handles returned by `create_shared` / `create_unique` pair the plugin
//! object with a guard that reports its destruction back to the loader. The
//! object is always dropped before the guard fires, so the plugin's drop
//! glue runs while its library is guaranteed resident; releasing the last
//! handle is what makes an on-demand unload legal in the first place.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::loader::LoaderInner;

/// Ties one managed instance to its loader's live-instance accounting.
pub(crate) struct InstanceGuard {
    loader: Arc<LoaderInner>,
}

impl InstanceGuard {
    pub(crate) fn new(loader: Arc<LoaderInner>) -> Self {
        InstanceGuard { loader }
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.loader.release_instance();
    }
}

// Field order is load-bearing: `instance` must drop before `guard`, because
// the guard's release may close the library that holds the drop glue.
struct SharedRepr<B: ?Sized> {
    instance: Box<B>,
    #[allow(dead_code)]
    guard: InstanceGuard,
}

/// Clonable shared handle to a plugin instance, reachable through base `B`.
///
/// All clones refer to the same instance; the loader's live-instance count
/// drops (and an on-demand unload may fire) when the last clone is dropped.
pub struct SharedInstance<B: ?Sized> {
    repr: Arc<SharedRepr<B>>,
}

impl<B: ?Sized> SharedInstance<B> {
    pub(crate) fn new(instance: Box<B>, guard: InstanceGuard) -> Self {
        SharedInstance {
            repr: Arc::new(SharedRepr { instance, guard }),
        }
    }
}

impl<B: ?Sized> Clone for SharedInstance<B> {
    fn clone(&self) -> Self {
        SharedInstance {
            repr: self.repr.clone(),
        }
    }
}

impl<B: ?Sized> Deref for SharedInstance<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.repr.instance
    }
}

impl<B: ?Sized> fmt::Debug for SharedInstance<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedInstance")
            .field("clones", &Arc::strong_count(&self.repr))
            .finish()
    }
}

/// Single-owner handle to a plugin instance, reachable through base `B`.
///
/// Unlike [`SharedInstance`] it grants mutable access. Dropping it releases
/// the instance with the same accounting as a shared handle.
pub struct UniqueInstance<B: ?Sized> {
    // Same drop-order requirement as `SharedRepr`.
    instance: Box<B>,
    #[allow(dead_code)]
    guard: InstanceGuard,
}

impl<B: ?Sized> UniqueInstance<B> {
    pub(crate) fn new(instance: Box<B>, guard: InstanceGuard) -> Self {
        UniqueInstance { instance, guard }
    }
}

impl<B: ?Sized> Deref for UniqueInstance<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.instance
    }
}

impl<B: ?Sized> DerefMut for UniqueInstance<B> {
    fn deref_mut(&mut self) -> &mut B {
        &mut self.instance
    }
}

impl<B: ?Sized> fmt::Debug for UniqueInstance<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueInstance").finish()
    }
}
