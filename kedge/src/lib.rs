//! # KEDGE
//!
//! Runtime plugin class loading for Rust: open shared libraries on demand,
//! discover the classes they export through load-time self-registration, and
//! instantiate those classes through a base-trait handle with lifetimes
//! scoped to the loader that created them.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kedge::prelude::*;
//!
//! let loader = Loader::new(system_library_format("widgets"), false)?;
//!
//! for class in loader.available_classes::<dyn Widget>() {
//!     println!("available: {class}");
//! }
//!
//! let widget = loader.create_shared::<dyn Widget>("GearWidget")?;
//! widget.poll();
//! ```
//!
//! Plugin side, once per exported class:
//!
//! ```rust,ignore
//! use kedge::register_class;
//!
//! register_class!(GearWidget, dyn Widget);
//! ```

// Re-export core components
pub use kedge_core::{self, *};

/// The kedge prelude - everything you need to get started
///
/// Just add `use kedge::prelude::*;`.
pub mod prelude {
    pub use kedge_core::dylib::{LibraryOpener, SharedLibrary};
    pub use kedge_core::error::{KedgeError, KedgeResult};
    pub use kedge_core::instance::{SharedInstance, UniqueInstance};
    pub use kedge_core::loader::Loader;
    pub use kedge_core::multi_loader::MultiLoader;
    pub use kedge_core::{register_class, register_factory, system_library_format};
}
