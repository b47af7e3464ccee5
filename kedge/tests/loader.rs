//! Integration tests for the single-library `Loader`.
//!
//! The platform dynamic loader is replaced by the in-tree stub opener, whose
//! scripted initializers play the role of a plugin library's load-time
//! self-registrations. Every test uses its own library paths (and mostly its
//! own base traits), so the tests are safe to run in parallel against the
//! process-global registry.

use std::sync::Arc;

use kedge::prelude::*;
use kedge_core::testing::{unique_library_path, StubOpener};

trait Widget {
    fn describe(&self) -> String;
}

#[derive(Default)]
struct GearWidget;

impl Widget for GearWidget {
    fn describe(&self) -> String {
        "gear".to_string()
    }
}

#[derive(Default)]
struct SpringWidget;

impl Widget for SpringWidget {
    fn describe(&self) -> String {
        "spring".to_string()
    }
}

/// Script a library that registers both widget classes when opened.
fn widget_library(tag: &str) -> (Arc<StubOpener>, String) {
    let stub = StubOpener::install();
    let path = unique_library_path(tag);
    stub.add_initializer(&path, || {
        register_factory::<dyn Widget>("GearWidget", "Widget", || Box::new(GearWidget));
        register_factory::<dyn Widget>("SpringWidget", "Widget", || Box::new(SpringWidget));
    });
    (stub, path)
}

// ============================================================================
// Basic load / create / unload
// ============================================================================

#[test]
fn test_basic_load_create_unload() {
    let (stub, path) = widget_library("basic");

    let loader = Loader::new(&path, false).unwrap();
    assert!(loader.is_library_loaded());
    assert!(loader.is_library_loaded_by_anyone());
    assert!(stub.is_resident(&path));

    let widget = loader.create_shared::<dyn Widget>("GearWidget").unwrap();
    assert_eq!(widget.describe(), "gear");
    assert_eq!(loader.live_instance_count(), 1);

    drop(widget);
    assert_eq!(loader.live_instance_count(), 0);

    assert_eq!(loader.unload_library().unwrap(), 0);
    assert!(!loader.is_library_loaded());
    assert!(!stub.is_resident(&path));
}

#[test]
fn test_registration_order_is_preserved() {
    let (_stub, path) = widget_library("order");
    let loader = Loader::new(&path, false).unwrap();

    assert_eq!(
        loader.available_classes::<dyn Widget>(),
        vec!["GearWidget", "SpringWidget"]
    );
    assert!(loader.is_class_available::<dyn Widget>("SpringWidget"));
    assert!(!loader.is_class_available::<dyn Widget>("CogWidget"));
    assert_eq!(loader.libraries_in_use(), vec![path]);
}

// ============================================================================
// Refused unload while instances are alive
// ============================================================================

#[test]
fn test_unload_refused_with_live_instance() {
    let (stub, path) = widget_library("refused");
    let loader = Loader::new(&path, false).unwrap();

    let widget = loader.create_shared::<dyn Widget>("GearWidget").unwrap();

    // One load is outstanding and it stays outstanding: the call is refused.
    assert_eq!(loader.unload_library().unwrap(), 1);
    assert_eq!(loader.live_instance_count(), 1);
    assert!(stub.is_resident(&path));
    assert_eq!(widget.describe(), "gear");

    drop(widget);
    assert_eq!(loader.unload_library().unwrap(), 0);
    assert!(!stub.is_resident(&path));
}

// ============================================================================
// Two loaders over the same library
// ============================================================================

#[test]
fn test_overlapping_loaders_share_one_open() {
    let (stub, path) = widget_library("overlap");

    let first = Loader::new(&path, false).unwrap();
    let second = Loader::new(&path, false).unwrap();
    // The second loader adopts the resident image instead of reopening it.
    assert_eq!(stub.open_count(&path), 1);
    assert!(second.is_library_loaded());

    let from_first = first.create_shared::<dyn Widget>("GearWidget").unwrap();
    let from_second = second.create_shared::<dyn Widget>("SpringWidget").unwrap();

    drop(from_first);
    assert_eq!(first.unload_library().unwrap(), 0);
    // The OS close must wait for the second loader.
    assert!(stub.is_resident(&path));
    assert!(!first.is_class_available::<dyn Widget>("GearWidget"));
    assert!(second.is_class_available::<dyn Widget>("GearWidget"));

    drop(from_second);
    assert_eq!(second.unload_library().unwrap(), 0);
    assert!(!stub.is_resident(&path));
}

// ============================================================================
// Load-count idempotence
// ============================================================================

#[test]
fn test_repeated_loads_need_matching_unloads() {
    let (stub, path) = widget_library("idempotence");
    let loader = Loader::new(&path, false).unwrap();

    loader.load_library().unwrap();
    loader.load_library().unwrap();
    assert_eq!(stub.open_count(&path), 1);

    assert_eq!(loader.unload_library().unwrap(), 2);
    assert!(stub.is_resident(&path));
    assert_eq!(loader.unload_library().unwrap(), 1);
    assert!(stub.is_resident(&path));
    assert_eq!(loader.unload_library().unwrap(), 0);
    assert!(!stub.is_resident(&path));

    // Unloading past zero stays at zero.
    assert_eq!(loader.unload_library().unwrap(), 0);
}

// ============================================================================
// Round trip back to a clean state
// ============================================================================

#[test]
fn test_load_unload_round_trip() {
    let (stub, path) = widget_library("roundtrip");
    let loader = Loader::new(&path, false).unwrap();
    assert_eq!(loader.available_classes::<dyn Widget>().len(), 2);

    assert_eq!(loader.unload_library().unwrap(), 0);

    // Back to the pre-load state: nothing resident, nothing visible.
    assert!(!stub.is_resident(&path));
    assert!(loader.available_classes::<dyn Widget>().is_empty());
    assert!(loader.libraries_in_use().is_empty());

    // A later create reopens the library on its own.
    let widget = loader.create_shared::<dyn Widget>("GearWidget").unwrap();
    assert_eq!(widget.describe(), "gear");
    assert_eq!(stub.open_count(&path), 2);
    assert!(loader.is_library_loaded());
    drop(widget);
    assert_eq!(loader.unload_library().unwrap(), 0);
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[test]
fn test_empty_path_is_a_linktime_pseudo_library() {
    let loader = Loader::new("", false).unwrap();
    loader.load_library().unwrap();
    assert_eq!(loader.unload_library().unwrap(), 0);
    assert!(!loader.is_library_loaded_by_anyone());
}

#[test]
fn test_unknown_class_raises_create_class() {
    trait Gadget {}

    let (_stub, path) = widget_library("unknown-class");
    let loader = Loader::new(&path, false).unwrap();

    let err = loader.create_shared::<dyn Widget>("CogWidget").unwrap_err();
    assert!(matches!(err, KedgeError::CreateClass(_)));

    // A known class name under the wrong base is just as unknown.
    let err = loader.create_shared::<dyn Gadget>("GearWidget").unwrap_err();
    assert!(matches!(err, KedgeError::CreateClass(_)));
}

#[test]
fn test_open_failure_leaves_loader_usable() {
    let stub = StubOpener::install();
    let path = unique_library_path("open-failure");
    stub.add_initializer(&path, || {
        register_factory::<dyn Widget>("GearWidget", "Widget", || Box::new(GearWidget));
    });

    stub.fail_next_open(&path);
    let err = Loader::new(&path, false).unwrap_err();
    assert!(matches!(err, KedgeError::LibraryLoad(_)));

    // The failed attempt poisoned nothing: the next construction works.
    let loader = Loader::new(&path, false).unwrap();
    assert!(loader.is_library_loaded());
    assert_eq!(
        loader
            .create_shared::<dyn Widget>("GearWidget")
            .unwrap()
            .describe(),
        "gear"
    );
}

#[test]
fn test_close_failure_surfaces_library_unload() {
    let (stub, path) = widget_library("close-failure");
    let loader = Loader::new(&path, false).unwrap();

    stub.fail_next_close(&path);
    let err = loader.unload_library().unwrap_err();
    assert!(matches!(err, KedgeError::LibraryUnload(_)));
}

// ============================================================================
// Handle flavors
// ============================================================================

#[test]
fn test_shared_handles_count_once_per_instance() {
    let (_stub, path) = widget_library("shared-clones");
    let loader = Loader::new(&path, false).unwrap();

    let widget = loader.create_shared::<dyn Widget>("SpringWidget").unwrap();
    let alias = widget.clone();
    assert_eq!(loader.live_instance_count(), 1);

    drop(widget);
    // A clone is still alive; the instance is not released yet.
    assert_eq!(loader.live_instance_count(), 1);
    assert_eq!(alias.describe(), "spring");

    drop(alias);
    assert_eq!(loader.live_instance_count(), 0);
}

#[test]
fn test_unique_handles_give_mutable_access() {
    trait Counter {
        fn bump(&mut self) -> u32;
    }

    #[derive(Default)]
    struct TickCounter {
        count: u32,
    }

    impl Counter for TickCounter {
        fn bump(&mut self) -> u32 {
            self.count += 1;
            self.count
        }
    }

    let stub = StubOpener::install();
    let path = unique_library_path("unique-handle");
    stub.add_initializer(&path, || {
        register_factory::<dyn Counter>("TickCounter", "Counter", || {
            Box::new(TickCounter::default())
        });
    });

    let loader = Loader::new(&path, false).unwrap();
    let mut counter = loader.create_unique::<dyn Counter>("TickCounter").unwrap();
    assert_eq!(counter.bump(), 1);
    assert_eq!(counter.bump(), 2);
    assert_eq!(loader.live_instance_count(), 1);

    drop(counter);
    assert_eq!(loader.live_instance_count(), 0);
}
