//! Load-time class registration
//!
//! Plugin authors declare, once per exported class, which trait the class is
//! reachable through. The [`register_class!`](crate::register_class) macro
//! turns that declaration into a load-time constructor: when the OS loader
//! maps the plugin library, the constructor fires, consults the loading
//! context for the loader driving the open, and publishes the factory into
//! the global registry.

/// Dependencies of the code generated by [`register_class!`](crate::register_class).
#[doc(hidden)]
pub mod export {
    pub use ctor;
    pub use log;
}

/// Export `$derived` as a runtime-creatable class reachable through
/// `$base`.
///
/// Declare once per exported class, at module scope, in the plugin library
/// that defines the class. The expansion registers a factory equivalent to
/// `Box::new(Derived::default())` when the library is loaded, so the derived
/// type must implement [`Default`]. An optional third argument is a banner
/// logged at registration time.
///
/// ```rust,ignore
/// use kedge_core::register_class;
///
/// #[derive(Default)]
/// pub struct GearWidget { teeth: u32 }
///
/// impl Widget for GearWidget {
///     fn poll(&self) -> u32 { self.teeth }
/// }
///
/// register_class!(GearWidget, dyn Widget);
/// register_class!(GearWidget, dyn Widget, "gear widget plugin loaded");
/// ```
///
/// Every expansion lives in its own anonymous `const` scope, so multiple
/// declarations in one module cannot collide.
#[macro_export]
macro_rules! register_class {
    ($derived:ty, $base:ty) => {
        $crate::register_class!($derived, $base, "");
    };
    ($derived:ty, $base:ty, $banner:expr) => {
        const _: () = {
            use $crate::export::ctor;

            #[ctor::ctor]
            fn register() {
                let banner: &str = $banner;
                if !banner.is_empty() {
                    $crate::export::log::info!("{}", banner);
                }
                $crate::registry::register_factory::<$base>(
                    ::core::stringify!($derived),
                    ::core::stringify!($base),
                    || ::std::boxed::Box::new(<$derived as ::core::default::Default>::default()),
                );
            }
        };
    };
}
