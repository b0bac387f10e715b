//! # Plugins
//!
//! Node implementations supplied as external plugin folders.
//!
//! A plugin folder holds a manifest and exactly one implementation artifact:
//!
//! ```text
//! plugins/
//! └── echo/
//!     ├── config.toml        # [remote] class_name = "Echo", [arguments] defaults
//!     └── libecho.so         # or echo.so, echo.dylib, echo.dll, echo.linked
//! ```
//!
//! The artifact is named after the folder (a leading `_` in the folder name
//! may be dropped). Each loaded artifact becomes a [`PluginNamespace`] named
//! after its folder, holding a [`SymbolTable`] from entry-point name to node
//! factory. Entry points are looked up by the declared name only; nothing is
//! discovered by reflection.
//!
//! ## Native plugins
//!
//! A native plugin is a `cdylib` that registers its entry points with
//! [`export_plugin!`](crate::export_plugin):
//!
//! ```rust,ignore
//! use tributary::export_plugin;
//!
//! export_plugin! {
//!   "Echo" => echo::build,
//! }
//! ```
//!
//! The host and the plugin must be built with the same compiler and the same
//! version of this crate; [`PLUGIN_ABI_VERSION`] guards against mismatches of
//! the latter.
//!
//! Entry points are `extern "C"`. The plugin carries its own copies of the
//! standard library, tokio and tracing, so the generated code contains every
//! panic inside the plugin, polls node hooks in a runtime owned by the plugin
//! and forwards plugin log events to the host (see [`guest`]).
//!
//! ## Linked plugins
//!
//! A `.linked` artifact is a text file naming a registration unit compiled
//! into the host binary. Hosts register units on a [`LinkedLoader`].

mod abi;
pub mod guest;
mod loader;
mod manifest;
mod resolver;

#[cfg(test)]
mod plugin_test;

pub use abi::{
  AbiVersionFn, HostServices, LogRecord, NativeRegisterFn, PANIC_PREFIX, REGISTER_INVALID,
  REGISTER_OK, REGISTER_PANICKED, is_contained_panic,
};
pub use loader::{
  ArtifactLoader, LinkedLoader, NativeLoader, PluginLoader, PluginNamespace, RegisterFn,
  ResolvedPlugin, SymbolTable,
};
pub use manifest::{MANIFEST_FILE, PluginManifest};
pub use resolver::{NodeRegistry, NodeResolver, NodeSource, ResolvedNode};

/// Version of the native plugin interface.
pub const PLUGIN_ABI_VERSION: u32 = 2;

/// Symbol returning the plugin's [`PLUGIN_ABI_VERSION`].
pub const ABI_VERSION_SYMBOL: &str = "tributary_plugin_abi_version";

/// Symbol registering the plugin's entry points.
pub const REGISTER_SYMBOL: &str = "tributary_plugin_register";

/// Exports the entry points of a native plugin.
///
/// Each entry maps an entry-point name, as declared by `class_name` in the
/// manifest, to a factory `fn(NodeOptions) -> Result<Box<dyn Node>, NodeError>`.
/// Factories and the nodes they build are wrapped by
/// [`guest::contain_factory`].
#[macro_export]
macro_rules! export_plugin {
  ($($class:literal => $factory:expr),+ $(,)?) => {
    #[unsafe(no_mangle)]
    pub extern "C" fn tributary_plugin_abi_version() -> u32 {
      $crate::plugin::PLUGIN_ABI_VERSION
    }

    /// # Safety
    ///
    /// Called by the host loader with a live symbol table and host services.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn tributary_plugin_register(
      table: *mut ::std::ffi::c_void,
      host: *const $crate::plugin::HostServices,
    ) -> i32 {
      // SAFETY: forwarded from the host loader.
      unsafe {
        $crate::plugin::guest::register(table, host, |table| {
          $(
            table.register($class, $crate::plugin::guest::contain_factory($class, $factory));
          )+
        })
      }
    }
  };
}
