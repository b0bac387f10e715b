//! C-compatible contract between the host and native plugins.
//!
//! Only `#[repr(C)]` data, raw pointers and `extern "C"` functions cross the
//! library boundary at registration time. A native plugin carries its own
//! copies of the standard library, tokio and tracing, so the host hands it the
//! services it cannot reach otherwise: the host log sink and its level.

use std::ffi::c_void;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, trace, warn};

/// Registration succeeded.
pub const REGISTER_OK: i32 = 0;
/// Registration panicked inside the plugin; the panic was contained there.
pub const REGISTER_PANICKED: i32 = 1;
/// The host passed an invalid table pointer.
pub const REGISTER_INVALID: i32 = 2;

/// Leading text of a hook error standing for a panic contained in a plugin.
///
/// Error types do not survive the library boundary, their rendered text does.
pub const PANIC_PREFIX: &str = "plugin panicked: ";

/// Whether `err` reports a panic contained inside a plugin.
pub fn is_contained_panic(err: &(dyn std::error::Error + Send + Sync)) -> bool {
  err.to_string().starts_with(PANIC_PREFIX)
}

/// Log level codes, `0` meaning off.
pub const LOG_OFF: u8 = 0;
/// Error level code.
pub const LOG_ERROR: u8 = 1;
/// Warn level code.
pub const LOG_WARN: u8 = 2;
/// Info level code.
pub const LOG_INFO: u8 = 3;
/// Debug level code.
pub const LOG_DEBUG: u8 = 4;
/// Trace level code.
pub const LOG_TRACE: u8 = 5;

/// ABI version of a native plugin, as exported by `tributary_plugin_abi_version`.
pub type AbiVersionFn = unsafe extern "C" fn() -> u32;

/// Registration entry point of a native plugin.
///
/// The first argument points at a [`SymbolTable`](super::SymbolTable) owned
/// by the host, valid for the duration of the call.
pub type NativeRegisterFn = unsafe extern "C" fn(*mut c_void, *const HostServices) -> i32;

/// One log event forwarded from a plugin.
#[repr(C)]
pub struct LogRecord {
  /// Level code.
  pub level: u8,
  /// UTF-8 target (module path in the plugin).
  pub target: *const u8,
  /// Length of `target` in bytes.
  pub target_len: usize,
  /// UTF-8 rendered message and fields.
  pub message: *const u8,
  /// Length of `message` in bytes.
  pub message_len: usize,
}

impl LogRecord {
  /// Borrows `target` and `message` into a record.
  pub fn new(level: u8, target: &str, message: &str) -> Self {
    Self {
      level,
      target: target.as_ptr(),
      target_len: target.len(),
      message: message.as_ptr(),
      message_len: message.len(),
    }
  }

  /// # Safety
  ///
  /// `ptr` and `len` must describe a live byte slice.
  unsafe fn text<'a>(ptr: *const u8, len: usize) -> std::borrow::Cow<'a, str> {
    if ptr.is_null() {
      return std::borrow::Cow::Borrowed("");
    }
    // SAFETY: guaranteed by the caller.
    String::from_utf8_lossy(unsafe { std::slice::from_raw_parts(ptr, len) })
  }
}

/// Services the host offers to native plugins.
#[repr(C)]
pub struct HostServices {
  /// ABI version of the host.
  pub abi_version: u32,
  /// Most verbose level the host records.
  pub max_level: u8,
  /// Receives log events emitted by plugin code.
  pub log: extern "C" fn(*const LogRecord),
}

impl HostServices {
  /// Services of this process, at its current log level.
  pub fn current() -> Self {
    Self {
      abi_version: super::PLUGIN_ABI_VERSION,
      max_level: level_code(LevelFilter::current()),
      log: host_log,
    }
  }
}

/// Level code of `filter`.
pub fn level_code(filter: LevelFilter) -> u8 {
  match filter.into_level() {
    None => LOG_OFF,
    Some(tracing::Level::ERROR) => LOG_ERROR,
    Some(tracing::Level::WARN) => LOG_WARN,
    Some(tracing::Level::INFO) => LOG_INFO,
    Some(tracing::Level::DEBUG) => LOG_DEBUG,
    Some(_) => LOG_TRACE,
  }
}

/// Filter matching a level code.
pub fn level_filter(code: u8) -> LevelFilter {
  match code {
    LOG_OFF => LevelFilter::OFF,
    LOG_ERROR => LevelFilter::ERROR,
    LOG_WARN => LevelFilter::WARN,
    LOG_INFO => LevelFilter::INFO,
    LOG_DEBUG => LevelFilter::DEBUG,
    _ => LevelFilter::TRACE,
  }
}

extern "C" fn host_log(record: *const LogRecord) {
  // SAFETY: plugins pass a record that lives for the duration of the call.
  let Some(record) = (unsafe { record.as_ref() }) else {
    return;
  };
  // SAFETY: the record borrows strings owned by the calling plugin.
  let (target, message) = unsafe {
    (
      LogRecord::text(record.target, record.target_len),
      LogRecord::text(record.message, record.message_len),
    )
  };
  match record.level {
    LOG_ERROR => error!(target: "tributary::plugin", origin = %target, "{message}"),
    LOG_WARN => warn!(target: "tributary::plugin", origin = %target, "{message}"),
    LOG_INFO => info!(target: "tributary::plugin", origin = %target, "{message}"),
    LOG_DEBUG => debug!(target: "tributary::plugin", origin = %target, "{message}"),
    LOG_TRACE => trace!(target: "tributary::plugin", origin = %target, "{message}"),
    _ => {}
  }
}
