//! Plugin-side half of the native plugin contract.
//!
//! Everything here is compiled into the plugin, not the host, and is reached
//! through [`export_plugin!`](crate::export_plugin). A native plugin links its
//! own copies of the standard library, tokio and tracing:
//!
//! - a panic must never unwind into host frames, so every factory call, hook
//!   poll and synchroniser decision is wrapped in `catch_unwind` here and
//!   handed to the host as an error;
//! - the plugin's tokio cannot see the host runtime, so hooks are polled
//!   inside a small runtime owned by the plugin, whose driver serves timers
//!   and I/O started by plugin code;
//! - the plugin's tracing has no subscriber, so events are rendered here and
//!   forwarded to the host log sink.

use super::SymbolTable;
use super::abi::{
  HostServices, LOG_DEBUG, LOG_ERROR, LOG_INFO, LOG_TRACE, LOG_WARN, LogRecord, PANIC_PREFIX,
  REGISTER_INVALID, REGISTER_OK, REGISTER_PANICKED, level_filter,
};
use crate::error::NodeError;
use crate::node::{InputBatch, Node, NodeContext, NodeOptions, panic_message};
use crate::payload::PayloadKind;
use crate::synchroniser::{Selection, SourceView, Synchroniser};
use async_trait::async_trait;
use std::ffi::c_void;
use std::fmt::{self, Write as _};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber, error};
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

static RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();

fn runtime() -> Option<&'static Handle> {
  RUNTIME
    .get_or_init(|| {
      Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("tributary-plugin")
        .enable_all()
        .build()
        .ok()
    })
    .as_ref()
    .map(Runtime::handle)
}

/// Runs `f` inside the plugin runtime, containing panics.
fn contained<T>(f: impl FnOnce() -> T) -> Result<T, String> {
  let _entered = runtime().map(Handle::enter);
  catch_unwind(AssertUnwindSafe(f)).map_err(|panic| panic_message(panic.as_ref()))
}

/// Fills the host's symbol table. Called by `tributary_plugin_register`.
///
/// # Safety
///
/// `table` must point to a live [`SymbolTable`] and `host`, when not null,
/// to live [`HostServices`], both for the duration of the call.
pub unsafe fn register(
  table: *mut c_void,
  host: *const HostServices,
  fill: impl FnOnce(&mut SymbolTable),
) -> i32 {
  let outcome = catch_unwind(AssertUnwindSafe(|| {
    // SAFETY: guaranteed by the caller.
    if let Some(host) = unsafe { host.as_ref() } {
      forward_logs(host);
    }
    // SAFETY: guaranteed by the caller.
    let Some(table) = (unsafe { table.cast::<SymbolTable>().as_mut() }) else {
      return REGISTER_INVALID;
    };
    fill(table);
    REGISTER_OK
  }));
  outcome.unwrap_or(REGISTER_PANICKED)
}

/// Wraps a plugin factory so that it, and every node it builds, is contained.
pub fn contain_factory<F>(
  class_name: &'static str,
  factory: F,
) -> impl Fn(NodeOptions) -> Result<Box<dyn Node>, NodeError> + Send + Sync + 'static
where
  F: Fn(NodeOptions) -> Result<Box<dyn Node>, NodeError> + Send + Sync + 'static,
{
  move |options| match contained(|| factory(options)) {
    Ok(Ok(node)) => Ok(Box::new(GuestNode { inner: node }) as Box<dyn Node>),
    Ok(Err(err)) => Err(err),
    Err(panic) => Err(format!("entry point '{class_name}' panicked: {panic}").into()),
  }
}

type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NodeError>> + Send + 'a>>;

/// Polls a plugin hook inside the plugin runtime and turns a panic into an
/// error.
struct Contained<'a> {
  hook: &'static str,
  future: Option<HookFuture<'a>>,
}

impl<'a> Contained<'a> {
  fn new(hook: &'static str, future: HookFuture<'a>) -> Self {
    Self {
      hook,
      future: Some(future),
    }
  }

  fn release(&mut self) {
    if let Some(future) = self.future.take() {
      if let Err(panic) = contained(move || drop(future)) {
        error!(hook = self.hook, panic = %panic, "plugin future panicked on drop");
      }
    }
  }
}

impl Future for Contained<'_> {
  type Output = Result<(), NodeError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = &mut *self;
    let Some(future) = this.future.as_mut() else {
      return Poll::Ready(Err(format!("'{}' polled after completion", this.hook).into()));
    };
    match contained(|| future.as_mut().poll(cx)) {
      Ok(Poll::Pending) => Poll::Pending,
      Ok(Poll::Ready(outcome)) => {
        this.release();
        Poll::Ready(outcome)
      }
      Err(panic) => {
        this.release();
        Poll::Ready(Err(format!("{PANIC_PREFIX}'{}': {panic}", this.hook).into()))
      }
    }
  }
}

impl Drop for Contained<'_> {
  fn drop(&mut self) {
    self.release();
  }
}

/// A plugin node as seen by the host.
struct GuestNode {
  inner: Box<dyn Node>,
}

#[async_trait]
impl Node for GuestNode {
  async fn configure(&mut self, ctx: &NodeContext) -> Result<(), NodeError> {
    Contained::new("configure", self.inner.configure(ctx)).await
  }

  async fn warmup(&mut self, ctx: &NodeContext) -> Result<(), NodeError> {
    Contained::new("warmup", self.inner.warmup(ctx)).await
  }

  async fn start(&mut self, ctx: &NodeContext) -> Result<(), NodeError> {
    Contained::new("start", self.inner.start(ctx)).await
  }

  async fn update(&mut self, batch: InputBatch, ctx: &NodeContext) -> Result<(), NodeError> {
    Contained::new("update", self.inner.update(batch, ctx)).await
  }

  async fn stop(&mut self) -> Result<(), NodeError> {
    Contained::new("stop", self.inner.stop()).await
  }

  async fn destroy(&mut self) -> Result<(), NodeError> {
    Contained::new("destroy", self.inner.destroy()).await
  }

  fn synchroniser(&self) -> Option<Arc<dyn Synchroniser>> {
    match contained(|| self.inner.synchroniser()) {
      Ok(synchroniser) => {
        synchroniser.map(|inner| Arc::new(GuestSynchroniser { inner }) as Arc<dyn Synchroniser>)
      }
      Err(panic) => {
        error!(panic = %panic, "plugin synchroniser lookup panicked");
        None
      }
    }
  }

  fn accepts(&self) -> &[PayloadKind] {
    contained(|| self.inner.accepts()).unwrap_or(&[])
  }

  fn produces(&self) -> &[PayloadKind] {
    contained(|| self.inner.produces()).unwrap_or(&[])
  }
}

/// A plugin synchroniser; a panicking decision selects nothing.
#[derive(Debug)]
struct GuestSynchroniser {
  inner: Arc<dyn Synchroniser>,
}

impl Synchroniser for GuestSynchroniser {
  fn name(&self) -> &str {
    contained(|| self.inner.name()).unwrap_or("plugin")
  }

  fn next_batch(&self, sources: &SourceView) -> Selection {
    contained(|| self.inner.next_batch(sources)).unwrap_or_else(|panic| {
      error!(panic = %panic, "plugin synchroniser panicked, nothing selected");
      Selection::new()
    })
  }
}

/// Installs a subscriber in the plugin that hands events to the host.
fn forward_logs(host: &HostServices) {
  let forward = ForwardLayer { log: host.log };
  // Fails when a previous registration already installed it.
  let _ = tracing_subscriber::registry()
    .with(level_filter(host.max_level))
    .with(forward)
    .try_init();
}

struct ForwardLayer {
  log: extern "C" fn(*const LogRecord),
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
  fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
    let metadata = event.metadata();
    let level = match *metadata.level() {
      tracing::Level::ERROR => LOG_ERROR,
      tracing::Level::WARN => LOG_WARN,
      tracing::Level::INFO => LOG_INFO,
      tracing::Level::DEBUG => LOG_DEBUG,
      _ => LOG_TRACE,
    };
    let mut line = Line::default();
    event.record(&mut line);
    let message = line.finish();
    (self.log)(&LogRecord::new(level, metadata.target(), &message));
  }
}

/// Renders an event as `message key=value ...`.
#[derive(Default)]
struct Line {
  message: String,
  fields: String,
}

impl Line {
  fn finish(mut self) -> String {
    if self.message.is_empty() {
      return self.fields.trim_start().to_string();
    }
    self.message.push_str(&self.fields);
    self.message
  }
}

impl Visit for Line {
  fn record_str(&mut self, field: &Field, value: &str) {
    if field.name() == "message" {
      self.message.push_str(value);
    } else {
      let _ = write!(self.fields, " {}={value}", field.name());
    }
  }

  fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
    if field.name() == "message" {
      let _ = write!(self.message, "{value:?}");
    } else {
      let _ = write!(self.fields, " {}={value:?}", field.name());
    }
  }
}
