//! The six-stage hook pipeline engine.
//!
//! Read-only stages fan hooks out over clones of the message behind a
//! bounded queue; hook failures are logged and never fail the exchange.
//! Mutation stages run hooks sequentially on the live message and abort the
//! exchange on the first error. Hook vectors swap atomically: in-flight
//! invocations keep the snapshot they entered with.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::body::Body;
use crate::errors::Result;
use crate::request::Request;
use crate::response::Response;

/// Queue capacity of each read-only stage.
pub const STAGE_QUEUE_CAPACITY: usize = 1024;

/// A message that can travel the pipelines.
pub trait PipelineItem: Clone + Send + Sync + 'static {
  /// The exchange identifier carried by the message.
  fn item_id(&self) -> Option<Uuid>;
  /// The body handle, if any.
  fn item_body(&self) -> Option<&Body>;
  /// Mutable access to the body handle.
  fn item_body_mut(&mut self) -> Option<&mut Body>;
}

impl PipelineItem for Request {
  fn item_id(&self) -> Option<Uuid> {
    Some(self.id())
  }
  fn item_body(&self) -> Option<&Body> {
    self.body()
  }
  fn item_body_mut(&mut self) -> Option<&mut Body> {
    self.body_mut().as_mut()
  }
}

impl PipelineItem for Response {
  fn item_id(&self) -> Option<Uuid> {
    self.id()
  }
  fn item_body(&self) -> Option<&Body> {
    self.body()
  }
  fn item_body_mut(&mut self) -> Option<&mut Body> {
    self.body_mut().as_mut()
  }
}

/// A hook that observes a message without modifying the exchange.
#[async_trait]
pub trait ReadOnlyHook<T>: Send + Sync {
  /// Observe one message. The hook owns a clone; errors are logged, never
  /// propagated to the exchange.
  async fn call(&self, item: T) -> Result<()>;
}

/// A hook that may rewrite a message.
#[async_trait]
pub trait ModHook<T>: Send + Sync {
  /// Rewrite (or pass through) one message. An error aborts the exchange.
  async fn call(&self, item: T) -> Result<T>;
}

struct FnReadOnly<F>(F);

#[async_trait]
impl<T, F> ReadOnlyHook<T> for FnReadOnly<F>
where
  T: PipelineItem,
  F: Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
  async fn call(&self, item: T) -> Result<()> {
    (self.0)(item).await
  }
}

struct FnMod<F>(F);

#[async_trait]
impl<T, F> ModHook<T> for FnMod<F>
where
  T: PipelineItem,
  F: Fn(T) -> BoxFuture<'static, Result<T>> + Send + Sync,
{
  async fn call(&self, item: T) -> Result<T> {
    (self.0)(item).await
  }
}

/// Wrap a closure as a read-only hook.
pub fn read_only_fn<T, F>(f: F) -> Arc<dyn ReadOnlyHook<T>>
where
  T: PipelineItem,
  F: Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
{
  Arc::new(FnReadOnly(f))
}

/// Wrap a closure as a mutation hook.
pub fn mod_fn<T, F>(f: F) -> Arc<dyn ModHook<T>>
where
  T: PipelineItem,
  F: Fn(T) -> BoxFuture<'static, Result<T>> + Send + Sync + 'static,
{
  Arc::new(FnMod(f))
}

struct QueueItem<T> {
  item: T,
  hooks: Arc<Vec<Arc<dyn ReadOnlyHook<T>>>>,
  done: oneshot::Sender<()>,
}

/// A read-only stage: a bounded queue drained by a dedicated worker which
/// forks one task per hook, each over its own clone of the message.
pub struct ReadOnlyPipeline<T: PipelineItem> {
  stage: &'static str,
  hooks: RwLock<Arc<Vec<Arc<dyn ReadOnlyHook<T>>>>>,
  queue: mpsc::Sender<QueueItem<T>>,
}

impl<T: PipelineItem> ReadOnlyPipeline<T> {
  /// Create the stage and spawn its drain worker.
  pub fn new(stage: &'static str, hooks: Vec<Arc<dyn ReadOnlyHook<T>>>) -> Self {
    let (queue, mut rx) = mpsc::channel::<QueueItem<T>>(STAGE_QUEUE_CAPACITY);
    tokio::spawn(async move {
      while let Some(item) = rx.recv().await {
        process_item(stage, item).await;
      }
    });
    Self {
      stage,
      hooks: RwLock::new(Arc::new(hooks)),
      queue,
    }
  }

  /// Offer one message to the stage and wait until every hook finished with
  /// it. A full queue drops the message with a warning; the exchange is
  /// never failed by this stage.
  pub async fn run(&self, item: &T) {
    let hooks = self
      .hooks
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    if hooks.is_empty() {
      return;
    }
    let (done, done_rx) = oneshot::channel();
    let queued = QueueItem {
      item: item.clone(),
      hooks,
      done,
    };
    match self.queue.try_send(queued) {
      Ok(()) => {
        let _ = done_rx.await;
      }
      Err(mpsc::error::TrySendError::Full(_)) => {
        tracing::warn!(stage = self.stage, "pipeline queue full, dropping item");
      }
      Err(mpsc::error::TrySendError::Closed(_)) => {
        tracing::warn!(stage = self.stage, "pipeline worker gone, dropping item");
      }
    }
  }

  /// Replace the hook vector. In-flight invocations keep their snapshot.
  pub fn set_hooks(&self, hooks: Vec<Arc<dyn ReadOnlyHook<T>>>) {
    let mut guard = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
    *guard = Arc::new(hooks);
  }
}

async fn process_item<T: PipelineItem>(stage: &'static str, queued: QueueItem<T>) {
  let mut tasks = Vec::with_capacity(queued.hooks.len());
  for hook in queued.hooks.iter() {
    let hook = hook.clone();
    let item = queued.item.clone();
    tasks.push(tokio::spawn(async move { hook.call(item).await }));
  }
  for task in tasks {
    match task.await {
      Ok(Ok(())) => {}
      Ok(Err(error)) => {
        tracing::error!(stage, %error, "read-only hook failed");
      }
      Err(error) => {
        tracing::error!(stage, %error, "read-only hook panicked");
      }
    }
  }
  let _ = queued.done.send(());
}

/// A mutation stage: hooks run one after another on the live message, in
/// registration order.
pub struct ModPipeline<T: PipelineItem> {
  stage: &'static str,
  hooks: RwLock<Arc<Vec<Arc<dyn ModHook<T>>>>>,
}

impl<T: PipelineItem> ModPipeline<T> {
  /// Create the stage.
  pub fn new(stage: &'static str, hooks: Vec<Arc<dyn ModHook<T>>>) -> Self {
    Self {
      stage,
      hooks: RwLock::new(Arc::new(hooks)),
    }
  }

  /// Run every hook in order. After each hook the body is readable from
  /// position zero again: a retained buffer has its cursor reset, a replaced
  /// buffer forces a clone of the message.
  pub async fn run(&self, mut item: T) -> Result<T> {
    let hooks = self
      .hooks
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    for hook in hooks.iter() {
      let before = item.item_body().cloned();
      item = hook.call(item).await.map_err(|error| {
        tracing::error!(stage = self.stage, %error, "mutation hook failed");
        error
      })?;
      let same_buffer = match (&before, item.item_body()) {
        (Some(previous), Some(current)) => current.same_buffer(previous),
        (None, None) => true,
        _ => false,
      };
      if same_buffer {
        if let Some(body) = item.item_body_mut() {
          body.reset();
        }
      } else {
        item = item.clone();
      }
    }
    Ok(item)
  }

  /// Replace the hook vector. In-flight invocations keep their snapshot.
  pub fn set_hooks(&self, hooks: Vec<Arc<dyn ModHook<T>>>) {
    let mut guard = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
    *guard = Arc::new(hooks);
  }
}

/// The six stages of the proxy, three per direction.
pub struct Pipelines {
  /// Read-only observation of the request as it arrived.
  pub request_in: ReadOnlyPipeline<Request>,
  /// Sequential request rewriting.
  pub request_mod: ModPipeline<Request>,
  /// Read-only observation of the request as it leaves for the upstream.
  pub request_out: ReadOnlyPipeline<Request>,
  /// Read-only observation of the response as it arrived.
  pub response_in: ReadOnlyPipeline<Response>,
  /// Sequential response rewriting.
  pub response_mod: ModPipeline<Response>,
  /// Read-only observation of the response sent to the client.
  pub response_out: ReadOnlyPipeline<Response>,
}

impl Pipelines {
  pub(crate) fn new() -> Self {
    Self {
      request_in: ReadOnlyPipeline::new("request_in", Vec::new()),
      request_mod: ModPipeline::new("request_mod", Vec::new()),
      request_out: ReadOnlyPipeline::new("request_out", Vec::new()),
      response_in: ReadOnlyPipeline::new("response_in", Vec::new()),
      response_mod: ModPipeline::new("response_mod", Vec::new()),
      response_out: ReadOnlyPipeline::new("response_out", Vec::new()),
    }
  }
}
