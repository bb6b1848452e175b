use anyhow::{anyhow, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};

/// Handle given to a spawned producer so it can surface progress updates to
/// the user while it works toward its final value.
#[derive(Clone)]
pub struct Emitter {
    tx: mpsc::Sender<String>,
}

impl Emitter {
    /// Send one user-visible progress update. Errors (consumer gone) are
    /// ignored; the producer keeps running and still gets to return a value.
    pub async fn update(&self, message: impl Into<String>) {
        let _ = self.tx.send(message.into()).await;
    }
}

enum Producer<T> {
    /// Value already captured, nothing to drive.
    Ready,
    /// Deferred work that yields no updates.
    Future(Option<BoxFuture<'static, Result<T>>>),
    /// A spawned producer streaming updates, final value on the oneshot.
    Stream {
        updates: mpsc::Receiver<String>,
        value: Option<oneshot::Receiver<Result<T>>>,
    },
}

/// Uniform carrier for "zero or more updates, then a final value".
///
/// Hooks and tools all speak this shape: a plain computation wraps its result
/// with [`Bridge::ready`] or [`Bridge::from_future`] and yields nothing; a
/// progress-reporting one uses [`Bridge::spawn`] and pushes updates through
/// the [`Emitter`]. The consumer drains [`next_update`](Bridge::next_update)
/// and then awaits [`returns`](Bridge::returns) for the value, or skips
/// straight to `returns`, which drives the producer to completion and
/// discards any updates.
///
/// Each bridge is single-shot: the value is captured exactly once, `returns`
/// consumes the bridge, and `next_update` keeps returning `None` once the
/// producer is done. A producer that finishes without handing over a value
/// surfaces as an error from `returns`, never as a hang.
pub struct Bridge<T> {
    producer: Producer<T>,
    value: Option<Result<T>>,
}

impl<T: Send + 'static> Bridge<T> {
    /// A bridge that yields nothing and immediately resolves to `value`.
    pub fn ready(value: T) -> Self {
        Self {
            producer: Producer::Ready,
            value: Some(Ok(value)),
        }
    }

    /// A bridge that immediately resolves to an error.
    pub fn fail(err: anyhow::Error) -> Self {
        Self {
            producer: Producer::Ready,
            value: Some(Err(err)),
        }
    }

    /// Wrap deferred work that produces a value but no updates.
    pub fn from_future<Fut>(fut: Fut) -> Self
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            producer: Producer::Future(Some(fut.boxed())),
            value: None,
        }
    }

    /// Spawn a producer task. The closure receives an [`Emitter`] for
    /// updates; its return value becomes the bridge's final value.
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Emitter) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (utx, urx) = mpsc::channel(16);
        let (vtx, vrx) = oneshot::channel();
        tokio::spawn(async move {
            let result = f(Emitter { tx: utx }).await;
            let _ = vtx.send(result);
        });
        Self {
            producer: Producer::Stream {
                updates: urx,
                value: Some(vrx),
            },
            value: None,
        }
    }

    /// Next progress update, driving the producer as needed. `None` means
    /// the producer is finished and the final value has been captured.
    pub async fn next_update(&mut self) -> Option<String> {
        if self.value.is_some() {
            return None;
        }
        match &mut self.producer {
            Producer::Ready => None,
            Producer::Future(slot) => {
                if let Some(fut) = slot.take() {
                    self.value = Some(fut.await);
                }
                None
            }
            Producer::Stream { updates, value } => match updates.recv().await {
                Some(update) => Some(update),
                None => {
                    let result = match value.take() {
                        Some(vrx) => vrx.await.unwrap_or_else(|_| {
                            Err(anyhow!("producer finished without a final value"))
                        }),
                        None => Err(anyhow!("producer finished without a final value")),
                    };
                    self.value = Some(result);
                    None
                }
            },
        }
    }

    /// Await the final value, draining (and discarding) any updates that
    /// were not consumed through `next_update`.
    pub async fn returns(mut self) -> Result<T> {
        loop {
            if let Some(result) = self.value.take() {
                return result;
            }
            if self.next_update().await.is_none() {
                return self
                    .value
                    .take()
                    .unwrap_or_else(|| Err(anyhow!("producer finished without a final value")));
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
