//! Single-owner cooperative event loop.
//!
//! A [`RunLoop`] drives closures against exclusively-owned state on one
//! task, giving components that juggle many callback sources a single
//! place where mutation happens. Any task may hold a [`LoopHandle`] and
//! submit work; submission is FIFO-ordered and wakes the loop. I/O
//! readiness itself is the tokio reactor's job; this crate only supplies
//! deterministic dispatch, timers, and termination.
//!
//! Handlers run to completion; they must not block.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

/// A cooperative dispatcher over state `S`.
pub struct RunLoop<S> {
    rx: mpsc::UnboundedReceiver<Task<S>>,
    handle: LoopHandle<S>,
}

/// Cloneable, thread-safe submission handle for a [`RunLoop`].
pub struct LoopHandle<S> {
    tx: mpsc::UnboundedSender<Task<S>>,
    cancel: CancellationToken,
}

// Derived Clone would require S: Clone.
impl<S> Clone for LoopHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Cancels its timer when invoked; dropping the handle leaves the timer
/// running.
pub struct TimerHandle {
    cancel: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<S: 'static> Default for RunLoop<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> RunLoop<S> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = LoopHandle {
            tx,
            cancel: CancellationToken::new(),
        };
        Self { rx, handle }
    }

    pub fn handle(&self) -> LoopHandle<S> {
        self.handle.clone()
    }

    /// Runs submitted work against `state` until [`LoopHandle::terminate`].
    ///
    /// Work already queued when termination is requested is drained before
    /// this returns; in-flight timers are cancelled.
    pub async fn run(&mut self, state: &mut S) {
        loop {
            tokio::select! {
                biased;
                _ = self.handle.cancel.cancelled() => break,
                task = self.rx.recv() => match task {
                    Some(task) => task(state),
                    None => break,
                },
            }
        }
        while let Ok(task) = self.rx.try_recv() {
            task(state);
        }
    }
}

impl<S: 'static> LoopHandle<S> {
    /// Enqueues `f` to run on the loop. FIFO with respect to other
    /// submissions; a no-op once the loop has terminated.
    pub fn submit(&self, f: impl FnOnce(&mut S) + Send + 'static) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.tx.send(Box::new(f));
    }

    /// Runs `f` on the loop once, after `delay`.
    pub fn submit_after(
        &self,
        delay: Duration,
        f: impl FnOnce(&mut S) + Send + 'static,
    ) -> TimerHandle {
        let tx = self.tx.clone();
        let timer = self.cancel.child_token();
        let guard = timer.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Box::new(f) as Task<S>);
                }
            }
        });
        TimerHandle { cancel: timer }
    }

    /// Runs `f` on the loop every `period` until cancelled.
    ///
    /// The first firing happens one full period after this call.
    pub fn submit_every(
        &self,
        period: Duration,
        f: impl Fn(&mut S) + Send + Sync + 'static,
    ) -> TimerHandle {
        let tx = self.tx.clone();
        let timer = self.cancel.child_token();
        let guard = timer.clone();
        let f = Arc::new(f);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // consume the immediate tick
            loop {
                tokio::select! {
                    _ = guard.cancelled() => return,
                    _ = ticker.tick() => {
                        let f = f.clone();
                        if tx.send(Box::new(move |s: &mut S| f(s))).is_err() {
                            return;
                        }
                    }
                }
            }
        });
        TimerHandle { cancel: timer }
    }

    /// Stops the loop. The loop drains already-queued work, cancels its
    /// timers, and returns from [`RunLoop::run`].
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
