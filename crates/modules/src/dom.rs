use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{trace, warn};

/// Host binding for subtree-change observation on the document root.
///
/// The watcher calls `observe` when the first pending wait is registered and
/// `disconnect` once none remain. While observing, the host must call
/// [`DomWatcher::on_mutations`] for every batch of changes.
pub trait MutationSource: Send + Sync {
    fn observe(&self);
    fn disconnect(&self);
}

type Condition = Box<dyn FnMut() -> bool + Send>;
type Slot = Arc<Mutex<Option<Condition>>>;

struct WatcherState {
    next_id: u64,
    observing: bool,
    pending: BTreeMap<u64, Slot>,
}

struct WatcherInner {
    source: Arc<dyn MutationSource>,
    state: Mutex<WatcherState>,
}

impl WatcherInner {
    fn unsubscribe(&self, id: u64) {
        let slot = {
            let mut state = lock(&self.state);
            let slot = state.pending.remove(&id);
            self.disconnect_if_idle(&mut state);
            slot
        };
        // Dropping the condition outside the state lock; it may be mid-evaluation.
        if let Some(slot) = slot {
            lock(&slot).take();
        }
    }

    fn disconnect_if_idle(&self, state: &mut WatcherState) {
        if state.observing && state.pending.is_empty() {
            state.observing = false;
            trace!("no pending waits, disconnecting mutation source");
            self.source.disconnect();
        }
    }
}

/// Resolves futures once a condition over the page holds.
///
/// All waits share one observation of the document; each wait can be dropped
/// independently.
#[derive(Clone)]
pub struct DomWatcher {
    inner: Arc<WatcherInner>,
}

impl DomWatcher {
    pub fn new(source: Arc<dyn MutationSource>) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                source,
                state: Mutex::new(WatcherState {
                    next_id: 0,
                    observing: false,
                    pending: BTreeMap::new(),
                }),
            }),
        }
    }

    /// Resolve once `condition` returns true. Checked immediately, then after
    /// every mutation batch until it holds.
    pub fn wait_for<F>(&self, mut condition: F) -> DomWait<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.wait_for_match(move || condition().then_some(()))
    }

    /// Resolve with the first `Some` the query produces.
    pub fn wait_for_match<T, F>(&self, mut query: F) -> DomWait<T>
    where
        T: Send + 'static,
        F: FnMut() -> Option<T> + Send + 'static,
    {
        if let Some(found) = query() {
            return DomWait {
                state: WaitState::Ready(Some(found)),
            };
        }

        let (sender, receiver) = oneshot::channel();
        let mut sender = Some(sender);
        let condition: Condition = Box::new(move || match query() {
            Some(found) => {
                if let Some(sender) = sender.take() {
                    let _ = sender.send(found);
                }
                true
            }
            None => false,
        });

        let id = {
            let mut state = lock(&self.inner.state);
            let id = state.next_id;
            state.next_id += 1;
            state.pending.insert(id, Arc::new(Mutex::new(Some(condition))));
            if !state.observing {
                state.observing = true;
                trace!("observing mutation source");
                self.inner.source.observe();
            }
            id
        };

        DomWait {
            state: WaitState::Pending {
                receiver,
                _subscription: Subscription {
                    watcher: Arc::clone(&self.inner),
                    id,
                },
            },
        }
    }

    /// Re-evaluate pending waits after a batch of page mutations.
    pub fn on_mutations(&self) {
        let snapshot: Vec<(u64, Slot)> = lock(&self.inner.state)
            .pending
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();

        let mut satisfied = Vec::new();
        for (id, slot) in snapshot {
            let mut entry = lock(&slot);
            let Some(check) = entry.as_mut() else {
                continue;
            };
            if check() {
                entry.take();
                satisfied.push(id);
            }
        }

        if satisfied.is_empty() {
            return;
        }

        let mut state = lock(&self.inner.state);
        for id in satisfied {
            state.pending.remove(&id);
        }
        self.inner.disconnect_if_idle(&mut state);
    }

    pub fn pending(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    pub fn is_observing(&self) -> bool {
        lock(&self.inner.state).observing
    }
}

impl fmt::Debug for DomWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("DomWatcher")
            .field("pending", &state.pending.len())
            .field("observing", &state.observing)
            .finish()
    }
}

struct Subscription {
    watcher: Arc<WatcherInner>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.watcher.unsubscribe(self.id);
    }
}

enum WaitState<T> {
    Ready(Option<T>),
    Pending {
        receiver: oneshot::Receiver<T>,
        _subscription: Subscription,
    },
    Done,
}

/// Future returned by [`DomWatcher::wait_for`] and [`DomWatcher::wait_for_match`].
///
/// There is no timeout. Dropping it withdraws the wait.
#[must_use = "a DomWait does nothing unless awaited"]
pub struct DomWait<T> {
    state: WaitState<T>,
}

impl<T> DomWait<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self.state, WaitState::Ready(_))
    }
}

impl<T> Unpin for DomWait<T> {}

impl<T> Future for DomWait<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        match &mut this.state {
            WaitState::Ready(found) => match found.take() {
                Some(found) => {
                    this.state = WaitState::Done;
                    Poll::Ready(found)
                }
                None => Poll::Pending,
            },
            WaitState::Pending { receiver, .. } => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(found)) => {
                    this.state = WaitState::Done;
                    Poll::Ready(found)
                }
                Poll::Ready(Err(_)) => {
                    // The condition was lost (it panicked mid-check); nothing can resolve us now.
                    warn!("dom wait abandoned by its condition");
                    this.state = WaitState::Done;
                    Poll::Pending
                }
                Poll::Pending => Poll::Pending,
            },
            WaitState::Done => Poll::Pending,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
