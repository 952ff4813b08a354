use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::descriptor::HookError;

/// Error a [`Removable`] reports when it cannot undo itself.
pub type RemoveError = HookError;

/// Anything a module created that has to be undone when the module goes away:
/// injected elements, listeners, stylesheets, observers.
///
/// `remove` should tolerate being called more than once; the ledger itself
/// only ever calls it once.
pub trait Removable: Send + Sync {
    fn remove(&self) -> Result<(), RemoveError>;
}

impl<R: Removable + ?Sized> Removable for Arc<R> {
    fn remove(&self) -> Result<(), RemoveError> {
        (**self).remove()
    }
}

impl<R: Removable + ?Sized> Removable for Box<R> {
    fn remove(&self) -> Result<(), RemoveError> {
        (**self).remove()
    }
}

type DisposeFn = Box<dyn FnOnce() -> Result<(), RemoveError> + Send>;

/// A closure run once on removal.
pub struct Disposer {
    action: Mutex<Option<DisposeFn>>,
}

impl Disposer {
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::fallible(move || {
            action();
            Ok(())
        })
    }

    pub fn fallible<F>(action: F) -> Self
    where
        F: FnOnce() -> Result<(), RemoveError> + Send + 'static,
    {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }
}

impl Removable for Disposer {
    fn remove(&self) -> Result<(), RemoveError> {
        let action = lock(&self.action).take();
        match action {
            Some(action) => action(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("pending", &lock(&self.action).is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger for module {module_id} is already disposed")]
    Disposed { module_id: String },
}

/// Every failure from one disposal pass; the first is the error source.
#[derive(Debug, thiserror::Error)]
#[error("{failed} of {attempted} removables failed for module {module_id}: {first}")]
pub struct DisposalError {
    pub module_id: String,
    pub attempted: usize,
    pub failed: usize,
    #[source]
    first: RemoveError,
    rest: Vec<RemoveError>,
}

impl DisposalError {
    pub fn first(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.first
    }

    pub fn failures(&self) -> impl Iterator<Item = &(dyn std::error::Error + Send + Sync + 'static)> {
        std::iter::once(self.first()).chain(self.rest.iter().map(|error| &**error))
    }
}

struct LedgerInner {
    module_id: String,
    live: AtomicBool,
    // `None` once disposed.
    removables: Mutex<Option<Vec<Arc<dyn Removable>>>>,
}

impl LedgerInner {
    fn add(&self, removable: Arc<dyn Removable>) -> Result<(), LedgerError> {
        match lock(&self.removables).as_mut() {
            Some(removables) => {
                removables.push(removable);
                Ok(())
            }
            None => Err(LedgerError::Disposed {
                module_id: self.module_id.clone(),
            }),
        }
    }

    fn is_active(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn dispose(&self) -> Result<(), DisposalError> {
        self.live.store(false, Ordering::Release);
        // Take the list before running anything so removables may touch the ledger.
        let Some(removables) = lock(&self.removables).take() else {
            return Ok(());
        };

        let attempted = removables.len();
        let mut failures: Vec<RemoveError> = Vec::new();
        for removable in removables {
            let outcome = catch_unwind(AssertUnwindSafe(|| removable.remove()))
                .unwrap_or_else(|panic| Err(panic_message(panic.as_ref()).into()));
            if let Err(error) = outcome {
                warn!(module_id = %self.module_id, %error, "removable failed to dispose");
                failures.push(error);
            }
        }

        debug!(
            module_id = %self.module_id,
            attempted,
            failed = failures.len(),
            "disposed ledger"
        );

        let failed = failures.len();
        let mut failures = failures.into_iter();
        match failures.next() {
            None => Ok(()),
            Some(first) => Err(DisposalError {
                module_id: self.module_id.clone(),
                attempted,
                failed,
                first,
                rest: failures.collect(),
            }),
        }
    }
}

/// Collects the [`Removable`]s one activation of a module produced.
///
/// The orchestrator owns the ledger and is the only party that can dispose
/// it. Modules keep a [`LedgerHandle`] when they need to register resources
/// from asynchronous continuations.
pub struct Ledger {
    inner: Arc<LedgerInner>,
}

impl Ledger {
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                module_id: module_id.into(),
                live: AtomicBool::new(true),
                removables: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    pub fn module_id(&self) -> &str {
        &self.inner.module_id
    }

    /// Register `removable` and hand it back for inline use.
    pub fn add<R: Removable + 'static>(&self, removable: R) -> Result<Arc<R>, LedgerError> {
        self.add_shared(Arc::new(removable))
    }

    pub fn add_shared<R: Removable + 'static>(&self, removable: Arc<R>) -> Result<Arc<R>, LedgerError> {
        self.inner.add(removable.clone())?;
        Ok(removable)
    }

    pub fn defer<F>(&self, action: F) -> Result<(), LedgerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.add(Arc::new(Disposer::new(action)))
    }

    pub fn handle(&self) -> LedgerHandle {
        LedgerHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.removables).as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything registered, attempting each removable even when
    /// earlier ones fail.
    pub fn dispose(self) -> Result<(), DisposalError> {
        self.inner.dispose()
    }
}

/// A nested ledger disposes as a unit.
impl Removable for Ledger {
    fn remove(&self) -> Result<(), RemoveError> {
        self.inner.dispose().map_err(|error| Box::new(error) as RemoveError)
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        if self.inner.is_active() {
            warn!(module_id = %self.inner.module_id, "ledger dropped without dispose");
            let _ = self.inner.dispose();
        }
    }
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("module_id", &self.inner.module_id)
            .field("active", &self.is_active())
            .field("len", &self.len())
            .finish()
    }
}

/// Non-owning access to a ledger for code that outlives `activate`.
///
/// Deactivation does not cancel work a module started. Continuations check
/// [`LedgerHandle::is_active`] before touching the page, and anything they
/// add after disposal is rejected with [`LedgerError::Disposed`].
#[derive(Clone)]
pub struct LedgerHandle {
    inner: Arc<LedgerInner>,
}

impl LedgerHandle {
    pub fn module_id(&self) -> &str {
        &self.inner.module_id
    }

    pub fn add<R: Removable + 'static>(&self, removable: R) -> Result<Arc<R>, LedgerError> {
        let removable = Arc::new(removable);
        self.inner.add(removable.clone())?;
        Ok(removable)
    }

    pub fn defer<F>(&self, action: F) -> Result<(), LedgerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.add(Arc::new(Disposer::new(action)))
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }
}

impl fmt::Debug for LedgerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerHandle")
            .field("module_id", &self.inner.module_id)
            .field("active", &self.is_active())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
