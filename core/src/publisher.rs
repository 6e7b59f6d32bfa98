//! Replaying result cells
//!
//! A [`PublishedResult`] stands for the single eventual outcome of a piece of
//! work. The work is launched at most once, either on [`start`](PublishedResult::start)
//! or on first subscription, and every observer (earlier or later, any number
//! of them) sees the same outcome. The first resolution wins; a resolved cell
//! never changes again.
//!
//! Every handle is one subscriber. [`cancel`](PublishedResult::cancel) detaches
//! only the handle it is called on; the shared work is skipped or aborted once
//! the last interested handle has withdrawn.

use crate::{CommandError, errors::panic_message};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::future::IntoFuture;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

/// Final outcome of a published result
pub type Outcome<T> = Result<T, CommandError>;

type Launch<T> = Box<dyn FnOnce() -> BoxFuture<'static, Outcome<T>> + Send>;
type Continuation<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

enum Slot<T> {
    Pending {
        /// Taken exactly once, by whoever starts the cell
        launch: Option<Launch<T>>,
        continuations: Vec<Continuation<T>>,
        abort: Option<AbortHandle>,
    },
    Resolved(Outcome<T>),
}

struct Cell<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
    handle: Handle,
    /// Handles that have not withdrawn
    interest: AtomicUsize,
}

impl<T: Clone + Send + Sync + 'static> Cell<T> {
    fn start(self: &Arc<Self>) {
        let launch = match &mut *self.slot.lock() {
            Slot::Pending { launch, .. } => launch.take(),
            Slot::Resolved(_) => None,
        };
        let Some(launch) = launch else {
            return;
        };

        // Admission decisions inside the launch run on the caller's thread
        let work = match std::panic::catch_unwind(AssertUnwindSafe(launch)) {
            Ok(work) => work,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(%message, "published result launch panicked");
                self.resolve(Err(CommandError::Panicked { message }));
                return;
            }
        };
        let cell = Arc::clone(self);
        let task = self.handle.spawn(async move {
            let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(%message, "published result work panicked");
                    Err(CommandError::Panicked { message })
                }
            };
            cell.resolve(outcome);
        });

        match &mut *self.slot.lock() {
            Slot::Pending { abort, .. } => *abort = Some(task.abort_handle()),
            // Finished already, or cancelled while launching
            Slot::Resolved(_) => task.abort(),
        }
    }

    /// First resolution wins; returns false if the cell was already resolved
    fn resolve(&self, outcome: Outcome<T>) -> bool {
        let continuations = {
            let mut slot = self.slot.lock();
            let continuations = match &mut *slot {
                Slot::Pending { continuations, .. } => std::mem::take(continuations),
                Slot::Resolved(_) => return false,
            };
            *slot = Slot::Resolved(outcome.clone());
            continuations
        };

        for continuation in continuations {
            continuation(&outcome);
        }
        self.notify.notify_waiters();
        true
    }

    fn peek(&self) -> Option<Outcome<T>> {
        match &*self.slot.lock() {
            Slot::Resolved(outcome) => Some(outcome.clone()),
            Slot::Pending { .. } => None,
        }
    }

    /// Never launch, or abort the running work; resolves `Cancelled`
    fn abandon(&self) -> bool {
        let abort = match &mut *self.slot.lock() {
            Slot::Pending { launch, abort, .. } => {
                launch.take();
                abort.take()
            }
            Slot::Resolved(_) => return false,
        };
        if let Some(abort) = abort {
            abort.abort();
        }

        let cancelled = self.resolve(Err(CommandError::Cancelled));
        if cancelled {
            tracing::debug!("published result cancelled");
        }
        cancelled
    }
}

/// One handle's interest in a cell
struct Subscription<T> {
    cell: Arc<Cell<T>>,
    withdrawn: AtomicBool,
}

impl<T> Subscription<T> {
    fn attach(cell: Arc<Cell<T>>) -> Arc<Self> {
        cell.interest.fetch_add(1, Ordering::AcqRel);
        Arc::new(Self {
            cell,
            withdrawn: AtomicBool::new(false),
        })
    }

    fn is_withdrawn(&self) -> bool {
        self.withdrawn.load(Ordering::SeqCst)
    }
}

impl<T> Drop for Subscription<T> {
    // Dropping is not cancelling: eager work keeps running
    fn drop(&mut self) {
        if !*self.withdrawn.get_mut() {
            self.cell.interest.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Handle to a single, replayed outcome
///
/// Cloning is cheap and every clone observes the same cell. Each clone is a
/// separate subscriber that can [`cancel`](Self::cancel) on its own. Awaiting
/// a `PublishedResult` (it implements [`IntoFuture`]) starts the work if
/// needed and yields a clone of the outcome.
pub struct PublishedResult<T> {
    subscription: Arc<Subscription<T>>,
}

impl<T> Clone for PublishedResult<T> {
    fn clone(&self) -> Self {
        Self {
            subscription: Subscription::attach(Arc::clone(&self.subscription.cell)),
        }
    }
}

impl<T> PublishedResult<T> {
    fn cell(&self) -> &Arc<Cell<T>> {
        &self.subscription.cell
    }
}

impl<T: Clone + Send + Sync + 'static> PublishedResult<T> {
    /// A cell that launches `work` on first start or subscription
    ///
    /// `work` is called synchronously by whoever starts the cell; the future
    /// it returns is spawned on `handle`.
    pub fn lazy<F>(handle: Handle, work: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, Outcome<T>> + Send + 'static,
    {
        Self::from_slot(
            handle,
            Slot::Pending {
                launch: Some(Box::new(work)),
                continuations: Vec::new(),
                abort: None,
            },
        )
    }

    /// A cell that is resolved from the beginning
    pub fn completed(handle: Handle, outcome: Outcome<T>) -> Self {
        Self::from_slot(handle, Slot::Resolved(outcome))
    }

    fn from_slot(handle: Handle, slot: Slot<T>) -> Self {
        let cell = Arc::new(Cell {
            slot: Mutex::new(slot),
            notify: Notify::new(),
            handle,
            interest: AtomicUsize::new(0),
        });
        Self {
            subscription: Subscription::attach(cell),
        }
    }

    /// A handle the cell does not count as interested
    ///
    /// Clones of it are ordinary subscribers. Used for holders such as the
    /// request cache that keep a cell around without waiting on it.
    pub(crate) fn detached(&self) -> Self {
        Self {
            subscription: Arc::new(Subscription {
                cell: Arc::clone(self.cell()),
                withdrawn: AtomicBool::new(true),
            }),
        }
    }

    /// Launch the work if it has not been launched yet
    pub fn start(&self) {
        self.cell().start();
    }

    /// True once the work has been launched (or the cell was born resolved)
    pub fn is_started(&self) -> bool {
        match &*self.cell().slot.lock() {
            Slot::Pending { launch, .. } => launch.is_none(),
            Slot::Resolved(_) => true,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(&*self.cell().slot.lock(), Slot::Resolved(_))
    }

    /// True once this handle has withdrawn through [`cancel`](Self::cancel)
    pub fn is_cancelled(&self) -> bool {
        self.subscription.is_withdrawn()
    }

    /// The outcome, if already resolved; never starts the work
    pub fn try_get(&self) -> Option<Outcome<T>> {
        self.cell().peek()
    }

    /// Start if needed and wait for the outcome
    ///
    /// On a cancelled handle this resolves `Cancelled` unless the cell already
    /// holds an outcome.
    pub fn observe(&self) -> BoxFuture<'static, Outcome<T>> {
        let subscription = Arc::clone(&self.subscription);
        Box::pin(async move {
            let cell = &subscription.cell;
            if !subscription.is_withdrawn() {
                cell.start();
            }
            loop {
                let notified = cell.notify.notified();
                tokio::pin!(notified);
                // Register before checking so a resolution in between is not missed
                notified.as_mut().enable();
                if let Some(outcome) = cell.peek() {
                    return outcome;
                }
                if subscription.is_withdrawn() {
                    return Err(CommandError::Cancelled);
                }
                notified.await;
            }
        })
    }

    /// Run `continuation` with the outcome, starting the work if needed
    ///
    /// If the cell is already resolved the continuation runs immediately on
    /// the calling thread; otherwise it runs on whichever thread resolves it.
    pub fn subscribe<F>(&self, continuation: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let resolved = match &mut *self.cell().slot.lock() {
            Slot::Pending { continuations, .. } => {
                continuations.push(Box::new(continuation));
                None
            }
            Slot::Resolved(outcome) => Some((outcome.clone(), continuation)),
        };

        match resolved {
            Some((outcome, continuation)) => continuation(&outcome),
            None => self.cell().start(),
        }
    }

    /// Withdraw this handle's interest
    ///
    /// Observers waiting through this handle resolve with
    /// [`CommandError::Cancelled`]; other handles keep waiting. When no
    /// interested handle remains, the work is never launched (or the running
    /// task is aborted) and the cell resolves `Cancelled` unless it already
    /// resolved. Returns whether this call cancelled the shared work.
    pub fn cancel(&self) -> bool {
        if self.subscription.withdrawn.swap(true, Ordering::SeqCst) {
            return false;
        }
        let cell = self.cell();
        cell.notify.notify_waiters();

        if cell.interest.fetch_sub(1, Ordering::AcqRel) > 1 {
            tracing::trace!("subscriber withdrew, others still waiting");
            return false;
        }
        cell.abandon()
    }

    /// Runtime this cell's work is spawned on
    pub fn handle(&self) -> &Handle {
        &self.cell().handle
    }

    /// True if both handles observe the same cell
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(self.cell(), other.cell())
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for PublishedResult<T> {
    type Output = Outcome<T>;
    type IntoFuture = BoxFuture<'static, Outcome<T>>;

    fn into_future(self) -> Self::IntoFuture {
        self.observe()
    }
}

impl<T> fmt::Debug for PublishedResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.cell().slot.lock() {
            Slot::Pending { launch: Some(_), .. } => "deferred",
            Slot::Pending { launch: None, .. } => "running",
            Slot::Resolved(Ok(_)) => "succeeded",
            Slot::Resolved(Err(_)) => "failed",
        };
        f.debug_struct("PublishedResult")
            .field("state", &state)
            .finish()
    }
}
