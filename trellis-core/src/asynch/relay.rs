//! Relays
//!
//! A relay bridges an externally driven source (a socket, a timer, a
//! subscription) into the graph. Its activation callback runs when the
//! relay's handle gains its first watcher and receives a [`StateHandle`] for
//! pushing values, errors or futures into the handle. The hooks it returns
//! are kept until the last watcher goes away, at which point `deactivate`
//! runs exactly once.
//!
//! An unwatched relay stays pending and runs nothing.
//!
//! When a relay is created inside a computation it belongs to that
//! computation: re-running the computation hands back the same handle and
//! calls the `update` hook instead of tearing the relay down.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::{Rc, Weak};

use futures_util::FutureExt;
use tracing::debug;

use super::handle::{AsyncHandle, Frame, HandleInner};
use crate::config::RelayOptions;
use crate::error::{ReactiveError, Result};
use crate::graph::{Evaluate, NodeKind};
use crate::reactive::runtime;

type Activate<T> = Box<dyn FnMut(StateHandle<T>) -> RelayHooks>;

/// Callbacks returned by a relay's activation.
#[derive(Default)]
pub struct RelayHooks {
    update: Option<Box<dyn FnMut()>>,
    deactivate: Option<Box<dyn FnOnce()>>,
}

impl RelayHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks with only a deactivation callback.
    pub fn on_deactivate(deactivate: impl FnOnce() + 'static) -> Self {
        Self::new().deactivate(deactivate)
    }

    /// Called when the owning computation re-runs while the relay is active.
    pub fn update(mut self, update: impl FnMut() + 'static) -> Self {
        self.update = Some(Box::new(update));
        self
    }

    /// Called once when the relay loses its last watcher.
    pub fn deactivate(mut self, deactivate: impl FnOnce() + 'static) -> Self {
        self.deactivate = Some(Box::new(deactivate));
        self
    }
}

/// Setter handed to a relay's activation.
///
/// Holds the handle weakly: once the handle is dropped every call returns
/// [`ReactiveError::Released`].
pub struct StateHandle<T> {
    handle: Weak<HandleInner<T>>,
}

impl<T: 'static> StateHandle<T> {
    fn upgrade(&self) -> Result<Rc<HandleInner<T>>> {
        self.handle.upgrade().ok_or(ReactiveError::Released)
    }

    /// Resolve the handle with `value`, dropping any pending future.
    pub fn set(&self, value: T) -> Result<()> {
        let inner = self.upgrade()?;
        inner.cancel_run();
        inner.settle(Ok(value));
        Ok(())
    }

    /// Reject the handle with `error`, dropping any pending future.
    pub fn set_error(&self, error: ReactiveError) -> Result<()> {
        let inner = self.upgrade()?;
        inner.cancel_run();
        inner.settle(Err(error));
        Ok(())
    }

    /// Drive the handle from a future. The handle goes pending until it
    /// settles.
    pub fn set_future<F>(&self, future: F) -> Result<()>
    where
        F: Future<Output = Result<T>> + 'static,
    {
        let inner = self.upgrade()?;
        inner.begin_run(future.boxed_local(), None, None, Frame::Restore);
        runtime::flush_if_idle();
        Ok(())
    }

    /// The handle this state feeds, if it is still alive.
    pub fn handle(&self) -> Option<AsyncHandle<T>> {
        self.handle.upgrade().map(AsyncHandle::from_inner)
    }
}

impl<T> Clone for StateHandle<T> {
    fn clone(&self) -> Self {
        Self {
            handle: Weak::clone(&self.handle),
        }
    }
}

/// Runs activation and deactivation on watch transitions of the handle's
/// version node.
struct RelayDriver<T> {
    handle: Weak<HandleInner<T>>,
    /// Taken out while it runs, so a re-run may swap it meanwhile.
    activate: RefCell<Option<Activate<T>>>,
    hooks: RefCell<Option<RelayHooks>>,
    active: Cell<bool>,
}

impl<T: 'static> RelayDriver<T> {
    fn update(&self) {
        if !self.active.get() {
            return;
        }
        let update = self.hooks.borrow_mut().as_mut().and_then(|hooks| hooks.update.take());
        if let Some(mut update) = update {
            update();
            if let Some(hooks) = self.hooks.borrow_mut().as_mut() {
                hooks.update.get_or_insert(update);
            }
        }
    }
}

impl<T: 'static> Evaluate for RelayDriver<T> {
    fn on_watched(&self) {
        if self.active.replace(true) {
            return;
        }
        debug!("relay activated");
        let state = StateHandle {
            handle: Weak::clone(&self.handle),
        };
        let mut running = Activation {
            driver: self,
            activate: self.activate.borrow_mut().take(),
            completed: false,
        };
        let Some(activate) = running.activate.as_mut() else {
            return;
        };
        let hooks = activate(state);
        running.completed = true;
        drop(running);
        let previous = self.hooks.replace(Some(hooks));
        drop(previous);
    }

    fn on_unwatched(&self) {
        if !self.active.replace(false) {
            return;
        }
        debug!("relay deactivated");
        let hooks = self.hooks.borrow_mut().take();
        if let Some(deactivate) = hooks.and_then(|hooks| hooks.deactivate) {
            deactivate();
        }
    }
}

/// An activation in progress. Puts the callback back when it returns, and
/// leaves the relay inactive if it unwinds, so the next watch retries.
struct Activation<'a, T> {
    driver: &'a RelayDriver<T>,
    activate: Option<Activate<T>>,
    completed: bool,
}

impl<T> Drop for Activation<'_, T> {
    fn drop(&mut self) {
        if let Some(activate) = self.activate.take() {
            if let Ok(mut slot) = self.driver.activate.try_borrow_mut() {
                slot.get_or_insert(activate);
            }
        }
        if !self.completed {
            self.driver.active.set(false);
        }
    }
}

impl<T> Drop for RelayDriver<T> {
    fn drop(&mut self) {
        if !self.active.get() {
            return;
        }
        if let Some(deactivate) = self.hooks.get_mut().take().and_then(|hooks| hooks.deactivate) {
            deactivate();
        }
    }
}

/// Create a relay with structural equality on pushed values.
pub fn relay<T, F>(activate: F) -> AsyncHandle<T>
where
    T: PartialEq + 'static,
    F: FnMut(StateHandle<T>) -> RelayHooks + 'static,
{
    relay_with(activate, RelayOptions::new())
}

/// Create a relay with explicit options.
pub fn relay_with<T, F>(activate: F, options: RelayOptions<T>) -> AsyncHandle<T>
where
    T: 'static,
    F: FnMut(StateHandle<T>) -> RelayHooks + 'static,
{
    let mut activate: Option<Activate<T>> = Some(Box::new(activate));
    let (slot, reused) = runtime::claim_owned(|| {
        let handle = AsyncHandle::pending(NodeKind::Relay, options.desc.clone(), options.equals.clone());
        let driver = Rc::new(RelayDriver {
            handle: Rc::downgrade(handle.inner()),
            activate: RefCell::new(activate.take()),
            hooks: RefCell::new(None),
            active: Cell::new(false),
        });
        let owner: Weak<dyn Evaluate> = Rc::downgrade(&driver) as Weak<dyn Evaluate>;
        runtime::set_owner(handle.id(), owner);
        Rc::new(RelaySlot { handle, driver })
    });

    if reused {
        if let Some(activate) = activate {
            let previous = slot.driver.activate.replace(Some(activate));
            drop(previous);
        }
        if slot.driver.active.get() {
            let driver = Rc::clone(&slot.driver);
            runtime::queue_hook(move || driver.update());
        }
    } else {
        slot.handle.attach_driver(slot.driver.clone());
    }
    slot.handle.clone()
}

/// What a computation keeps for each relay it creates.
struct RelaySlot<T> {
    handle: AsyncHandle<T>,
    driver: Rc<RelayDriver<T>>,
}
