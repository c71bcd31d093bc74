//! Manually triggered async computations.
//!
//! A task owns one long-lived handle. Each [`Task::run`] starts a fresh run
//! of the body on that handle, superseding any run still in flight. A
//! superseded run keeps going to completion but its result is discarded.
//! Runs are not memoized by argument.

use std::future::Future;
use std::ops::Deref;
use std::rc::Rc;

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use tracing::trace;

use super::handle::{AsyncHandle, Frame};
use crate::config::TaskOptions;
use crate::error::Result;
use crate::graph::NodeKind;
use crate::reactive::runtime;
use crate::reactive::Equals;
use crate::scope::Scope;

type TaskBody<A, T> = Rc<dyn Fn(A) -> LocalBoxFuture<'static, Result<T>>>;

/// An async computation started on demand.
pub struct Task<A, T> {
    handle: AsyncHandle<T>,
    body: TaskBody<A, T>,
    scope: Scope,
}

/// Create a task from an async body.
pub fn task<A, T, F, Fut>(body: F) -> Task<A, T>
where
    A: 'static,
    T: 'static,
    F: Fn(A) -> Fut + 'static,
    Fut: Future<Output = Result<T>> + 'static,
{
    task_with(body, TaskOptions::new())
}

pub fn task_with<A, T, F, Fut>(body: F, options: TaskOptions) -> Task<A, T>
where
    A: 'static,
    T: 'static,
    F: Fn(A) -> Fut + 'static,
    Fut: Future<Output = Result<T>> + 'static,
{
    Task {
        handle: AsyncHandle::pending(NodeKind::Source, options.desc, Equals::never()),
        body: Rc::new(move |args| body(args).boxed_local()),
        scope: Scope::current(),
    }
}

impl<A: 'static, T: 'static> Task<A, T> {
    /// Start a new run. Reads inside the body are untracked; the run sees
    /// the scope the task was created in.
    pub fn run(&self, args: A) -> AsyncHandle<T> {
        trace!(handle = ?self.handle.id(), "task run");
        let future = (self.body)(args);
        self.handle
            .inner()
            .begin_run(future, None, Some(self.scope.clone()), Frame::Restore);
        runtime::flush_if_idle();
        self.handle.clone()
    }

    pub fn handle(&self) -> &AsyncHandle<T> {
        &self.handle
    }
}

impl<A, T> Deref for Task<A, T> {
    type Target = AsyncHandle<T>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<A, T> Clone for Task<A, T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            body: Rc::clone(&self.body),
            scope: self.scope.clone(),
        }
    }
}
