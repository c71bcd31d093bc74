//! Integration tests for suspendable computations and tasks.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use trellis_core::{
    context, get_context, reactive, reactive_async, signal, task, watcher, with_contexts, AsyncHandle,
    AsyncReactiveFn, ReactiveError, Signal, Status,
};

/// A chain of `depth` async computations; the bottom one reads `cell` after
/// yielding, each level above awaits the one below after yielding.
fn chain(depth: usize, cell: &Signal<String>) -> AsyncReactiveFn<(), String> {
    let c = cell.clone();
    let mut top = reactive_async(move |_: ()| {
        let c = c.clone();
        async move {
            tokio::task::yield_now().await;
            Ok(c.get())
        }
    });
    for _ in 1..depth {
        let below = top.clone();
        top = reactive_async(move |_: ()| {
            let below = below.clone();
            async move {
                tokio::task::yield_now().await;
                below.get().await
            }
        });
    }
    top
}

/// Each write is visible to the next read of the top of the chain, at any
/// depth.
#[tokio::test]
async fn sequential_writes_reach_every_depth() {
    for depth in 1..=10 {
        let cell = signal(String::from("cat"));
        let top = chain(depth, &cell);
        assert_eq!(top.get().await.unwrap(), "cat", "depth {depth}");

        cell.set("dog".into());
        assert_eq!(top.get().await.unwrap(), "dog", "depth {depth}");

        cell.set("fish".into());
        assert_eq!(top.get().await.unwrap(), "fish", "depth {depth}");
    }
}

/// Reads made after an await are tracked: a write to them re-runs the node.
#[tokio::test]
async fn reads_after_await_are_dependencies() {
    let runs = Rc::new(Cell::new(0));
    let late = signal(1);
    let (r, l) = (runs.clone(), late.clone());
    let scaled = reactive_async(move |factor: i32| {
        let (r, l) = (r.clone(), l.clone());
        async move {
            r.set(r.get() + 1);
            tokio::task::yield_now().await;
            Ok(l.get() * factor)
        }
    });

    assert_eq!(scaled.call(3).await.unwrap(), 3);
    assert_eq!(scaled.call(3).await.unwrap(), 3);
    assert_eq!(runs.get(), 1);

    late.set(5);
    assert_eq!(scaled.call(3).await.unwrap(), 15);
    assert_eq!(runs.get(), 2);
}

/// A new run supersedes the pending one on the same handle. The old run
/// still finishes, but only the new one settles the handle.
#[tokio::test]
async fn rerun_keeps_handle_and_old_run_finishes_inertly() {
    let finished = Rc::new(RefCell::new(Vec::new()));
    let input = signal(1);
    let (f, i) = (finished.clone(), input.clone());
    let slow = reactive_async(move |_: ()| {
        let (f, i) = (f.clone(), i.clone());
        async move {
            let seen = i.get();
            tokio::task::yield_now().await;
            f.borrow_mut().push(seen);
            Ok(seen)
        }
    });

    let first = slow.get();
    input.set(2);
    let second = slow.get();
    assert!(first.ptr_eq(&second));
    assert_eq!(second.await.unwrap(), 2);
    assert_eq!(*finished.borrow(), vec![1, 2]);
    assert_eq!(slow.get().value(), Some(2));
}

/// A watcher alone keeps an async computation moving: its listener fires
/// once the timer does, without anyone awaiting the handle.
#[tokio::test]
async fn watcher_sees_async_result_without_awaiting() {
    let input = signal(4u64);
    let i = input.clone();
    let slow = reactive_async(move |_: ()| {
        let i = i.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(i.get() * 2)
        }
    });

    let s = slow.clone();
    let w = watcher(move || Ok(s.get().value()));
    let calls = Rc::new(Cell::new(0));
    let c = calls.clone();
    let _sub = w.add_listener(move || c.set(c.get() + 1));
    assert_eq!(w.value().unwrap(), None);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.get(), 1);
    assert_eq!(w.value().unwrap(), Some(8));

    input.set(5);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(w.value().unwrap(), Some(10));
    assert!(calls.get() >= 2);
}

/// Handle flags are reactive: a watcher over `is_pending` sees the
/// transition to resolved.
#[tokio::test]
async fn watcher_follows_handle_status() {
    let gate = task(|n: u32| async move {
        tokio::task::yield_now().await;
        Ok(n + 1)
    });

    let g = gate.handle().clone();
    let status = watcher(move || Ok(g.status()));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let (log, s) = (seen.clone(), status.clone());
    let _sub = status.add_listener(move || log.borrow_mut().push(s.value().unwrap()));
    assert_eq!(status.value().unwrap(), Status::Pending);

    let handle = gate.run(41);
    assert_eq!(handle.await.unwrap(), 42);
    assert_eq!(status.value().unwrap(), Status::Resolved);
    assert_eq!(seen.borrow().last(), Some(&Status::Resolved));
}

/// A sync computation reading a handle's value recomputes when it settles.
#[tokio::test]
async fn sync_reader_sees_settlement() {
    let source = AsyncHandle::from_future(async {
        tokio::task::yield_now().await;
        Ok(7)
    });
    let s = source.clone();
    let shown = reactive(move |_: &()| {
        Ok(match s.value() {
            Some(v) => format!("value {v}"),
            None => "loading".to_string(),
        })
    });

    assert!(shown.get().is_ok());
    assert_eq!(source.clone().await.unwrap(), 7);
    assert_eq!(shown.get().unwrap(), "value 7");
}

#[tokio::test]
async fn rejection_propagates_through_awaits() {
    let fails = reactive_async(|_: ()| async {
        tokio::task::yield_now().await;
        Err::<u8, _>(ReactiveError::computation("upstream down"))
    });
    let f = fails.clone();
    let wraps = reactive_async(move |_: ()| {
        let f = f.clone();
        async move { Ok(f.get().await? + 1) }
    });

    let err = wraps.get().await.unwrap_err();
    assert!(err.to_string().contains("upstream down"));
    assert!(wraps.get().is_rejected());
}

/// Ambient context survives suspension.
#[tokio::test]
async fn context_is_restored_after_await() {
    let locale = context("en");
    let key = locale.clone();
    let greet = reactive_async(move |_: ()| {
        let key = key.clone();
        async move {
            tokio::task::yield_now().await;
            Ok(match get_context(&key) {
                "fr" => "bonjour",
                _ => "hello",
            })
        }
    });

    let french = with_contexts([locale.bind("fr")], || greet.get());
    assert_eq!(french.await.unwrap(), "bonjour");
    assert_eq!(greet.get().await.unwrap(), "hello");
}

#[tokio::test]
async fn task_reruns_on_demand_only() {
    let runs = Rc::new(Cell::new(0));
    let r = runs.clone();
    let fetch = task(move |id: u32| {
        let r = r.clone();
        async move {
            r.set(r.get() + 1);
            tokio::task::yield_now().await;
            Ok(format!("user-{id}"))
        }
    });

    assert!(fetch.is_pending());
    assert_eq!(runs.get(), 0);

    assert_eq!(fetch.run(1).await.unwrap(), "user-1");
    assert_eq!(fetch.value().as_deref(), Some("user-1"));
    assert_eq!(fetch.run(2).await.unwrap(), "user-2");
    assert_eq!(runs.get(), 2);
}
