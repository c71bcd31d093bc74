//! Integration tests for scopes: contexts, owned computations and garbage
//! collection of unwatched nodes.

use std::cell::Cell;
use std::rc::Rc;

use trellis_core::{
    clear_global_contexts, context, get_context, reactive, reactive_method, reactive_with, set_global_contexts, signal,
    watcher, with_contexts, ReactiveOptions, Runtime, Scope, ScopeOwner, Signal,
};

fn bump(count: &Cell<u32>) {
    count.set(count.get() + 1);
}

#[test]
fn unwatched_nodes_are_reclaimed() {
    let runs = Rc::new(Cell::new(0));
    let input = signal(2);
    let (r, i) = (runs.clone(), input.clone());
    let squared = reactive(move |_: &()| {
        bump(&r);
        Ok(i.get() * i.get())
    });

    let s = squared.clone();
    let w = watcher(move || s.get());
    let sub = w.add_listener(|| {});
    assert!(squared.is_cached(&()));
    assert_eq!(runs.get(), 1);

    drop(sub);
    assert!(!squared.is_cached(&()));

    assert_eq!(squared.get().unwrap(), 4);
    assert_eq!(runs.get(), 2);
}

#[test]
fn retention_policy_keeps_nodes_warm() {
    let runs = Rc::new(Cell::new(0));
    let input = signal(3);
    let (r, i) = (runs.clone(), input.clone());
    let tripled = reactive_with(
        move |_: &()| {
            bump(&r);
            Ok(i.get() * 3)
        },
        ReactiveOptions::new().should_gc(|_: &()| false),
    );

    let t = tripled.clone();
    let w = watcher(move || t.get());
    let sub = w.add_listener(|| {});
    drop(sub);

    assert!(tripled.is_cached(&()));
    assert_eq!(tripled.get().unwrap(), 9);
    assert_eq!(runs.get(), 1);

    input.set(4);
    assert_eq!(tripled.get().unwrap(), 12);
    assert_eq!(runs.get(), 2);
}

/// A node still read by another watcher survives one watcher going away.
#[test]
fn shared_nodes_survive_partial_unwatch() {
    let input = signal(1);
    let i = input.clone();
    let shared = reactive(move |_: &()| Ok(i.get() + 1));

    let (a, b) = (shared.clone(), shared.clone());
    let wa = watcher(move || a.get());
    let wb = watcher(move || b.get());
    let sub_a = wa.add_listener(|| {});
    let sub_b = wb.add_listener(|| {});

    drop(sub_a);
    assert!(shared.is_cached(&()));
    drop(sub_b);
    assert!(!shared.is_cached(&()));
}

#[test]
fn contexts_resolve_through_scopes() {
    let theme = context(String::from("light"));
    let key = theme.clone();
    let label = reactive(move |_: &()| Ok(format!("theme: {}", get_context(&key))));

    assert_eq!(label.get().unwrap(), "theme: light");

    let dark = with_contexts([theme.bind("dark".into())], || label.get().unwrap());
    assert_eq!(dark, "theme: dark");

    let nested = with_contexts([theme.bind("dark".into())], || {
        with_contexts([theme.bind("contrast".into())], || label.get().unwrap())
    });
    assert_eq!(nested, "theme: contrast");

    assert_eq!(label.get().unwrap(), "theme: light");
}

#[test]
fn global_contexts_sit_below_scopes() {
    let region = context("us");
    assert_eq!(get_context(&region), "us");

    set_global_contexts([region.bind("eu")]);
    assert_eq!(get_context(&region), "eu");
    assert_eq!(with_contexts([region.bind("ap")], || get_context(&region)), "ap");

    clear_global_contexts();
    assert_eq!(get_context(&region), "us");
}

/// Binding a signal makes context reads reactive through the signal.
#[test]
fn bound_signal_is_tracked() {
    let user: Signal<&'static str> = signal("ada");
    let current_user = context(signal("nobody"));
    let scope = Scope::root().child([current_user.bind(user.clone())]);

    let key = current_user.clone();
    let greeting = scope.run(|| reactive(move |_: &()| Ok(format!("hi {}", get_context(&key).get()))));
    let g = greeting.clone();
    let read = move || scope.run(|| g.get().unwrap());

    assert_eq!(read(), "hi ada");
    user.set("grace");
    assert_eq!(read(), "hi grace");
}

struct Store {
    scope: Scope,
}

impl ScopeOwner for Store {
    fn scope(&self) -> &Scope {
        &self.scope
    }
}

#[test]
fn dropping_an_owner_scope_releases_its_nodes() {
    let store = Store { scope: Scope::new() };
    let price = signal(5);
    let p = price.clone();
    let total = reactive_method(&store, move |qty: &u32| Ok(p.get() * qty), ReactiveOptions::new());

    let before = Runtime::node_count();
    assert_eq!(total.call(2).unwrap(), 10);
    assert_eq!(total.call(3).unwrap(), 15);
    assert_eq!(store.scope.node_count(), 2);
    assert_eq!(Runtime::node_count(), before + 2);

    drop(total);
    drop(store);
    assert_eq!(Runtime::node_count(), before);
}
