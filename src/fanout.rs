//! Structured fan-out/fan-in over independent database work.
//!
//! Every task runs on its own scoped thread and always runs to completion:
//! a failing task never cancels its siblings. The join point returns once
//! all tasks have finished, with results in submission order; when several
//! tasks fail, the error of the earliest submitted one is returned.

use crate::error::Result;
use std::panic;
use std::thread;

/// A unit of work borrowed from the caller's scope.
pub type Task<'a, T> = Box<dyn FnOnce() -> Result<T> + Send + 'a>;

/// Box a closure as a [`Task`].
pub fn task<'a, T, F>(f: F) -> Task<'a, T>
where
    F: FnOnce() -> Result<T> + Send + 'a,
{
    Box::new(f)
}

/// Run all tasks concurrently and wait for every one of them.
pub fn join_all<'a, T: Send>(tasks: Vec<Task<'a, T>>) -> Result<Vec<T>> {
    let results: Vec<Result<T>> = thread::scope(|s| {
        let handles: Vec<_> = tasks.into_iter().map(|t| s.spawn(t)).collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|p| panic::resume_unwind(p)))
            .collect()
    });
    results.into_iter().collect()
}

/// Run two tasks of different result types concurrently and wait for both.
pub fn join2<A, B, FA, FB>(a: FA, b: FB) -> Result<(A, B)>
where
    A: Send,
    B: Send,
    FA: FnOnce() -> Result<A> + Send,
    FB: FnOnce() -> Result<B> + Send,
{
    let (ra, rb) = thread::scope(|s| {
        let hb = s.spawn(b);
        let ra = a();
        let rb = hb.join().unwrap_or_else(|p| panic::resume_unwind(p));
        (ra, rb)
    });
    Ok((ra?, rb?))
}
