//! Composition of published results
//!
//! Every combinator returns a new lazy [`PublishedResult`] that runs on the
//! upstream cell's runtime. Because the composed value is itself a replaying
//! cell, a continuation runs once no matter how many times the composed
//! result is observed. Failures short-circuit: a failed upstream skips the
//! continuation and resolves the composed cell with the same error.

use crate::publisher::{Outcome, PublishedResult};
use futures::future::{try_join, try_join_all};
use tokio::runtime::Handle;

impl<T: Clone + Send + Sync + 'static> PublishedResult<T> {
    /// Transform the value once it is available
    pub fn map<U, F>(&self, f: F) -> PublishedResult<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let upstream = self.clone();
        PublishedResult::lazy(self.handle().clone(), move || {
            Box::pin(async move { upstream.observe().await.map(f) })
        })
    }

    /// Like [`map`](Self::map), for a fallible transformation
    pub fn and_then<U, F>(&self, f: F) -> PublishedResult<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Outcome<U> + Send + 'static,
    {
        let upstream = self.clone();
        PublishedResult::lazy(self.handle().clone(), move || {
            Box::pin(async move { upstream.observe().await.and_then(f) })
        })
    }

    /// Chain a dependent result, typically a command built from the value
    pub fn flat_map<U, F>(&self, f: F) -> PublishedResult<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> PublishedResult<U> + Send + 'static,
    {
        let upstream = self.clone();
        PublishedResult::lazy(self.handle().clone(), move || {
            Box::pin(async move {
                let value = upstream.observe().await?;
                f(value).observe().await
            })
        })
    }

    /// Combine with another result; both run concurrently and the first
    /// failure wins
    pub fn zip_with<U, R, F>(&self, other: &PublishedResult<U>, f: F) -> PublishedResult<R>
    where
        U: Clone + Send + Sync + 'static,
        R: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) -> R + Send + 'static,
    {
        let left = self.clone();
        let right = other.clone();
        PublishedResult::lazy(self.handle().clone(), move || {
            Box::pin(async move {
                let (a, b) = try_join(left.observe(), right.observe()).await?;
                Ok(f(a, b))
            })
        })
    }

    /// Pair with another result
    pub fn zip<U>(&self, other: &PublishedResult<U>) -> PublishedResult<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        self.zip_with(other, |a, b| (a, b))
    }
}

/// Collect many results of one type, in input order
///
/// All inputs run concurrently and the first failure wins. An empty input
/// resolves to an empty vector.
pub fn zip_all<T, I>(handle: &Handle, results: I) -> PublishedResult<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = PublishedResult<T>>,
{
    let results: Vec<_> = results.into_iter().collect();
    PublishedResult::lazy(handle.clone(), move || {
        Box::pin(async move {
            try_join_all(results.iter().map(PublishedResult::<T>::observe)).await
        })
    })
}
