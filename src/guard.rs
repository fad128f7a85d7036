//! Scoped resource ownership with exactly-once release.
//!
//! A [`ResourceGuard`] wraps anything implementing [`Release`]. The release
//! runs once: either through an explicit [`ResourceGuard::close`] or when the
//! guard is dropped. Drop covers early returns, `?` propagation, panics and
//! task cancellation (a cancelled tokio task drops its future, and with it
//! every guard the future owns).
//!
//! Guards declared in one scope release in reverse declaration order. For a
//! dynamic number of resources, [`GuardStack`] keeps the same ordering.

use crate::error::ReleaseError;
use std::ops::{Deref, DerefMut};
use tracing::warn;

/// A resource with a fallible cleanup step.
pub trait Release {
    /// Label used in logs and in [`ReleaseError`].
    fn label(&self) -> String;

    fn release(&mut self) -> Result<(), ReleaseError>;
}

/// Acquire a resource from `factory` and put it under a guard.
///
/// If the factory fails nothing was acquired, so nothing is released.
pub fn acquire<R, E, F>(factory: F) -> Result<ResourceGuard<R>, E>
where
    R: Release,
    F: FnOnce() -> Result<R, E>,
{
    factory().map(ResourceGuard::new)
}

/// Owns a resource and releases it exactly once.
pub struct ResourceGuard<R: Release> {
    resource: Option<R>,
}

impl<R: Release> ResourceGuard<R> {
    pub fn new(resource: R) -> Self {
        Self {
            resource: Some(resource),
        }
    }

    /// Release now and report the result.
    pub fn close(mut self) -> Result<(), ReleaseError> {
        self.release_once().unwrap_or(Ok(()))
    }

    fn release_once(&mut self) -> Option<Result<(), ReleaseError>> {
        let mut resource = self.resource.take()?;
        Some(resource.release())
    }
}

impl<R: Release> Deref for ResourceGuard<R> {
    type Target = R;

    fn deref(&self) -> &R {
        // `resource` is only taken by `close`, which consumes the guard.
        match &self.resource {
            Some(r) => r,
            None => unreachable!("guard used after release"),
        }
    }
}

impl<R: Release> DerefMut for ResourceGuard<R> {
    fn deref_mut(&mut self) -> &mut R {
        match &mut self.resource {
            Some(r) => r,
            None => unreachable!("guard used after release"),
        }
    }
}

impl<R: Release> Drop for ResourceGuard<R> {
    fn drop(&mut self) {
        if let Some(Err(e)) = self.release_once() {
            warn!(error = %e, "Release failed");
        }
    }
}

/// Releases a dynamic set of resources in reverse acquisition order.
pub struct GuardStack {
    guards: Vec<Box<dyn Release + Send>>,
}

impl GuardStack {
    pub fn new() -> Self {
        Self { guards: Vec::new() }
    }

    pub fn push<R: Release + Send + 'static>(&mut self, resource: R) {
        self.guards.push(Box::new(resource));
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Release everything now, returning every failure.
    ///
    /// A failure does not stop the remaining resources from releasing.
    pub fn close(mut self) -> Vec<ReleaseError> {
        self.release_all()
    }

    fn release_all(&mut self) -> Vec<ReleaseError> {
        let mut errors = Vec::new();
        while let Some(mut resource) = self.guards.pop() {
            if let Err(e) = resource.release() {
                errors.push(e);
            }
        }
        errors
    }
}

impl Default for GuardStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GuardStack {
    fn drop(&mut self) {
        for e in self.release_all() {
            warn!(error = %e, "Release failed");
        }
    }
}
