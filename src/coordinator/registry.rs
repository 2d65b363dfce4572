//! Ordered registry of resources owned by a facade
//!
//! The store handle and the leader server are attached here as they are
//! acquired. Teardown closes them in reverse attachment order through one
//! routine, whether the facade is closing normally or failing.

use crate::common::{Error, Result};
use crate::engine::Store;
use futures::future::BoxFuture;

/// Something that must be released when its owner goes away
pub trait Resource: Send {
    fn name(&self) -> &'static str;

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

impl Resource for Store {
    fn name(&self) -> &'static str {
        "store"
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        let store = *self;
        Box::pin(async move { store.close().await })
    }
}

#[derive(Default)]
pub struct ResourceRegistry {
    resources: Vec<Box<dyn Resource>>,
    torn_down: bool,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `resource`.
    ///
    /// Once teardown has started nothing new is accepted; the resource is
    /// handed back so the caller can release it.
    pub fn attach(
        &mut self,
        resource: Box<dyn Resource>,
    ) -> std::result::Result<(), Box<dyn Resource>> {
        if self.torn_down {
            return Err(resource);
        }
        tracing::debug!("Attached {}", resource.name());
        self.resources.push(resource);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Seal the registry and hand out everything in teardown order.
    pub fn drain(&mut self) -> Vec<Box<dyn Resource>> {
        self.torn_down = true;
        let mut resources = std::mem::take(&mut self.resources);
        resources.reverse();
        resources
    }
}

/// Close every resource even if some fail; report the first failure.
pub async fn close_all(resources: Vec<Box<dyn Resource>>) -> Result<()> {
    let mut first_error: Option<Error> = None;
    for resource in resources {
        let name = resource.name();
        if let Err(e) = resource.close().await {
            tracing::warn!("Failed to close {}: {}", name, e);
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Close a single resource that could not be attached.
pub async fn release(resource: Box<dyn Resource>) {
    let name = resource.name();
    if let Err(e) = resource.close().await {
        tracing::warn!("Failed to release {}: {}", name, e);
    }
}
