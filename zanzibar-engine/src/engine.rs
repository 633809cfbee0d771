use crate::{
    compile::InferredRule,
    error::{Result, ZanzibarError},
    model::Model,
    resolver::Resolver,
    storage::{Cursor, Pagination, Storage},
    tuple::{Tuple, TupleFilter},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Validating front door over a [`Resolver`] and its [`Storage`].
///
/// Tuples are checked against the model before they are written, deleted or checked, so
/// storage never holds relations the model cannot resolve.
pub struct AuthorizationEngine<S: Storage> {
    model: Arc<Model>,
    storage: Arc<S>,
    resolver: Resolver<S>,
}

impl<S: Storage> AuthorizationEngine<S> {
    /// Builds the resolver, preparing a storage plan for every relation of `model`.
    ///
    /// Fails with [`ZanzibarError::ValidationError`] when `max_depth` is zero.
    pub async fn new(model: Arc<Model>, storage: Arc<S>, max_depth: usize) -> Result<Self> {
        let resolver = Resolver::new(model.clone(), storage.clone(), max_depth).await?;
        Ok(Self {
            model,
            storage,
            resolver,
        })
    }

    /// The authorization model tuples are validated against.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// The tuple storage shared with the resolver.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// The resolver behind [`AuthorizationEngine::check`]; it does not validate tuples.
    pub fn resolver(&self) -> &Resolver<S> {
        &self.resolver
    }

    // =============================================================================
    // Authorization
    // =============================================================================

    /// Validates `tuple` against the model, then resolves it.
    ///
    /// `Ok(false)` is a denial; `Err(MaxDepthExceeded)` means the answer is unknown.
    pub async fn check(&self, tuple: &Tuple) -> Result<bool> {
        self.validate(tuple)?;
        let allowed = self.resolver.check(tuple).await?;
        debug!(allowed, "Checked {}", tuple);
        Ok(allowed)
    }

    /// Like [`AuthorizationEngine::check`], but gives up with [`ZanzibarError::Timeout`]
    /// once `timeout` has elapsed. The pending storage query is dropped.
    pub async fn check_with_timeout(&self, tuple: &Tuple, timeout: Duration) -> Result<bool> {
        tokio::time::timeout(timeout, self.check(tuple))
            .await
            .map_err(|_| {
                warn!(?timeout, "Check timed out: {}", tuple);
                ZanzibarError::Timeout(timeout)
            })?
    }

    /// Compiled instructions for `object_type#relation`, `None` if the model lacks it.
    pub fn ruleset_for(&self, object_type: &str, relation: &str) -> Option<&[InferredRule]> {
        self.model.ruleset_for(object_type, relation)
    }

    // =============================================================================
    // Tuple Management
    // =============================================================================

    /// Validates and stores `tuple`. Writing a stored tuple again is a no-op.
    pub async fn write(&self, tuple: &Tuple) -> Result<()> {
        self.validate(tuple)?;
        self.storage.write(tuple).await?;
        info!("Wrote tuple {}", tuple);
        Ok(())
    }

    /// Writes all tuples after validating every one of them; nothing is written if any
    /// tuple is rejected.
    pub async fn write_all(&self, tuples: &[Tuple]) -> Result<()> {
        for tuple in tuples {
            self.validate(tuple)?;
        }
        for tuple in tuples {
            self.storage.write(tuple).await?;
        }
        info!("Wrote {} tuples", tuples.len());
        Ok(())
    }

    /// Validates and removes `tuple`. Deleting an absent tuple is not an error.
    pub async fn delete(&self, tuple: &Tuple) -> Result<()> {
        self.validate(tuple)?;
        self.storage.delete(tuple).await?;
        info!("Deleted tuple {}", tuple);
        Ok(())
    }

    /// Identifier of the stored `tuple`, or [`ZanzibarError::NotFound`].
    pub async fn read(&self, tuple: &Tuple) -> Result<Uuid> {
        self.storage.read(tuple).await
    }

    /// One page of tuples matching `filter`, newest first, with the cursor of the next page.
    pub async fn list(
        &self,
        filter: &TupleFilter,
        pagination: &Pagination,
    ) -> Result<(Vec<Tuple>, Option<Cursor>)> {
        self.storage.list(filter, pagination).await
    }

    fn validate(&self, tuple: &Tuple) -> Result<()> {
        self.model.validate(tuple).map_err(|e| {
            warn!("Rejected tuple: {}", e);
            e
        })
    }
}
