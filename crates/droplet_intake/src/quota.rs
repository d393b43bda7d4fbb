//! Enforcement of the package size budget.

use droplet_resource_pool::{PoolError, ResourcePool};

use crate::descriptor::ResourceDescriptor;

/// An error returned by [`check_size`].
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("package size {total} bytes exceeds the limit of {budget} bytes")]
    Exceeded { total: u64, budget: u64 },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Adds the sizes of all pooled resources to the uncompressed size of the upload and fails if the
/// sum is larger than `budget`. Returns the total.
///
/// Only sizes are looked up, nothing is copied. A total exactly equal to the budget is accepted.
pub fn check_size(
    upload_size: u64,
    resources: &[ResourceDescriptor],
    pool: &dyn ResourcePool,
    budget: u64,
) -> Result<u64, QuotaError> {
    let mut total = upload_size;
    for resource in resources {
        total = total.saturating_add(pool.size_of(&resource.sha1)?);
        // No need to look up the rest once the budget is blown.
        if total > budget {
            return Err(QuotaError::Exceeded { total, budget });
        }
    }

    if total > budget {
        return Err(QuotaError::Exceeded { total, budget });
    }
    Ok(total)
}
