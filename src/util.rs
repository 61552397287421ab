//! Bridging synchronous git2 and filesystem work onto the async side.

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run `f` on the blocking pool. A panic inside `f` surfaces as
/// `Error::TaskJoin` instead of unwinding into the caller.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}
