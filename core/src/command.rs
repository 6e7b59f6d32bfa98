//! The unit of isolated work

use crate::{BoxError, CommandKeys, FallbackContext};
use async_trait::async_trait;

/// A call to a dependency, wrapped with identity and an optional fallback
///
/// A command value is consumed when it is submitted, so each instance runs
/// at most once. The executor applies circuit, pool and timeout policy
/// around [`run`](Command::run).
///
/// Return [`BadRequest`](crate::BadRequest) from `run` to report a caller
/// fault: it surfaces as [`CommandError::BadRequest`](crate::CommandError::BadRequest),
/// does not count against the circuit and skips the fallback.
#[async_trait]
pub trait Command: Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    /// Group, command and pool identity
    fn keys(&self) -> &CommandKeys;

    /// The protected work
    async fn run(&self) -> Result<Self::Output, BoxError>;

    /// Substitute value after a failure, timeout or rejection
    ///
    /// `None` means no fallback is available and the original failure stands.
    async fn fallback(&self, _ctx: &FallbackContext) -> Option<Result<Self::Output, BoxError>> {
        None
    }

    /// Key for request-scoped de-duplication; `None` disables caching
    fn cache_key(&self) -> Option<String> {
        None
    }
}
