// Parent-side connections: the eager request/response multiplexer bound
// to one worker process, and the lazy wrapper that opens (and re-opens)
// eager connections on demand.

mod eager;
mod lazy;

use std::sync::Arc;

use crate::error::SidecarError;

pub use eager::Connection;
pub use lazy::LazyConnection;

/// Lifecycle signal shared by both connection flavours.
///
/// `Closed` fires exactly once per lifetime; the carried error is present
/// only for fatal protocol failures, which are observable strictly
/// together with the close.
#[derive(Debug, Clone, Default)]
pub(crate) enum Lifecycle {
    #[default]
    Open,
    Closed(Option<Arc<SidecarError>>),
}

impl Lifecycle {
    pub(crate) fn closed_error(&self) -> Option<Option<Arc<SidecarError>>> {
        match self {
            Lifecycle::Open => None,
            Lifecycle::Closed(error) => Some(error.clone()),
        }
    }
}
