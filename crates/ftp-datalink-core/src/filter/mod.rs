//! Contains the [`SessionFilter`] trait: a predicate deciding whether a client address may open a
//! session.

use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::Arc;

/// Decides whether a client connecting from a given address is allowed to open a session.
///
/// Closures of type `Fn(IpAddr) -> bool` can be wrapped in [`FnFilter`] to supply a quick filter
/// without declaring a type.
pub trait SessionFilter: Send + Sync + Debug {
    /// Returns `true` if the client at `remote` may continue.
    fn accept(&self, remote: IpAddr) -> bool;
}

/// Wraps a closure so it can be used as a [`SessionFilter`].
pub struct FnFilter<F>(pub F);

impl<F> Debug for FnFilter<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnFilter")
    }
}

impl<F> SessionFilter for FnFilter<F>
where
    F: Fn(IpAddr) -> bool + Send + Sync,
{
    fn accept(&self, remote: IpAddr) -> bool {
        (self.0)(remote)
    }
}

/// A filter that lets every client through.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl SessionFilter for AcceptAll {
    fn accept(&self, _remote: IpAddr) -> bool {
        true
    }
}

impl<T: SessionFilter + ?Sized> SessionFilter for Arc<T> {
    fn accept(&self, remote: IpAddr) -> bool {
        (**self).accept(remote)
    }
}
