use std::{borrow::Cow, net::SocketAddr};

use anyhow::Context;

/// Normalize a bind/listen address.
///
/// The shorthand `":PORT"` means "all interfaces"; `SocketAddr` parsing does not accept it, so it
/// becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

pub fn parse_bind_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    normalize_bind_addr(addr)
        .parse()
        .with_context(|| format!("invalid bind address {addr:?}"))
}
