use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Configs accept the shorthand `":PORT"` and `"*:PORT"` for "all interfaces".
/// `SocketAddr` parsing and Tokio bind APIs accept neither, so both become
/// `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if let Some(port) = addr.strip_prefix("*:") {
        return Cow::Owned(format!("0.0.0.0:{port}"));
    }
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_bind_addr;

    #[test]
    fn port_only_binds_all_interfaces() {
        assert_eq!(normalize_bind_addr(":10000").as_ref(), "0.0.0.0:10000");
        assert_eq!(normalize_bind_addr(" *:7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn explicit_addresses_pass_through() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:10000").as_ref(),
            "127.0.0.1:10000"
        );
        assert_eq!(normalize_bind_addr("[::]:10000").as_ref(), "[::]:10000");
    }
}
