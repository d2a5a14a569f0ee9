use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// The shorthand `":PORT"` means "bind on all interfaces"; Tokio bind APIs do not accept it,
/// so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Joins a host and port into something `TcpListener::bind` accepts.
///
/// IPv6 literals are bracketed; an empty host binds all interfaces.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.is_empty() {
        return format!("0.0.0.0:{port}");
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.contains(':') {
        format!("[{bare}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":9090").as_ref(), "0.0.0.0:9090");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
        assert_eq!(
            normalize_bind_addr("127.0.0.1:9090").as_ref(),
            "127.0.0.1:9090"
        );
    }

    #[test]
    fn join_host_port_forms() {
        assert_eq!(join_host_port("localhost", 8080), "localhost:8080");
        assert_eq!(join_host_port("", 8080), "0.0.0.0:8080");
        assert_eq!(join_host_port("::1", 3001), "[::1]:3001");
        assert_eq!(join_host_port("[::]", 3001), "[::]:3001");
        assert_eq!(join_host_port(" 10.0.0.1 ", 0), "10.0.0.1:0");
    }
}
