use std::net::SocketAddr;

/// Session identifiers are random 64-bit values, independently chosen by
/// each side. Zero is reserved for "not yet assigned".
pub fn generate_guid() -> u64 {
    loop {
        let guid = rand::random::<u64>();
        if guid != 0 {
            return guid;
        }
    }
}

/// Parse textual `ip:port`. Bare hostnames do not parse; callers route
/// those through a resolver instead.
pub fn parse_address(s: &str) -> Option<SocketAddr> {
    s.parse().ok()
}

/// Resolver results may carry port 0; rewrite those with the configured
/// server port.
pub fn apply_default_port(mut addr: SocketAddr, default_port: u16) -> SocketAddr {
    if addr.port() == 0 {
        addr.set_port(default_port);
    }
    addr
}

#[test]
fn address_parsing_distinguishes_hostnames() {
    assert!(parse_address("10.0.0.1:9000").is_some());
    assert!(parse_address("[::1]:9000").is_some());
    assert!(parse_address("game.example.com:9000").is_none());
    assert!(parse_address("game.example.com").is_none());
}

#[test]
fn zero_port_is_rewritten() {
    let addr = parse_address("10.0.0.1:0").unwrap();
    assert_eq!(apply_default_port(addr, 9000).port(), 9000);

    let addr = parse_address("10.0.0.1:5000").unwrap();
    assert_eq!(apply_default_port(addr, 9000).port(), 5000);
}

#[test]
fn guids_are_nonzero_and_distinct() {
    let a = generate_guid();
    let b = generate_guid();
    assert_ne!(a, 0);
    assert_ne!(b, 0);
    assert_ne!(a, b);
}
