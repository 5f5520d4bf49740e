//! NAT classification and the direct-path eligibility rule

use sshgate_proto::{NatDescriptor, ReachabilityClass};
use std::net::{IpAddr, SocketAddr};

/// Produces a NAT descriptor for a connected peer
pub trait AddressClassifier: Send + Sync {
    fn classify(&self, peer_addr: SocketAddr) -> NatDescriptor;
}

/// Guesses a reachability class from the peer address alone
///
/// Loopback peers share the relay's host and get `None`. Private-range peers
/// are assumed to sit behind a cone NAT. Everything else is `Unknown`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeerAddressClassifier;

impl PeerAddressClassifier {
    pub fn new() -> Self {
        Self
    }

    fn reachability(ip: IpAddr) -> ReachabilityClass {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };

        if ip.is_loopback() {
            return ReachabilityClass::None;
        }

        match ip {
            IpAddr::V4(v4) if v4.is_private() => ReachabilityClass::Cone,
            // fc00::/7 unique local
            IpAddr::V6(v6) if (v6.segments()[0] & 0xfe00) == 0xfc00 => ReachabilityClass::Cone,
            _ => ReachabilityClass::Unknown,
        }
    }
}

impl AddressClassifier for PeerAddressClassifier {
    fn classify(&self, peer_addr: SocketAddr) -> NatDescriptor {
        let ip = peer_addr.ip();
        NatDescriptor::new(Self::reachability(ip), Some(ip.to_string()))
    }
}

/// Whether a direct path between the two peers is worth attempting
///
/// Two symmetric NATs cannot be punched through. A peer that is not behind a
/// NAT at all gains nothing over the relay.
pub fn can_attempt_direct(client: &NatDescriptor, agent: &NatDescriptor) -> bool {
    use ReachabilityClass::*;

    match (client.reachability_class, agent.reachability_class) {
        (Symmetric, Symmetric) => false,
        (None, _) | (_, None) => false,
        _ => true,
    }
}
