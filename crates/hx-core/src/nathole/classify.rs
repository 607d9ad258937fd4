//! Classification of observed NAT mappings

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::NatError;

/// Largest port spread still considered a predictable allocation
const REGULAR_PORTS_CHANGE_MAX: u16 = 5;

/// Coarse NAT class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatType {
    /// The public mapping is stable across destinations
    Easy,
    /// The public mapping varies by destination
    Hard,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatType::Easy => write!(f, "EasyNAT"),
            NatType::Hard => write!(f, "HardNAT"),
        }
    }
}

/// Which parts of the public mapping changed between observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatBehavior {
    NoChange,
    IpChanged,
    PortChanged,
    BothChanged,
}

impl fmt::Display for NatBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatBehavior::NoChange => write!(f, "BehaviorNoChange"),
            NatBehavior::IpChanged => write!(f, "BehaviorIPChanged"),
            NatBehavior::PortChanged => write!(f, "BehaviorPortChanged"),
            NatBehavior::BothChanged => write!(f, "BehaviorBothChanged"),
        }
    }
}

/// Result of classifying one set of observations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatFeature {
    pub nat_type: NatType,
    pub behavior: NatBehavior,
    /// Spread between highest and lowest observed port; only set for
    /// [`NatBehavior::PortChanged`]
    pub ports_difference: u16,
    /// The port spread is small enough to predict
    pub regular_ports_change: bool,
    /// One of the observed addresses is a local interface address
    pub public_network: bool,
}

/// Classify the NAT from its observed public addresses.
///
/// `addresses` are `ip:port` strings as reported by STUN; the first one is
/// the baseline the rest are compared against. `local_ips` are this host's
/// interface addresses.
pub fn classify_nat_feature(
    addresses: &[String],
    local_ips: &[String],
) -> Result<NatFeature, NatError> {
    if addresses.len() < 2 {
        return Err(NatError::InsufficientSamples(addresses.len()));
    }

    let mut ip_changed = false;
    let mut port_changed = false;
    let mut public_network = false;
    let mut base: Option<SocketAddr> = None;
    let mut port_min = u16::MAX;
    let mut port_max = u16::MIN;

    for raw in addresses {
        let addr: SocketAddr = raw
            .parse()
            .map_err(|_| NatError::InvalidAddress(raw.clone()))?;

        if local_ips.iter().any(|ip| ip == &addr.ip().to_string()) {
            public_network = true;
        }

        port_min = port_min.min(addr.port());
        port_max = port_max.max(addr.port());

        match base {
            None => base = Some(addr),
            Some(b) => {
                ip_changed |= b.ip() != addr.ip();
                port_changed |= b.port() != addr.port();
            }
        }
    }

    let (nat_type, behavior) = match (ip_changed, port_changed) {
        (true, true) => (NatType::Hard, NatBehavior::BothChanged),
        (true, false) => (NatType::Hard, NatBehavior::IpChanged),
        (false, true) => (NatType::Hard, NatBehavior::PortChanged),
        (false, false) => (NatType::Easy, NatBehavior::NoChange),
    };

    let mut feature = NatFeature {
        nat_type,
        behavior,
        ports_difference: 0,
        regular_ports_change: false,
        public_network,
    };

    if behavior == NatBehavior::PortChanged {
        feature.ports_difference = port_max - port_min;
        feature.regular_ports_change =
            (1..=REGULAR_PORTS_CHANGE_MAX).contains(&feature.ports_difference);
    }

    Ok(feature)
}

/// Tally of features from several peers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureCount {
    pub easy: usize,
    pub hard: usize,
    /// Hard NATs whose ports change predictably
    pub regular_ports_changed: usize,
}

pub fn classify_feature_count(features: &[NatFeature]) -> FeatureCount {
    let mut count = FeatureCount::default();
    for feature in features {
        match feature.nat_type {
            NatType::Easy => count.easy += 1,
            NatType::Hard => {
                count.hard += 1;
                if feature.regular_ports_change {
                    count.regular_ports_changed += 1;
                }
            }
        }
    }
    count
}
