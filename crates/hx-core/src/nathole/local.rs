//! Local interface addresses

use std::net::IpAddr;

use crate::error::NatError;

/// List up to `max` IPv4 interface addresses usable for hole punching.
///
/// Loopback and link-local addresses are skipped. `max` must be at least 1.
pub fn list_local_ips_for_nat_hole(max: usize) -> Result<Vec<String>, NatError> {
    if max == 0 {
        return Err(NatError::InvalidLimit);
    }

    let interfaces = get_if_addrs::get_if_addrs()?;

    let ips = interfaces
        .iter()
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_link_local() => Some(ip.to_string()),
            _ => None,
        })
        .take(max)
        .collect();

    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_respects_max() {
        assert!(matches!(
            list_local_ips_for_nat_hole(0),
            Err(NatError::InvalidLimit)
        ));
        assert!(list_local_ips_for_nat_hole(1).unwrap().len() <= 1);
    }

    #[test]
    fn test_excludes_loopback() {
        let ips = list_local_ips_for_nat_hole(16).unwrap();
        assert!(ips.iter().all(|ip| !ip.starts_with("127.")));
    }
}
