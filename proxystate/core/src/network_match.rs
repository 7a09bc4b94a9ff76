use ipnet::IpNet;
use std::{collections::BTreeSet, net::IpAddr};

/// A set of exact-address networks.
///
/// Addresses are kept ordered so that the same set of addresses always
/// produces the same list of ranges, whatever order they were inserted in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct NetworkMatch {
    nets: BTreeSet<IpNet>,
}

/// Returns the host network for `addr`: a /32 for IPv4 and a /128 for IPv6.
pub fn exact_net(addr: IpAddr) -> IpNet {
    IpNet::from(addr)
}

// === impl NetworkMatch ===

impl NetworkMatch {
    /// Adds an address, ignoring anything that is not a literal IP.
    pub fn insert_addr(&mut self, addr: &str) -> bool {
        match addr.parse::<IpAddr>() {
            Ok(ip) => self.nets.insert(exact_net(ip)),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn into_ranges(self) -> Vec<IpNet> {
        self.nets.into_iter().collect()
    }
}

impl<'a> FromIterator<&'a str> for NetworkMatch {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut nets = Self::default();
        for addr in iter {
            nets.insert_addr(addr);
        }
        nets
    }
}

impl<'a> FromIterator<&'a String> for NetworkMatch {
    fn from_iter<I: IntoIterator<Item = &'a String>>(iter: I) -> Self {
        iter.into_iter().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order_does_not_matter() {
        let a: NetworkMatch = ["10.0.0.2", "240.0.0.1", "2001:db8::1"].into_iter().collect();
        let b: NetworkMatch = ["2001:db8::1", "10.0.0.2", "240.0.0.1", "10.0.0.2"]
            .into_iter()
            .collect();
        assert_eq!(a, b);
        assert_eq!(a.into_ranges(), b.into_ranges());
    }

    #[test]
    fn host_prefix_lengths() {
        let ranges = ["10.0.0.1", "::1", "not-an-ip"]
            .into_iter()
            .collect::<NetworkMatch>()
            .into_ranges();
        assert_eq!(
            ranges,
            vec![
                "10.0.0.1/32".parse::<IpNet>().unwrap(),
                "::1/128".parse::<IpNet>().unwrap(),
            ]
        );
    }
}
