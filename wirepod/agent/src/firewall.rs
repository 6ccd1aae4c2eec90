//! NAT-table forwarding rules that redirect cluster traffic arriving at the
//! pod into the tunnel, and masquerade what leaves it.

use std::net::Ipv4Addr;
use thiserror::Error;

/// Well-known loopback endpoint of the sidecar interception proxy.
pub const INTERCEPT_TARGET: &str = "127.0.0.6:15001";

/// Sidecar health/admin ports that must stay directly reachable when
/// interception is active.
pub const INTERCEPT_HEALTH_PORTS: [u16; 2] = [15020, 15021];

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("unable to initialize iptables client: {0}")]
    Client(String),

    #[error("unable to install nat {chain} rule {rule:?}: {message}")]
    Rule {
        chain: String,
        rule: String,
        message: String,
    },
}

/// The subset of iptables used here; inserts are idempotent. Narrow on
/// purpose so the rule text is testable against a recording fake.
pub trait RuleSink {
    fn append_unique(&mut self, table: &str, chain: &str, rule: &str) -> Result<(), FirewallError>;
    fn insert_unique(
        &mut self,
        table: &str,
        chain: &str,
        rule: &str,
        position: i32,
    ) -> Result<(), FirewallError>;
}

pub struct IptablesSink {
    ipt: iptables::IPTables,
}

impl IptablesSink {
    pub fn new() -> Result<Self, FirewallError> {
        iptables::new(false)
            .map(|ipt| Self { ipt })
            .map_err(|error| FirewallError::Client(error.to_string()))
    }
}

impl RuleSink for IptablesSink {
    fn append_unique(&mut self, table: &str, chain: &str, rule: &str) -> Result<(), FirewallError> {
        self.ipt
            .append_unique(table, chain, rule)
            .map_err(|error| FirewallError::Rule {
                chain: chain.to_string(),
                rule: rule.to_string(),
                message: error.to_string(),
            })
    }

    fn insert_unique(
        &mut self,
        table: &str,
        chain: &str,
        rule: &str,
        position: i32,
    ) -> Result<(), FirewallError> {
        self.ipt
            .insert_unique(table, chain, rule, position)
            .map_err(|error| FirewallError::Rule {
                chain: chain.to_string(),
                rule: rule.to_string(),
                message: error.to_string(),
            })
    }
}

#[derive(Clone, Debug)]
pub struct ForwardingSpec<'a> {
    /// The pod's cluster-facing interface and its address.
    pub data_interface: &'a str,
    pub data_address: Ipv4Addr,
    pub tunnel_interface: &'a str,
    /// Workstation overlay address redirected traffic is sent to.
    pub local_overlay_addr: Ipv4Addr,
    /// Sidecar interception mode is active in this pod.
    pub interception: bool,
    /// Destination ports excluded from redirection, in order.
    pub excluded_ports: &'a [String],
}

/// Installs the forwarding rules. Any failure is fatal to agent startup.
pub fn install_rules(sink: &mut dyn RuleSink, spec: &ForwardingSpec<'_>) -> Result<(), FirewallError> {
    sink.append_unique(
        "nat",
        "POSTROUTING",
        &format!("-p udp -o {} -j MASQUERADE", spec.data_interface),
    )?;

    let mut redirect = format!("-p tcp -i {}", spec.data_interface);
    if !spec.excluded_ports.is_empty() {
        redirect.push_str(&format!(
            " -m multiport ! --dports {}",
            spec.excluded_ports.join(",")
        ));
    }
    redirect.push_str(&format!(" -j DNAT --to-destination {}", spec.local_overlay_addr));
    sink.append_unique("nat", "PREROUTING", &redirect)?;

    if spec.interception {
        // The interception proxy owns all inbound TCP; hand tunnel traffic to
        // it ahead of every other PREROUTING rule.
        sink.insert_unique(
            "nat",
            "PREROUTING",
            &format!(
                "-p tcp -i {} -j DNAT --to-destination {INTERCEPT_TARGET}",
                spec.tunnel_interface
            ),
            1,
        )?;
    } else {
        sink.append_unique(
            "nat",
            "PREROUTING",
            &format!(
                "-p tcp -i {} --destination {} -j DNAT --to-destination {}",
                spec.tunnel_interface, spec.data_address, spec.local_overlay_addr
            ),
        )?;
        sink.append_unique(
            "nat",
            "POSTROUTING",
            &format!("-p tcp -o {} -j MASQUERADE", spec.data_interface),
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingSink {
        rules: HashMap<String, HashMap<String, Vec<String>>>,
    }

    impl RecordingSink {
        fn chain(&self, table: &str, chain: &str) -> Vec<String> {
            self.rules
                .get(table)
                .and_then(|chains| chains.get(chain))
                .cloned()
                .unwrap_or_default()
        }
    }

    impl RuleSink for RecordingSink {
        fn append_unique(
            &mut self,
            table: &str,
            chain: &str,
            rule: &str,
        ) -> Result<(), FirewallError> {
            let chain = self
                .rules
                .entry(table.to_string())
                .or_default()
                .entry(chain.to_string())
                .or_default();
            if !chain.contains(&rule.to_string()) {
                chain.push(rule.to_string());
            }
            Ok(())
        }

        fn insert_unique(
            &mut self,
            table: &str,
            chain: &str,
            rule: &str,
            position: i32,
        ) -> Result<(), FirewallError> {
            let chain = self
                .rules
                .entry(table.to_string())
                .or_default()
                .entry(chain.to_string())
                .or_default();
            if !chain.contains(&rule.to_string()) {
                chain.insert((position - 1) as usize, rule.to_string());
            }
            Ok(())
        }
    }

    fn spec<'a>(interception: bool, excluded_ports: &'a [String]) -> ForwardingSpec<'a> {
        ForwardingSpec {
            data_interface: "eth0",
            data_address: "100.34.56.10".parse().unwrap(),
            tunnel_interface: "wg0",
            local_overlay_addr: "10.1.0.1".parse().unwrap(),
            interception,
            excluded_ports,
        }
    }

    #[test]
    fn basic_rules() {
        let mut sink = RecordingSink::default();
        install_rules(&mut sink, &spec(false, &[])).unwrap();

        assert_eq!(
            sink.chain("nat", "PREROUTING"),
            vec![
                "-p tcp -i eth0 -j DNAT --to-destination 10.1.0.1",
                "-p tcp -i wg0 --destination 100.34.56.10 -j DNAT --to-destination 10.1.0.1",
            ]
        );
        assert_eq!(
            sink.chain("nat", "POSTROUTING"),
            vec![
                "-p udp -o eth0 -j MASQUERADE",
                "-p tcp -o eth0 -j MASQUERADE",
            ]
        );
    }

    #[test]
    fn excluded_ports() {
        let excluded = vec!["12345".to_string(), "23456".to_string()];
        let mut sink = RecordingSink::default();
        install_rules(&mut sink, &spec(false, &excluded)).unwrap();

        assert_eq!(
            sink.chain("nat", "PREROUTING"),
            vec![
                "-p tcp -i eth0 -m multiport ! --dports 12345,23456 -j DNAT --to-destination 10.1.0.1",
                "-p tcp -i wg0 --destination 100.34.56.10 -j DNAT --to-destination 10.1.0.1",
            ]
        );
    }

    #[test]
    fn interception_rules() {
        let excluded = vec![
            "12345".to_string(),
            "23456".to_string(),
            "15020".to_string(),
            "15021".to_string(),
        ];
        let mut sink = RecordingSink::default();
        install_rules(&mut sink, &spec(true, &excluded)).unwrap();

        // The tunnel-side redirect jumps the queue; no TCP masquerade.
        assert_eq!(
            sink.chain("nat", "PREROUTING"),
            vec![
                "-p tcp -i wg0 -j DNAT --to-destination 127.0.0.6:15001",
                "-p tcp -i eth0 -m multiport ! --dports 12345,23456,15020,15021 -j DNAT --to-destination 10.1.0.1",
            ]
        );
        assert_eq!(
            sink.chain("nat", "POSTROUTING"),
            vec!["-p udp -o eth0 -j MASQUERADE"]
        );
    }

    #[test]
    fn repeated_installs_do_not_duplicate_rules() {
        let mut sink = RecordingSink::default();
        install_rules(&mut sink, &spec(false, &[])).unwrap();
        install_rules(&mut sink, &spec(false, &[])).unwrap();

        assert_eq!(sink.chain("nat", "PREROUTING").len(), 2);
        assert_eq!(sink.chain("nat", "POSTROUTING").len(), 2);
    }
}
