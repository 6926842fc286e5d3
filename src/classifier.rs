//! Packet classifier setup (nftables)
//!
//! Owns one table with a named counter. Game traffic leaving through the WAN
//! is counted and DSCP-marked so CAKE's diffserv tins prioritise it.

use crate::config::ClassifierConfig;
use crate::{exec, Result, ShaperError};
use ipnetwork::IpNetwork;
use std::fmt::Write;
use std::time::Duration;

const NFT_TIMEOUT: Duration = Duration::from_secs(10);

/// nftables-backed classifier
#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
    wan_interface: String,
}

impl Classifier {
    /// Classifier for traffic leaving `wan_interface`
    pub fn new(config: ClassifierConfig, wan_interface: String) -> Self {
        Self { config, wan_interface }
    }

    /// Render the ruleset as one atomic `nft -f` transaction.
    ///
    /// The leading `table`/`delete table` pair makes reloading idempotent.
    pub fn render(&self) -> Result<String> {
        let c = &self.config;
        let mut script = String::new();
        let _ = writeln!(script, "table {} {}", c.family, c.table);
        let _ = writeln!(script, "delete table {} {}", c.family, c.table);
        let _ = writeln!(script, "table {} {} {{", c.family, c.table);
        let _ = writeln!(script, "    counter {} {{ }}", c.counter);
        let _ = writeln!(script, "    chain postrouting {{");
        let _ = writeln!(script, "        type filter hook postrouting priority mangle; policy accept;");

        let mark = format!("counter name \"{}\" ip dscp set {}", c.counter, c.dscp);
        let mark6 = format!("counter name \"{}\" ip6 dscp set {}", c.counter, c.dscp);
        let oif = format!("oifname \"{}\"", self.wan_interface);
        let rule = |script: &mut String, matcher: &str| {
            let _ = writeln!(script, "        {} meta nfproto ipv4 {} {}", oif, matcher, mark);
            let _ = writeln!(script, "        {} meta nfproto ipv6 {} {}", oif, matcher, mark6);
        };

        if !c.udp_ports.is_empty() {
            rule(&mut script, &format!("udp dport {{ {} }}", port_set(&c.udp_ports)?));
        }
        if !c.tcp_ports.is_empty() {
            rule(&mut script, &format!("tcp dport {{ {} }}", port_set(&c.tcp_ports)?));
        }
        for host in &c.hosts {
            let net: IpNetwork = host
                .parse()
                .map_err(|e| ShaperError::Config(format!("classifier host {}: {}", host, e)))?;
            let family = match net {
                IpNetwork::V4(_) => "ip",
                IpNetwork::V6(_) => "ip6",
            };
            let _ = writeln!(
                script,
                "        {} {} daddr {} counter name \"{}\" {} dscp set {}",
                oif, family, net, c.counter, family, c.dscp
            );
        }

        let _ = writeln!(script, "    }}");
        let _ = writeln!(script, "}}");
        Ok(script)
    }

    /// Load the ruleset
    pub async fn apply(&self) -> Result<()> {
        let script = self.render()?;
        tracing::info!(
            "Loading classifier table {} {} on {}",
            self.config.family, self.config.table, self.wan_interface
        );
        exec::run(&self.config.nft_binary, &["-f", "-"], Some(&script), NFT_TIMEOUT)
            .await?
            .check(&self.config.nft_binary)?;
        Ok(())
    }

    /// Current value of the named packet counter
    pub async fn packet_count(&self) -> Result<u64> {
        let c = &self.config;
        let out = exec::run(
            &c.nft_binary,
            &["list", "counter", &c.family, &c.table, &c.counter],
            None,
            NFT_TIMEOUT,
        )
        .await?
        .check(&c.nft_binary)?;
        parse_counter_packets(&out.stdout)
            .ok_or_else(|| ShaperError::Parse(format!("no packet count in counter {}", c.counter)))
    }
}

/// Validate and join port entries (`"3074"`, `"27015-27030"`)
fn port_set(ports: &[String]) -> Result<String> {
    let mut parts = Vec::with_capacity(ports.len());
    for entry in ports {
        let entry = entry.trim();
        let valid = match entry.split_once('-') {
            Some((lo, hi)) => matches!(
                (lo.parse::<u16>(), hi.parse::<u16>()),
                (Ok(lo), Ok(hi)) if lo <= hi
            ),
            None => entry.parse::<u16>().is_ok(),
        };
        if !valid {
            return Err(ShaperError::Config(format!("invalid port entry {:?}", entry)));
        }
        parts.push(entry.to_string());
    }
    Ok(parts.join(", "))
}

/// Extract `packets N` from `nft list counter` output
pub fn parse_counter_packets(output: &str) -> Option<u64> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "packets" {
            return tokens.next()?.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counter_packets() {
        let out = "table inet sase_shaper {\n\tcounter game_pkts {\n\t\tpackets 4821 bytes 611302\n\t}\n}\n";
        assert_eq!(parse_counter_packets(out), Some(4821));
        assert_eq!(parse_counter_packets("Error: No such file or directory"), None);
    }

    #[test]
    fn test_render_is_idempotent_transaction() {
        let classifier = Classifier::new(ClassifierConfig::default(), "wan".into());
        let script = classifier.render().unwrap();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "table inet sase_shaper");
        assert_eq!(lines[1], "delete table inet sase_shaper");
        assert!(script.contains("counter game_pkts { }"));
        assert!(script.contains("udp dport { 3074, 3478-3480, 27015-27030 }"));
        assert!(script.contains("oifname \"wan\""));
    }

    #[test]
    fn test_render_hosts() {
        let config = ClassifierConfig {
            udp_ports: vec![],
            tcp_ports: vec![],
            hosts: vec!["203.0.113.0/24".into(), "2001:db8::/32".into()],
            ..ClassifierConfig::default()
        };
        let script = Classifier::new(config, "wan".into()).render().unwrap();
        assert!(script.contains("ip daddr 203.0.113.0/24"));
        assert!(script.contains("ip6 daddr 2001:db8::/32"));
        assert!(!script.contains("dport"));
    }

    #[test]
    fn test_invalid_ports_rejected() {
        for bad in ["70000", "30-10", "abc"] {
            let config = ClassifierConfig { udp_ports: vec![bad.into()], ..ClassifierConfig::default() };
            assert!(Classifier::new(config, "wan".into()).render().is_err(), "{}", bad);
        }
    }
}
