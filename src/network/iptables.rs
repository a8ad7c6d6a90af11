//! NAT and forwarding rules, programmed through the `iptables` binary. The
//! kernel tables are shared with other actors, so every add has a matching
//! delete and cleanup ignores failures.

use std::collections::HashMap;
use std::process::Command;

use anyhow::{bail, Context, Result};

/// Splits a port token into `(port, protocol)`. Accepts `8080` (protocol
/// defaults to tcp) and `8080/udp`.
pub fn parse_port(token: &str) -> (String, String) {
    match token.split_once('/') {
        Some((port, proto)) => (port.to_string(), proto.to_ascii_lowercase()),
        None => (token.to_string(), "tcp".to_string()),
    }
}

/// Allows forwarding through the bridge and masquerades egress traffic from
/// the network's CIDR.
pub fn setup_bridge_nat(bridge: &str, cidr: &str) -> Result<()> {
    filter(&["-I", "FORWARD", "-i", bridge, "-j", "ACCEPT"]).context("add forward in")?;
    filter(&["-I", "FORWARD", "-o", bridge, "-j", "ACCEPT"]).context("add forward out")?;
    nat(&[
        "-A", "POSTROUTING", "-s", cidr, "!", "-o", bridge, "-j", "MASQUERADE",
    ])
    .context("add masquerade")?;
    Ok(())
}

pub fn clean_bridge_nat(bridge: &str, cidr: &str) {
    let _ = filter(&["-D", "FORWARD", "-i", bridge, "-j", "ACCEPT"]);
    let _ = filter(&["-D", "FORWARD", "-o", bridge, "-j", "ACCEPT"]);
    let _ = nat(&[
        "-D", "POSTROUTING", "-s", cidr, "!", "-o", bridge, "-j", "MASQUERADE",
    ]);
}

/// Publishes container ports: one DNAT rule in PREROUTING for external
/// traffic and one in OUTPUT so the host's own loopback connections are
/// redirected too.
pub fn setup_port_mapping(container_ip: &str, ports: &HashMap<String, String>) -> Result<()> {
    for (host, guest) in ports {
        let (host_port, proto) = parse_port(host);
        let (guest_port, _) = parse_port(guest);
        let dest = format!("{container_ip}:{guest_port}");

        nat(&dnat_rule("-A", "PREROUTING", &proto, &host_port, &dest))
            .with_context(|| format!("add PREROUTING {host}->{guest}"))?;
        if let Err(e) = nat(&dnat_rule("-A", "OUTPUT", &proto, &host_port, &dest)) {
            let _ = nat(&dnat_rule("-D", "PREROUTING", &proto, &host_port, &dest));
            return Err(e).with_context(|| format!("add OUTPUT {host}->{guest}"));
        }
    }
    Ok(())
}

pub fn clean_port_mapping(container_ip: &str, ports: &HashMap<String, String>) {
    for (host, guest) in ports {
        let (host_port, proto) = parse_port(host);
        let (guest_port, _) = parse_port(guest);
        let dest = format!("{container_ip}:{guest_port}");

        let _ = nat(&dnat_rule("-D", "PREROUTING", &proto, &host_port, &dest));
        let _ = nat(&dnat_rule("-D", "OUTPUT", &proto, &host_port, &dest));
    }
}

fn dnat_rule<'a>(
    op: &'a str,
    chain: &'a str,
    proto: &'a str,
    host_port: &'a str,
    dest: &'a str,
) -> Vec<&'a str> {
    vec![
        op,
        chain,
        "-p",
        proto,
        "--dport",
        host_port,
        "-j",
        "DNAT",
        "--to-destination",
        dest,
    ]
}

fn nat(args: &[&str]) -> Result<()> {
    run_iptables("nat", args)
}

fn filter(args: &[&str]) -> Result<()> {
    run_iptables("filter", args)
}

fn run_iptables(table: &str, args: &[&str]) -> Result<()> {
    let status = Command::new("iptables")
        .args(["-t", table])
        .args(args)
        .status()
        .context("spawn iptables")?;
    if !status.success() {
        bail!("iptables -t {table} {} failed", args.join(" "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_defaults_to_tcp() {
        assert_eq!(parse_port("8080"), ("8080".to_string(), "tcp".to_string()));
    }

    #[test]
    fn test_parse_port_with_protocol() {
        assert_eq!(parse_port("53/UDP"), ("53".to_string(), "udp".to_string()));
        assert_eq!(parse_port("443/tcp"), ("443".to_string(), "tcp".to_string()));
    }

    #[test]
    fn test_dnat_rule_shape() {
        let rule = dnat_rule("-A", "PREROUTING", "tcp", "18080", "10.0.0.2:80");
        assert_eq!(
            rule,
            vec![
                "-A",
                "PREROUTING",
                "-p",
                "tcp",
                "--dport",
                "18080",
                "-j",
                "DNAT",
                "--to-destination",
                "10.0.0.2:80"
            ]
        );
    }
}
