//! iptables programming for port maps and outbound NAT
//!
//! Every per-container rule carries a `corral:<id>` comment so it can be told
//! apart from rules other software installed.

use super::PortMap;
use crate::error::{CorralError, Result};
use std::net::Ipv4Addr;
use std::process::Command;

/// A rule in one table and chain, without the `-A`/`-C`/`-D` verb
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: &'static str,
    pub chain: &'static str,
    pub args: Vec<String>,
}

impl Rule {
    fn new(table: &'static str, chain: &'static str, args: &[&str]) -> Self {
        Self {
            table,
            chain,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn command(&self, verb: &str) -> Vec<String> {
        let mut command = vec![
            "-t".to_string(),
            self.table.to_string(),
            verb.to_string(),
            self.chain.to_string(),
        ];
        command.extend(self.args.iter().cloned());
        command
    }
}

/// Comment tagging rules owned by `container_id`
pub fn rule_comment(container_id: &str) -> String {
    format!("corral:{}", container_id)
}

/// DNAT rules for one port map: external traffic in PREROUTING, locally
/// generated traffic in OUTPUT
pub fn dnat_rules(container_id: &str, container_ip: Ipv4Addr, map: &PortMap) -> Vec<Rule> {
    let destination = format!("{}:{}", container_ip, map.container_port);
    let mut args = vec!["-p".to_string(), map.protocol.to_string()];
    if map.host_ip.is_unspecified() {
        args.extend(["-m", "addrtype", "--dst-type", "LOCAL"].map(String::from));
    } else {
        args.extend(["-d".to_string(), map.host_ip.to_string()]);
    }
    args.extend([
        "--dport".to_string(),
        map.host_port.to_string(),
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        rule_comment(container_id),
        "-j".to_string(),
        "DNAT".to_string(),
        "--to-destination".to_string(),
        destination,
    ]);

    ["PREROUTING", "OUTPUT"]
        .into_iter()
        .map(|chain| Rule {
            table: "nat",
            chain,
            args: args.clone(),
        })
        .collect()
}

/// Bridge-wide rules: masquerade outbound container traffic and localhost
/// traffic redirected into the bridge, and let the bridge forward
pub fn bridge_rules(bridge: &str, cidr: &str) -> Vec<Rule> {
    vec![
        Rule::new(
            "nat",
            "POSTROUTING",
            &["-s", cidr, "!", "-o", bridge, "-j", "MASQUERADE"],
        ),
        Rule::new(
            "nat",
            "POSTROUTING",
            &["-s", "127.0.0.0/8", "-o", bridge, "-j", "MASQUERADE"],
        ),
        Rule::new("filter", "FORWARD", &["-i", bridge, "-j", "ACCEPT"]),
        Rule::new("filter", "FORWARD", &["-o", bridge, "-j", "ACCEPT"]),
    ]
}

/// iptables front end
#[derive(Debug, Clone)]
pub struct Iptables {
    program: String,
}

impl Default for Iptables {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl Iptables {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Verify iptables can be run
    pub fn check_support(&self) -> Result<()> {
        let output = Command::new(&self.program)
            .arg("--version")
            .output()
            .map_err(|e| {
                CorralError::UnsupportedHost(format!("cannot run {}: {}", self.program, e))
            })?;
        if !output.status.success() {
            return Err(CorralError::UnsupportedHost(format!(
                "{} --version failed: {}",
                self.program,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn run(&self, args: &[String]) -> Result<()> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| CorralError::external(format!("run {}", self.program), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CorralError::ExternalCommand {
                context: format!(
                    "{} {} failed: {}",
                    self.program,
                    args.join(" "),
                    stderr.trim()
                ),
            });
        }
        Ok(())
    }

    fn exists(&self, rule: &Rule) -> bool {
        self.run(&rule.command("-C")).is_ok()
    }

    /// Append `rule` unless an identical one is present
    pub fn ensure(&self, rule: &Rule) -> Result<()> {
        if self.exists(rule) {
            return Ok(());
        }
        self.run(&rule.command("-A"))
    }

    pub fn append(&self, rule: &Rule) -> Result<()> {
        self.run(&rule.command("-A"))
    }

    /// Delete `rule`; a rule that is already gone is not an error
    pub fn delete(&self, rule: &Rule) -> Result<()> {
        if !self.exists(rule) {
            return Ok(());
        }
        self.run(&rule.command("-D"))
    }

    /// Install the DNAT rules for a port map, all or nothing
    pub fn add_port_map(
        &self,
        container_id: &str,
        container_ip: Ipv4Addr,
        map: &PortMap,
    ) -> Result<()> {
        let rules = dnat_rules(container_id, container_ip, map);
        for (installed, rule) in rules.iter().enumerate() {
            if let Err(e) = self.append(rule) {
                for done in &rules[..installed] {
                    if let Err(undo) = self.delete(done) {
                        tracing::warn!("Failed to roll back {:?}: {}", done, undo);
                    }
                }
                return Err(e);
            }
        }
        tracing::debug!(
            container = container_id,
            host_port = map.host_port,
            container_port = map.container_port,
            protocol = %map.protocol,
            "added port map"
        );
        Ok(())
    }

    /// Remove the DNAT rules for a port map, attempting every rule
    pub fn remove_port_map(
        &self,
        container_id: &str,
        container_ip: Ipv4Addr,
        map: &PortMap,
    ) -> Result<()> {
        let mut first_error = None;
        for rule in dnat_rules(container_id, container_ip, map) {
            if let Err(e) = self.delete(&rule) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Idempotently install the bridge-wide rules
    pub fn setup_bridge(&self, bridge: &str, cidr: &str) -> Result<()> {
        for rule in bridge_rules(bridge, cidr) {
            self.ensure(&rule)?;
        }
        Ok(())
    }
}
