//! iptables rules for the AP's NAT path.

use std::fmt;

use ipnet::Ipv4Net;

use super::run_cmd;
use crate::error::{Result, WaptError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Forward,
    Postrouting,
}

impl Chain {
    fn as_str(&self) -> &'static str {
        match self {
            Chain::Forward => "FORWARD",
            Chain::Postrouting => "POSTROUTING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Accept,
    Masquerade,
}

impl Target {
    fn as_str(&self) -> &'static str {
        match self {
            Target::Accept => "ACCEPT",
            Target::Masquerade => "MASQUERADE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: Table,
    pub chain: Chain,
    pub target: Target,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub source: Option<Ipv4Net>,
    pub state: Option<String>,
}

impl Rule {
    pub fn new(table: Table, chain: Chain, target: Target) -> Self {
        Self {
            table,
            chain,
            target,
            in_interface: None,
            out_interface: None,
            source: None,
            state: None,
        }
    }

    pub fn in_interface(mut self, iface: &str) -> Self {
        self.in_interface = Some(iface.to_string());
        self
    }

    pub fn out_interface(mut self, iface: &str) -> Self {
        self.out_interface = Some(iface.to_string());
        self
    }

    pub fn source(mut self, net: Ipv4Net) -> Self {
        self.source = Some(net);
        self
    }

    pub fn connection_state(mut self, state: &str) -> Self {
        self.state = Some(state.to_string());
        self
    }

    /// iptables argv for `action` (`-I`, `-A`, `-D`).
    pub fn to_args(&self, action: &str) -> Vec<String> {
        let mut args = Vec::new();
        if self.table != Table::Filter {
            args.push("-t".to_string());
            args.push(self.table.as_str().to_string());
        }
        args.push(action.to_string());
        args.push(self.chain.as_str().to_string());
        args.extend(self.match_args());
        args
    }

    /// The line `iptables -S` prints for this rule, prefixed with its table.
    pub fn listed(&self) -> String {
        format!(
            "{} -A {} {}",
            self.table.as_str(),
            self.chain.as_str(),
            self.match_args().join(" ")
        )
    }

    pub fn is_listed(&self, listed: &[String]) -> bool {
        let expected = self.listed();
        listed.iter().any(|line| line.trim() == expected)
    }

    fn match_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(net) = self.source {
            args.push("-s".to_string());
            args.push(net.to_string());
        }
        if let Some(iface) = &self.in_interface {
            args.push("-i".to_string());
            args.push(iface.clone());
        }
        if let Some(iface) = &self.out_interface {
            args.push("-o".to_string());
            args.push(iface.clone());
        }
        if let Some(state) = &self.state {
            args.push("-m".to_string());
            args.push("state".to_string());
            args.push("--state".to_string());
            args.push(state.clone());
        }
        args.push("-j".to_string());
        args.push(self.target.as_str().to_string());
        args
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_args("-I").join(" "))
    }
}

/// The three rules that route AP clients out through `egress`.
pub fn nat_rules(ap_iface: &str, egress: &str, subnet: Ipv4Net) -> [Rule; 3] {
    [
        Rule::new(Table::Nat, Chain::Postrouting, Target::Masquerade)
            .source(subnet.trunc())
            .out_interface(egress),
        Rule::new(Table::Filter, Chain::Forward, Target::Accept)
            .in_interface(ap_iface)
            .out_interface(egress),
        Rule::new(Table::Filter, Chain::Forward, Target::Accept)
            .in_interface(egress)
            .out_interface(ap_iface)
            .connection_state("RELATED,ESTABLISHED"),
    ]
}

pub trait Firewall: Send + Sync {
    /// Inserts `rule`; a rejected rule is a `Firewall` error.
    fn insert(&self, rule: &Rule) -> Result<()>;
    /// Flushes the filter and nat tables.
    fn flush_all(&self) -> Result<()>;
    /// Rules currently present, as `<table> <iptables -S line>`.
    fn list_rules(&self) -> Result<Vec<String>>;
}

pub struct IptablesFirewall {
    binary: String,
}

impl IptablesFirewall {
    pub fn new() -> Self {
        Self {
            binary: "iptables".to_string(),
        }
    }
}

impl Default for IptablesFirewall {
    fn default() -> Self {
        Self::new()
    }
}

impl Firewall for IptablesFirewall {
    fn insert(&self, rule: &Rule) -> Result<()> {
        let args = rule.to_args("-I");
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        run_cmd(&self.binary, &argv).map(|_| ()).map_err(|err| WaptError::Firewall {
            rule: rule.to_string(),
            reason: err.to_string(),
        })
    }

    fn flush_all(&self) -> Result<()> {
        let filter = run_cmd(&self.binary, &["-F"]);
        let nat = run_cmd(&self.binary, &["-t", "nat", "-F"]);
        filter?;
        nat?;
        Ok(())
    }

    fn list_rules(&self) -> Result<Vec<String>> {
        let mut rules = Vec::new();
        for table in [Table::Filter, Table::Nat] {
            let out = run_cmd(&self.binary, &["-t", table.as_str(), "-S"])?;
            rules.extend(
                out.stdout
                    .lines()
                    .filter(|line| line.starts_with("-A "))
                    .map(|line| format!("{} {line}", table.as_str())),
            );
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nat_rule_arguments() {
        let subnet: Ipv4Net = "10.0.0.1/24".parse().unwrap();
        let [masq, out, back] = nat_rules("wlan0", "eth0", subnet);
        assert_eq!(
            masq.to_args("-I"),
            ["-t", "nat", "-I", "POSTROUTING", "-s", "10.0.0.0/24", "-o", "eth0", "-j", "MASQUERADE"]
        );
        assert_eq!(
            out.to_args("-I"),
            ["-I", "FORWARD", "-i", "wlan0", "-o", "eth0", "-j", "ACCEPT"]
        );
        assert_eq!(
            back.to_string(),
            "-I FORWARD -i eth0 -o wlan0 -m state --state RELATED,ESTABLISHED -j ACCEPT"
        );
    }

    #[test]
    fn listed_form_matches_iptables_save_output() {
        let subnet: Ipv4Net = "10.0.0.1/24".parse().unwrap();
        let [masq, _, back] = nat_rules("wlan0", "eth0", subnet);
        assert_eq!(
            masq.listed(),
            "nat -A POSTROUTING -s 10.0.0.0/24 -o eth0 -j MASQUERADE"
        );
        let listed = vec![
            "filter -A FORWARD -i eth0 -o wlan0 -m state --state RELATED,ESTABLISHED -j ACCEPT".to_string(),
        ];
        assert!(back.is_listed(&listed));
        assert!(!masq.is_listed(&listed));
    }
}
