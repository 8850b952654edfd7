use std::collections::{BTreeMap, HashMap, HashSet};

use super::{CommandRunner, Element, FirewallBackend, SyncPlan};

/// The nftables table owned by the limiter. Everything the daemon installs
/// lives under it, so an operator can inspect or flush the whole thing with
/// one `nft` invocation.
pub const TABLE_NAME: &str = "wg_limiter";

fn chain_name(interface: &str) -> String {
    format!("wglim_{interface}")
}

fn set_name(interface: &str, family: &str) -> String {
    format!("wglim_{interface}_allowed_{family}")
}

/// Native nftables backend: one inet table, one chain and two typed sets
/// per interface, element-level syncing with at most one add and one delete
/// batch per set per tick.
pub struct NftablesBackend {
    runner: Box<dyn CommandRunner>,
    initialized: HashSet<String>,
    current_v4: HashMap<String, HashSet<Element>>,
    current_v6: HashMap<String, HashSet<Element>>,
}

impl NftablesBackend {
    pub fn new(runner: Box<dyn CommandRunner>) -> Self {
        Self {
            runner,
            initialized: HashSet::new(),
            current_v4: HashMap::new(),
            current_v6: HashMap::new(),
        }
    }

    fn run(&mut self, args: &[&str]) -> bool {
        match self.runner.run("nft", args) {
            Ok(output) => {
                if !output.success {
                    log::debug!("nft command failed: {}", output.stderr);
                }
                output.success
            },
            Err(e) => {
                log::debug!("failed to spawn nft: {e}");
                false
            },
        }
    }

    /// Create the limiter's table if this host doesn't have it yet.
    pub fn ensure_environment(&mut self) {
        if !self.run(&["list", "table", "inet", TABLE_NAME]) {
            self.run(&["add", "table", "inet", TABLE_NAME]);
        }
    }

    fn sync_set(
        &mut self,
        set: &str,
        desired: &HashSet<Element>,
        current: &HashSet<Element>,
    ) -> usize {
        let mut to_add: Vec<&Element> = desired.difference(current).collect();
        let mut to_remove: Vec<&Element> = current.difference(desired).collect();
        to_add.sort();
        to_remove.sort();

        let mut issued = 0;
        if !to_add.is_empty() {
            let elements = format_elements(&to_add);
            self.run(&["add", "element", "inet", TABLE_NAME, set, &elements]);
            issued += 1;
        }
        if !to_remove.is_empty() {
            let elements = format_elements(&to_remove);
            self.run(&["delete", "element", "inet", TABLE_NAME, set, &elements]);
            issued += 1;
        }
        issued
    }
}

/// Render elements in nft set-literal syntax, e.g. `{ 10.0.0.1 . 51820 }`.
fn format_elements(elements: &[&Element]) -> String {
    let parts: Vec<String> = elements
        .iter()
        .map(|(host, port)| {
            if host.contains(':') {
                format!("[{host}] . {port}")
            } else {
                format!("{host} . {port}")
            }
        })
        .collect();
    format!("{{ {} }}", parts.join(", "))
}

impl FirewallBackend for NftablesBackend {
    fn name(&self) -> &'static str {
        "nftables"
    }

    fn ensure_interface(&mut self, interface: &str, listen_port: u16) {
        if self.initialized.contains(interface) {
            return;
        }
        let chain = chain_name(interface);
        let set_v4 = set_name(interface, "v4");
        let set_v6 = set_name(interface, "v6");
        let port = listen_port.to_string();

        if !self.run(&["list", "set", "inet", TABLE_NAME, &set_v4]) {
            self.run(&[
                "add", "set", "inet", TABLE_NAME, &set_v4,
                "{", "type", "ipv4_addr", ".", "inet_service;", "}",
            ]);
        }
        if !self.run(&["list", "set", "inet", TABLE_NAME, &set_v6]) {
            self.run(&[
                "add", "set", "inet", TABLE_NAME, &set_v6,
                "{", "type", "ipv6_addr", ".", "inet_service;", "}",
            ]);
        }
        if !self.run(&["list", "chain", "inet", TABLE_NAME, &chain]) {
            // Hook below the usual filter chains so an accept here is only
            // an accept out of this chain, and the distribution firewall
            // still gets its say.
            self.run(&[
                "add", "chain", "inet", TABLE_NAME, &chain,
                "{", "type", "filter", "hook", "input", "priority", "-150;",
                "policy", "accept;", "}",
            ]);
            let v4_ref = format!("@{set_v4}");
            let v6_ref = format!("@{set_v6}");
            self.run(&[
                "add", "rule", "inet", TABLE_NAME, &chain,
                "udp", "dport", &port, "ip", "saddr", ".", "udp", "sport", &v4_ref, "return",
            ]);
            self.run(&[
                "add", "rule", "inet", TABLE_NAME, &chain,
                "udp", "dport", &port, "ip6", "saddr", ".", "udp", "sport", &v6_ref, "return",
            ]);
            self.run(&["add", "rule", "inet", TABLE_NAME, &chain, "udp", "dport", &port, "drop"]);
        }
        self.initialized.insert(interface.to_string());
    }

    fn sync(&mut self, plans: &BTreeMap<String, SyncPlan>) -> usize {
        let mut issued = 0;
        for (interface, plan) in plans {
            self.ensure_interface(interface, plan.port);
            let set_v4 = set_name(interface, "v4");
            let set_v6 = set_name(interface, "v6");
            let current_v4 = self.current_v4.remove(interface).unwrap_or_default();
            let current_v6 = self.current_v6.remove(interface).unwrap_or_default();

            issued += self.sync_set(&set_v4, &plan.ipv4, &current_v4);
            issued += self.sync_set(&set_v6, &plan.ipv6, &current_v6);

            self.current_v4.insert(interface.clone(), plan.ipv4.clone());
            self.current_v6.insert(interface.clone(), plan.ipv6.clone());
        }
        issued
    }

    fn forget_interface(&mut self, interface: &str) {
        self.current_v4.remove(interface);
        self.current_v6.remove(interface);
    }
}
