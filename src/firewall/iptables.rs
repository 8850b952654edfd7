use std::collections::{BTreeMap, HashMap, HashSet};

use super::{CommandRunner, Element, FirewallBackend, SyncPlan};

fn set_name(interface: &str) -> String {
    format!("wglim_{interface}_allowed")
}

/// Legacy iptables/ipset backend for hosts without nftables. IPv4 only,
/// one ipset command per element; slower than the native backend but fine
/// for small fleets.
pub struct IptablesBackend {
    runner: Box<dyn CommandRunner>,
    initialized: HashSet<String>,
    current: HashMap<String, HashSet<Element>>,
}

impl IptablesBackend {
    pub fn new(runner: Box<dyn CommandRunner>) -> Self {
        Self {
            runner,
            initialized: HashSet::new(),
            current: HashMap::new(),
        }
    }

    fn run(&mut self, program: &str, args: &[&str]) -> bool {
        match self.runner.run(program, args) {
            Ok(output) => {
                if !output.success {
                    log::debug!("{program} command failed: {}", output.stderr);
                }
                output.success
            },
            Err(e) => {
                log::debug!("failed to spawn {program}: {e}");
                false
            },
        }
    }
}

impl FirewallBackend for IptablesBackend {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn ensure_interface(&mut self, interface: &str, listen_port: u16) {
        if self.initialized.contains(interface) {
            return;
        }
        let set = set_name(interface);
        if !self.run("ipset", &["list", &set]) {
            self.run("ipset", &["create", &set, "hash:ip,port", "family", "inet"]);
        }

        let port = listen_port.to_string();
        let rule = [
            "-p", "udp", "--dport", &port,
            "-m", "set", "!", "--match-set", &set, "src,src",
            "-j", "DROP",
        ];
        let mut check = vec!["-C", "INPUT"];
        check.extend_from_slice(&rule);
        if !self.run("iptables", &check) {
            let mut insert = vec!["-I", "INPUT", "1"];
            insert.extend_from_slice(&rule);
            self.run("iptables", &insert);
        }
        self.initialized.insert(interface.to_string());
    }

    fn sync(&mut self, plans: &BTreeMap<String, SyncPlan>) -> usize {
        let mut issued = 0;
        for (interface, plan) in plans {
            if !plan.ipv6.is_empty() {
                log::warn!("IPv6 endpoints on {interface} are not enforced by the iptables backend");
            }
            self.ensure_interface(interface, plan.port);

            let set = set_name(interface);
            let current = self.current.remove(interface).unwrap_or_default();
            let mut to_add: Vec<&Element> = plan.ipv4.difference(&current).collect();
            let mut to_remove: Vec<&Element> = current.difference(&plan.ipv4).collect();
            to_add.sort();
            to_remove.sort();

            for (host, port) in to_add {
                self.run("ipset", &["add", &set, &format!("{host},{port}")]);
                issued += 1;
            }
            for (host, port) in to_remove {
                self.run("ipset", &["del", &set, &format!("{host},{port}")]);
                issued += 1;
            }
            self.current.insert(interface.clone(), plan.ipv4.clone());
        }
        issued
    }

    fn forget_interface(&mut self, interface: &str) {
        self.current.remove(interface);
    }
}
