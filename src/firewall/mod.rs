use std::{
    collections::{BTreeMap, HashSet},
    io,
    process::Command,
};

use crate::{endpoint::Endpoint, util::find_program};

pub mod iptables;
pub mod nftables;

pub use iptables::IptablesBackend;
pub use nftables::NftablesBackend;

/// A bare (host, port) tuple destined for a firewall allow-set.
pub type Element = (String, u16);

/// Desired allow-state for one interface for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub port: u16,
    pub ipv4: HashSet<Element>,
    pub ipv6: HashSet<Element>,
}

impl SyncPlan {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ipv4: HashSet::new(),
            ipv6: HashSet::new(),
        }
    }

    /// Sort an endpoint into the v4 or v6 bucket.
    pub fn insert(&mut self, endpoint: &Endpoint) {
        let element = (endpoint.host.clone(), endpoint.port);
        if endpoint.is_ipv6() {
            self.ipv6.insert(element);
        } else {
            self.ipv4.insert(element);
        }
    }
}

/// What a concrete firewall implementation must provide: an idempotent
/// per-interface skeleton, and a diff-and-apply pass over the desired
/// allow-sets. `sync` reports how many element commands it issued so the
/// daemon can account for them.
///
/// Backends log failed host-tool invocations at debug and keep going; a
/// broken firewall tool must never take the observation loop down with it.
pub trait FirewallBackend {
    fn name(&self) -> &'static str;

    /// Idempotently install whatever table/chain/set/rule skeleton is needed
    /// so that by default UDP to `listen_port` is dropped unless the source
    /// (ip, port) matches the interface's allow-set.
    fn ensure_interface(&mut self, interface: &str, listen_port: u16);

    /// Converge installed state toward `plans`, emitting only deltas.
    fn sync(&mut self, plans: &BTreeMap<String, SyncPlan>) -> usize;

    /// Drop bookkeeping for an interface that no longer exists.
    fn forget_interface(&mut self, interface: &str);
}

/// Pick the best backend the host supports, or none at all.
///
/// Running without a backend is fail-open on purpose: observation and
/// persistence keep the dashboard truthful even on hosts where this daemon
/// is not allowed to manage the firewall.
pub fn detect() -> Option<Box<dyn FirewallBackend>> {
    if find_program("nft").is_some() {
        let mut backend = NftablesBackend::new(Box::new(SystemRunner));
        backend.ensure_environment();
        return Some(Box::new(backend));
    }
    if find_program("iptables").is_some() && find_program("ipset").is_some() {
        return Some(Box::new(IptablesBackend::new(Box::new(SystemRunner))));
    }
    log::warn!("no supported firewall backend found; running in fail-open mode");
    None
}

/// Outcome of one host-tool invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stderr: String,
}

/// Runs firewall commands. Swapped out for a recording fake in tests.
pub trait CommandRunner {
    fn run(&mut self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;
}

/// Shells out to the host tools, one process per command.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&mut self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        log::trace!("{program} {}: {:?}", args.join(" "), output.status.code());
        Ok(CommandOutput {
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{CommandOutput, CommandRunner};
    use std::{cell::RefCell, io, rc::Rc};

    /// Records every command instead of running it, reporting success or
    /// failure as scripted.
    pub struct RecordingRunner {
        pub commands: Rc<RefCell<Vec<String>>>,
        pub succeed: bool,
    }

    impl RecordingRunner {
        pub fn recording_to(commands: Rc<RefCell<Vec<String>>>) -> Self {
            Self {
                commands,
                succeed: true,
            }
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&mut self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
            self.commands
                .borrow_mut()
                .push(format!("{program} {}", args.join(" ")));
            Ok(CommandOutput {
                success: self.succeed,
                stderr: String::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_buckets_endpoints_by_family() {
        let mut plan = SyncPlan::new(51820);
        plan.insert(&"10.0.0.1:1000".parse().unwrap());
        plan.insert(&"[2001:db8::1]:2000".parse().unwrap());
        plan.insert(&"10.0.0.1:1000".parse().unwrap());

        assert_eq!(plan.ipv4, HashSet::from([("10.0.0.1".to_string(), 1000)]));
        assert_eq!(plan.ipv6, HashSet::from([("2001:db8::1".to_string(), 2000)]));
    }
}
