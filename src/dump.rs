use std::{collections::BTreeMap, process::Command};

use crate::{error::LimiterError, util::find_program};

/// One peer line from the dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDump {
    pub public_key: String,
    pub endpoint: String,
    /// Unix seconds of the latest handshake, zero if there has never been one.
    pub latest_handshake: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// One interface section from the dump.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceDump {
    pub listen_port: u16,
    pub peers: Vec<PeerDump>,
}

/// Collects `wg show all dump` output from the host tool.
#[derive(Debug, Default)]
pub struct DumpCollector;

impl DumpCollector {
    pub fn collect(&self) -> Result<BTreeMap<String, InterfaceDump>, LimiterError> {
        let wg = find_program("wg").ok_or(LimiterError::ToolMissing("wg"))?;
        let output = Command::new(wg).args(["show", "all", "dump"]).output()?;
        if !output.status.success() {
            return Err(LimiterError::ToolFailed {
                tool: "wg",
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(parse_dump(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse the tab-separated dump format.
///
/// A 5-field line opens an interface section (name at field 0, listen port
/// at field 3); lines with 8 or more fields are peers of the current
/// section (public key, endpoint, handshake epoch, rx, tx). Lines of other
/// arities, peers before the first section, and peer lines with mangled
/// counters are dropped. The format carries no schema version, so trailing
/// extra fields are tolerated.
pub fn parse_dump(raw: &str) -> BTreeMap<String, InterfaceDump> {
    let mut interfaces: BTreeMap<String, InterfaceDump> = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in raw.lines() {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() == 5 {
            let name = fields[0].to_string();
            interfaces.insert(
                name.clone(),
                InterfaceDump {
                    listen_port: fields[3].parse().unwrap_or(0),
                    peers: Vec::new(),
                },
            );
            current = Some(name);
        } else if fields.len() >= 8 {
            if let (Some(name), Some(peer)) = (&current, parse_peer_line(&fields)) {
                if let Some(interface) = interfaces.get_mut(name) {
                    interface.peers.push(peer);
                }
            }
        }
    }

    interfaces
}

fn parse_peer_line(fields: &[&str]) -> Option<PeerDump> {
    Some(PeerDump {
        public_key: fields[0].to_string(),
        endpoint: fields[2].to_string(),
        latest_handshake: parse_counter(fields[4])?,
        rx_bytes: parse_counter(fields[5])?,
        tx_bytes: parse_counter(fields[6])?,
    })
}

fn parse_counter(field: &str) -> Option<u64> {
    if field.is_empty() {
        Some(0)
    } else {
        field.parse().ok()
    }
}
