/// Emulated TCP/IP stack assembly and protocol options
use crate::config::types::{Result, RunkError};
use crate::net::{Clock, UniqueIdSource};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Default TTL / hop limit applied to IPv4 and IPv6.
pub const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetworkProtocol {
    Ipv4,
    Ipv6,
    Arp,
}

impl NetworkProtocol {
    /// EtherType
    pub fn number(self) -> u16 {
        match self {
            NetworkProtocol::Ipv4 => 0x0800,
            NetworkProtocol::Ipv6 => 0x86dd,
            NetworkProtocol::Arp => 0x0806,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmpv4,
}

impl TransportProtocol {
    /// IP protocol number
    pub fn number(self) -> u8 {
        match self {
            TransportProtocol::Tcp => 6,
            TransportProtocol::Udp => 17,
            TransportProtocol::Icmpv4 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOption {
    SackEnabled(bool),
    ModerateReceiveBuffer(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkOption {
    DefaultTtl(u8),
}

#[derive(Debug, Clone, Default)]
pub struct StackOptions {
    pub network_protocols: Vec<NetworkProtocol>,
    pub transport_protocols: Vec<TransportProtocol>,
    /// Deliver packets addressed to local interfaces without a NIC round trip
    pub handle_local: bool,
    /// Allow raw sockets for callers with sufficient privilege
    pub raw_sockets: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TcpSettings {
    sack: bool,
    moderate_receive_buffer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPolicy {
    Accept,
    Drop,
}

/// Builtin iptables tables and their chains.
pub const IPTABLES_BUILTINS: [(&str, &[&str]); 3] = [
    ("filter", &["INPUT", "FORWARD", "OUTPUT"]),
    ("nat", &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"]),
    ("mangle", &["PREROUTING", "OUTPUT"]),
];

#[derive(Debug, Clone, Default)]
pub struct IpTables {
    policies: BTreeMap<(String, String), ChainPolicy>,
}

impl IpTables {
    /// Accept-all policy on every builtin chain.
    pub fn default_accept() -> Self {
        let mut policies = BTreeMap::new();
        for (table, chains) in IPTABLES_BUILTINS {
            for chain in chains {
                policies.insert((table.to_string(), chain.to_string()), ChainPolicy::Accept);
            }
        }
        Self { policies }
    }

    pub fn policy(&self, table: &str, chain: &str) -> Option<ChainPolicy> {
        self.policies
            .get(&(table.to_string(), chain.to_string()))
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

pub struct EmulatedStack {
    network_protocols: BTreeSet<NetworkProtocol>,
    transport_protocols: BTreeSet<TransportProtocol>,
    handle_local: bool,
    raw_sockets: bool,
    tcp: TcpSettings,
    default_ttl: BTreeMap<NetworkProtocol, u8>,
    iptables: IpTables,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn UniqueIdSource>,
}

impl EmulatedStack {
    pub fn new(options: StackOptions, clock: Arc<dyn Clock>, ids: Arc<dyn UniqueIdSource>) -> Self {
        Self {
            network_protocols: options.network_protocols.into_iter().collect(),
            transport_protocols: options.transport_protocols.into_iter().collect(),
            handle_local: options.handle_local,
            raw_sockets: options.raw_sockets,
            tcp: TcpSettings::default(),
            default_ttl: BTreeMap::new(),
            iptables: IpTables::default(),
            clock,
            ids,
        }
    }

    pub fn set_transport_protocol_option(
        &mut self,
        protocol: TransportProtocol,
        option: TransportOption,
    ) -> Result<()> {
        if !self.transport_protocols.contains(&protocol) {
            return Err(RunkError::NetworkConfig(format!(
                "transport protocol {:?} is not registered",
                protocol
            )));
        }

        match (protocol, option) {
            (TransportProtocol::Tcp, TransportOption::SackEnabled(v)) => self.tcp.sack = v,
            (TransportProtocol::Tcp, TransportOption::ModerateReceiveBuffer(v)) => {
                self.tcp.moderate_receive_buffer = v
            }
            (p, o) => {
                return Err(RunkError::NetworkConfig(format!(
                    "option {:?} is not supported by {:?}",
                    o, p
                )))
            }
        }
        Ok(())
    }

    pub fn set_network_protocol_option(
        &mut self,
        protocol: NetworkProtocol,
        option: NetworkOption,
    ) -> Result<()> {
        if !self.network_protocols.contains(&protocol) {
            return Err(RunkError::NetworkConfig(format!(
                "network protocol {:?} is not registered",
                protocol
            )));
        }

        match (protocol, option) {
            (NetworkProtocol::Ipv4 | NetworkProtocol::Ipv6, NetworkOption::DefaultTtl(0)) => {
                Err(RunkError::NetworkConfig("default TTL must be non-zero".to_string()))
            }
            (NetworkProtocol::Ipv4 | NetworkProtocol::Ipv6, NetworkOption::DefaultTtl(ttl)) => {
                self.default_ttl.insert(protocol, ttl);
                Ok(())
            }
            (p, o) => Err(RunkError::NetworkConfig(format!(
                "option {:?} is not supported by {:?}",
                o, p
            ))),
        }
    }

    pub fn fill_default_ip_tables(&mut self) {
        self.iptables = IpTables::default_accept();
    }

    pub fn sack_enabled(&self) -> bool {
        self.tcp.sack
    }

    pub fn moderate_receive_buffer(&self) -> bool {
        self.tcp.moderate_receive_buffer
    }

    pub fn default_ttl(&self, protocol: NetworkProtocol) -> Option<u8> {
        self.default_ttl.get(&protocol).copied()
    }

    pub fn handle_local(&self) -> bool {
        self.handle_local
    }

    pub fn raw_sockets(&self) -> bool {
        self.raw_sockets
    }

    pub fn iptables(&self) -> &IpTables {
        &self.iptables
    }

    pub fn has_network_protocol(&self, protocol: NetworkProtocol) -> bool {
        self.network_protocols.contains(&protocol)
    }

    pub fn has_transport_protocol(&self, protocol: TransportProtocol) -> bool {
        self.transport_protocols.contains(&protocol)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Next stack-wide unique id.
    pub fn next_unique_id(&self) -> u64 {
        self.ids.unique_id()
    }
}

impl fmt::Debug for EmulatedStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedStack")
            .field("network_protocols", &self.network_protocols)
            .field("transport_protocols", &self.transport_protocols)
            .field("handle_local", &self.handle_local)
            .field("raw_sockets", &self.raw_sockets)
            .field("tcp", &self.tcp)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

/// Assemble the emulated stack with its full option set.
pub fn build_emulated_stack(
    clock: Arc<dyn Clock>,
    ids: Arc<dyn UniqueIdSource>,
) -> Result<EmulatedStack> {
    let options = StackOptions {
        network_protocols: vec![NetworkProtocol::Ipv4, NetworkProtocol::Ipv6, NetworkProtocol::Arp],
        transport_protocols: vec![
            TransportProtocol::Tcp,
            TransportProtocol::Udp,
            TransportProtocol::Icmpv4,
        ],
        handle_local: true,
        raw_sockets: true,
    };
    let mut stack = EmulatedStack::new(options, clock, ids);

    stack
        .set_transport_protocol_option(TransportProtocol::Tcp, TransportOption::SackEnabled(true))
        .map_err(|e| RunkError::NetworkConfig(format!("failed to enable SACK: {}", e)))?;

    for protocol in [NetworkProtocol::Ipv4, NetworkProtocol::Ipv6] {
        stack
            .set_network_protocol_option(protocol, NetworkOption::DefaultTtl(DEFAULT_TTL))
            .map_err(|e| {
                RunkError::NetworkConfig(format!("failed to set default TTL on {:?}: {}", protocol, e))
            })?;
    }

    stack
        .set_transport_protocol_option(
            TransportProtocol::Tcp,
            TransportOption::ModerateReceiveBuffer(true),
        )
        .map_err(|e| {
            RunkError::NetworkConfig(format!("failed to enable receive buffer auto-tuning: {}", e))
        })?;

    stack.fill_default_ip_tables();
    Ok(stack)
}
