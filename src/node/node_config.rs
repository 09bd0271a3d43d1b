use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashSet;

use crate::messaging::node_id::NodeId;
use crate::messaging::transport_config::TransportConfig;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub myself: NodeId,

    /// The participant list is the same on all nodes and fixed for the process lifetime: a
    ///  node's position in it is its [NodeId], and its length is the size of vector clocks
    pub participants: Vec<SocketAddr>,

    pub transport: TransportConfig,

    /// Buffered messages that wait for a predecessor longer than this are reported as
    ///  unresolved dependencies (they stay buffered). `None` disables the check.
    pub stall_timeout: Option<Duration>,
    pub stall_check_interval: Duration,
}

impl NodeConfig {
    pub fn new(myself: NodeId, participants: Vec<SocketAddr>) -> NodeConfig {
        NodeConfig {
            myself,
            participants,
            transport: TransportConfig::default(),
            stall_timeout: Some(Duration::from_secs(30)),
            stall_check_interval: Duration::from_secs(1),
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.participants.len()
    }

    pub fn self_addr(&self) -> anyhow::Result<SocketAddr> {
        match self.participants.get(self.myself.index()) {
            Some(addr) => Ok(*addr),
            None => bail!("node id {} is out of range - there are {} participants", self.myself, self.participants.len()),
        }
    }

    pub fn addr_of(&self, node: NodeId) -> Option<SocketAddr> {
        self.participants.get(node.index()).cloned()
    }

    /// everybody except myself, in participant order
    pub fn other_nodes(&self) -> Vec<SocketAddr> {
        self.participants.iter()
            .enumerate()
            .filter(|(i, _)| *i != self.myself.index())
            .map(|(_, addr)| *addr)
            .collect()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.participants.is_empty() {
            bail!("there must be at least one participant");
        }
        self.self_addr()?;

        let distinct = self.participants.iter().collect::<FxHashSet<_>>();
        if distinct.len() != self.participants.len() {
            bail!("participant addresses must be distinct: {:?}", self.participants);
        }

        if self.stall_check_interval.is_zero() {
            bail!("stall check interval must be positive");
        }

        self.transport.validate()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn addrs(ports: &[u16]) -> Vec<SocketAddr> {
        ports.iter()
            .map(|&p| SocketAddr::from(([127, 0, 0, 1], p)))
            .collect()
    }

    #[rstest]
    #[case::valid(0, addrs(&[8000, 8001, 8002]), true)]
    #[case::single_node(0, addrs(&[8000]), true)]
    #[case::last(2, addrs(&[8000, 8001, 8002]), true)]
    #[case::out_of_range(3, addrs(&[8000, 8001, 8002]), false)]
    #[case::empty(0, vec![], false)]
    #[case::duplicate_addr(0, addrs(&[8000, 8001, 8000]), false)]
    fn test_validate(#[case] myself: usize, #[case] participants: Vec<SocketAddr>, #[case] expected_ok: bool) {
        let config = NodeConfig::new(NodeId(myself), participants);
        assert_eq!(config.validate().is_ok(), expected_ok);
    }

    #[test]
    fn test_other_nodes() {
        let config = NodeConfig::new(NodeId(1), addrs(&[8000, 8001, 8002]));
        assert_eq!(config.other_nodes(), addrs(&[8000, 8002]));
        assert_eq!(config.self_addr().unwrap(), addrs(&[8001])[0]);
        assert_eq!(config.addr_of(NodeId(2)), Some(addrs(&[8002])[0]));
        assert_eq!(config.addr_of(NodeId(3)), None);
        assert_eq!(config.num_nodes(), 3);
    }
}
