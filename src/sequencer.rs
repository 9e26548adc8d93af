//! NodeID sequencer.
//!
//! The sequencer is the single authority handing out node ids. Ids start at
//! zero and grow by one per registration; the directory keeps every
//! registration and additionally maps `ip:port` to id for SERVER entries so
//! that clients can translate a target address during connection setup.

use std::collections::HashMap;
use std::thread;

use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::proto::{
    CtrlMessage, CtrlServer, CtrlSocket, Handler, MessageStatus, NodeEntry, NodeRole,
};
use crate::types::NodeId;

/// The sequencer's registration directory.
#[derive(Default)]
pub struct NodeDirectory {
    entries: Vec<NodeEntry>,
    addr_to_id: HashMap<String, NodeId>,
}

impl NodeDirectory {
    /// Register a node and return its fresh id.
    pub fn register(&mut self, addr: String, name: String, role: NodeRole) -> NodeId {
        // Indexing `entries` by id relies on ids growing one by one.
        let id = self.entries.len() as NodeId;
        if role == NodeRole::Server {
            self.addr_to_id.insert(addr.clone(), id);
        }
        self.entries.push(NodeEntry {
            addr,
            name,
            id,
            role,
        });
        id
    }

    /// Look up a SERVER entry by its `ip:port`.
    pub fn lookup(&self, addr: &str) -> Option<&NodeEntry> {
        self.addr_to_id
            .get(addr)
            .map(|&id| &self.entries[id as usize])
    }

    /// All registrations, in id order.
    pub fn entries(&self) -> &[NodeEntry] {
        &self.entries
    }
}

impl Handler for NodeDirectory {
    fn handle(&mut self, msg: CtrlMessage) -> CtrlMessage {
        match msg {
            CtrlMessage::NodeIdRequest { addr, name, role } => {
                let id = self.register(addr, name, role);
                log::debug!("sequencer assigned node id {}", id);
                CtrlMessage::NodeIdResponse {
                    id,
                    status: MessageStatus::NoError,
                }
            }
            CtrlMessage::NodeIdForAddrRequest { addr } => match self.lookup(&addr) {
                Some(entry) => CtrlMessage::NodeIdForAddrResponse {
                    id: entry.id,
                    addr: entry.addr.clone(),
                    name: entry.name.clone(),
                    role: entry.role,
                    status: MessageStatus::NoError,
                },
                None => CtrlMessage::NodeIdForAddrResponse {
                    id: 0,
                    addr: String::new(),
                    name: String::new(),
                    role: NodeRole::Server,
                    status: MessageStatus::NodeIdNotFound,
                },
            },
            CtrlMessage::AllNodeIdsRequest => CtrlMessage::AllNodeIdsResponse {
                entries: self.entries.clone(),
                status: MessageStatus::NoError,
            },
            other => {
                log::warn!("sequencer received unhandled message {}", other.kind());
                CtrlMessage::Error {
                    status: MessageStatus::InvalidMessage,
                }
            }
        }
    }
}

/// A running NodeID sequencer service.
pub struct NodeIdSequencer {
    server: CtrlServer,
}

impl NodeIdSequencer {
    /// Bind and serve on the configured sequencer address.
    pub fn start(config: &Config) -> Result<Self> {
        Self::start_on(&config.sequencer_addr())
    }

    /// Bind and serve on an explicit `ip:port`.
    pub fn start_on(bind_addr: &str) -> Result<Self> {
        let server = CtrlServer::start(bind_addr, NodeDirectory::default())?;
        log::info!("node id sequencer running on {}", server.local_addr());
        Ok(Self { server })
    }

    /// The address the sequencer is bound to.
    pub fn local_addr(&self) -> &str {
        self.server.local_addr()
    }

    /// Stop serving.
    pub fn stop(&mut self) {
        self.server.stop();
    }
}

/// Translate a server address to its node id, retrying with growing backoff
/// while the sequencer has not seen the server register yet.
pub(crate) fn lookup_node_id(
    sequencer: &mut CtrlSocket,
    target_addr: &str,
    retries: u32,
) -> Result<NodeId> {
    let mut attempt = 0;
    loop {
        let reply = sequencer.request(&CtrlMessage::NodeIdForAddrRequest {
            addr: target_addr.to_owned(),
        })?;
        match reply {
            CtrlMessage::NodeIdForAddrResponse {
                id,
                addr,
                status: MessageStatus::NoError,
                ..
            } => {
                if addr != target_addr {
                    return Err(Error::ctrl(format!(
                        "sequencer returned address '{}' for requested '{}'",
                        addr, target_addr
                    )));
                }
                return Ok(id);
            }
            CtrlMessage::NodeIdForAddrResponse { status, .. } => {
                attempt += 1;
                if attempt >= retries {
                    return Err(Error::RemoteRejected(status));
                }
                log::debug!(
                    "node id for '{}' not known yet (attempt {}/{})",
                    target_addr,
                    attempt,
                    retries
                );
                thread::sleep(config::SLEEP_INTERVAL * attempt);
            }
            other => {
                return Err(Error::ctrl(format!(
                    "unexpected reply {} to node id lookup",
                    other.kind()
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn connect(addr: &str) -> CtrlSocket {
        CtrlSocket::connect(addr, Duration::from_millis(500)).unwrap()
    }

    #[test]
    fn ids_are_dense_and_start_at_zero() {
        let mut sequencer = NodeIdSequencer::start_on("127.0.0.1:0").unwrap();
        let mut socket = connect(sequencer.local_addr());

        for expected in 0..4u64 {
            let reply = socket
                .request(&CtrlMessage::NodeIdRequest {
                    addr: format!("10.0.0.{}:5200", expected),
                    name: "node".to_owned(),
                    role: NodeRole::Client,
                })
                .unwrap();
            match reply {
                CtrlMessage::NodeIdResponse { id, status } => {
                    assert_eq!(status, MessageStatus::NoError);
                    assert_eq!(id, expected);
                }
                other => panic!("unexpected reply: {:?}", other),
            }
        }
        sequencer.stop();
    }

    #[test]
    fn server_entries_are_resolvable_by_addr() {
        let mut sequencer = NodeIdSequencer::start_on("127.0.0.1:0").unwrap();
        let mut socket = connect(sequencer.local_addr());

        socket
            .request(&CtrlMessage::NodeIdRequest {
                addr: "10.0.0.1:5200".to_owned(),
                name: "server-a".to_owned(),
                role: NodeRole::Server,
            })
            .unwrap();
        socket
            .request(&CtrlMessage::NodeIdRequest {
                addr: "10.0.0.2:5200".to_owned(),
                name: "client-b".to_owned(),
                role: NodeRole::Client,
            })
            .unwrap();

        let id = lookup_node_id(&mut socket, "10.0.0.1:5200", 3).unwrap();
        assert_eq!(id, 0);

        // Client registrations are not resolvable by address.
        let err = lookup_node_id(&mut socket, "10.0.0.2:5200", 2).unwrap_err();
        assert!(matches!(
            err,
            Error::RemoteRejected(MessageStatus::NodeIdNotFound)
        ));
        sequencer.stop();
    }

    #[test]
    fn lookup_retries_until_registration_lands() {
        let mut sequencer = NodeIdSequencer::start_on("127.0.0.1:0").unwrap();
        let addr = sequencer.local_addr().to_owned();

        let register = {
            let addr = addr.clone();
            thread::spawn(move || {
                // Let the lookup fail at least once first.
                thread::sleep(Duration::from_millis(150));
                let mut socket = connect(&addr);
                socket
                    .request(&CtrlMessage::NodeIdRequest {
                        addr: "10.9.9.9:5200".to_owned(),
                        name: "late-server".to_owned(),
                        role: NodeRole::Server,
                    })
                    .unwrap();
            })
        };

        let mut socket = connect(&addr);
        let id = lookup_node_id(&mut socket, "10.9.9.9:5200", 10).unwrap();
        assert_eq!(id, 0);

        register.join().unwrap();
        sequencer.stop();
    }

    #[test]
    fn directory_dump_lists_all_nodes() {
        let mut sequencer = NodeIdSequencer::start_on("127.0.0.1:0").unwrap();
        let mut socket = connect(sequencer.local_addr());

        for i in 0..3 {
            socket
                .request(&CtrlMessage::NodeIdRequest {
                    addr: format!("10.0.1.{}:5200", i),
                    name: format!("node-{}", i),
                    role: NodeRole::Server,
                })
                .unwrap();
        }

        match socket.request(&CtrlMessage::AllNodeIdsRequest).unwrap() {
            CtrlMessage::AllNodeIdsResponse { entries, status } => {
                assert_eq!(status, MessageStatus::NoError);
                assert_eq!(entries.len(), 3);
                assert!(entries.iter().enumerate().all(|(i, e)| e.id == i as u64));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        sequencer.stop();
    }
}
