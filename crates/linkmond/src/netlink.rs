//! Platform link/address plumbing.
//!
//! Two surfaces: a [`LinkProvider`] handle for full link/address enumeration
//! (initial discovery, periodic resync and the raw dump control operation),
//! and — on Linux — a subscription socket that turns kernel RTM_NEWLINK /
//! RTM_DELLINK / RTM_NEWADDR / RTM_DELADDR messages into [`NetlinkEvent`]s
//! for the monitor's inbound queue. Non-Linux builds get a mock for
//! development and testing.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{AddrInfo, LinkInfo};

/// Narrow handle for enumerating the OS link/address inventory.
///
/// The underlying socket outlives the link monitor; implementations are
/// used only from the event-loop task.
#[async_trait]
pub trait LinkProvider: Send {
    /// Enumerates all links.
    async fn get_all_links(&mut self) -> Result<Vec<LinkInfo>>;

    /// Enumerates all assigned addresses.
    async fn get_all_addresses(&mut self) -> Result<Vec<AddrInfo>>;
}

/// In-memory provider for tests and non-Linux development.
#[derive(Debug, Default)]
pub struct MockLinkProvider {
    /// Links returned by enumeration
    pub links: Vec<LinkInfo>,
    /// Addresses returned by enumeration
    pub addrs: Vec<AddrInfo>,
    /// When set, the next enumeration fails and clears the flag
    pub fail_next: bool,
}

impl MockLinkProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider with a fixed inventory.
    pub fn with_inventory(links: Vec<LinkInfo>, addrs: Vec<AddrInfo>) -> Self {
        Self {
            links,
            addrs,
            fail_next: false,
        }
    }
}

#[async_trait]
impl LinkProvider for MockLinkProvider {
    async fn get_all_links(&mut self) -> Result<Vec<LinkInfo>> {
        if self.fail_next {
            self.fail_next = false;
            return Err(crate::error::LinkMonitorError::Netlink(
                "injected enumeration failure".to_string(),
            ));
        }
        Ok(self.links.clone())
    }

    async fn get_all_addresses(&mut self) -> Result<Vec<AddrInfo>> {
        Ok(self.addrs.clone())
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::LinkProvider;
    use crate::error::{LinkMonitorError, Result};
    use crate::types::{AddrInfo, CidrNetwork, LinkInfo, NetlinkEvent};
    use async_trait::async_trait;
    use netlink_packet_core::{
        NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST,
    };
    use netlink_packet_route::address::{AddressAttribute, AddressMessage};
    use netlink_packet_route::link::{LinkAttribute, LinkFlag, LinkMessage};
    use netlink_packet_route::RouteNetlinkMessage;
    use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
    use tracing::{debug, trace};

    /// Multicast groups for link and v4/v6 address notifications
    const RTNLGRP_LINK: u32 = 1;
    const RTNLGRP_IPV4_IFADDR: u32 = 5;
    const RTNLGRP_IPV6_IFADDR: u32 = 9;

    fn group_mask(group: u32) -> u32 {
        1 << (group - 1)
    }

    fn parse_link(msg: &LinkMessage, assume_up: bool) -> Option<LinkInfo> {
        let mut name = None;
        for attr in &msg.attributes {
            if let LinkAttribute::IfName(n) = attr {
                name = Some(n.clone());
            }
        }
        let is_up = assume_up && msg.header.flags.contains(&LinkFlag::Running);
        Some(LinkInfo {
            name: name?,
            if_index: msg.header.index,
            is_up,
        })
    }

    fn parse_addr(msg: &AddressMessage) -> Option<AddrInfo> {
        for attr in &msg.attributes {
            if let AddressAttribute::Address(addr) = attr {
                let network = CidrNetwork::new(*addr, msg.header.prefix_len).ok()?;
                return Some(AddrInfo {
                    if_index: msg.header.index,
                    network,
                });
            }
        }
        None
    }

    /// Turns one rtnetlink message into a monitor event.
    pub fn event_from_message(msg: &NetlinkMessage<RouteNetlinkMessage>) -> Option<NetlinkEvent> {
        match &msg.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                let info = parse_link(link, true)?;
                Some(NetlinkEvent::Link {
                    name: info.name,
                    if_index: info.if_index,
                    is_up: info.is_up,
                })
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                let info = parse_link(link, false)?;
                Some(NetlinkEvent::Link {
                    name: info.name,
                    if_index: info.if_index,
                    is_up: false,
                })
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewAddress(addr)) => {
                let info = parse_addr(addr)?;
                Some(NetlinkEvent::Addr {
                    if_index: info.if_index,
                    network: info.network,
                    is_add: true,
                })
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelAddress(addr)) => {
                let info = parse_addr(addr)?;
                Some(NetlinkEvent::Addr {
                    if_index: info.if_index,
                    network: info.network,
                    is_add: false,
                })
            }
            _ => None,
        }
    }

    /// Kernel subscription socket delivering link and address events.
    pub struct NetlinkEventSocket {
        socket: Socket,
        buffer: Vec<u8>,
    }

    impl NetlinkEventSocket {
        /// Creates and binds the subscription socket.
        pub fn new() -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| LinkMonitorError::Netlink(format!("cannot create socket: {}", e)))?;
            let groups = group_mask(RTNLGRP_LINK)
                | group_mask(RTNLGRP_IPV4_IFADDR)
                | group_mask(RTNLGRP_IPV6_IFADDR);
            socket
                .bind(&SocketAddr::new(0, groups))
                .map_err(|e| LinkMonitorError::Netlink(format!("cannot bind socket: {}", e)))?;
            debug!("Netlink event socket bound to link/address groups");
            Ok(Self {
                socket,
                buffer: Vec::with_capacity(65536),
            })
        }

        /// Blocks for the next batch of events. Intended to run on a
        /// dedicated blocking task feeding the monitor's netlink queue.
        pub fn recv_events(&mut self) -> Result<Vec<NetlinkEvent>> {
            self.buffer.clear();
            let len = self
                .socket
                .recv(&mut self.buffer, 0)
                .map_err(|e| LinkMonitorError::Netlink(format!("recv failed: {}", e)))?;

            let mut events = Vec::new();
            let mut offset = 0;
            while offset < len {
                let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(
                    &self.buffer[offset..len],
                )
                .map_err(|e| LinkMonitorError::Netlink(format!("cannot parse message: {}", e)))?;
                let size = msg.header.length as usize;
                if size == 0 {
                    break;
                }
                offset += (size + 3) & !3;
                if let Some(event) = event_from_message(&msg) {
                    events.push(event);
                }
            }
            trace!(count = events.len(), "Received netlink events");
            Ok(events)
        }
    }

    /// Dump-based enumeration over a dedicated request socket.
    pub struct NetlinkLinkProvider {
        socket: Socket,
        buffer: Vec<u8>,
    }

    impl NetlinkLinkProvider {
        /// Creates the request socket.
        pub fn new() -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| LinkMonitorError::Netlink(format!("cannot create socket: {}", e)))?;
            socket
                .bind(&SocketAddr::new(0, 0))
                .map_err(|e| LinkMonitorError::Netlink(format!("cannot bind socket: {}", e)))?;
            Ok(Self {
                socket,
                buffer: Vec::with_capacity(65536),
            })
        }

        fn request_dump(&mut self, payload: RouteNetlinkMessage) -> Result<()> {
            let mut header = NetlinkHeader::default();
            header.flags = NLM_F_REQUEST | NLM_F_DUMP;
            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
            packet.finalize();

            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);
            self.socket
                .send(&buf, 0)
                .map_err(|e| LinkMonitorError::Netlink(format!("dump request failed: {}", e)))?;
            Ok(())
        }

        fn collect_dump(&mut self) -> Result<Vec<NetlinkMessage<RouteNetlinkMessage>>> {
            let mut messages = Vec::new();
            'outer: loop {
                self.buffer.clear();
                let len = self
                    .socket
                    .recv(&mut self.buffer, 0)
                    .map_err(|e| LinkMonitorError::Netlink(format!("recv failed: {}", e)))?;

                let mut offset = 0;
                while offset < len {
                    let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(
                        &self.buffer[offset..len],
                    )
                    .map_err(|e| {
                        LinkMonitorError::Netlink(format!("cannot parse message: {}", e))
                    })?;
                    let size = msg.header.length as usize;
                    if size == 0 {
                        break;
                    }
                    offset += (size + 3) & !3;
                    match &msg.payload {
                        NetlinkPayload::Done(_) => break 'outer,
                        NetlinkPayload::Error(e) => {
                            return Err(LinkMonitorError::Netlink(format!(
                                "dump error: {:?}",
                                e
                            )));
                        }
                        _ => messages.push(msg),
                    }
                }
            }
            Ok(messages)
        }
    }

    #[async_trait]
    impl LinkProvider for NetlinkLinkProvider {
        async fn get_all_links(&mut self) -> Result<Vec<LinkInfo>> {
            self.request_dump(RouteNetlinkMessage::GetLink(LinkMessage::default()))?;
            let mut links = Vec::new();
            for msg in self.collect_dump()? {
                if let NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) =
                    &msg.payload
                {
                    if let Some(info) = parse_link(link, true) {
                        links.push(info);
                    }
                }
            }
            Ok(links)
        }

        async fn get_all_addresses(&mut self) -> Result<Vec<AddrInfo>> {
            self.request_dump(RouteNetlinkMessage::GetAddress(AddressMessage::default()))?;
            let mut addrs = Vec::new();
            for msg in self.collect_dump()? {
                if let NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewAddress(addr)) =
                    &msg.payload
                {
                    if let Some(info) = parse_addr(addr) {
                        addrs.push(info);
                    }
                }
            }
            Ok(addrs)
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::{NetlinkEventSocket, NetlinkLinkProvider};
