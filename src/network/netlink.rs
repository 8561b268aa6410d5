//! rtnetlink requests for links, addresses and routes
//!
//! A handle operates on the network namespace of the thread that opened it.

use crate::error::{CorralError, Result};
use ipnetwork::Ipv4Network;
use std::ffi::CString;
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

const NETLINK_ROUTE: i32 = 0;

const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_NEWADDR: u16 = 20;
const RTM_NEWROUTE: u16 = 24;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;

const NLA_F_NESTED: u16 = 1 << 15;

const IFF_UP: u32 = 0x1;

const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_MASTER: u16 = 10;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_FD: u16 = 28;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

const RTA_GATEWAY: u16 = 5;
const RTA_OIF: u16 = 4;

const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTN_UNICAST: u8 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IfInfoMsg {
    ifi_family: u8,
    _pad: u8,
    ifi_type: u16,
    ifi_index: i32,
    ifi_flags: u32,
    ifi_change: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct IfAddrMsg {
    ifa_family: u8,
    ifa_prefixlen: u8,
    ifa_flags: u8,
    ifa_scope: u8,
    ifa_index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RtMsg {
    rtm_family: u8,
    rtm_dst_len: u8,
    rtm_src_len: u8,
    rtm_tos: u8,
    rtm_table: u8,
    rtm_protocol: u8,
    rtm_scope: u8,
    rtm_type: u8,
    rtm_flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlAttr {
    nla_len: u16,
    nla_type: u16,
}

fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Builder for one request: header, fixed payload, then attributes
struct Message {
    buf: Vec<u8>,
    nests: Vec<usize>,
    kind: u16,
    flags: u16,
}

impl Message {
    fn new<T: Copy>(kind: u16, flags: u16, payload: &T) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        buf.extend_from_slice(as_bytes(payload));
        Self {
            buf,
            nests: Vec::new(),
            kind,
            flags: flags | NLM_F_REQUEST | NLM_F_ACK,
        }
    }

    fn attr(&mut self, kind: u16, value: &[u8]) -> &mut Self {
        let len = mem::size_of::<NlAttr>() + value.len();
        let header = NlAttr {
            nla_len: len as u16,
            nla_type: kind,
        };
        self.buf.extend_from_slice(as_bytes(&header));
        self.buf.extend_from_slice(value);
        self.buf.resize(align4(self.buf.len()), 0);
        self
    }

    fn attr_str(&mut self, kind: u16, value: &str) -> &mut Self {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.attr(kind, &bytes)
    }

    fn attr_u32(&mut self, kind: u16, value: u32) -> &mut Self {
        self.attr(kind, &value.to_ne_bytes())
    }

    /// Raw bytes inside the current nest, used for the veth peer's ifinfomsg
    fn raw<T: Copy>(&mut self, value: &T) -> &mut Self {
        self.buf.extend_from_slice(as_bytes(value));
        self.buf.resize(align4(self.buf.len()), 0);
        self
    }

    fn begin_nested(&mut self, kind: u16) -> &mut Self {
        self.nests.push(self.buf.len());
        let header = NlAttr {
            nla_len: 0,
            nla_type: kind | NLA_F_NESTED,
        };
        self.buf.extend_from_slice(as_bytes(&header));
        self
    }

    fn end_nested(&mut self) -> &mut Self {
        if let Some(start) = self.nests.pop() {
            let len = (self.buf.len() - start) as u16;
            self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
        }
        self
    }

    fn finish(mut self, seq: u32) -> Vec<u8> {
        let header = NlMsgHdr {
            nlmsg_len: self.buf.len() as u32,
            nlmsg_type: self.kind,
            nlmsg_flags: self.flags,
            nlmsg_seq: seq,
            nlmsg_pid: 0,
        };
        self.buf[..mem::size_of::<NlMsgHdr>()].copy_from_slice(as_bytes(&header));
        self.buf
    }
}

fn link_msg(kind: u16, flags: u16, ifindex: u32) -> Message {
    let info = IfInfoMsg {
        ifi_family: libc::AF_UNSPEC as u8,
        ifi_index: ifindex as i32,
        ..Default::default()
    };
    Message::new(kind, flags, &info)
}

/// Netlink route socket
pub struct NetlinkHandle {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkHandle {
    /// Open a route socket in the calling thread's network namespace
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(CorralError::external(
                "open netlink socket",
                io::Error::last_os_error(),
            ));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_pid = 0;
        addr.nl_groups = 0;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if ret < 0 {
            return Err(CorralError::external(
                "bind netlink socket",
                io::Error::last_os_error(),
            ));
        }

        Ok(Self { fd, seq: 0 })
    }

    fn request(&mut self, context: &str, message: Message) -> Result<()> {
        self.seq = self.seq.wrapping_add(1);
        let msg = message.finish(self.seq);

        let sent = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if sent < 0 {
            return Err(CorralError::external(context, io::Error::last_os_error()));
        }

        let mut buf = [0u8; 4096];
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if len < 0 {
            return Err(CorralError::external(context, io::Error::last_os_error()));
        }

        let header_len = mem::size_of::<NlMsgHdr>();
        if len as usize >= header_len + 4 {
            let header = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const NlMsgHdr) };
            if header.nlmsg_type == libc::NLMSG_ERROR as u16 {
                let code = i32::from_ne_bytes([
                    buf[header_len],
                    buf[header_len + 1],
                    buf[header_len + 2],
                    buf[header_len + 3],
                ]);
                if code != 0 {
                    return Err(CorralError::external(
                        context,
                        io::Error::from_raw_os_error(-code),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Interface index for `name`, `None` when there is no such link
    pub fn ifindex(&self, name: &str) -> Result<Option<u32>> {
        let c_name =
            CString::new(name).map_err(|e| CorralError::InvalidArgument(e.to_string()))?;
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        Ok((index != 0).then_some(index))
    }

    pub fn require_ifindex(&self, name: &str) -> Result<u32> {
        self.ifindex(name)?.ok_or_else(|| {
            CorralError::external(
                format!("link {}", name),
                io::Error::from_raw_os_error(libc::ENODEV),
            )
        })
    }

    /// Create a bridge and return its index
    pub fn create_bridge(&mut self, name: &str) -> Result<u32> {
        let mut msg = link_msg(RTM_NEWLINK, NLM_F_CREATE | NLM_F_EXCL, 0);
        msg.attr_str(IFLA_IFNAME, name)
            .begin_nested(IFLA_LINKINFO)
            .attr_str(IFLA_INFO_KIND, "bridge")
            .end_nested();
        self.request(&format!("create bridge {}", name), msg)?;
        self.require_ifindex(name)
    }

    /// Create a veth pair and return the index of the `host` end
    pub fn create_veth(&mut self, host: &str, peer: &str) -> Result<u32> {
        let peer_info = IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ..Default::default()
        };
        let mut msg = link_msg(RTM_NEWLINK, NLM_F_CREATE | NLM_F_EXCL, 0);
        msg.attr_str(IFLA_IFNAME, host)
            .begin_nested(IFLA_LINKINFO)
            .attr_str(IFLA_INFO_KIND, "veth")
            .begin_nested(IFLA_INFO_DATA)
            .begin_nested(VETH_INFO_PEER)
            .raw(&peer_info)
            .attr_str(IFLA_IFNAME, peer)
            .end_nested()
            .end_nested()
            .end_nested();
        self.request(&format!("create veth {}/{}", host, peer), msg)?;
        self.require_ifindex(host)
    }

    /// Delete a link; deleting one end of a veth removes both
    pub fn delete_link(&mut self, ifindex: u32) -> Result<()> {
        self.request("delete link", link_msg(RTM_DELLINK, 0, ifindex))
    }

    pub fn set_link_up(&mut self, ifindex: u32) -> Result<()> {
        let info = IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index: ifindex as i32,
            ifi_flags: IFF_UP,
            ifi_change: IFF_UP,
            ..Default::default()
        };
        self.request("set link up", Message::new(RTM_NEWLINK, 0, &info))
    }

    /// Enslave to `master`; zero detaches from any bridge
    pub fn set_master(&mut self, ifindex: u32, master: u32) -> Result<()> {
        let mut msg = link_msg(RTM_NEWLINK, 0, ifindex);
        msg.attr_u32(IFLA_MASTER, master);
        self.request("set link master", msg)
    }

    pub fn set_mac(&mut self, ifindex: u32, mac: [u8; 6]) -> Result<()> {
        let mut msg = link_msg(RTM_NEWLINK, 0, ifindex);
        msg.attr(IFLA_ADDRESS, &mac);
        self.request("set link address", msg)
    }

    /// Move a link into the namespace referred to by `netns_fd`
    pub fn move_to_netns(&mut self, ifindex: u32, netns_fd: RawFd) -> Result<()> {
        let mut msg = link_msg(RTM_NEWLINK, 0, ifindex);
        msg.attr_u32(IFLA_NET_NS_FD, netns_fd as u32);
        self.request("move link to namespace", msg)
    }

    pub fn add_address(&mut self, ifindex: u32, addr: Ipv4Network) -> Result<()> {
        let info = IfAddrMsg {
            ifa_family: libc::AF_INET as u8,
            ifa_prefixlen: addr.prefix(),
            ifa_flags: 0,
            ifa_scope: 0,
            ifa_index: ifindex,
        };
        let octets = addr.ip().octets();
        let mut msg = Message::new(RTM_NEWADDR, NLM_F_CREATE | NLM_F_EXCL, &info);
        msg.attr(IFA_LOCAL, &octets).attr(IFA_ADDRESS, &octets);
        self.request(&format!("add address {}", addr), msg)
    }

    /// Default route through `gateway` out of `ifindex`
    pub fn add_default_route(&mut self, gateway: Ipv4Addr, ifindex: u32) -> Result<()> {
        let route = RtMsg {
            rtm_family: libc::AF_INET as u8,
            rtm_dst_len: 0,
            rtm_src_len: 0,
            rtm_tos: 0,
            rtm_table: RT_TABLE_MAIN,
            rtm_protocol: RTPROT_BOOT,
            rtm_scope: RT_SCOPE_UNIVERSE,
            rtm_type: RTN_UNICAST,
            rtm_flags: 0,
        };
        let mut msg = Message::new(RTM_NEWROUTE, NLM_F_CREATE | NLM_F_EXCL, &route);
        msg.attr(RTA_GATEWAY, &gateway.octets())
            .attr_u32(RTA_OIF, ifindex);
        self.request(&format!("add default route via {}", gateway), msg)
    }
}
