//! Low-level link management over a raw `NETLINK_ROUTE` socket: bridge and
//! veth creation, addresses, routes, and moving interfaces between network
//! namespaces. A handle answers requests in the network namespace its
//! socket was created in, which is how container-side interfaces get
//! configured from the host.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use anyhow::{bail, Context, Result};
use ipnetwork::Ipv4Network;
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;

const NETLINK_ROUTE: i32 = 0;

const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_GETLINK: u16 = 18;
const RTM_NEWADDR: u16 = 20;
const RTM_NEWROUTE: u16 = 24;
const NLMSG_ERROR: u16 = 2;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;
const NLA_F_NESTED: u16 = 1 << 15;

const IFF_UP: u32 = 0x1;

const IFLA_IFNAME: u16 = 3;
const IFLA_MASTER: u16 = 10;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_PID: u16 = 19;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;

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

fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    // repr(C) plain-old-data structs only
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Appends one netlink attribute, padded to the 4-byte boundary.
fn put_attr(msg: &mut Vec<u8>, kind: u16, payload: &[u8]) {
    let len = (mem::size_of::<u32>() + payload.len()) as u16;
    msg.extend_from_slice(&len.to_ne_bytes());
    msg.extend_from_slice(&kind.to_ne_bytes());
    msg.extend_from_slice(payload);
    msg.resize(align4(msg.len()), 0);
}

fn put_attr_str(msg: &mut Vec<u8>, kind: u16, value: &str) {
    let mut payload = value.as_bytes().to_vec();
    payload.push(0);
    put_attr(msg, kind, &payload);
}

fn put_attr_u32(msg: &mut Vec<u8>, kind: u16, value: u32) {
    put_attr(msg, kind, &value.to_ne_bytes());
}

/// Reserves space for a nested attribute and returns its offset for
/// [`end_nested`].
fn begin_nested(msg: &mut Vec<u8>) -> usize {
    let offset = msg.len();
    msg.extend_from_slice(&[0u8; 4]);
    offset
}

fn end_nested(msg: &mut Vec<u8>, offset: usize, kind: u16) {
    let len = (msg.len() - offset) as u16;
    msg[offset..offset + 2].copy_from_slice(&len.to_ne_bytes());
    msg[offset + 2..offset + 4].copy_from_slice(&(kind | NLA_F_NESTED).to_ne_bytes());
}

pub struct Netlink {
    fd: OwnedFd,
    seq: u32,
}

impl Netlink {
    /// Opens a `NETLINK_ROUTE` socket in the current network namespace.
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            bail!("create netlink socket: {}", io::Error::last_os_error());
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
            bail!("bind netlink socket: {}", io::Error::last_os_error());
        }

        Ok(Self { fd, seq: 0 })
    }

    /// Opens a handle bound to the network namespace of `pid`. The socket is
    /// created while temporarily joined to the target namespace and keeps
    /// answering there after the calling thread switches back.
    pub fn in_namespace_of(pid: i32) -> Result<Self> {
        let own_ns = open(
            "/proc/self/ns/net",
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .context("open own netns")?;
        let target_ns = open(
            format!("/proc/{pid}/ns/net").as_str(),
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .with_context(|| format!("open netns of pid {pid}"));

        let target_ns = match target_ns {
            Ok(fd) => fd,
            Err(e) => {
                let _ = close(own_ns);
                return Err(e);
            }
        };

        let result = setns(target_ns, CloneFlags::CLONE_NEWNET)
            .context("enter target netns")
            .and_then(|_| {
                let handle = Self::new();
                setns(own_ns, CloneFlags::CLONE_NEWNET).context("return to own netns")?;
                handle
            });

        let _ = close(own_ns);
        let _ = close(target_ns);
        result
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send(&self, msg: &[u8]) -> Result<()> {
        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if ret < 0 {
            bail!("send netlink message: {}", io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 8192];
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if len < 0 {
            bail!("receive netlink response: {}", io::Error::last_os_error());
        }
        buf.truncate(len as usize);
        Ok(buf)
    }

    /// Sends a request and consumes the kernel acknowledgement, turning a
    /// non-zero `NLMSG_ERROR` into an error.
    fn send_and_ack(&mut self, msg: &[u8]) -> Result<()> {
        self.send(msg)?;
        let buf = self.recv()?;
        if let Some(errno) = decode_error(&buf) {
            bail!("netlink: {}", io::Error::from_raw_os_error(errno));
        }
        Ok(())
    }

    /// Builds the fixed message prefix: header placeholder plus `ifinfomsg`.
    fn start_link_msg(&mut self, ifindex: i32, flags: u32, change: u32) -> Vec<u8> {
        let mut msg = Vec::with_capacity(256);
        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        let ifinfo = IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index: ifindex,
            ifi_flags: flags,
            ifi_change: change,
            ..Default::default()
        };
        msg.extend_from_slice(as_bytes(&ifinfo));
        msg
    }

    fn finish(&mut self, msg: &mut [u8], nlmsg_type: u16, nlmsg_flags: u16) {
        let hdr = NlMsgHdr {
            nlmsg_len: msg.len() as u32,
            nlmsg_type,
            nlmsg_flags,
            nlmsg_seq: self.next_seq(),
            nlmsg_pid: 0,
        };
        msg[..mem::size_of::<NlMsgHdr>()].copy_from_slice(as_bytes(&hdr));
    }

    /// Resolves an interface name to its index in the handle's namespace.
    pub fn ifindex(&mut self, name: &str) -> Result<u32> {
        let mut msg = self.start_link_msg(0, 0, 0);
        put_attr_str(&mut msg, IFLA_IFNAME, name);
        self.finish(&mut msg, RTM_GETLINK, NLM_F_REQUEST);
        self.send(&msg)?;

        let buf = self.recv()?;
        if let Some(errno) = decode_error(&buf) {
            bail!(
                "link {name}: {}",
                io::Error::from_raw_os_error(errno)
            );
        }
        if buf.len() < mem::size_of::<NlMsgHdr>() + mem::size_of::<IfInfoMsg>() {
            bail!("short netlink response for link {name}");
        }
        let ifinfo =
            unsafe { &*(buf.as_ptr().add(mem::size_of::<NlMsgHdr>()) as *const IfInfoMsg) };
        Ok(ifinfo.ifi_index as u32)
    }

    pub fn link_exists(&mut self, name: &str) -> bool {
        self.ifindex(name).is_ok()
    }

    pub fn create_bridge(&mut self, name: &str) -> Result<()> {
        let mut msg = self.start_link_msg(0, 0, 0);
        put_attr_str(&mut msg, IFLA_IFNAME, name);
        let linkinfo = begin_nested(&mut msg);
        put_attr_str(&mut msg, IFLA_INFO_KIND, "bridge");
        end_nested(&mut msg, linkinfo, IFLA_LINKINFO);
        self.finish(
            &mut msg,
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        self.send_and_ack(&msg)
            .with_context(|| format!("create bridge {name}"))
    }

    /// Creates a veth pair; `name` stays in the current namespace, `peer` is
    /// the end destined for a container.
    pub fn create_veth(&mut self, name: &str, peer: &str) -> Result<()> {
        let mut msg = self.start_link_msg(0, 0, 0);
        put_attr_str(&mut msg, IFLA_IFNAME, name);
        let linkinfo = begin_nested(&mut msg);
        put_attr_str(&mut msg, IFLA_INFO_KIND, "veth");
        let infodata = begin_nested(&mut msg);
        // VETH_INFO_PEER carries a whole link message for the peer end
        let peer_attr = begin_nested(&mut msg);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ..Default::default()
        }));
        put_attr_str(&mut msg, IFLA_IFNAME, peer);
        end_nested(&mut msg, peer_attr, VETH_INFO_PEER);
        end_nested(&mut msg, infodata, IFLA_INFO_DATA);
        end_nested(&mut msg, linkinfo, IFLA_LINKINFO);
        self.finish(
            &mut msg,
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        self.send_and_ack(&msg)
            .with_context(|| format!("create veth {name}/{peer}"))
    }

    pub fn delete_link(&mut self, name: &str) -> Result<()> {
        let ifindex = self.ifindex(name)?;
        let mut msg = self.start_link_msg(ifindex as i32, 0, 0);
        self.finish(&mut msg, RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK);
        self.send_and_ack(&msg)
            .with_context(|| format!("delete link {name}"))
    }

    pub fn set_up(&mut self, name: &str) -> Result<()> {
        let ifindex = self.ifindex(name)?;
        let mut msg = self.start_link_msg(ifindex as i32, IFF_UP, IFF_UP);
        self.finish(&mut msg, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        self.send_and_ack(&msg)
            .with_context(|| format!("set link {name} up"))
    }

    pub fn set_master(&mut self, name: &str, master: &str) -> Result<()> {
        let master_index = self.ifindex(master)?;
        let ifindex = self.ifindex(name)?;
        let mut msg = self.start_link_msg(ifindex as i32, 0, 0);
        put_attr_u32(&mut msg, IFLA_MASTER, master_index);
        self.finish(&mut msg, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        self.send_and_ack(&msg)
            .with_context(|| format!("attach {name} to {master}"))
    }

    pub fn rename(&mut self, name: &str, new_name: &str) -> Result<()> {
        let ifindex = self.ifindex(name)?;
        let mut msg = self.start_link_msg(ifindex as i32, 0, 0);
        put_attr_str(&mut msg, IFLA_IFNAME, new_name);
        self.finish(&mut msg, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        self.send_and_ack(&msg)
            .with_context(|| format!("rename {name} to {new_name}"))
    }

    /// Moves an interface into the network namespace of `pid`.
    pub fn move_to_pid_netns(&mut self, name: &str, pid: i32) -> Result<()> {
        let ifindex = self.ifindex(name)?;
        let mut msg = self.start_link_msg(ifindex as i32, 0, 0);
        put_attr_u32(&mut msg, IFLA_NET_NS_PID, pid as u32);
        self.finish(&mut msg, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        self.send_and_ack(&msg)
            .with_context(|| format!("move {name} to netns of pid {pid}"))
    }

    pub fn add_address(&mut self, name: &str, addr: Ipv4Network) -> Result<()> {
        let ifindex = self.ifindex(name)?;
        let mut msg = Vec::with_capacity(128);
        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        let ifaddr = IfAddrMsg {
            ifa_family: libc::AF_INET as u8,
            ifa_prefixlen: addr.prefix(),
            ifa_flags: 0,
            ifa_scope: 0,
            ifa_index: ifindex,
        };
        msg.extend_from_slice(as_bytes(&ifaddr));
        put_attr(&mut msg, IFA_LOCAL, &addr.ip().octets());
        put_attr(&mut msg, IFA_ADDRESS, &addr.ip().octets());
        self.finish(
            &mut msg,
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        self.send_and_ack(&msg)
            .with_context(|| format!("add address {addr} to {name}"))
    }

    /// Installs a default route through `gateway` on `name`.
    pub fn add_default_route(&mut self, name: &str, gateway: Ipv4Addr) -> Result<()> {
        let ifindex = self.ifindex(name)?;
        let mut msg = Vec::with_capacity(128);
        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        let rtmsg = RtMsg {
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
        msg.extend_from_slice(as_bytes(&rtmsg));
        put_attr(&mut msg, RTA_GATEWAY, &gateway.octets());
        put_attr_u32(&mut msg, RTA_OIF, ifindex);
        self.finish(
            &mut msg,
            RTM_NEWROUTE,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE,
        );
        self.send_and_ack(&msg)
            .with_context(|| format!("add default route via {gateway}"))
    }
}

/// Extracts the errno of an `NLMSG_ERROR` response; `None` when the reply is
/// not an error message, `Some(0)` never (a zero code is the ack).
fn decode_error(buf: &[u8]) -> Option<i32> {
    if buf.len() < mem::size_of::<NlMsgHdr>() + 4 {
        return None;
    }
    let hdr = unsafe { &*(buf.as_ptr() as *const NlMsgHdr) };
    if hdr.nlmsg_type != NLMSG_ERROR {
        return None;
    }
    let code = unsafe { *(buf.as_ptr().add(mem::size_of::<NlMsgHdr>()) as *const i32) };
    if code == 0 {
        None
    } else {
        Some(-code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align4() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align4(5), 8);
    }

    #[test]
    fn test_put_attr_pads_payload() {
        let mut msg = Vec::new();
        put_attr_str(&mut msg, IFLA_IFNAME, "eth0");
        // 4 byte header + "eth0\0" padded to 8
        assert_eq!(msg.len(), 12);
        assert_eq!(u16::from_ne_bytes([msg[0], msg[1]]), 9);
        assert_eq!(u16::from_ne_bytes([msg[2], msg[3]]), IFLA_IFNAME);
        assert_eq!(&msg[4..9], b"eth0\0");
    }

    #[test]
    fn test_nested_attr_framing() {
        let mut msg = Vec::new();
        let nested = begin_nested(&mut msg);
        put_attr_str(&mut msg, IFLA_INFO_KIND, "bridge");
        end_nested(&mut msg, nested, IFLA_LINKINFO);

        let len = u16::from_ne_bytes([msg[0], msg[1]]);
        let kind = u16::from_ne_bytes([msg[2], msg[3]]);
        assert_eq!(len as usize, msg.len());
        assert_eq!(kind, IFLA_LINKINFO | NLA_F_NESTED);
    }

    #[test]
    fn test_decode_error() {
        // a 16-byte header with NLMSG_ERROR type followed by errno -19 (ENODEV)
        let hdr = NlMsgHdr {
            nlmsg_len: 20,
            nlmsg_type: NLMSG_ERROR,
            nlmsg_flags: 0,
            nlmsg_seq: 1,
            nlmsg_pid: 0,
        };
        let mut buf = as_bytes(&hdr).to_vec();
        buf.extend_from_slice(&(-19i32).to_ne_bytes());
        assert_eq!(decode_error(&buf), Some(19));

        let mut ack = as_bytes(&hdr).to_vec();
        ack.extend_from_slice(&0i32.to_ne_bytes());
        assert_eq!(decode_error(&ack), None);
    }
}
