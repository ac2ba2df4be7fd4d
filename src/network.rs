//! Brings the loopback interface up inside a fresh network namespace.
//!
//! A fresh `CLONE_NEWNET` namespace starts with `lo` present but down; the
//! spec asks only for loopback, not a bridge or a NAT device (an explicit
//! Non-goal), so this is the full extent of network setup the child does.
//! Grounded on the `SIOCGIFFLAGS`/`SIOCSIFFLAGS` ioctl pair used by
//! `run_in_container` in the pack's other_examples.

use std::os::fd::AsRawFd;

use nix::errno::Errno;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};

use crate::Error;

const LOOPBACK: &str = "lo";

/// Brings `lo` up. Must run after the identity-map handshake (bringing an
/// interface up requires `CAP_NET_ADMIN` in the new user namespace) and
/// before the user command execs.
pub fn bring_up_loopback() -> Result<(), Error> {
    let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )
    .map_err(|e| format!("cannot open netlink control socket: {e}"))?;

    let mut ifreq = new_ifreq(LOOPBACK);
    let res = unsafe { nix::libc::ioctl(sock.as_raw_fd(), nix::libc::SIOCGIFFLAGS, &mut ifreq) };
    Errno::result(res).map_err(|e| format!("SIOCGIFFLAGS lo: {e}"))?;

    unsafe {
        ifreq.ifr_ifru.ifru_flags |= (nix::libc::IFF_UP | nix::libc::IFF_RUNNING) as i16;
    }
    let res = unsafe { nix::libc::ioctl(sock.as_raw_fd(), nix::libc::SIOCSIFFLAGS, &ifreq) };
    Errno::result(res).map_err(|e| format!("SIOCSIFFLAGS lo: {e}"))?;
    Ok(())
}

fn new_ifreq(name: &str) -> nix::libc::ifreq {
    let mut ifr_name = [0i8; nix::libc::IFNAMSIZ];
    for (dst, src) in ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as i8;
    }
    nix::libc::ifreq {
        ifr_name,
        ifr_ifru: nix::libc::__c_anonymous_ifr_ifru { ifru_flags: 0 },
    }
}
