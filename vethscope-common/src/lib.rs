//! Record layouts shared between the eBPF programs and userspace
//!
//! Every struct here crosses the kernel/user boundary and must be:
//! - `#[repr(C)]` for stable memory layout
//! - `no_std` compatible for the eBPF side
//! - field-for-field identical to the C definitions in the probe objects

#![cfg_attr(not(feature = "user"), no_std)]

pub const METHOD_LEN: usize = 8;
pub const PATH_LEN: usize = 128;
pub const VERSION_LEN: usize = 16;
pub const STATUS_LEN: usize = 8;
pub const COMM_LEN: usize = 16;
pub const MAX_USER_STACK: usize = 50;

/// `framing` discriminator values in [`RpcRecord`]
pub const RPC_FRAMING_HTTP: u8 = 0;
pub const RPC_FRAMING_DUBBO: u8 = 1;

/// One completed HTTP exchange captured on a veth interface.
///
/// Addresses and ports are in network byte order as read off the wire.
/// Duration is derived in userspace from the two wall-clock timestamps.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct HttpRecord {
    pub method: [u8; METHOD_LEN],
    pub path: [u8; PATH_LEN],
    pub version: [u8; VERSION_LEN],
    pub status_code: u16,
    pub src_port: u16,
    pub dst_port: u16,
    pub _pad: u16,
    pub src_addr: u32,
    pub dst_addr: u32,
    pub begin_ns: u64,
    pub end_ns: u64,
}

/// One completed RPC exchange (HTTP-like or Dubbo framing).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RpcRecord {
    pub path: [u8; PATH_LEN],
    pub status: [u8; STATUS_LEN],
    pub framing: u8,
    pub _pad: [u8; 3],
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub duration_ns: u64,
}

/// Snapshot of an OOM kill taken by the `oom_kill_process` kprobe.
///
/// `user_stack_size` is the byte count returned by `bpf_get_stack`; negative
/// on failure.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct OomRecord {
    pub pid: u32,
    pub comm: [u8; COMM_LEN],
    pub cgroup_id: u32,
    pub user_stack_size: i32,
    pub user_stack: [u64; MAX_USER_STACK],
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for HttpRecord {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for RpcRecord {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for OomRecord {}

#[cfg(feature = "user")]
const _: () = {
    assert!(
        core::mem::size_of::<HttpRecord>() == 184,
        "HttpRecord must be exactly 184 bytes"
    );
    assert!(
        core::mem::size_of::<RpcRecord>() == 160,
        "RpcRecord must be exactly 160 bytes"
    );
    assert!(
        core::mem::size_of::<OomRecord>() == 432,
        "OomRecord must be exactly 432 bytes"
    );
    assert!(
        core::mem::align_of::<HttpRecord>() == 8,
        "HttpRecord must be 8-byte aligned"
    );
};
