//! Raw kernel events and ring-buffer record decoding
//!
//! Records arrive as fixed-size `#[repr(C)]` structs (see `vethscope-common`)
//! and are validated by length before being read, the same way the probe
//! loader treats any byte slice coming out of a kernel map as untrusted.

use crate::error::{AgentError, Result};
use std::mem;
use std::net::Ipv4Addr;
use std::ptr;
use vethscope_common::{HttpRecord, OomRecord, RpcRecord, MAX_USER_STACK, RPC_FRAMING_DUBBO};

/// Capacity of the shared event channel feeding the enricher.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub enum RawEvent {
    Http(HttpExchange),
    Rpc(RpcExchange),
    OomKill(OomKillEvent),
}

#[derive(Debug, Clone)]
pub struct HttpExchange {
    pub method: String,
    pub path: String,
    pub version: String,
    pub status_code: u16,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub duration_ns: u64,
}

#[derive(Debug, Clone)]
pub struct RpcExchange {
    pub path: String,
    pub status: String,
    pub framing: RpcFraming,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub duration_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcFraming {
    Http,
    Dubbo,
}

impl RpcFraming {
    pub fn from_wire(value: u8) -> Self {
        if value == RPC_FRAMING_DUBBO {
            RpcFraming::Dubbo
        } else {
            RpcFraming::Http
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RpcFraming::Http => "http",
            RpcFraming::Dubbo => "dubbo",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OomKillEvent {
    pub pid: u32,
    pub comm: String,
    pub cgroup_id: u32,
    pub user_stack: Vec<u64>,
}

impl HttpExchange {
    pub fn from_record(rec: &HttpRecord) -> Self {
        Self {
            method: fixed_str(&rec.method),
            path: fixed_str(&rec.path),
            version: fixed_str(&rec.version),
            status_code: rec.status_code,
            src_ip: ipv4(rec.src_addr),
            src_port: u16::from_be(rec.src_port),
            dst_ip: ipv4(rec.dst_addr),
            dst_port: u16::from_be(rec.dst_port),
            duration_ns: rec.end_ns.saturating_sub(rec.begin_ns),
        }
    }
}

impl RpcExchange {
    pub fn from_record(rec: &RpcRecord) -> Self {
        Self {
            path: fixed_str(&rec.path),
            status: fixed_str(&rec.status),
            framing: RpcFraming::from_wire(rec.framing),
            src_ip: ipv4(rec.src_addr),
            src_port: u16::from_be(rec.src_port),
            dst_ip: ipv4(rec.dst_addr),
            dst_port: u16::from_be(rec.dst_port),
            duration_ns: rec.duration_ns,
        }
    }
}

impl OomKillEvent {
    pub fn from_record(rec: &OomRecord) -> Self {
        // user_stack_size is in bytes; negative means bpf_get_stack failed
        let frames = (rec.user_stack_size.max(0) as usize / mem::size_of::<u64>())
            .min(MAX_USER_STACK);
        Self {
            pid: rec.pid,
            comm: fixed_str(&rec.comm),
            cgroup_id: rec.cgroup_id,
            user_stack: rec.user_stack[..frames].to_vec(),
        }
    }
}

/// Decode one HTTP ring-buffer record.
pub fn decode_http(data: &[u8]) -> Result<RawEvent> {
    let rec: HttpRecord = read_record(data, "http")?;
    Ok(RawEvent::Http(HttpExchange::from_record(&rec)))
}

/// Decode one RPC ring-buffer record.
pub fn decode_rpc(data: &[u8]) -> Result<RawEvent> {
    let rec: RpcRecord = read_record(data, "rpc")?;
    Ok(RawEvent::Rpc(RpcExchange::from_record(&rec)))
}

fn read_record<T: Copy>(data: &[u8], kind: &'static str) -> Result<T> {
    let expected = mem::size_of::<T>();
    if data.len() != expected {
        return Err(AgentError::Decode {
            kind,
            expected,
            got: data.len(),
        });
    }
    Ok(unsafe { ptr::read_unaligned(data.as_ptr() as *const T) })
}

/// NUL-terminated bounded string out of a fixed-size field.
fn fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Addresses are carried in network byte order.
fn ipv4(addr: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from_be(addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vethscope_common::{METHOD_LEN, PATH_LEN, STATUS_LEN, VERSION_LEN};

    fn fixed<const N: usize>(s: &str) -> [u8; N] {
        let mut buf = [0u8; N];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        buf
    }

    fn http_record() -> HttpRecord {
        HttpRecord {
            method: fixed::<METHOD_LEN>("GET"),
            path: fixed::<PATH_LEN>("/api"),
            version: fixed::<VERSION_LEN>("HTTP/1.1"),
            status_code: 200,
            src_port: 40000u16.to_be(),
            dst_port: 8080u16.to_be(),
            _pad: 0,
            src_addr: u32::from(Ipv4Addr::new(10, 0, 0, 1)).to_be(),
            dst_addr: u32::from(Ipv4Addr::new(10, 0, 0, 2)).to_be(),
            begin_ns: 1_000,
            end_ns: 51_000,
        }
    }

    #[test]
    fn test_decode_http_record() {
        let rec = http_record();
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &rec as *const HttpRecord as *const u8,
                mem::size_of::<HttpRecord>(),
            )
        };

        let event = decode_http(bytes).expect("record should decode");
        let RawEvent::Http(ex) = event else {
            panic!("expected http event");
        };
        assert_eq!(ex.method, "GET");
        assert_eq!(ex.path, "/api");
        assert_eq!(ex.version, "HTTP/1.1");
        assert_eq!(ex.src_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ex.dst_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ex.src_port, 40000);
        assert_eq!(ex.dst_port, 8080);
        assert_eq!(ex.duration_ns, 50_000);
    }

    #[test]
    fn test_decode_rejects_truncated_record() {
        let err = decode_http(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, AgentError::Decode { got: 10, .. }));

        let err = decode_rpc(&[0u8; 3]).unwrap_err();
        assert!(matches!(err, AgentError::Decode { got: 3, .. }));
    }

    #[test]
    fn test_rpc_framing_from_wire() {
        let mut rec = RpcRecord {
            path: fixed::<PATH_LEN>("com.acme.Svc/hello"),
            status: fixed::<STATUS_LEN>("20"),
            framing: RPC_FRAMING_DUBBO,
            _pad: [0; 3],
            src_addr: 0,
            dst_addr: 0,
            src_port: 0,
            dst_port: 0,
            duration_ns: 7,
        };
        let ex = RpcExchange::from_record(&rec);
        assert_eq!(ex.framing, RpcFraming::Dubbo);
        assert_eq!(ex.status, "20");
        assert_eq!(ex.duration_ns, 7);

        rec.framing = 0;
        assert_eq!(RpcExchange::from_record(&rec).framing, RpcFraming::Http);
        // unknown discriminators fall back to the HTTP framing
        rec.framing = 9;
        assert_eq!(RpcExchange::from_record(&rec).framing, RpcFraming::Http);
    }

    #[test]
    fn test_oom_stack_clamped_to_reported_bytes() {
        let mut rec = OomRecord {
            pid: 42,
            comm: fixed::<16>("java"),
            cgroup_id: 7,
            user_stack_size: 3 * 8,
            user_stack: [0xdead; MAX_USER_STACK],
        };
        let ev = OomKillEvent::from_record(&rec);
        assert_eq!(ev.comm, "java");
        assert_eq!(ev.user_stack.len(), 3);

        rec.user_stack_size = -14; // bpf_get_stack failure
        assert!(OomKillEvent::from_record(&rec).user_stack.is_empty());

        rec.user_stack_size = i32::MAX;
        assert_eq!(
            OomKillEvent::from_record(&rec).user_stack.len(),
            MAX_USER_STACK
        );
    }
}
