//! Control message (ancillary data) decoding
//!
//! With `IP_RECVORIGDSTADDR` / `IPV6_RECVORIGDSTADDR` enabled, the kernel
//! attaches the datagram's original destination to every `recvmsg` as a
//! control message carrying a `sockaddr_in` / `sockaddr_in6`.
//!
//! Decoding is a pure function over the raw control buffer so it can be
//! tested without sockets. Records use the Linux `cmsghdr` framing:
//!
//! ```text
//! +-----------+-----------+----------+---------+---------------+
//! | cmsg_len  | cmsg_level| cmsg_type| padding | data ...      |
//! | (usize)   | (c_int)   | (c_int)  |         |               |
//! +-----------+-----------+----------+---------+---------------+
//! ```
//!
//! Headers and the start of each record are aligned to `size_of::<usize>()`.

use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::Range;

use super::socket::{IPV6_RECVORIGDSTADDR, IP_RECVORIGDSTADDR};
use crate::error::DecodeError;
use crate::session::{AddressFamily, Endpoint};

/// Where the port and address live inside an original-destination payload
#[derive(Debug)]
struct OrigDstLayout {
    family: AddressFamily,
    level: libc::c_int,
    kind: libc::c_int,
    port: Range<usize>,
    addr: Range<usize>,
}

/// `sockaddr_in`: port at bytes 2..4, address at 4..8.
/// `sockaddr_in6`: port at bytes 2..4, address at 8..24.
static LAYOUTS: [OrigDstLayout; 2] = [
    OrigDstLayout {
        family: AddressFamily::Ipv4,
        level: libc::SOL_IP,
        kind: IP_RECVORIGDSTADDR,
        port: 2..4,
        addr: 4..8,
    },
    OrigDstLayout {
        family: AddressFamily::Ipv6,
        level: libc::SOL_IPV6,
        kind: IPV6_RECVORIGDSTADDR,
        port: 2..4,
        addr: 8..24,
    },
];

impl OrigDstLayout {
    fn find(level: libc::c_int, kind: libc::c_int) -> Option<&'static Self> {
        LAYOUTS.iter().find(|l| l.level == level && l.kind == kind)
    }

    fn decode(&self, data: &[u8]) -> Result<Endpoint, DecodeError> {
        let expected = self.addr.end.max(self.port.end);
        if data.len() < expected {
            return Err(DecodeError::Truncated {
                expected,
                actual: data.len(),
            });
        }

        let port = u16::from_be_bytes([data[self.port.start], data[self.port.start + 1]]);
        let raw = &data[self.addr.clone()];
        let ip = match self.family {
            AddressFamily::Ipv4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(raw);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            AddressFamily::Ipv6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(raw);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };

        Ok(Endpoint::new(ip, port))
    }
}

const fn cmsg_align(len: usize) -> usize {
    let align = mem::size_of::<usize>();
    (len + align - 1) & !(align - 1)
}

const HEADER_LEN: usize = mem::size_of::<libc::cmsghdr>();

/// One control message record borrowed from a control buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage<'a> {
    /// `cmsg_level`
    pub level: libc::c_int,
    /// `cmsg_type`
    pub kind: libc::c_int,
    /// Record payload (without header or trailing padding)
    pub data: &'a [u8],
}

/// Iterator over the records of a control buffer.
///
/// Yields `Err(DecodeError::Malformed)` once and then stops if a header
/// is inconsistent with the buffer.
#[derive(Debug, Clone)]
pub struct ControlMessages<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> ControlMessages<'a> {
    /// Iterate over the records in `buf`
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            failed: false,
        }
    }

    fn malformed(&mut self, reason: String) -> Option<Result<ControlMessage<'a>, DecodeError>> {
        self.failed = true;
        Some(Err(DecodeError::Malformed(reason)))
    }
}

impl<'a> Iterator for ControlMessages<'a> {
    type Item = Result<ControlMessage<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.len().saturating_sub(self.offset) < HEADER_LEN {
            return None;
        }

        let start = self.offset;
        // SAFETY: at least HEADER_LEN bytes remain past `start`; read_unaligned
        // tolerates any alignment of the caller's buffer.
        let header = unsafe {
            std::ptr::read_unaligned(self.buf[start..].as_ptr().cast::<libc::cmsghdr>())
        };

        #[allow(clippy::unnecessary_cast)] // cmsg_len is u32 on some targets
        let len = header.cmsg_len as usize;
        let data_offset = cmsg_align(HEADER_LEN);
        if len < data_offset {
            return self.malformed(format!("record at {start} has length {len}"));
        }
        let Some(end) = start.checked_add(len).filter(|&e| e <= self.buf.len()) else {
            return self.malformed(format!(
                "record at {start} of length {len} exceeds buffer of {}",
                self.buf.len()
            ));
        };

        self.offset = start.saturating_add(cmsg_align(len));

        Some(Ok(ControlMessage {
            level: header.cmsg_level,
            kind: header.cmsg_type,
            data: &self.buf[start + data_offset..end],
        }))
    }
}

/// Decode the original destination from a control buffer.
///
/// Scans every record for `(SOL_IP, IP_RECVORIGDSTADDR)` or
/// `(SOL_IPV6, IPV6_RECVORIGDSTADDR)` and decodes the first one found.
///
/// # Errors
///
/// - [`DecodeError::NotFound`] if no matching record exists
/// - [`DecodeError::Truncated`] if the matching record is too short
/// - [`DecodeError::Malformed`] if record framing is broken before a match
pub fn decode_original_dst(control: &[u8]) -> Result<Endpoint, DecodeError> {
    for record in ControlMessages::new(control) {
        let record = record?;
        if let Some(layout) = OrigDstLayout::find(record.level, record.kind) {
            return layout.decode(record.data);
        }
    }
    Err(DecodeError::NotFound)
}

/// Append one record to a control buffer using kernel framing.
///
/// Useful for building synthetic ancillary data.
#[allow(clippy::cast_possible_truncation, clippy::unnecessary_cast)]
pub fn append_record(buf: &mut Vec<u8>, level: libc::c_int, kind: libc::c_int, payload: &[u8]) {
    let start = buf.len();
    let len = cmsg_align(HEADER_LEN) + payload.len();

    // SAFETY: cmsghdr is plain old data; zeroed is a valid value on every target.
    let mut header: libc::cmsghdr = unsafe { mem::zeroed() };
    header.cmsg_len = len as _;
    header.cmsg_level = level;
    header.cmsg_type = kind;

    // SAFETY: reading the bytes of a fully initialised POD header.
    let header_bytes = unsafe {
        std::slice::from_raw_parts(std::ptr::addr_of!(header).cast::<u8>(), HEADER_LEN)
    };
    buf.extend_from_slice(header_bytes);
    buf.resize(start + cmsg_align(HEADER_LEN), 0);
    buf.extend_from_slice(payload);
    buf.resize(start + cmsg_align(len), 0);
}

/// Build the `sockaddr_in` / `sockaddr_in6` payload the kernel would attach
/// for `endpoint`, and append it as an original-destination record.
pub fn append_original_dst(buf: &mut Vec<u8>, endpoint: &Endpoint) {
    let layout = match endpoint.family() {
        AddressFamily::Ipv4 => &LAYOUTS[0],
        AddressFamily::Ipv6 => &LAYOUTS[1],
    };

    let (mut payload, family) = match endpoint.ip() {
        IpAddr::V4(ip) => {
            let mut p = vec![0u8; mem::size_of::<libc::sockaddr_in>()];
            p[layout.addr.clone()].copy_from_slice(&ip.octets());
            (p, libc::AF_INET)
        }
        IpAddr::V6(ip) => {
            let mut p = vec![0u8; mem::size_of::<libc::sockaddr_in6>()];
            p[layout.addr.clone()].copy_from_slice(&ip.octets());
            (p, libc::AF_INET6)
        }
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let family = family as libc::sa_family_t;
    payload[0..2].copy_from_slice(&family.to_ne_bytes());
    payload[layout.port.clone()].copy_from_slice(&endpoint.port().to_be_bytes());

    append_record(buf, layout.level, layout.kind, &payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ipv4_record() {
        let mut payload = [0u8; 16];
        payload[2..4].copy_from_slice(&[0x01, 0xBB]);
        payload[4..8].copy_from_slice(&[93, 184, 216, 34]);

        let mut buf = Vec::new();
        append_record(&mut buf, libc::SOL_IP, IP_RECVORIGDSTADDR, &payload);

        let endpoint = decode_original_dst(&buf).unwrap();
        assert_eq!(endpoint.to_string(), "93.184.216.34:443");
        assert_eq!(endpoint.family(), AddressFamily::Ipv4);
    }

    #[test]
    fn test_decode_ipv6_record() {
        let target: Endpoint = "[2001:db8::53]:5353"
            .parse::<std::net::SocketAddr>()
            .unwrap()
            .into();
        let mut buf = Vec::new();
        append_original_dst(&mut buf, &target);

        assert_eq!(decode_original_dst(&buf).unwrap(), target);
    }

    #[test]
    fn test_empty_buffer_not_found() {
        assert_eq!(decode_original_dst(&[]), Err(DecodeError::NotFound));
    }

    #[test]
    fn test_unrelated_records_not_found() {
        let mut buf = Vec::new();
        // IP_TTL and IP_PKTINFO style records
        append_record(&mut buf, libc::SOL_IP, libc::IP_TTL, &64i32.to_ne_bytes());
        append_record(&mut buf, libc::SOL_SOCKET, 29, &[0u8; 16]);

        assert_eq!(decode_original_dst(&buf), Err(DecodeError::NotFound));
    }

    #[test]
    fn test_skips_records_before_match() {
        let target: Endpoint = "10.1.2.3:8080".parse::<std::net::SocketAddr>().unwrap().into();

        let mut buf = Vec::new();
        append_record(&mut buf, libc::SOL_IP, libc::IP_TTL, &[1, 2, 3]);
        append_original_dst(&mut buf, &target);

        assert_eq!(decode_original_dst(&buf).unwrap(), target);
    }

    #[test]
    fn test_wrong_level_is_ignored() {
        let mut payload = [0u8; 16];
        payload[2..4].copy_from_slice(&53u16.to_be_bytes());
        payload[4..8].copy_from_slice(&[8, 8, 8, 8]);

        let mut buf = Vec::new();
        // IPv4 type number at the IPv6 level is a different option
        append_record(&mut buf, libc::SOL_IPV6, IP_RECVORIGDSTADDR, &payload);

        assert_eq!(decode_original_dst(&buf), Err(DecodeError::NotFound));
    }

    #[test]
    fn test_truncated_payload() {
        let mut buf = Vec::new();
        append_record(&mut buf, libc::SOL_IPV6, IPV6_RECVORIGDSTADDR, &[0u8; 12]);

        assert_eq!(
            decode_original_dst(&buf),
            Err(DecodeError::Truncated {
                expected: 24,
                actual: 12
            })
        );
    }

    #[test]
    fn test_length_beyond_buffer_is_malformed() {
        let mut buf = Vec::new();
        append_record(&mut buf, libc::SOL_IP, IP_RECVORIGDSTADDR, &[0u8; 16]);
        buf.truncate(HEADER_LEN + 4);

        assert!(matches!(
            decode_original_dst(&buf),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_zero_length_is_malformed() {
        let buf = vec![0u8; HEADER_LEN * 2];
        assert!(matches!(
            decode_original_dst(&buf),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_iterator_yields_all_records() {
        let mut buf = Vec::new();
        append_record(&mut buf, 1, 2, &[0xAA; 3]);
        append_record(&mut buf, 3, 4, &[0xBB; 9]);

        let records: Vec<_> = ControlMessages::new(&buf).map(Result::unwrap).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data, &[0xAA; 3]);
        assert_eq!((records[1].level, records[1].kind), (3, 4));
        assert_eq!(records[1].data, &[0xBB; 9]);
    }

    #[test]
    fn test_record_framing_is_aligned() {
        let mut buf = Vec::new();
        append_record(&mut buf, 1, 2, &[0u8; 3]);
        assert_eq!(buf.len() % mem::size_of::<usize>(), 0);
    }
}
