//! Internet checksum helpers.

use crate::frame::{ChecksumState, Frame, UDP_CSUM_OFFSET};

/// One's-complement sum of `data` added to `initial`, not folded.
pub fn checksum_no_fold(data: &[u8], initial: u64) -> u64 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u64) << 8;
    }
    sum
}

/// Fold a 64-bit accumulator to 16 bits.
pub fn fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Folded, non-inverted checksum of `data` seeded with `initial`.
pub fn checksum(data: &[u8], initial: u64) -> u16 {
    fold(checksum_no_fold(data, initial))
}

/// Value to store in an IPv4 header checksum field.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    !checksum(header, 0)
}

/// IPv4 pseudo-header sum, not folded.
pub fn pseudo_header_checksum_no_fold(src: &[u8], dst: &[u8], protocol: u8, len: u16) -> u64 {
    let sum = checksum_no_fold(src, 0);
    let sum = checksum_no_fold(dst, sum);
    sum + protocol as u64 + len as u64
}

/// Folded, non-inverted pseudo-header sum. Stored in a transport checksum
/// field as the seed for a partial checksum.
pub fn pseudo_header_seed(src: &[u8], dst: &[u8], protocol: u8, len: u16) -> u16 {
    fold(pseudo_header_checksum_no_fold(src, dst, protocol, len))
}

/// Full transport checksum over `segment` (header plus payload) with the
/// checksum field already zeroed.
pub fn transport_checksum(src: &[u8], dst: &[u8], protocol: u8, segment: &[u8]) -> u16 {
    let seed = pseudo_header_checksum_no_fold(src, dst, protocol, segment.len() as u16);
    !checksum(segment, seed)
}

/// Check the transport checksum of an IPv4 packet (header at `ip[0]`).
pub fn ipv4_transport_checksum_valid(ip: &[u8]) -> bool {
    if ip.len() < 20 {
        return false;
    }
    let ihl = ((ip[0] & 0x0f) as usize) * 4;
    let total = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    if ihl < 20 || total < ihl || total > ip.len() {
        return false;
    }
    let seed = pseudo_header_checksum_no_fold(&ip[12..16], &ip[16..20], ip[9], (total - ihl) as u16);
    !checksum(&ip[ihl..total], seed) == 0
}

/// Finish a partial checksum in software.
///
/// The seed already in the checksum field is summed with the bytes from
/// `start` to the end of the frame and the result stored back. The state
/// becomes `None`. Returns false if the checksum field lies outside the
/// data region.
pub fn resolve_partial(frame: &mut Frame) -> bool {
    let ChecksumState::Partial { start, offset } = frame.csum else {
        return true;
    };
    let at = start + offset;
    let Some(seed) = frame.read_u16(at) else {
        return false;
    };
    if start < frame.data_offset() {
        return false;
    }
    let tail = frame.tail_offset();
    let buf = frame.buffer_mut();
    buf[at] = 0;
    buf[at + 1] = 0;
    let mut csum = !checksum(&buf[start..tail], seed as u64);
    if csum == 0 && offset == UDP_CSUM_OFFSET {
        csum = 0xffff;
    }
    buf[at..at + 2].copy_from_slice(&csum.to_be_bytes());
    frame.csum = ChecksumState::None;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    // 20-byte IPv4 header from RFC 1071 examples / common captures.
    const IP_HEADER: [u8; 20] = [
        0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0xb8, 0x61, 0xc0, 0xa8, 0x00,
        0x01, 0xc0, 0xa8, 0x00, 0xc7,
    ];

    #[test]
    fn test_ipv4_header_checksum() {
        let mut header = IP_HEADER;
        header[10] = 0;
        header[11] = 0;
        assert_eq!(ipv4_header_checksum(&header), 0xb861);
        // A header with a correct checksum sums to 0xffff.
        assert_eq!(checksum(&IP_HEADER, 0), 0xffff);
    }

    #[test]
    fn test_odd_length() {
        assert_eq!(checksum(&[0x01], 0), 0x0100);
        assert_eq!(checksum(&[0x00, 0x01, 0xf2], 0), 0xf201);
    }

    #[test]
    fn test_fold_carries() {
        assert_eq!(fold(0x1_ffff), 0x0001);
        assert_eq!(fold(0xffff_ffff), 0xffff);
    }

    #[test]
    fn test_resolve_partial_udp() {
        let src = [10, 0, 0, 1];
        let dst = [10, 0, 0, 2];
        let mut seg = vec![0x30, 0x39, 0x00, 0x35, 0x00, 0x0c, 0x00, 0x00, 1, 2, 3, 4];
        let expected = transport_checksum(&src, &dst, 17, &seg);

        let seed = pseudo_header_seed(&src, &dst, 17, seg.len() as u16);
        seg[6..8].copy_from_slice(&seed.to_be_bytes());
        let mut frame = Frame::with_headroom(8, &seg);
        assert!(frame.set_partial_csum(0, 6));
        assert!(resolve_partial(&mut frame));

        assert_eq!(frame.csum, ChecksumState::None);
        assert_eq!(&frame.data()[6..8], &expected.to_be_bytes());
    }

    #[test]
    fn test_resolve_partial_noop_without_partial() {
        let mut frame = Frame::with_headroom(0, &[1, 2, 3, 4]);
        assert!(resolve_partial(&mut frame));
        assert_eq!(frame.data(), &[1, 2, 3, 4]);
    }
}
