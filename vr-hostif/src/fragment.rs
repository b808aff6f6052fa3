//! Software IPv4 fragmentation of oversized tunneled frames.
//!
//! The frame's network header points at the IPv4 header to fragment (the
//! inner header of a tunneled packet). Every byte in front of it, from the
//! Ethernet header through the outer tunnel headers, is the link header and
//! is copied into each fragment; the outer headers are fixed up afterwards
//! by the header rewrite.

use smoltcp::wire::Ipv4Packet;

use crate::checksum::resolve_partial;
use crate::error::FragmentError;
use crate::frame::{ChecksumState, Frame, IPV4_MIN_HLEN};

/// Shortest last fragment the split aims for.
const MIN_LAST_FRAGMENT: usize = 64;

/// Payload bytes per fragment for a packet that must fit `mtu`.
///
/// `frag_size` is a multiple of 8 and, when possible, the last fragment is
/// at least 64 bytes. Returns `None` when no positive size exists or the
/// payload fits in one fragment.
pub fn fragment_size(payload: usize, mtu: usize, link_len: usize, ip_hlen: usize) -> Option<usize> {
    let mut frag_size = mtu.checked_sub(link_len + ip_hlen)? & !7;
    if frag_size == 0 || payload <= frag_size {
        return None;
    }
    let num_frags = payload / frag_size;
    let last = payload % frag_size;
    if last != 0 && last < MIN_LAST_FRAGMENT {
        frag_size -= (MIN_LAST_FRAGMENT - last) / num_frags;
        frag_size -= 1;
        frag_size &= !7;
    }
    (frag_size != 0).then_some(frag_size)
}

/// Offsets of the IPv4 header to fragment: (link header length, IP header length).
fn ipv4_layout(frame: &Frame) -> Result<(usize, usize), FragmentError> {
    let link_len = frame.network_offset().ok_or(FragmentError::NotIpv4)?;
    let bytes = frame.data();
    if bytes.len() < link_len + IPV4_MIN_HLEN {
        return Err(FragmentError::Truncated);
    }
    if bytes[link_len] >> 4 != 4 {
        return Err(FragmentError::NotIpv4);
    }
    let ip_hlen = ((bytes[link_len] & 0x0f) as usize) * 4;
    if ip_hlen < IPV4_MIN_HLEN || bytes.len() < link_len + ip_hlen {
        return Err(FragmentError::Truncated);
    }
    Ok((link_len, ip_hlen))
}

/// Split `frame` into IPv4 fragments that fit `mtu`.
pub fn fragment(frame: Frame, mtu: usize) -> Result<Vec<Frame>, FragmentError> {
    let (link_len, ip_hlen) = ipv4_layout(&frame)?;
    let payload = frame.len() - link_len - ip_hlen;

    let room = mtu.saturating_sub(link_len + ip_hlen) & !7;
    if room == 0 {
        return Err(FragmentError::MtuTooSmall { mtu });
    }
    if payload <= room {
        return Err(FragmentError::SingleFragment {
            payload,
            frag_size: room,
        });
    }
    let frag_size =
        fragment_size(payload, mtu, link_len, ip_hlen).ok_or(FragmentError::MtuTooSmall { mtu })?;

    split(frame, link_len, ip_hlen, frag_size)
}

/// Split `frame` into fragments carrying `frag_size` payload bytes each.
/// A payload that already fits is returned as a single frame.
pub fn fragment_with_size(frame: Frame, frag_size: usize) -> Result<Vec<Frame>, FragmentError> {
    let (link_len, ip_hlen) = ipv4_layout(&frame)?;
    if frag_size == 0 || frag_size % 8 != 0 {
        return Err(FragmentError::MtuTooSmall {
            mtu: link_len + ip_hlen + frag_size,
        });
    }
    split(frame, link_len, ip_hlen, frag_size)
}

fn split(
    mut frame: Frame,
    link_len: usize,
    ip_hlen: usize,
    frag_size: usize,
) -> Result<Vec<Frame>, FragmentError> {
    frame.gso = None;
    if matches!(frame.csum, ChecksumState::Partial { .. }) && !resolve_partial(&mut frame) {
        return Err(FragmentError::Checksum);
    }

    let bytes = frame.data();
    let (ident, source_mf, mut offset) = {
        let ip = Ipv4Packet::new_unchecked(&bytes[link_len..]);
        (ip.ident(), ip.more_frags(), ip.frag_offset() as usize)
    };
    let header = &bytes[..link_len + ip_hlen];
    let body = &bytes[link_len + ip_hlen..];
    let headroom = frame.headroom();

    let mut fragments = Vec::with_capacity(body.len().div_ceil(frag_size).max(1));
    let mut chunks = body.chunks(frag_size).peekable();
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        let len = header.len() + chunk.len();
        let mut buf = vec![0u8; headroom + len];
        buf[headroom..headroom + header.len()].copy_from_slice(header);
        buf[headroom + header.len()..].copy_from_slice(chunk);

        {
            let mut ip = Ipv4Packet::new_unchecked(&mut buf[headroom + link_len..]);
            ip.set_ident(ident);
            ip.set_frag_offset(offset as u16);
            ip.set_more_frags(!last || source_mf);
            ip.set_total_len((ip_hlen + chunk.len()) as u16);
            ip.fill_checksum();
        }
        offset += chunk.len();

        let mut piece = frame.clone_meta(buf, headroom, headroom + len);
        piece.set_mac_header(headroom);
        piece.set_network_header(headroom + link_len);
        piece.set_transport_header(headroom + link_len + ip_hlen);
        piece.csum = ChecksumState::None;
        piece.gso = None;
        fragments.push(piece);
    }

    if fragments.is_empty() {
        fragments.push(frame);
    }
    Ok(fragments)
}
