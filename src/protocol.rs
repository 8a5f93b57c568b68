//! Image-info packet carried alongside each frame on the wire.
//!
//! Big-endian layout:
//!
//! ```text
//! +--------+------+----------+-----------+----------+----------+
//! | header | size | frame id | timestamp | exposure | checksum |
//! |  0x3B  | 0x0B |   u16    |    u32    |   u16    |   u8     |
//! +--------+------+----------+-----------+----------+----------+
//! ```
//!
//! The checksum is the XOR of every byte after the header. The timestamp is
//! a power-on monotonic counter in 10-us units; it wraps around 32 bits
//! after roughly 11.9 hours, which is expected and must not be treated as
//! an error. Frames whose packet fails the checksum are dropped by the
//! device layer before they reach the pipeline.

use anyhow::{bail, Result};

use crate::stream::ImgMeta;

pub const PACKET_HEADER: u8 = 0x3B;
pub const PACKET_SIZE: u8 = 0x0B;
pub const PACKET_LEN: usize = 11;

/// Parse and validate one image-info packet.
pub fn parse_img_packet(buf: &[u8]) -> Result<ImgMeta> {
    if buf.len() < PACKET_LEN {
        bail!("image packet too short: {} bytes", buf.len());
    }
    if buf[0] != PACKET_HEADER {
        bail!("bad image packet header: {:#04x}", buf[0]);
    }
    if buf[1] != PACKET_SIZE {
        bail!("bad image packet size: {:#04x}", buf[1]);
    }
    let checksum = buf[1..PACKET_LEN - 1].iter().fold(0u8, |acc, b| acc ^ b);
    if checksum != buf[PACKET_LEN - 1] {
        bail!(
            "image packet checksum mismatch: computed {:#04x}, got {:#04x}",
            checksum,
            buf[PACKET_LEN - 1]
        );
    }
    Ok(ImgMeta {
        frame_id: u16::from_be_bytes([buf[2], buf[3]]),
        timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        exposure_time: u16::from_be_bytes([buf[8], buf[9]]),
    })
}
