//! HCI stream framing
//!
//! Raw sockets can hand over several packets in one read, or a packet split
//! across reads. The framer buffers chunks and cuts complete packets off the
//! front of the buffer, one at a time, in arrival order.
//!
//! On the monitor channel the unit is a record instead (see [`super::monitor`]).
//! Records that carry no packet are skipped.

use crate::error::FramingError;
use crate::hci::constants::{DEFAULT_MAX_PAYLOAD_LEN, HCI_MON_HDR_SIZE};
use crate::hci::monitor::MonitorHeader;
use crate::hci::packet::{HciPacket, PacketType};
use crate::hci::transport::{HciChannel, RawChunk};
use bytes::{Buf, BytesMut};
use log::trace;

/// Reassembly buffer turning raw chunks into [`HciPacket`]s
#[derive(Debug)]
pub struct Framer {
    buffer: BytesMut,
    max_payload_len: usize,
    channel: HciChannel,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_LEN)
    }

    /// Create a framer rejecting any packet whose declared payload exceeds `max_payload_len`
    pub fn with_max_payload(max_payload_len: usize) -> Self {
        Self::for_channel(HciChannel::Raw, max_payload_len)
    }

    /// Create a framer for the byte stream format of `channel`
    pub fn for_channel(channel: HciChannel, max_payload_len: usize) -> Self {
        Framer {
            buffer: BytesMut::with_capacity(4096),
            max_payload_len,
            channel,
        }
    }

    /// Append a chunk to the reassembly buffer
    pub fn push(&mut self, chunk: RawChunk) {
        self.buffer.extend_from_slice(&chunk);
    }

    /// Try to extract one complete packet from the head of the buffer.
    ///
    /// - `Ok(Some(packet))` when a whole packet was buffered
    /// - `Ok(None)` when more bytes are needed
    /// - `Err(InvalidType)` when the head byte is not a packet type; that byte is dropped
    /// - `Err(OversizedPayload)` when a length field exceeds the limit; the buffer is dropped
    /// - `Err(MalformedRecord)` when a monitor record does not hold exactly one packet; the record is dropped
    pub fn poll(&mut self) -> Result<Option<HciPacket>, FramingError> {
        match self.channel {
            HciChannel::Raw => self.poll_raw(),
            HciChannel::Monitor => self.poll_monitor(),
        }
    }

    fn poll_raw(&mut self) -> Result<Option<HciPacket>, FramingError> {
        let Some(&tag) = self.buffer.first() else {
            return Ok(None);
        };

        let packet_type = match PacketType::try_from(tag) {
            Ok(packet_type) => packet_type,
            Err(err) => {
                self.buffer.advance(1);
                return Err(err);
            }
        };

        let header_end = 1 + packet_type.header_len();
        if self.buffer.len() < header_end {
            return Ok(None);
        }

        let payload_len = packet_type.payload_len(&self.buffer[1..header_end]);
        if payload_len > self.max_payload_len {
            // Nothing after a corrupt length field can be trusted
            self.buffer.clear();
            return Err(FramingError::OversizedPayload {
                packet_type: tag,
                length: payload_len,
                max: self.max_payload_len,
            });
        }

        let total = header_end + payload_len;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame = self.buffer.split_to(total).freeze();
        HciPacket::parse(packet_type, &frame[1..])
            .map(Some)
            .ok_or(FramingError::Truncated {
                needed: total,
                buffered: frame.len(),
            })
    }

    fn poll_monitor(&mut self) -> Result<Option<HciPacket>, FramingError> {
        loop {
            let Some(header) = MonitorHeader::parse(&self.buffer) else {
                return Ok(None);
            };

            let packet_type = header.packet_type();
            let body_len = header.len as usize;
            let payload_len = body_len.saturating_sub(packet_type.map_or(0, PacketType::header_len));
            if payload_len > self.max_payload_len {
                self.buffer.clear();
                return Err(FramingError::OversizedPayload {
                    packet_type: packet_type.map_or(0, |t| t as u8),
                    length: payload_len,
                    max: self.max_payload_len,
                });
            }

            let total = HCI_MON_HDR_SIZE + body_len;
            if self.buffer.len() < total {
                return Ok(None);
            }
            let record = self.buffer.split_to(total).freeze();

            let Some(packet_type) = packet_type else {
                trace!("Skipping monitor record opcode {} for hci{}", header.opcode, header.index);
                continue;
            };

            let body = &record[HCI_MON_HDR_SIZE..];
            return match HciPacket::parse(packet_type, body) {
                Some(packet) if packet_type.header_len() + packet.payload_len() == body.len() => {
                    trace!("{:?} {} on hci{}", header.direction(), packet_type.name(), header.index);
                    Ok(Some(packet))
                }
                _ => Err(FramingError::MalformedRecord {
                    packet_type: packet_type as u8,
                    length: body.len(),
                }),
            };
        }
    }

    /// Extract every complete packet currently buffered.
    ///
    /// Stops at the first error, leaving later bytes buffered.
    pub fn drain(&mut self) -> Result<Vec<HciPacket>, FramingError> {
        let mut packets = Vec::new();
        while let Some(packet) = self.poll()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// End of stream: report and discard any partial packet still buffered
    pub fn finish(&mut self) -> Result<(), FramingError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let buffered = self.buffer.len();
        if self.channel == HciChannel::Monitor {
            let needed = MonitorHeader::parse(&self.buffer)
                .map_or(HCI_MON_HDR_SIZE, |header| HCI_MON_HDR_SIZE + header.len as usize);
            self.buffer.clear();
            return Err(FramingError::Truncated { needed, buffered });
        }

        let needed = match PacketType::try_from(self.buffer[0]) {
            Ok(packet_type) => {
                let header_end = 1 + packet_type.header_len();
                if buffered < header_end {
                    header_end
                } else {
                    header_end + packet_type.payload_len(&self.buffer[1..header_end])
                }
            }
            Err(_) => buffered,
        };

        self.buffer.clear();
        Err(FramingError::Truncated { needed, buffered })
    }

    /// Number of bytes waiting for the rest of their packet
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }

    pub fn channel(&self) -> HciChannel {
        self.channel
    }
}
