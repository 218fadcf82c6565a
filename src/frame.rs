use std::io::Cursor;

use mavlink::ardupilotmega::MavMessage;
use mavlink::peek_reader::PeekReader;
use mavlink::MavHeader;
use thiserror::Error;

const MAV_STX_V1: u8 = 0xFE;
const MAV_STX_V2: u8 = 0xFD;

/// v2 signature block length when the incompat "signed" flag is set.
const V2_SIGNATURE_LEN: usize = 13;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("undecodable frame: {0}")]
    Parse(String),
}

/// Incremental frame extractor for the MAVLink byte stream.
///
/// Finds frame boundaries (v1 and v2 start bytes, lengths, signature flag),
/// then hands each complete candidate to the `mavlink` crate for CRC checking
/// and payload decoding. Garbage between frames and frames that fail to
/// decode are skipped one byte at a time so the scanner resynchronizes on the
/// next valid start byte.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete frame out of the buffer, if one is available.
    /// Returns `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<(MavHeader, MavMessage), DecodeError>> {
        match self.buf.iter().position(|&b| b == MAV_STX_V1 || b == MAV_STX_V2) {
            Some(0) => {}
            Some(start) => {
                self.buf.drain(..start);
            }
            None => {
                self.buf.clear();
                return None;
            }
        }

        let total = self.frame_len()?;
        if self.buf.len() < total {
            return None;
        }

        let frame: Vec<u8> = self.buf.drain(..total).collect();
        match decode(&frame) {
            Ok(pair) => Some(Ok(pair)),
            Err(e) => {
                // Resync one byte past the bad start byte.
                let mut rest = frame[1..].to_vec();
                rest.extend_from_slice(&self.buf);
                self.buf = rest;
                Some(Err(e))
            }
        }
    }

    /// Full frame length implied by the header at the buffer start, or `None`
    /// if the length fields have not arrived yet.
    fn frame_len(&self) -> Option<usize> {
        match self.buf[0] {
            MAV_STX_V2 => {
                if self.buf.len() < 3 {
                    return None;
                }
                let payload = self.buf[1] as usize;
                let signed = self.buf[2] & 0x01 != 0;
                Some(12 + payload + if signed { V2_SIGNATURE_LEN } else { 0 })
            }
            _ => {
                if self.buf.len() < 2 {
                    return None;
                }
                Some(8 + self.buf[1] as usize)
            }
        }
    }
}

fn decode(frame: &[u8]) -> Result<(MavHeader, MavMessage), DecodeError> {
    let mut reader = PeekReader::new(Cursor::new(frame));
    let result = if frame[0] == MAV_STX_V2 {
        mavlink::read_v2_msg::<MavMessage, _>(&mut reader)
    } else {
        mavlink::read_v1_msg::<MavMessage, _>(&mut reader)
    };
    result.map_err(|e| DecodeError::Parse(format!("{e:?}")))
}

/// Encode a message as a MAVLink v2 frame.
pub fn encode_frame(header: MavHeader, msg: &MavMessage) -> Result<Vec<u8>, DecodeError> {
    let mut buf = Cursor::new(Vec::with_capacity(280));
    mavlink::write_v2_msg(&mut buf, header, msg)
        .map_err(|e| DecodeError::Parse(format!("{e:?}")))?;
    Ok(buf.into_inner())
}
