//! Codec frame contracts.
//!
//! Codecs are opaque here: the channel only needs to know how big a frame is,
//! how long it lasts, and what silence looks like. Frame boundaries are either
//! fixed-size or self-describing through a leading size-class table (AMR).

use std::io::Read;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VxiError};

/// Frame size (bytes, header included) by AMR frame type. The frame type is
/// bits 3..6 of the leading byte; zero entries are reserved types.
pub const AMR_FRAME_SIZES: [usize; 16] = [13, 14, 16, 18, 20, 21, 27, 32, 6, 0, 0, 0, 0, 0, 0, 1];

/// Leading byte of an AMR "no data" frame (frame type 15, quality bit set).
const AMR_NO_DATA: u8 = 0x7C;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Codec {
    #[serde(rename_all = "camelCase")]
    Linear16 { sample_rate: u32 },
    Mulaw,
    Alaw,
    Amr,
}

impl Default for Codec {
    fn default() -> Self {
        Self::Linear16 { sample_rate: 8000 }
    }
}

/// How a codec delimits frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Fixed(usize),
    SizeClass(&'static [usize; 16]),
}

impl Codec {
    pub fn name(self) -> &'static str {
        match self {
            Self::Linear16 { .. } => "linear16",
            Self::Mulaw => "mulaw",
            Self::Alaw => "alaw",
            Self::Amr => "amr",
        }
    }

    pub fn sample_rate(self) -> u32 {
        match self {
            Self::Linear16 { sample_rate } => sample_rate,
            Self::Mulaw | Self::Alaw | Self::Amr => 8000,
        }
    }

    pub fn is_linear(self) -> bool {
        matches!(self, Self::Linear16 { .. })
    }

    pub fn frame_format(self, interval: Duration) -> FrameFormat {
        let samples = (self.sample_rate() as u128 * interval.as_micros() / 1_000_000) as usize;
        match self {
            Self::Linear16 { .. } => FrameFormat::Fixed(samples * 2),
            Self::Mulaw | Self::Alaw => FrameFormat::Fixed(samples),
            Self::Amr => FrameFormat::SizeClass(&AMR_FRAME_SIZES),
        }
    }

    /// The channel's native frame size: the exact size of every silence frame
    /// it emits.
    pub fn frame_size(self, interval: Duration) -> usize {
        match self.frame_format(interval) {
            FrameFormat::Fixed(n) => n,
            FrameFormat::SizeClass(_) => 1,
        }
    }

    pub fn silence_frame(self, interval: Duration) -> Vec<u8> {
        let size = self.frame_size(interval);
        let fill = match self {
            Self::Linear16 { .. } => 0x00,
            Self::Mulaw => 0xFF,
            Self::Alaw => 0xD5,
            Self::Amr => AMR_NO_DATA,
        };
        vec![fill; size]
    }

    /// Check that an inbound frame has a legal size for this codec.
    pub fn validate_frame(self, interval: Duration, frame: &[u8]) -> Result<()> {
        let ok = match self.frame_format(interval) {
            FrameFormat::Fixed(n) => frame.len() == n,
            FrameFormat::SizeClass(table) => frame
                .first()
                .map(|b| table[((b >> 3) & 0x0F) as usize])
                .map_or(false, |size| size != 0 && size == frame.len()),
        };
        if ok {
            Ok(())
        } else {
            Err(VxiError::Media(format!(
                "misaligned {} frame of {} bytes",
                self.name(),
                frame.len()
            )))
        }
    }
}

/// Read one frame into `buf`. Returns `Ok(false)` on a clean end of stream
/// (no bytes at a frame boundary); a short or malformed frame is an error.
pub fn read_frame(format: FrameFormat, reader: &mut dyn Read, buf: &mut Vec<u8>) -> Result<bool> {
    buf.clear();
    let size = match format {
        FrameFormat::Fixed(n) => n,
        FrameFormat::SizeClass(table) => {
            let mut header = [0u8; 1];
            if read_full(reader, &mut header)? == 0 {
                return Ok(false);
            }
            let size = table[((header[0] >> 3) & 0x0F) as usize];
            if size == 0 {
                return Err(VxiError::Media(format!(
                    "reserved frame type in header byte {:#04x}",
                    header[0]
                )));
            }
            buf.push(header[0]);
            size
        }
    };
    let start = buf.len();
    buf.resize(size, 0);
    let got = read_full(reader, &mut buf[start..])?;
    if got == 0 && start == 0 {
        buf.clear();
        return Ok(false);
    }
    if start + got != size {
        return Err(VxiError::Media(format!(
            "short frame: {} of {} bytes",
            start + got,
            size
        )));
    }
    Ok(true)
}

fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MS20: Duration = Duration::from_millis(20);

    #[test]
    fn native_frame_sizes() {
        assert_eq!(Codec::Linear16 { sample_rate: 8000 }.frame_size(MS20), 320);
        assert_eq!(Codec::Linear16 { sample_rate: 16000 }.frame_size(MS20), 640);
        assert_eq!(Codec::Mulaw.frame_size(MS20), 160);
        assert_eq!(Codec::Alaw.silence_frame(MS20), vec![0xD5; 160]);
        assert_eq!(Codec::Amr.silence_frame(MS20), vec![0x7C]);
    }

    #[test]
    fn fixed_frames_reject_short_tail() {
        let data = vec![1u8; 250];
        let mut reader = Cursor::new(data);
        let mut buf = Vec::new();
        let format = Codec::Mulaw.frame_format(MS20);
        assert!(read_frame(format, &mut reader, &mut buf).unwrap());
        assert_eq!(buf.len(), 160);
        let err = read_frame(format, &mut reader, &mut buf).unwrap_err();
        assert!(matches!(err, VxiError::Media(_)));
    }

    #[test]
    fn clean_eof_at_boundary() {
        let mut reader = Cursor::new(vec![0u8; 160]);
        let mut buf = Vec::new();
        let format = Codec::Mulaw.frame_format(MS20);
        assert!(read_frame(format, &mut reader, &mut buf).unwrap());
        assert!(!read_frame(format, &mut reader, &mut buf).unwrap());
        assert!(buf.is_empty());
    }

    #[test]
    fn amr_size_class_frames() {
        // FT=7 (12.2 kbit/s): 32 bytes; FT=15: 1 byte.
        let mut data = vec![7 << 3];
        data.extend([0xAA; 31]);
        data.push(AMR_NO_DATA);
        data.push(0);
        let mut reader = Cursor::new(data);
        let mut buf = Vec::new();
        let format = Codec::Amr.frame_format(MS20);
        assert!(read_frame(format, &mut reader, &mut buf).unwrap());
        assert_eq!(buf.len(), 32);
        assert!(read_frame(format, &mut reader, &mut buf).unwrap());
        assert_eq!(buf, vec![AMR_NO_DATA]);
        // Header 0x00 is FT=0 (13 bytes) with nothing behind it.
        assert!(read_frame(format, &mut reader, &mut buf).is_err());
    }

    #[test]
    fn amr_reserved_type_rejected() {
        let mut reader = Cursor::new(vec![9 << 3, 0, 0]);
        let mut buf = Vec::new();
        assert!(read_frame(Codec::Amr.frame_format(MS20), &mut reader, &mut buf).is_err());
    }

    #[test]
    fn validate_inbound_frames() {
        let codec = Codec::Linear16 { sample_rate: 8000 };
        assert!(codec.validate_frame(MS20, &[0; 320]).is_ok());
        assert!(codec.validate_frame(MS20, &[0; 319]).is_err());
        assert!(Codec::Amr.validate_frame(MS20, &[AMR_NO_DATA]).is_ok());
        assert!(Codec::Amr.validate_frame(MS20, &[AMR_NO_DATA, 0]).is_err());
    }

    #[test]
    fn codec_serde_shape() {
        let json = serde_json::to_value(Codec::Linear16 { sample_rate: 16000 }).unwrap();
        assert_eq!(json["kind"], "linear16");
        assert_eq!(json["sampleRate"], 16000);
        let back: Codec = serde_json::from_str(r#"{"kind":"mulaw"}"#).unwrap();
        assert_eq!(back, Codec::Mulaw);
    }
}
