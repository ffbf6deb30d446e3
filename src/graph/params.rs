//! Typed parameter values exchanged with backends.
//!
//! The wire-level parameter serialization is out of scope for the core; this
//! module is the typed boundary the core negotiates through. Backends
//! enumerate [`MediaFormat`]s and buffer requirements, the link code
//! intersects them here.

use serde::{Deserialize, Serialize};

/// Parameter classes a backend can enumerate or accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamId {
    /// Possible formats of a port.
    EnumFormat,
    /// The configured format of a port.
    Format,
    /// Buffer requirements of a port.
    Buffers,
    /// Metadata requirements of a port.
    Meta,
    /// IO areas a port supports.
    Io,
    /// Free-form backend properties.
    Props,
}

/// Media type of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Video,
    Midi,
}

/// Sample/pixel encoding of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaSubtype {
    Raw,
    Dsp,
    Encoded,
}

/// A concrete or partially-open stream format.
///
/// `rate == 0` or `channels == 0` mean "any"; intersection fixates them from
/// the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub media_type: MediaType,
    pub media_subtype: MediaSubtype,
    pub rate: u32,
    pub channels: u32,
}

impl MediaFormat {
    pub fn audio(rate: u32, channels: u32) -> Self {
        Self {
            media_type: MediaType::Audio,
            media_subtype: MediaSubtype::Raw,
            rate,
            channels,
        }
    }

    /// Whether this format accepts `other` as a concrete instance.
    pub fn matches(&self, other: &MediaFormat) -> bool {
        self.media_type == other.media_type
            && self.media_subtype == other.media_subtype
            && (self.rate == 0 || other.rate == 0 || self.rate == other.rate)
            && (self.channels == 0 || other.channels == 0 || self.channels == other.channels)
    }

    /// Intersect two formats into the most constrained common one.
    pub fn intersect(&self, other: &MediaFormat) -> Option<MediaFormat> {
        if !self.matches(other) {
            return None;
        }
        Some(MediaFormat {
            media_type: self.media_type,
            media_subtype: self.media_subtype,
            rate: if self.rate != 0 { self.rate } else { other.rate },
            channels: if self.channels != 0 {
                self.channels
            } else {
                other.channels
            },
        })
    }

    /// Replace remaining wildcards with defaults so the format is concrete.
    pub fn fixate(mut self) -> MediaFormat {
        if self.rate == 0 {
            self.rate = 48000;
        }
        if self.channels == 0 {
            self.channels = 2;
        }
        self
    }
}

/// Buffer requirements announced by a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRequirements {
    pub buffers: u32,
    pub size: u32,
    pub stride: u32,
    pub align: u32,
}

impl Default for BufferRequirements {
    fn default() -> Self {
        Self {
            buffers: 4,
            size: 8192,
            stride: 0,
            align: 8,
        }
    }
}

impl BufferRequirements {
    /// Merge two requirement sets into one both sides can satisfy.
    pub fn merge(&self, other: &BufferRequirements) -> BufferRequirements {
        BufferRequirements {
            buffers: match (self.buffers, other.buffers) {
                (0, b) => b,
                (a, 0) => a,
                (a, b) => a.min(b),
            },
            size: self.size.max(other.size),
            stride: self.stride.max(other.stride),
            align: self.align.max(other.align),
        }
    }
}

/// A typed parameter value, the small sum standing in for serialized pods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Format(MediaFormat),
    Buffers(BufferRequirements),
}

impl ParamValue {
    pub fn as_format(&self) -> Option<&MediaFormat> {
        match self {
            ParamValue::Format(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_buffers(&self) -> Option<&BufferRequirements> {
        match self {
            ParamValue::Buffers(b) => Some(b),
            _ => None,
        }
    }
}

/// Pick the first format in `outputs` that intersects with any entry of
/// `inputs`, fixated to a concrete format.
pub fn filter_formats(outputs: &[MediaFormat], inputs: &[MediaFormat]) -> Option<MediaFormat> {
    for out in outputs {
        for inp in inputs {
            if let Some(common) = out.intersect(inp) {
                return Some(common.fixate());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersect_fixates_wildcards() {
        let open = MediaFormat::audio(0, 2);
        let concrete = MediaFormat::audio(44100, 0);
        let common = open.intersect(&concrete).unwrap().fixate();
        assert_eq!(common.rate, 44100);
        assert_eq!(common.channels, 2);
    }

    #[test]
    fn mismatched_rates_do_not_intersect() {
        let a = MediaFormat::audio(48000, 2);
        let b = MediaFormat::audio(44100, 2);
        assert!(a.intersect(&b).is_none());
    }

    #[test]
    fn filter_picks_first_common() {
        let outs = [MediaFormat::audio(96000, 2), MediaFormat::audio(48000, 2)];
        let ins = [MediaFormat::audio(48000, 0)];
        let picked = filter_formats(&outs, &ins).unwrap();
        assert_eq!(picked.rate, 48000);
        assert_eq!(picked.channels, 2);
    }

    #[test]
    fn buffer_merge_takes_strictest() {
        let a = BufferRequirements {
            buffers: 8,
            size: 4096,
            stride: 0,
            align: 8,
        };
        let b = BufferRequirements {
            buffers: 4,
            size: 8192,
            stride: 4,
            align: 16,
        };
        let merged = a.merge(&b);
        assert_eq!(merged.buffers, 4);
        assert_eq!(merged.size, 8192);
        assert_eq!(merged.stride, 4);
        assert_eq!(merged.align, 16);
    }
}
