//! Frame handles with a single, deterministic release point

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::pool::PooledStorage;
use crate::capture::source::{ConnectionInfo, SourceDescriptor};
use crate::error::{Error, Result};

/// Maximum plane count of any supported format.
pub const MAX_PLANES: usize = 3;

/// Four-character pixel format code as reported by the capture pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            for b in self.0 {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(f, "0x{:08x}", self.as_u32())
        }
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

/// Pixel formats we deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit Y plane followed by interleaved UV at half resolution.
    Nv12,
    /// 8-bit planar YUV 4:2:0, three planes.
    I420,
    Yuyv,
    Uyvy,
    Rgb24,
    Bgr24,
    Rgba32,
    Bgra32,
    /// Compressed; a single opaque plane.
    Mjpeg,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 9] = [
        PixelFormat::Nv12,
        PixelFormat::I420,
        PixelFormat::Yuyv,
        PixelFormat::Uyvy,
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Rgba32,
        PixelFormat::Bgra32,
        PixelFormat::Mjpeg,
    ];

    pub fn fourcc(&self) -> FourCc {
        match self {
            PixelFormat::Nv12 => FourCc::new(b"NV12"),
            PixelFormat::I420 => FourCc::new(b"I420"),
            PixelFormat::Yuyv => FourCc::new(b"YUYV"),
            PixelFormat::Uyvy => FourCc::new(b"UYVY"),
            PixelFormat::Rgb24 => FourCc::new(b"RGB3"),
            PixelFormat::Bgr24 => FourCc::new(b"BGR3"),
            PixelFormat::Rgba32 => FourCc::new(b"AB24"),
            PixelFormat::Bgra32 => FourCc::new(b"AR24"),
            PixelFormat::Mjpeg => FourCc::new(b"MJPG"),
        }
    }

    /// Map a capture pipeline code to a format, accepting the common aliases.
    pub fn from_fourcc(fourcc: FourCc) -> Option<Self> {
        let format = match &fourcc.0 {
            b"NV12" => PixelFormat::Nv12,
            b"I420" | b"YU12" => PixelFormat::I420,
            b"YUYV" | b"YUY2" => PixelFormat::Yuyv,
            b"UYVY" | b"2vuy" => PixelFormat::Uyvy,
            b"RGB3" => PixelFormat::Rgb24,
            b"BGR3" => PixelFormat::Bgr24,
            b"AB24" | b"RGBA" => PixelFormat::Rgba32,
            b"AR24" | b"BGRA" => PixelFormat::Bgra32,
            b"MJPG" | b"jpeg" => PixelFormat::Mjpeg,
            _ => return None,
        };
        Some(format)
    }

    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::Nv12 => 2,
            PixelFormat::I420 => 3,
            _ => 1,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }

    /// Tightly packed plane layout for a frame of this format.
    ///
    /// Compressed formats get a single plane sized for the worst case
    /// (two bytes per pixel) with a stride of zero.
    pub fn plane_layouts(&self, width: u32, height: u32) -> Vec<PlaneLayout> {
        let w = width as usize;
        let h = height as usize;
        let half_w = w.div_ceil(2);
        let half_h = h.div_ceil(2);

        let rows: &[(usize, usize)] = match self {
            PixelFormat::Nv12 => &[(w, h), (half_w * 2, half_h)],
            PixelFormat::I420 => &[(w, h), (half_w, half_h), (half_w, half_h)],
            PixelFormat::Yuyv | PixelFormat::Uyvy => &[(half_w * 4, h)],
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => &[(w * 3, h)],
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => &[(w * 4, h)],
            PixelFormat::Mjpeg => {
                return vec![PlaneLayout {
                    offset: 0,
                    stride: 0,
                    len: w * h * 2,
                }]
            }
        };

        let mut offset = 0;
        rows.iter()
            .map(|&(stride, rows)| {
                let plane = PlaneLayout {
                    offset,
                    stride,
                    len: stride * rows,
                };
                offset += plane.len;
                plane
            })
            .collect()
    }

    /// Total storage needed for [`plane_layouts`](Self::plane_layouts).
    pub fn frame_len(&self, width: u32, height: u32) -> usize {
        self.plane_layouts(width, height)
            .iter()
            .map(|p| p.offset + p.len)
            .max()
            .unwrap_or(0)
    }
}

/// Monotonic capture time in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn from_duration(d: Duration) -> Self {
        Self(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub const fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_duration().as_secs_f64())
    }
}

/// Where one plane lives inside a frame's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    pub stride: usize,
    pub len: usize,
}

/// A single plane of image data.
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    pub bytes_per_row: usize,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp: Timestamp,
    pub planes: Vec<PlaneLayout>,
}

/// One captured frame, exclusively owned by whoever holds it.
///
/// The handle leases a slot of the capture pipeline's buffer pool. That slot
/// goes back to the pool exactly once: on [`release`](Self::release), or when
/// the handle is dropped, whichever comes first. A consumer that doesn't keep
/// the handle past its callback therefore releases it at the end of the
/// delivery call.
///
/// Plane views borrow the handle, so the borrow checker already rules out
/// reading storage after an explicit release; calls made after release return
/// [`Error::UseAfterRelease`].
pub struct FrameBuffer {
    meta: FrameMetadata,
    connection: ConnectionInfo,
    storage: Option<PooledStorage>,
}

impl FrameBuffer {
    /// Wrap a source descriptor. On error the descriptor is dropped, which
    /// returns its storage to the pool.
    pub(crate) fn create(
        source: SourceDescriptor,
        timestamp: Timestamp,
        sequence: u64,
        connection: ConnectionInfo,
    ) -> Result<Self> {
        let format = PixelFormat::from_fourcc(source.fourcc).ok_or(Error::InvalidFormat {
            fourcc: source.fourcc,
        })?;
        validate_layout(format, &source.planes, source.storage.len())?;

        Ok(Self {
            meta: FrameMetadata {
                sequence,
                width: source.width,
                height: source.height,
                format,
                timestamp,
                planes: source.planes,
            },
            connection,
            storage: Some(source.storage),
        })
    }

    /// Sequence number within the capture session. Stays readable after
    /// release so the frame can still be identified in logs.
    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn is_released(&self) -> bool {
        self.storage.is_none()
    }

    pub fn metadata(&self) -> Result<&FrameMetadata> {
        self.live()?;
        Ok(&self.meta)
    }

    pub fn pixel_format(&self) -> Result<PixelFormat> {
        Ok(self.metadata()?.format)
    }

    pub fn width(&self) -> Result<u32> {
        Ok(self.metadata()?.width)
    }

    pub fn height(&self) -> Result<u32> {
        Ok(self.metadata()?.height)
    }

    pub fn timestamp(&self) -> Result<Timestamp> {
        Ok(self.metadata()?.timestamp)
    }

    pub fn connection(&self) -> Result<&ConnectionInfo> {
        self.live()?;
        Ok(&self.connection)
    }

    pub fn plane_count(&self) -> Result<usize> {
        Ok(self.metadata()?.planes.len())
    }

    pub fn stride(&self, index: usize) -> Result<usize> {
        Ok(self.layout(index)?.stride)
    }

    /// Read-only view over one plane's bytes.
    pub fn pixel_plane(&self, index: usize) -> Result<Plane<'_>> {
        let layout = self.layout(index)?;
        let storage = self.live()?;
        Ok(Plane {
            data: &storage.as_slice()[layout.offset..layout.offset + layout.len],
            bytes_per_row: layout.stride,
        })
    }

    /// Return the storage to the pool. Calling it again is a no-op.
    pub fn release(&mut self) {
        if let Some(storage) = self.storage.take() {
            tracing::trace!(sequence = self.meta.sequence, ticket = ?storage.ticket(), "frame released");
            drop(storage);
        }
    }

    fn live(&self) -> Result<&PooledStorage> {
        self.storage.as_ref().ok_or(Error::UseAfterRelease {
            sequence: self.meta.sequence,
        })
    }

    fn layout(&self, index: usize) -> Result<PlaneLayout> {
        let planes = &self.metadata()?.planes;
        planes.get(index).copied().ok_or(Error::OutOfRange {
            index,
            planes: planes.len(),
        })
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("sequence", &self.meta.sequence)
            .field("format", &self.meta.format)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("timestamp", &self.meta.timestamp)
            .field("released", &self.is_released())
            .finish()
    }
}

fn validate_layout(format: PixelFormat, planes: &[PlaneLayout], storage_len: usize) -> Result<()> {
    if planes.len() != format.plane_count() {
        return Err(Error::InvalidLayout(format!(
            "{format:?} needs {} planes, descriptor has {}",
            format.plane_count(),
            planes.len()
        )));
    }

    for (index, plane) in planes.iter().enumerate() {
        let end = plane.offset.checked_add(plane.len);
        if end.map_or(true, |end| end > storage_len) {
            return Err(Error::InvalidLayout(format!(
                "plane {index} ({}+{}) overruns {storage_len} bytes of storage",
                plane.offset, plane.len
            )));
        }
        if !format.is_compressed() && plane.stride == 0 {
            return Err(Error::InvalidLayout(format!("plane {index} has zero stride")));
        }
    }

    Ok(())
}
