use std::{
    fs::File,
    io::{self, BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::device::{DeviceConfiguration, RawCapture, RawPlane};
use crate::{
    calibration::Calibration,
    types::{Capture, PixelFormat, PlaneRole},
};

pub const MAGIC: &[u8; 4] = b"DCAP";
pub const CAPTURE_MARKER: &[u8; 4] = b"CAPT";
pub const VERSION: u32 = 1;
pub const FILE_EXTENSION: &str = "dcap";

const MAX_HEADER_BYTES: u32 = 1 << 20;
const MAX_PLANE_BYTES: u32 = 256 << 20;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordingHeader {
    pub calibration: Calibration,
    pub device_configuration: DeviceConfiguration,
}

pub trait Recorder: Send {
    fn write_header(&mut self) -> Result<()>;
    fn write_capture(&mut self, capture: &Capture) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

pub struct FileRecorder {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    header: RecordingHeader,
    header_written: bool,
    captures: u64,
}

impl FileRecorder {
    pub fn create(path: impl Into<PathBuf>, header: RecordingHeader) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)
            .with_context(|| format!("failed to create recording {}", path.display()))?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            header,
            header_written: false,
            captures: 0,
        })
    }

    /// `<dir>/YYYY_MM_DD_hhmmss.dcap`
    pub fn timestamped_path(dir: &Path, now: DateTime<Local>) -> PathBuf {
        dir.join(format!(
            "{}.{FILE_EXTENSION}",
            now.format("%Y_%m_%d_%H%M%S")
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| anyhow!("recording {} is closed", self.path.display()))
    }
}

impl Recorder for FileRecorder {
    fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            bail!("recording header already written");
        }
        let json = serde_json::to_vec(&self.header).context("failed to encode header")?;
        let len = u32::try_from(json.len()).map_err(|_| anyhow!("header too large"))?;
        let writer = self.writer()?;
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&json)?;
        self.header_written = true;
        Ok(())
    }

    fn write_capture(&mut self, capture: &Capture) -> Result<()> {
        if !self.header_written {
            bail!("recording header must be written before captures");
        }
        let planes = capture.planes();
        let count = u8::try_from(planes.len()).map_err(|_| anyhow!("too many planes"))?;
        let timestamp = u64::try_from(capture.timestamp().as_micros()).unwrap_or(u64::MAX);

        let writer = self.writer()?;
        writer.write_all(CAPTURE_MARKER)?;
        writer.write_all(&timestamp.to_le_bytes())?;
        writer.write_all(&[count])?;
        for plane in planes {
            let data = plane.data();
            let len = u32::try_from(data.len()).map_err(|_| anyhow!("plane too large"))?;
            let stride = u32::try_from(plane.stride()).map_err(|_| anyhow!("stride too large"))?;
            writer.write_all(&[plane.role().code(), plane.format().code()])?;
            writer.write_all(&plane.width().to_le_bytes())?;
            writer.write_all(&plane.height().to_le_bytes())?;
            writer.write_all(&stride.to_le_bytes())?;
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(data)?;
        }
        self.captures += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            log::info!(
                "closed recording {} ({} captures)",
                self.path.display(),
                self.captures
            );
        }
        Ok(())
    }
}

/// Sequential reader over a `.dcap` stream.
pub struct RecordingReader<R: Read> {
    reader: R,
}

impl<R: Read> RecordingReader<R> {
    pub fn open(mut reader: R) -> Result<(Self, RecordingHeader)> {
        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .context("failed to read recording magic")?;
        if &magic != MAGIC {
            bail!("not a capture recording");
        }
        let version = read_u32(&mut reader)?;
        if version != VERSION {
            bail!("unsupported recording version {version}");
        }
        let len = read_u32(&mut reader)?;
        if len > MAX_HEADER_BYTES {
            bail!("recording header of {len} bytes is implausible");
        }
        let mut json = vec![0u8; len as usize];
        reader.read_exact(&mut json)?;
        let header = serde_json::from_slice(&json).context("failed to decode recording header")?;
        Ok((Self { reader }, header))
    }

    /// `Ok(None)` when the stream ends cleanly at a capture boundary.
    pub fn next_capture(&mut self) -> Result<Option<RawCapture>> {
        let Some(marker) = self.read_marker()? else {
            return Ok(None);
        };
        if &marker != CAPTURE_MARKER {
            bail!("corrupt recording: unexpected record marker {marker:?}");
        }

        let timestamp = Duration::from_micros(read_u64(&mut self.reader)?);
        let count = read_u8(&mut self.reader)?;
        let mut planes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let role_code = read_u8(&mut self.reader)?;
            let format_code = read_u8(&mut self.reader)?;
            let role = PlaneRole::from_code(role_code)
                .ok_or_else(|| anyhow!("corrupt recording: unknown plane role {role_code}"))?;
            let format = PixelFormat::from_code(format_code)
                .ok_or_else(|| anyhow!("corrupt recording: unknown pixel format {format_code}"))?;
            let width = read_u32(&mut self.reader)?;
            let height = read_u32(&mut self.reader)?;
            let stride = read_u32(&mut self.reader)? as usize;
            let len = read_u32(&mut self.reader)?;
            if len > MAX_PLANE_BYTES {
                bail!("corrupt recording: plane of {len} bytes");
            }
            let mut data = vec![0u8; len as usize];
            self.reader
                .read_exact(&mut data)
                .context("recording truncated inside a plane")?;
            let plane = RawPlane {
                role,
                format,
                width,
                height,
                stride,
                data,
            };
            plane.validate().context("corrupt recording")?;
            planes.push(plane);
        }

        Ok(Some(RawCapture { timestamp, planes }))
    }

    fn read_marker(&mut self) -> Result<Option<[u8; 4]>> {
        let mut marker = [0u8; 4];
        let mut filled = 0;
        while filled < marker.len() {
            match self.reader.read(&mut marker[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        match filled {
            0 => Ok(None),
            4 => Ok(Some(marker)),
            n => bail!("recording truncated: {n} of 4 marker bytes"),
        }
    }
}

fn read_u8(reader: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
