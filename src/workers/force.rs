use std::time::{Duration, Instant};

use common::force::{
    decode_sample, ForceCommand, ForceProfile, SampleRate, SAMPLE_DELIMITER, SAMPLE_FRAME_LEN,
};
use tracing::{debug, info, trace, warn};

use crate::{
    externals::transport::{Link, Transport},
    models::device::DeviceKind,
};

use super::{ConnectError, DeviceDriver, DeviceError, Reply};

/// How many bytes a read may skip while hunting for a delimiter.
const MAX_RESYNC_BYTES: usize = 64;

/// Driver for the force measuring amplifier.
///
/// The amplifier streams samples continuously once transmission is started;
/// a read takes the newest complete sample and throws the backlog away.
pub struct ForceDriver {
    link: Option<Link>,
    transport: Option<Box<dyn Transport>>,
    profile: Option<ForceProfile>,
    rate: SampleRate,
    settle: Duration,
    start_at: Option<Instant>,
    streaming: bool,
}

impl ForceDriver {
    pub fn new(link: Link, profile: Option<ForceProfile>) -> Self {
        Self {
            link: Some(link),
            transport: None,
            profile,
            rate: SampleRate::Hz200,
            settle: Duration::from_secs(1),
            start_at: None,
            streaming: false,
        }
    }

    /// Time between setting the sample rate and starting transmission.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_rate(mut self, rate: SampleRate) -> Self {
        self.rate = rate;
        self
    }

    fn transport(&mut self) -> Result<&mut Box<dyn Transport>, DeviceError> {
        self.transport
            .as_mut()
            .ok_or_else(|| DeviceError::Transport("force link is not open".into()))
    }

    fn send(&mut self, command: ForceCommand) -> Result<(), DeviceError> {
        trace!("Sending {:?}.", command);
        self.transport()?.write_all(command.encode().as_bytes())?;
        Ok(())
    }

    fn start_streaming_when_settled(&mut self) -> Result<(), DeviceError> {
        if self.streaming {
            return Ok(());
        }
        match self.start_at {
            Some(start_at) if Instant::now() >= start_at => {
                self.send(ForceCommand::StartTransmission)?;
                self.streaming = true;
                info!("Transmission started.");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Newest complete sample among the waiting bytes, or a resync on the
    /// delimiter when nothing complete is waiting.
    fn read_raw(&mut self) -> Result<u16, DeviceError> {
        let transport = self.transport()?;
        let waiting = transport.bytes_to_read()?;
        if waiting >= SAMPLE_FRAME_LEN {
            let mut buffer = vec![0u8; waiting];
            transport.read_exact(&mut buffer)?;
            if let Some(start) = last_frame_start(&buffer) {
                return Ok(decode_sample(&buffer[start..start + SAMPLE_FRAME_LEN])?);
            }
            debug!("No delimiter among {} waiting bytes.", waiting);
        }

        let mut byte = [0u8; 1];
        let mut skipped = 0;
        loop {
            transport.read_exact(&mut byte)?;
            if byte[0] == SAMPLE_DELIMITER {
                break;
            }
            skipped += 1;
            if skipped >= MAX_RESYNC_BYTES {
                warn!("Gave up looking for a delimiter after {} bytes.", skipped);
                return Err(common::FrameError::MissingDelimiter(byte[0]).into());
            }
        }
        let mut value = [0u8; 2];
        transport.read_exact(&mut value)?;
        Ok(decode_sample(&[SAMPLE_DELIMITER, value[0], value[1]])?)
    }
}

/// Start of the last frame when walking `buffer` frame by frame from the
/// first delimiter.
fn last_frame_start(buffer: &[u8]) -> Option<usize> {
    let mut last = None;
    let mut i = 0;
    while i + SAMPLE_FRAME_LEN <= buffer.len() {
        if buffer[i] == SAMPLE_DELIMITER {
            last = Some(i);
            i += SAMPLE_FRAME_LEN;
        } else {
            i += 1;
        }
    }
    last
}

impl DeviceDriver for ForceDriver {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Force
    }

    fn open(&mut self) -> Result<(), ConnectError> {
        let Some(link) = self.link.take() else {
            debug!("Force link already open.");
            return Ok(());
        };
        let name = link.describe();
        let connect_error = |source| ConnectError::Transport {
            kind: DeviceKind::Force,
            link: name.clone(),
            source,
        };
        let mut transport = link.connect().map_err(connect_error)?;
        transport
            .write_all(ForceCommand::SetRate(self.rate).encode().as_bytes())
            .map_err(connect_error)?;
        self.transport = Some(transport);
        self.start_at = Some(Instant::now() + self.settle);
        debug!("Sample rate set to {:?}.", self.rate);
        Ok(())
    }

    fn read(&mut self) -> Result<Reply, DeviceError> {
        self.start_streaming_when_settled()?;
        let Some(profile) = self.profile else {
            let dropped = self.transport()?.drain()?;
            trace!("Dropped {} bytes, no calibration loaded.", dropped);
            return Err(DeviceError::CalibrationMissing);
        };
        let raw = self.read_raw()?;
        Ok(Reply::Values(vec![profile.convert(raw)]))
    }

    /// Raw opcode bytes, e.g. an encoded `ForceCommand`.
    fn write(&mut self, payload: &[u8]) -> Result<Reply, DeviceError> {
        self.transport()?.write_all(payload)?;
        Ok(Reply::Done)
    }

    fn self_test(&mut self) -> Result<Reply, DeviceError> {
        self.read()
    }

    fn idle(&mut self) -> Result<(), DeviceError> {
        self.start_streaming_when_settled()
    }

    fn close(&mut self) {
        if self.streaming {
            if let Err(e) = self.send(ForceCommand::StopTransmission) {
                debug!("Failed to stop transmission. Error: {}", e);
            }
            self.streaming = false;
        }
        if self.transport.take().is_some() {
            debug!("Force link closed.");
        }
    }
}
