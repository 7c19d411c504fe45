//! Unit transfers.
//!
//! A unit is one image or one audio clip. Each mechanism moves it
//! differently, but every transfer ends the same way: the source answers
//! XferDone, Cancel or a failure, and the answer becomes a [`UnitReport`]
//! telling the acquisition loop whether more units are pending or this one
//! should be tried again.

use std::{fs, path::PathBuf};

use bytes::{Bytes, BytesMut};
use scanbridge_proto::{
    ConditionCode, DataArgType, Msg, ReturnCode,
    payloads::{
        AudioInfo, FileFormat, ImageInfo, ImageMemXfer, MemoryFlags, PendingXfers, SetupFileXfer,
        SetupMemXfer,
    },
};

use super::Source;
use crate::{
    config::{FailAction, TransferMode},
    entry::{Payload, PayloadKind},
    error::{DispatchError, ErrorRecord, SourceError},
    memory::ScopedBuffer,
    notify::Notification,
};

/// Strip size used when the source states no preference and the image
/// size is unknown.
const DEFAULT_STRIP: u32 = 64 * 1024;

/// Consecutive empty strips tolerated before a buffered transfer is
/// considered stuck.
const MAX_EMPTY_STRIPS: u32 = 16;

/// Where the acquisition loop goes after a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitOutcome {
    /// The source has more units
    MorePending,
    /// Nothing is left
    NoMorePending,
    /// Transfer the same unit again
    RetryUnit,
}

/// Result of one unit transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitReport {
    /// Where to go next
    pub outcome: UnitOutcome,
    /// Whether a unit was actually acquired
    pub acquired: bool,
}

impl UnitReport {
    fn after(pending: &PendingXfers, acquired: bool) -> Self {
        let outcome =
            if pending.has_more() { UnitOutcome::MorePending } else { UnitOutcome::NoMorePending };
        Self { outcome, acquired }
    }
}

/// The transferred data.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitData {
    /// Held in memory
    Bytes(Bytes),
    /// Written to a file
    File(PathBuf),
}

/// Metadata fetched before a unit was transferred.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitMetadata {
    /// Image metadata
    Image(ImageInfo),
    /// Audio metadata
    Audio(AudioInfo),
}

impl UnitMetadata {
    /// Image metadata, for image units.
    pub fn image(&self) -> Option<&ImageInfo> {
        match self {
            Self::Image(info) => Some(info),
            Self::Audio(_) => None,
        }
    }
}

/// One unit as handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredUnit {
    /// 1-based unit number within its acquisition
    pub page: u32,
    /// Configured mechanism
    pub mechanism: TransferMode,
    /// The data
    pub data: UnitData,
    /// Metadata in effect for the unit
    pub metadata: Option<UnitMetadata>,
    /// Pixel type when the source became ready
    pub pixel_type: Option<u16>,
    /// Bit depth when the source became ready
    pub bit_depth: Option<u16>,
}

/// Asks the user where a prompted file transfer should be saved.
pub trait SavePrompt: Send {
    /// Save a transferred unit. Returns where it went, or `None` if the
    /// user declined.
    fn save(&self, page: u32, data: &[u8], format: FileFormat) -> Option<PathBuf>;
}

impl<F> SavePrompt for F
where
    F: Fn(u32, &[u8], FileFormat) -> Option<PathBuf> + Send,
{
    fn save(&self, page: u32, data: &[u8], format: FileFormat) -> Option<PathBuf> {
        self(page, data, format)
    }
}

/// What the acquisition loop knows about the unit in flight.
#[derive(Debug, Clone, Default)]
pub(super) struct UnitContext {
    pub(super) page: u32,
    pub(super) metadata: Option<UnitMetadata>,
    pub(super) pixel_type: Option<u16>,
    pub(super) bit_depth: Option<u16>,
}

/// How the source answered a transfer.
enum Transferred {
    Done(UnitData),
    Cancelled,
    Failed(ErrorRecord),
}

impl Source {
    /// Transfer one unit with the configured mechanism.
    pub(super) fn transfer_unit(&mut self, unit: &UnitContext) -> Result<UnitReport, SourceError> {
        let mode = match self.acquisition.mode {
            TransferMode::Clipboard => self.acquisition.clipboard.mode(),
            mode => mode,
        };
        tracing::debug!(source = %self.name(), page = unit.page, ?mode, "transferring unit");

        let transferred = match mode {
            TransferMode::Native | TransferMode::Clipboard => self.transfer_native(false)?,
            TransferMode::AudioNative => self.transfer_native(true)?,
            TransferMode::Memory => self.transfer_memory(unit)?,
            TransferMode::File => self.transfer_file(unit.page, false)?,
            TransferMode::AudioFile => self.transfer_file(unit.page, true)?,
        };
        self.conclude(unit, transferred)
    }

    fn transfer_native(&mut self, audio: bool) -> Result<Transferred, SourceError> {
        let payload = Payload::NativeXfer(None);
        let (dat, triplet) = if audio {
            (DataArgType::AUDIONATIVEXFER, self.audio(DataArgType::AUDIONATIVEXFER, Msg::GET, payload))
        } else {
            (DataArgType::IMAGENATIVEXFER, self.image(DataArgType::IMAGENATIVEXFER, Msg::GET, payload))
        };
        let reply = self.call(triplet)?;
        let code = reply.code;
        let handle = take_payload!(reply.payload, dat, NativeXfer);

        match code {
            ReturnCode::XferDone => {
                let handle = handle.ok_or(SourceError::Protocol {
                    dat,
                    msg: Msg::GET,
                    return_code: code,
                    condition: ConditionCode::Bummer,
                })?;
                // The application owns the handle once the transfer is done
                let buffer = ScopedBuffer::adopt(self.codec.memory(), handle);
                let bytes = buffer.read_all()?;
                buffer.release()?;
                Ok(Transferred::Done(UnitData::Bytes(Bytes::from(bytes))))
            },
            ReturnCode::Cancel => {
                if let Some(handle) = handle {
                    ScopedBuffer::adopt(self.codec.memory(), handle).release()?;
                }
                Ok(Transferred::Cancelled)
            },
            code => Ok(Transferred::Failed(self.diagnose(code))),
        }
    }

    fn transfer_memory(&mut self, unit: &UnitContext) -> Result<Transferred, SourceError> {
        let payload = Payload::SetupMemXfer(SetupMemXfer::default());
        let setup = match self.fetch(self.control(DataArgType::SETUPMEMXFER, Msg::GET, payload))? {
            Ok(payload) => take_payload!(payload, DataArgType::SETUPMEMXFER, SetupMemXfer),
            Err(record) => return Ok(Transferred::Failed(record)),
        };

        let info = unit.metadata.as_ref().and_then(UnitMetadata::image);
        let strip = strip_size(&setup, info);
        let buffer = ScopedBuffer::allocate(self.codec.memory(), strip as usize)?;
        let mut image = BytesMut::new();
        let mut empty_strips = 0;

        loop {
            let request = ImageMemXfer {
                memory_flags: MemoryFlags::APP_OWNS | MemoryFlags::HANDLE,
                memory_length: strip,
                memory_handle: Some(buffer.handle()),
                ..ImageMemXfer::default()
            };
            let payload = Payload::ImageMemXfer(request);
            let reply = self.call(self.image(DataArgType::IMAGEMEMXFER, Msg::GET, payload))?;
            let code = reply.code;
            let written = take_payload!(reply.payload, DataArgType::IMAGEMEMXFER, ImageMemXfer);

            match code {
                ReturnCode::Success | ReturnCode::XferDone => {
                    let len = written.bytes_written.min(strip) as usize;
                    if len > 0 {
                        image.extend_from_slice(&buffer.lock()?.read(0, len)?);
                        empty_strips = 0;
                    } else {
                        empty_strips += 1;
                    }
                    tracing::trace!(rows = written.rows, bytes = len, "strip received");

                    if code == ReturnCode::XferDone {
                        break;
                    }
                    if empty_strips >= MAX_EMPTY_STRIPS {
                        return Err(SourceError::Protocol {
                            dat: DataArgType::IMAGEMEMXFER,
                            msg: Msg::GET,
                            return_code: code,
                            condition: ConditionCode::OperationError,
                        });
                    }
                },
                ReturnCode::Cancel => {
                    buffer.release()?;
                    return Ok(Transferred::Cancelled);
                },
                code => {
                    let record = self.diagnose(code);
                    buffer.release()?;
                    return Ok(Transferred::Failed(record));
                },
            }
        }

        buffer.release()?;
        Ok(Transferred::Done(UnitData::Bytes(image.freeze())))
    }

    fn transfer_file(&mut self, page: u32, audio: bool) -> Result<Transferred, SourceError> {
        let file = self.acquisition.file.clone();

        let path = if file.prompt || file.setup {
            let path = if file.prompt {
                self.link.config.temp_dir.join(temp_name(file.format))
            } else {
                file.path.clone()
            };
            let setup = SetupFileXfer { path: path.clone(), format: file.format, vref: -1 };
            let payload = Payload::SetupFileXfer(setup);
            let reply = self.call(self.control(DataArgType::SETUPFILEXFER, Msg::SET, payload))?;
            if !reply.code.is_success() {
                return Ok(Transferred::Failed(self.diagnose(reply.code)));
            }
            path
        } else {
            // The source writes wherever it was last told to
            let payload = Payload::SetupFileXfer(SetupFileXfer::default());
            match self.fetch(self.control(DataArgType::SETUPFILEXFER, Msg::GET, payload))? {
                Ok(payload) => take_payload!(payload, DataArgType::SETUPFILEXFER, SetupFileXfer).path,
                Err(record) => return Ok(Transferred::Failed(record)),
            }
        };

        let triplet = if audio {
            self.audio(DataArgType::AUDIOFILEXFER, Msg::GET, Payload::None)
        } else {
            self.image(DataArgType::IMAGEFILEXFER, Msg::GET, Payload::None)
        };
        let reply = self.call(triplet)?;
        match reply.code {
            ReturnCode::XferDone => {},
            ReturnCode::Cancel => return Ok(Transferred::Cancelled),
            code => return Ok(Transferred::Failed(self.diagnose(code))),
        }

        if !file.prompt {
            return Ok(Transferred::Done(UnitData::File(path)));
        }

        let bytes = fs::read(&path)
            .map_err(|error| SourceError::File(format!("{}: {error}", path.display())))?;
        let saved = self.save_prompt.as_ref().and_then(|prompt| prompt.save(page, &bytes, file.format));
        if file.delete_after_save {
            if let Err(error) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), %error, "temporary transfer file not removed");
            }
        }

        let data = match saved {
            Some(saved) => UnitData::File(saved),
            None => UnitData::Bytes(Bytes::from(bytes)),
        };
        Ok(Transferred::Done(data))
    }

    fn conclude(&mut self, unit: &UnitContext, transferred: Transferred) -> Result<UnitReport, SourceError> {
        match transferred {
            Transferred::Done(data) => {
                let pending = self.pending_xfers(Msg::ENDXFER)?;
                self.machine.unit_completed();
                self.units.push(AcquiredUnit {
                    page: unit.page,
                    mechanism: self.acquisition.mode,
                    data,
                    metadata: unit.metadata.clone(),
                    pixel_type: unit.pixel_type,
                    bit_depth: unit.bit_depth,
                });
                self.notify(Notification::PageTransferred { source: self.name().to_owned(), page: unit.page });
                Ok(UnitReport::after(&pending, true))
            },
            Transferred::Cancelled => {
                tracing::info!(source = %self.name(), page = unit.page, "transfer cancelled by source");
                let pending = self.pending_xfers(Msg::ENDXFER)?;
                self.machine.unit_completed();
                self.notify(Notification::TransferCancelled { source: self.name().to_owned() });
                Ok(UnitReport::after(&pending, false))
            },
            Transferred::Failed(record) => self.unit_failed(record, true),
        }
    }

    /// Apply the fail action to a failed unit. With `allow_retry` unset a
    /// Retry action behaves like Continue.
    pub(super) fn unit_failed(
        &mut self,
        record: ErrorRecord,
        allow_retry: bool,
    ) -> Result<UnitReport, SourceError> {
        self.record_error(record);

        let policy = self.acquisition.retry;
        let action = match policy.fail_action {
            FailAction::Retry if !allow_retry => FailAction::Continue,
            FailAction::Retry if self.machine.retries() >= policy.max_retries => {
                tracing::warn!(source = %self.name(), retries = policy.max_retries, "retry budget spent");
                FailAction::Continue
            },
            action => action,
        };

        match action {
            FailAction::Retry => {
                let attempt = self.machine.record_retry();
                tracing::warn!(source = %self.name(), attempt, "retrying unit");
                Ok(UnitReport { outcome: UnitOutcome::RetryUnit, acquired: false })
            },
            FailAction::Continue => {
                let pending = self.pending_xfers(Msg::ENDXFER)?;
                self.machine.unit_completed();
                Ok(UnitReport::after(&pending, false))
            },
            FailAction::Abort => {
                self.pending_xfers(Msg::RESET)?;
                self.machine.set_pending(0);
                self.machine.unit_completed();
                Ok(UnitReport { outcome: UnitOutcome::NoMorePending, acquired: false })
            },
        }
    }
}

/// Strip size for a buffered transfer: the source's preference, else the
/// estimated image size (or a default) clamped to the source's limits.
fn strip_size(setup: &SetupMemXfer, info: Option<&ImageInfo>) -> u32 {
    if setup.preferred != 0 && setup.preferred != u32::MAX {
        return setup.preferred;
    }
    let estimate = info.and_then(ImageInfo::estimated_size).unwrap_or(DEFAULT_STRIP);
    let max = if setup.max_buf_size == 0 { u32::MAX } else { setup.max_buf_size };
    let min = setup.min_buf_size.clamp(1, max);
    estimate.clamp(min, max)
}

fn temp_name(format: FileFormat) -> String {
    format!("sb-{:016x}.{}", rand::random::<u64>(), format.extension())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_strip_size_wins() {
        let setup = SetupMemXfer { min_buf_size: 1024, max_buf_size: 8192, preferred: 4096 };
        assert_eq!(strip_size(&setup, None), 4096);
    }

    #[test]
    fn estimate_is_clamped_to_source_limits() {
        let setup = SetupMemXfer { min_buf_size: 1024, max_buf_size: 8192, preferred: u32::MAX };
        let big = ImageInfo {
            image_width: 2550,
            image_length: 3300,
            bits_per_pixel: 24,
            ..ImageInfo::default()
        };
        assert_eq!(strip_size(&setup, Some(&big)), 8192);

        let tiny = ImageInfo { image_width: 8, image_length: 2, bits_per_pixel: 1, ..ImageInfo::default() };
        assert_eq!(strip_size(&setup, Some(&tiny)), 1024);
    }

    #[test]
    fn unknown_size_uses_default_strip() {
        let setup = SetupMemXfer { min_buf_size: 0, max_buf_size: 0, preferred: 0 };
        assert_eq!(strip_size(&setup, None), DEFAULT_STRIP);
    }

    #[test]
    fn temp_names_carry_the_format_extension() {
        let name = temp_name(FileFormat::Png);
        assert!(name.starts_with("sb-"));
        assert!(name.ends_with(".png"));
        assert_ne!(temp_name(FileFormat::Png), name);
    }

    #[test]
    fn report_follows_pending_count() {
        let more = PendingXfers { count: -1, end_of_job: 0 };
        assert_eq!(UnitReport::after(&more, true).outcome, UnitOutcome::MorePending);
        let done = PendingXfers { count: 0, end_of_job: 0 };
        assert_eq!(UnitReport::after(&done, false).outcome, UnitOutcome::NoMorePending);
    }
}
