//! Configuration consumed by sessions and sources.
//!
//! The engine owns none of this: the host builds it (from a file, flags,
//! or code) and hands it in.

use std::{path::PathBuf, time::Duration};

use scanbridge_proto::{Frame, payloads::FileFormat};
use serde::{Deserialize, Serialize};

/// Session-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Watchdog period for non-exempt calls, `None` to disable
    pub watchdog_timeout: Option<Duration>,
    /// Log every triplet before and after the call
    pub log_triplets: bool,
    /// Directory for prompted file transfers
    pub temp_dir: PathBuf,
    /// Sources that signal close before transfer readiness
    pub deferred_close: DeferredClosePolicy,
    /// Parent window handle passed when opening the broker
    pub parent_window: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout: None,
            log_triplets: false,
            temp_dir: std::env::temp_dir(),
            deferred_close: DeferredClosePolicy::default(),
            parent_window: 0,
        }
    }
}

/// Allow-list of sources whose close request must wait for transfer
/// readiness, plus the number of later events after which the interface
/// is closed anyway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferredClosePolicy {
    /// Product names, matched exactly
    pub products: Vec<String>,
    /// Events after the close request before forcing the close
    pub threshold: u32,
}

impl Default for DeferredClosePolicy {
    fn default() -> Self {
        Self { products: Vec::new(), threshold: 4 }
    }
}

impl DeferredClosePolicy {
    /// Whether a product is on the allow-list.
    pub fn applies_to(&self, product_name: &str) -> bool {
        self.products.iter().any(|product| product == product_name)
    }
}

/// How units are moved from the source to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransferMode {
    /// Whole image in one native handle
    #[default]
    Native,
    /// Image in buffered strips
    Memory,
    /// Source writes a file
    File,
    /// Whole audio clip in one native handle
    AudioNative,
    /// Source writes an audio file
    AudioFile,
    /// Clipboard export, transferred via [`ClipboardDelegate`]
    Clipboard,
}

impl TransferMode {
    /// Audio group transfer.
    pub fn is_audio(self) -> bool {
        matches!(self, Self::AudioNative | Self::AudioFile)
    }

    /// Transfer mechanism capability value for this mode.
    pub fn mechanism_code(self, clipboard: ClipboardDelegate) -> u16 {
        match self {
            Self::Native | Self::AudioNative => 0,
            Self::File | Self::AudioFile => 1,
            Self::Memory => 2,
            Self::Clipboard => clipboard.mode().mechanism_code(clipboard),
        }
    }
}

/// Mechanism used underneath a clipboard export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClipboardDelegate {
    /// Native transfer
    #[default]
    Native,
    /// Buffered transfer
    Memory,
}

impl ClipboardDelegate {
    /// Transfer mode this delegate runs.
    pub fn mode(self) -> TransferMode {
        match self {
            Self::Native => TransferMode::Native,
            Self::Memory => TransferMode::Memory,
        }
    }
}

/// File transfer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileTransferConfig {
    /// Destination path (ignored in prompt mode)
    pub path: PathBuf,
    /// File format
    pub format: FileFormat,
    /// Transfer to a generated temporary name, then hand the result to the
    /// save prompt
    pub prompt: bool,
    /// Issue the file-transfer setup triplet before each unit
    pub setup: bool,
    /// Remove the temporary file once the prompt has saved it
    pub delete_after_save: bool,
}

impl Default for FileTransferConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scan.bmp"),
            format: FileFormat::Bmp,
            prompt: false,
            setup: true,
            delete_after_save: true,
        }
    }
}

/// What to do when a unit transfer fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FailAction {
    /// Reset the remaining transfers and stop
    #[default]
    Abort,
    /// Skip the unit and move on to the next
    Continue,
    /// Repeat the unit, up to the retry budget
    Retry,
}

/// Retry budget and fail action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed per unit
    pub max_retries: u32,
    /// What a failure does
    pub fail_action: FailAction,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, fail_action: FailAction::Abort }
    }
}

/// Per-acquisition settings of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Transfer mechanism
    pub mode: TransferMode,
    /// Mechanism under a clipboard export
    pub clipboard: ClipboardDelegate,
    /// File transfer settings
    pub file: FileTransferConfig,
    /// Area to acquire, applied before enabling
    pub layout: Option<Frame>,
    /// Horizontal and vertical scaling, applied before enabling
    pub scaling: Option<(f64, f64)>,
    /// Retry budget and fail action
    pub retry: RetryPolicy,
    /// Continue with the previous metadata when a metadata fetch fails
    pub skip_image_info_errors: bool,
    /// Show the source's own interface
    pub show_ui: bool,
    /// Run the interface modally
    pub modal_ui: bool,
    /// Enable the interface for settings only, without acquiring
    pub ui_only: bool,
    /// Disable the interface once an acquisition finishes
    pub close_ui_after_acquire: bool,
    /// Stop after this many pages
    pub max_pages: Option<u32>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            mode: TransferMode::Native,
            clipboard: ClipboardDelegate::Native,
            file: FileTransferConfig::default(),
            layout: None,
            scaling: None,
            retry: RetryPolicy::default(),
            skip_image_info_errors: true,
            show_ui: false,
            modal_ui: false,
            ui_only: false,
            close_ui_after_acquire: true,
            max_pages: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_close_matches_exact_product() {
        let policy =
            DeferredClosePolicy { products: vec!["Camera X".into()], threshold: 4 };
        assert!(policy.applies_to("Camera X"));
        assert!(!policy.applies_to("Camera"));
    }

    #[test]
    fn clipboard_uses_delegate_mechanism() {
        assert_eq!(TransferMode::Clipboard.mechanism_code(ClipboardDelegate::Memory), 2);
        assert_eq!(TransferMode::Clipboard.mechanism_code(ClipboardDelegate::Native), 0);
        assert_eq!(TransferMode::File.mechanism_code(ClipboardDelegate::Memory), 1);
    }
}
