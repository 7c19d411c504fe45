//! Audio-group payload records.

use serde::{Deserialize, Serialize};

/// Metadata of the pending audio snippet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioInfo {
    /// Source-defined description
    pub name: String,
    /// Reserved
    pub reserved: u32,
}
