use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::types::{ElementEntry, FirmwareVersion, ModuleInfo};

pub const MANIFEST_VERSION: &str = "1.0.0";
pub const MANIFEST_FILE: &str = "module.json";

/// On-disk `module.json`, one per module directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleManifest {
    pub version: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub tool_version: String,
    pub index: usize,
    pub position: [i8; 2],
    #[serde(rename = "type")]
    pub type_name: String,
    pub type_id: u8,
    pub firmware: FirmwareVersion,
    pub elements: Vec<ElementEntry>,
    pub pages: Vec<u8>,
}

impl ModuleManifest {
    pub fn new(index: usize, module: &ModuleInfo, pages: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            version: MANIFEST_VERSION.to_string(),
            created: now,
            modified: now,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            index,
            position: [module.dx, module.dy],
            type_name: module.type_name.clone(),
            type_id: module.type_id,
            firmware: module.firmware,
            elements: module.elements.clone(),
            pages,
        }
    }

    pub fn to_module_info(&self) -> ModuleInfo {
        ModuleInfo {
            dx: self.position[0],
            dy: self.position[1],
            type_name: self.type_name.clone(),
            type_id: self.type_id,
            firmware: self.firmware,
            elements: self.elements.clone(),
        }
    }
}
