//! 设备分组

use std::fmt;

use serde::{Deserialize, Serialize};

/// 设备分组：同一分组内的连接互斥
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceGroup {
    Mobile,
    Desktop,
    Web,
}

impl DeviceGroup {
    pub const ALL: [DeviceGroup; 3] = [DeviceGroup::Mobile, DeviceGroup::Desktop, DeviceGroup::Web];

    /// 由设备类型推导分组，未知或缺省归为 WEB
    pub fn from_device_type(device_type: Option<&str>) -> Self {
        let Some(raw) = device_type else {
            return DeviceGroup::Web;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "ios" | "android" | "mobile" => DeviceGroup::Mobile,
            "windows" | "mac" | "linux" | "desktop" => DeviceGroup::Desktop,
            _ => DeviceGroup::Web,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceGroup::Mobile => "MOBILE",
            DeviceGroup::Desktop => "DESKTOP",
            DeviceGroup::Web => "WEB",
        }
    }
}

impl fmt::Display for DeviceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_groups_case_insensitively() {
        assert_eq!(DeviceGroup::from_device_type(Some("iOS")), DeviceGroup::Mobile);
        assert_eq!(DeviceGroup::from_device_type(Some("android")), DeviceGroup::Mobile);
        assert_eq!(DeviceGroup::from_device_type(Some("MAC")), DeviceGroup::Desktop);
        assert_eq!(DeviceGroup::from_device_type(Some("h5")), DeviceGroup::Web);
        assert_eq!(DeviceGroup::from_device_type(Some("toaster")), DeviceGroup::Web);
        assert_eq!(DeviceGroup::from_device_type(None), DeviceGroup::Web);
    }
}
