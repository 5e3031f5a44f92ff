use nimbus_signaling_common::DeviceGroup;

/// 连接身份
///
/// 由鉴权闸门在认证成功时创建一次，之后只读地传给登录、心跳与清理等环节。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub user_id: String,
    /// 握手时声明的设备类型（登录消息可再指定）
    pub device_type: Option<String>,
    /// 认证使用的凭证，心跳时用于计算剩余有效期
    pub token: String,
}

impl ConnectionIdentity {
    pub fn new(
        user_id: impl Into<String>,
        device_type: Option<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_type: device_type.filter(|d| !d.is_empty()),
            token: token.into(),
        }
    }

    /// 解析最终设备类型：登录消息中的优先，其次握手声明
    pub fn resolve_device_type<'a>(&'a self, requested: Option<&'a str>) -> Option<&'a str> {
        requested
            .filter(|d| !d.is_empty())
            .or(self.device_type.as_deref())
    }

    pub fn device_group(&self) -> DeviceGroup {
        DeviceGroup::from_device_type(self.device_type.as_deref())
    }
}
