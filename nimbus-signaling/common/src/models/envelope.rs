//! Envelope：线上与总线上流转的通用消息单元

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::MessageType;

/// 通用消息单元
///
/// 两种编码（二进制 / JSON）共享同一内存结构。可选字符串字段中的空串
/// 与 `data: null` 均视为缺省，保证两种编码往返一致。
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "empty_as_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "empty_as_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "empty_as_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "empty_as_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "empty_as_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty", deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_default")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "empty_as_none")]
    pub message: Option<String>,
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.is_empty()))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Envelope {
    pub fn builder(kind: MessageType) -> EnvelopeBuilder {
        EnvelopeBuilder::new(kind.code())
    }

    /// 已知的消息类型（未知 code 返回 None）
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_code(self.code)
    }

    /// 复制一份并替换目标用户列表（用于按节点扇出）
    pub fn with_ids(&self, ids: Vec<String>) -> Self {
        Self {
            ids,
            ..self.clone()
        }
    }

    /// 可选字段归一化：空串与 null 视为缺省
    pub fn normalized(mut self) -> Self {
        for field in [
            &mut self.token,
            &mut self.request_id,
            &mut self.client_ip,
            &mut self.user_agent,
            &mut self.device_type,
            &mut self.message,
        ] {
            if field.as_deref() == Some("") {
                *field = None;
            }
        }
        if matches!(self.data, Some(Value::Null)) {
            self.data = None;
        }
        self
    }

    /// 从 `data` 中读取字符串字段
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key)?.as_str()
    }
}

/// Envelope 构建器
#[derive(Debug, Clone, Default)]
pub struct EnvelopeBuilder {
    inner: Envelope,
}

impl EnvelopeBuilder {
    pub fn new(code: i32) -> Self {
        Self {
            inner: Envelope {
                code,
                timestamp: nimbus_im_core::utils::current_millis(),
                ..Envelope::default()
            },
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.inner.token = Some(token.into());
        self
    }

    pub fn request_id(mut self, request_id: Option<String>) -> Self {
        self.inner.request_id = request_id;
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.inner.timestamp = timestamp;
        self
    }

    pub fn client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.inner.client_ip = Some(client_ip.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.inner.user_agent = Some(user_agent.into());
        self
    }

    pub fn device_type(mut self, device_type: impl Into<String>) -> Self {
        self.inner.device_type = Some(device_type.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.metadata.insert(key.into(), value.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.inner.data = Some(data);
        self
    }

    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.inner.ids = ids;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.inner.message = Some(message.into());
        self
    }

    pub fn build(self) -> Envelope {
        self.inner.normalized()
    }
}
