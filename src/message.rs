use serde::ser::{Serialize, SerializeMap, Serializer};
use simd_json::OwnedValue;
use simd_json::owned::Object;

/// 消息段
#[derive(Debug, Clone)]
pub struct Segment {
    pub type_: String,
    pub data: Object,
}

impl Segment {
    pub fn new(type_: &str) -> Self {
        Self {
            type_: type_.to_string(),
            data: Object::new(),
        }
    }

    pub fn put(mut self, key: &str, value: impl Into<OwnedValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn into_value(self) -> OwnedValue {
        let mut obj = Object::new();
        obj.insert("type".into(), OwnedValue::from(self.type_));
        obj.insert("data".into(), OwnedValue::from(self.data));
        OwnedValue::from(obj)
    }
}

/// 消息构建器 (OneBot 消息段数组)
#[derive(Debug, Clone, Default)]
pub struct Message(pub Vec<Segment>);

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, segment: Segment) -> Self {
        self.0.push(segment);
        self
    }

    /// 纯文本段
    pub fn text(self, text: impl Into<String>) -> Self {
        self.add(Segment::new("text").put("text", text.into()))
    }

    /// 自定义合并转发节点 (用于 send_forward_msg)
    pub fn node_custom(self, user_id: i64, nickname: &str, content: Message) -> Self {
        let mut data = Object::new();
        data.insert("user_id".into(), OwnedValue::from(user_id.to_string()));
        data.insert("nickname".into(), OwnedValue::from(nickname));
        data.insert("content".into(), content.into_value());

        self.add(Segment {
            type_: "node".to_string(),
            data,
        })
    }

    pub fn into_value(self) -> OwnedValue {
        OwnedValue::from(
            self.0
                .into_iter()
                .map(Segment::into_value)
                .collect::<Vec<_>>(),
        )
    }
}

impl Serialize for Segment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", &self.type_)?;
        map.serialize_entry("data", &OwnedValue::from(self.data.clone()))?;
        map.end()
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::new().text(text)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::new().text(text)
    }
}
