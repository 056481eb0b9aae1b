use crate::config::AppConfig;
use crate::matcher::Matcher;
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;
use simd_json::derived::{ValueObjectAccess, ValueObjectAccessAsScalar};
use std::sync::{Arc, RwLock};

pub type Event = OwnedValue;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoginUser {
    pub id: String,
    pub name: Option<String>,
    pub nick: Option<String>,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BotStatus {
    pub adapter: String,
    pub platform: String,
    pub login_user: LoginUser,
}

/// 统一的上下文，包含事件数据、可变配置和等待匹配器
/// 注意：event 字段直接持有 EventType，支持在插件链中移交所有权从而实现修改。
#[derive(Clone)]
pub struct Context {
    pub event: EventType,
    pub config: Arc<RwLock<AppConfig>>,
    pub matcher: Arc<Matcher>,
    pub bot: BotStatus,
}

impl Context {
    /// 尝试将当前事件视为 OneBot 消息事件
    pub fn as_message(&self) -> Option<MessageEvent<'_>> {
        if let EventType::Onebot(event) = &self.event
            && event.get_str("post_type") == Some("message")
        {
            return Some(MessageEvent(event));
        }
        None
    }

    /// 尝试将当前事件视为 OneBot 请求事件（入群申请/群聊邀请/好友申请）
    pub fn as_request(&self) -> Option<RequestEvent<'_>> {
        if let EventType::Onebot(event) = &self.event
            && event.get_str("post_type") == Some("request")
        {
            return Some(RequestEvent(event));
        }
        None
    }

    /// 尝试将当前事件视为 OneBot 通知事件
    pub fn as_notice(&self) -> Option<NoticeEvent<'_>> {
        if let EventType::Onebot(event) = &self.event
            && event.get_str("post_type") == Some("notice")
        {
            return Some(NoticeEvent(event));
        }
        None
    }

    /// 获取事件的 Post Type (如果是 OneBot 事件)
    pub fn post_type(&self) -> Option<&str> {
        if let EventType::Onebot(event) = &self.event {
            event.get_str("post_type")
        } else {
            None
        }
    }

    /// 当前事件发送者是否为超级管理员
    pub fn is_superuser(&self, user_id: i64) -> bool {
        self.config.read().unwrap().is_superuser(user_id)
    }
}

// ================== 事件封装工具 ==================

fn get_i64_field(ev: &Event, key: &str) -> Option<i64> {
    ev.get_i64(key).or_else(|| ev.get_u64(key).map(|v| v as i64))
}

/// 消息事件封装，提供便捷的强类型访问
pub struct MessageEvent<'a>(pub &'a Event);

impl<'a> MessageEvent<'a> {
    /// 获取群号 (如果是群消息)
    pub fn group_id(&self) -> Option<i64> {
        get_i64_field(self.0, "group_id")
    }

    /// 获取用户 ID
    pub fn user_id(&self) -> i64 {
        get_i64_field(self.0, "user_id").unwrap_or(0)
    }

    /// 获取 Bot 自身 ID
    pub fn self_id(&self) -> i64 {
        get_i64_field(self.0, "self_id").unwrap_or(0)
    }

    /// 获取发送者昵称
    pub fn sender_nickname(&self) -> Option<&'a str> {
        self.0.get("sender").and_then(|s| s.get_str("nickname"))
    }

    /// 获取发送者群名片 (如果为空则返回 None)
    pub fn sender_card(&self) -> Option<&'a str> {
        self.0
            .get("sender")
            .and_then(|s| s.get_str("card"))
            .filter(|s| !s.is_empty())
    }

    /// 获取发送者显示名称 (优先名片，其次昵称)
    pub fn sender_name(&self) -> &'a str {
        self.sender_card()
            .or_else(|| self.sender_nickname())
            .unwrap_or("Unknown")
    }

    /// 获取发送者角色 (owner, admin, member)
    pub fn sender_role(&self) -> Option<&'a str> {
        self.0.get("sender").and_then(|s| s.get_str("role"))
    }

    /// 发送者是否为群管理员或群主
    pub fn sender_is_admin(&self) -> bool {
        matches!(self.sender_role(), Some("admin") | Some("owner"))
    }
}

/// 请求事件封装（request_type: group / friend）
pub struct RequestEvent<'a>(pub &'a Event);

impl<'a> RequestEvent<'a> {
    /// 请求类别 ("group" 或 "friend")
    pub fn request_type(&self) -> &'a str {
        self.0.get_str("request_type").unwrap_or("")
    }

    /// 群请求子类型 ("add" 入群申请 / "invite" 邀请 Bot 进群)
    pub fn sub_type(&self) -> &'a str {
        self.0.get_str("sub_type").unwrap_or("")
    }

    /// 请求标识，处理请求时原样传回平台
    pub fn flag(&self) -> &'a str {
        self.0.get_str("flag").unwrap_or("")
    }

    pub fn user_id(&self) -> i64 {
        get_i64_field(self.0, "user_id").unwrap_or(0)
    }

    pub fn group_id(&self) -> Option<i64> {
        get_i64_field(self.0, "group_id")
    }

    /// 验证信息（可能为空）
    pub fn comment(&self) -> &'a str {
        self.0.get_str("comment").unwrap_or("")
    }
}

/// 通知事件封装
pub struct NoticeEvent<'a>(pub &'a Event);

impl<'a> NoticeEvent<'a> {
    pub fn notice_type(&self) -> &'a str {
        self.0.get_str("notice_type").unwrap_or("")
    }

    pub fn sub_type(&self) -> &'a str {
        self.0.get_str("sub_type").unwrap_or("")
    }

    pub fn group_id(&self) -> Option<i64> {
        get_i64_field(self.0, "group_id")
    }

    pub fn user_id(&self) -> i64 {
        get_i64_field(self.0, "user_id").unwrap_or(0)
    }

    pub fn operator_id(&self) -> Option<i64> {
        get_i64_field(self.0, "operator_id")
    }

    pub fn self_id(&self) -> i64 {
        get_i64_field(self.0, "self_id").unwrap_or(0)
    }
}

// ================== 基础结构定义 ==================

/// 事件类型
#[derive(Debug, Clone)]
pub enum EventType {
    /// 来自 OneBot 的原始事件
    Onebot(Event),
    /// 插件准备发送消息前的拦截事件
    BeforeSend(SendPacket),
    /// 系统初始化事件 (用于插件 init 生命周期)
    Init,
}

/// 发送包结构，用于在 BeforeSend 中传递
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SendPacket {
    pub action: String,
    pub params: OwnedValue,
}
