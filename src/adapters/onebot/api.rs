// 引用同模块下的工具函数
use super::{LockedWriter, send_frame_raw};
use crate::event::Context;
use crate::message::Message;
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;
use simd_json::derived::{ValueObjectAccess, ValueObjectAccessAsScalar};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub type ApiError = Box<dyn std::error::Error + Send + Sync>;

static ECHO_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_echo() -> String {
    let count = ECHO_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("api-req-{}", count)
}

#[derive(Serialize)]
struct ApiRequest<T> {
    action: String,
    params: T,
    echo: String,
}

/// 通用 API 调用函数
pub async fn call_action<P, R>(
    ctx: &Context,
    writer: LockedWriter,
    action: &str,
    params: P,
) -> Result<R, ApiError>
where
    P: Serialize,
    R: serde::de::DeserializeOwned,
{
    let echo = next_echo();
    let req = ApiRequest {
        action: action.to_string(),
        params,
        echo: echo.clone(),
    };

    let json_str = simd_json::to_string(&req)?;

    // 注册监听，默认超时 60 秒
    let wait_future = ctx.matcher.wait_resp(echo, Duration::from_secs(60));

    // 发送请求
    send_frame_raw(writer, json_str).await?;

    // 等待响应
    let resp_event = wait_future.await.ok_or("API 请求超时")?;

    // 响应格式: { status, retcode, data, echo }
    let retcode = resp_event
        .get_i64("retcode")
        .or_else(|| resp_event.get_u64("retcode").map(|v| v as i64))
        .unwrap_or(-1);

    if retcode != 0 {
        let msg = resp_event.get_str("msg").unwrap_or("Unknown Error");
        return Err(format!("API 调用失败 (retcode={}): {}", retcode, msg).into());
    }

    // 提取 data 字段
    let data_val = resp_event
        .get("data")
        .cloned()
        .unwrap_or(OwnedValue::from(()));

    let data: R = simd_json::serde::from_owned_value(data_val)?;

    Ok(data)
}

// ================= API 定义 =================

// --- get_login_info ---

#[derive(Serialize)]
struct GetLoginInfoParams {}

#[derive(Debug, Deserialize)]
pub struct LoginInfo {
    pub user_id: i64,
    pub nickname: String,
}

pub async fn get_login_info(ctx: &Context, writer: LockedWriter) -> Result<LoginInfo, ApiError> {
    call_action(ctx, writer, "get_login_info", GetLoginInfoParams {}).await
}

// --- send_group_msg ---

#[derive(Serialize)]
struct SendGroupMsgParams {
    group_id: i64,
    message: Message,
}

#[derive(Debug, Deserialize)]
pub struct SentMessage {
    pub message_id: i64,
}

/// 向指定群发送消息并返回平台分配的 message_id
/// (审核通知需要用返回的 ID 建立回复关联，因此不走 send_msg 流水线)
pub async fn send_group_msg(
    ctx: &Context,
    writer: LockedWriter,
    group_id: i64,
    message: Message,
) -> Result<SentMessage, ApiError> {
    let params = SendGroupMsgParams { group_id, message };
    call_action(ctx, writer, "send_group_msg", params).await
}

// --- send_forward_msg (group/private) ---

#[derive(Serialize)]
struct SendForwardMsgParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<i64>,
    messages: Message,
}

pub async fn send_forward_msg(
    ctx: &Context,
    writer: LockedWriter,
    group_id: Option<i64>,
    user_id: Option<i64>,
    messages: Message,
) -> Result<simd_json::OwnedValue, ApiError> {
    let action = if group_id.is_some() {
        "send_group_forward_msg"
    } else {
        "send_private_forward_msg"
    };

    let params = SendForwardMsgParams {
        group_id,
        user_id,
        messages,
    };

    call_action(ctx, writer, action, params).await
}

// --- set_group_add_request ---

#[derive(Serialize)]
struct SetGroupAddRequestParams<'a> {
    flag: &'a str,
    sub_type: &'a str,
    approve: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

/// 处理入群申请 / 群聊邀请
/// 需要确认平台是否接受 (flag 过期会返回非零 retcode)，因此等待响应
pub async fn set_group_add_request(
    ctx: &Context,
    writer: LockedWriter,
    flag: &str,
    sub_type: &str,
    approve: bool,
    reason: Option<&str>,
) -> Result<(), ApiError> {
    let params = SetGroupAddRequestParams {
        flag,
        sub_type,
        approve,
        reason,
    };
    call_action::<_, simd_json::OwnedValue>(ctx, writer, "set_group_add_request", params).await?;
    Ok(())
}

// --- set_friend_add_request ---

#[derive(Serialize)]
struct SetFriendAddRequestParams<'a> {
    flag: &'a str,
    approve: bool,
}

/// 处理好友申请
pub async fn set_friend_add_request(
    ctx: &Context,
    writer: LockedWriter,
    flag: &str,
    approve: bool,
) -> Result<(), ApiError> {
    let params = SetFriendAddRequestParams { flag, approve };
    call_action::<_, simd_json::OwnedValue>(ctx, writer, "set_friend_add_request", params).await?;
    Ok(())
}
