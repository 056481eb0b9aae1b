//! 审核插件：入群申请 / 群聊邀请 / 好友申请的人工审核队列。
//!
//! 平台请求事件先转发到固定的审核群，管理员通过「回复通知消息」或
//! 「/同意 /拒绝 + 请求标识」处理，处理结果经平台 API 确认后才从队列移除。

use crate::adapters::onebot::{LockedWriter, api, send_msg};
use crate::config::build_config;
use crate::event::Context;
use crate::message::Message;
use crate::plugins::{self, PluginError, get_config};
use crate::{error, info, warn};
use chrono::{Local, TimeZone};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use toml::Value;

pub mod parser;
pub mod store;

use parser::Decision;
use store::{AuditQueue, Entry, FriendRequest, GroupRequest, GroupSubType, RequestKind};

#[derive(Serialize, Deserialize)]
struct AuditConfig {
    enabled: bool,
    /// 审核群群号，0 表示未配置
    #[serde(default)]
    audit_group_id: i64,
}

pub fn default_config() -> Value {
    build_config(AuditConfig {
        enabled: true,
        audit_group_id: 0,
    })
}

static QUEUE: OnceLock<AuditQueue> = OnceLock::new();

pub fn init(_ctx: Context) -> BoxFuture<'static, Result<(), PluginError>> {
    Box::pin(async move {
        let data_dir = plugins::get_data_dir("audit").await?;
        let queue = AuditQueue::load(data_dir).await;
        let (group, friend) = queue.counts().await;
        let _ = QUEUE.set(queue);
        info!(target: "Plugin/Audit", "已加载审核请求持久化数据 (入群 {} / 好友 {})", group, friend);
        Ok(())
    })
}

/// 消息事件发送者的审核相关信息
struct Sender {
    user_id: i64,
    group_id: Option<i64>,
    self_id: i64,
    is_admin: bool,
    is_superuser: bool,
}

/// 基础命令权限：超级管理员，或群聊中的群管理员/群主
fn command_allowed(sender: &Sender) -> bool {
    sender.is_superuser || (sender.group_id.is_some() && sender.is_admin)
}

/// 好友请求只允许超级管理员处理，入群请求群管理员即可
fn may_resolve(kind: RequestKind, sender: &Sender) -> bool {
    !kind.is_friend() || sender.is_superuser
}

pub fn handle(
    ctx: Context,
    writer: LockedWriter,
) -> BoxFuture<'static, Result<Option<Context>, PluginError>> {
    Box::pin(async move {
        let config: AuditConfig = match get_config(&ctx, "audit") {
            Some(c) => c,
            None => return Ok(Some(ctx)),
        };
        let Some(queue) = QUEUE.get() else {
            return Ok(Some(ctx));
        };

        // ---- 请求事件：登记并通知审核群 ----
        if let Some(req) = ctx.as_request() {
            let request_type = req.request_type().to_string();
            let sub_type = req.sub_type().to_string();
            let flag = req.flag().to_string();
            let user_id = req.user_id();
            let group_id = req.group_id();
            let comment = req.comment().to_string();

            if config.audit_group_id == 0 {
                warn!(target: "Plugin/Audit", "审核群未配置 (audit_group_id)，忽略请求 flag={}", flag);
                return Ok(None);
            }

            intake(
                &ctx,
                writer,
                queue,
                config.audit_group_id,
                &request_type,
                &sub_type,
                flag,
                user_id,
                group_id,
                &comment,
            )
            .await;
            return Ok(None);
        }

        // ---- 群成员增加通知：转发到审核群 ----
        if let Some(notice) = ctx.as_notice() {
            if notice.notice_type() == "group_increase" && config.audit_group_id != 0 {
                let text = render_increase_notice(
                    notice.group_id().unwrap_or(0),
                    notice.user_id(),
                    notice.operator_id(),
                    notice.sub_type(),
                    notice.user_id() == notice.self_id(),
                );
                if let Err(e) =
                    send_msg(&ctx, writer, Some(config.audit_group_id), None, Message::from(text))
                        .await
                {
                    error!(target: "Plugin/Audit", "发送群成员增加通知消息失败: {}", e);
                }
                return Ok(None);
            }
            return Ok(Some(ctx));
        }

        // ---- 消息事件：命令与回复式处理 ----
        let Some(msg) = ctx.as_message() else {
            return Ok(Some(ctx));
        };
        let sender = Sender {
            user_id: msg.user_id(),
            group_id: msg.group_id(),
            self_id: msg.self_id(),
            is_admin: msg.sender_is_admin(),
            is_superuser: ctx.is_superuser(msg.user_id()),
        };

        // 查看入群审核
        if crate::command::match_command(&ctx, "查看入群审核").is_some() {
            if !command_allowed(&sender) {
                return Ok(Some(ctx));
            }
            if !check_audit_group(&ctx, &writer, &sender, config.audit_group_id).await? {
                return Ok(None);
            }
            let text = render_group_list(&queue.group_snapshot().await);
            reply(&ctx, writer, &sender, text).await?;
            return Ok(None);
        }

        // 查看好友审核 (仅超管)
        if crate::command::match_command(&ctx, "查看好友审核").is_some() {
            if !sender.is_superuser {
                return Ok(Some(ctx));
            }
            if !check_audit_group(&ctx, &writer, &sender, config.audit_group_id).await? {
                return Ok(None);
            }
            let text = render_friend_list(&queue.friend_snapshot().await);
            reply(&ctx, writer, &sender, text).await?;
            return Ok(None);
        }

        // 查看所有审核
        if crate::command::match_command(&ctx, "查看所有审核").is_some() {
            if !command_allowed(&sender) {
                return Ok(Some(ctx));
            }
            if !check_audit_group(&ctx, &writer, &sender, config.audit_group_id).await? {
                return Ok(None);
            }
            list_all(&ctx, writer, queue, &sender).await?;
            return Ok(None);
        }

        // 回复式处理：回复审核通知 + 「同意」/「拒绝理由」(理由无需空格分隔)
        if let Some(reply_id) = crate::command::reply_target(msg.0) {
            let text = crate::command::plain_text(msg.0);
            if let Some(decision) = parser::parse_decision(&text) {
                if !command_allowed(&sender) {
                    return Ok(Some(ctx));
                }
                if sender.group_id != Some(config.audit_group_id) {
                    return Ok(Some(ctx));
                }
                let Ok(source_id) = reply_id.parse::<i64>() else {
                    return Ok(Some(ctx));
                };
                let Some(flag) = queue.flag_for_message(source_id).await else {
                    // 回复的不是审核通知，与本插件无关
                    return Ok(Some(ctx));
                };
                resolve(&ctx, writer, queue, &sender, &flag, decision, true).await?;
                return Ok(None);
            }
            // 回复文本与审核无关，不拦截
        }

        // 命令式处理：同意/拒绝 + 请求标识
        for command in ["同意", "拒绝"] {
            let Some(matched) = crate::command::match_command(&ctx, command) else {
                continue;
            };
            if !command_allowed(&sender) {
                return Ok(Some(ctx));
            }

            let decision = if command == "同意" {
                Decision::Approve
            } else {
                let reason = matched
                    .rest
                    .split_once(char::is_whitespace)
                    .map(|(_, r)| r.trim().to_string());
                Decision::Reject {
                    reason: reason.unwrap_or_else(|| "管理员拒绝".to_string()),
                }
            };

            if sender.group_id.is_some()
                && !check_audit_group(&ctx, &writer, &sender, config.audit_group_id).await?
            {
                return Ok(None);
            }
            let flag = matched
                .rest
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_string();
            if flag.is_empty() {
                let usage = if command == "同意" {
                    "格式错误，请使用：同意 [请求标识]"
                } else {
                    "格式错误，请使用：拒绝 [请求标识] [拒绝理由(可选)]"
                };
                reply(&ctx, writer, &sender, usage.to_string()).await?;
                return Ok(None);
            }
            resolve(&ctx, writer, queue, &sender, &flag, decision, false).await?;
            return Ok(None);
        }

        Ok(Some(ctx))
    })
}

/// 群聊中命令只在审核群内有效。返回 false 表示已回复拒绝提示。
async fn check_audit_group(
    ctx: &Context,
    writer: &LockedWriter,
    sender: &Sender,
    audit_group_id: i64,
) -> Result<bool, PluginError> {
    if let Some(gid) = sender.group_id
        && gid != audit_group_id
    {
        reply(ctx, writer.clone(), sender, "此命令只能在指定的审核群中使用".to_string()).await?;
        return Ok(false);
    }
    Ok(true)
}

async fn reply(
    ctx: &Context,
    writer: LockedWriter,
    sender: &Sender,
    text: String,
) -> Result<(), PluginError> {
    send_msg(
        ctx,
        writer,
        sender.group_id,
        Some(sender.user_id),
        Message::from(text),
    )
    .await
}

// ================= 请求登记 =================

#[allow(clippy::too_many_arguments)]
async fn intake(
    ctx: &Context,
    writer: LockedWriter,
    queue: &AuditQueue,
    audit_group_id: i64,
    request_type: &str,
    sub_type: &str,
    flag: String,
    user_id: i64,
    group_id: Option<i64>,
    comment: &str,
) {
    let now = Local::now().timestamp();

    match request_type {
        "group" => {
            let gid = group_id.unwrap_or(0);
            let (stored_comment, parsed_sub_type, notice) = match sub_type {
                "invite" => {
                    let comment = "机器人被邀请进群".to_string();
                    let notice = format!(
                        "【收到新的入群邀请】\n邀请人: {}\n目标群组: {}\n请求标识: {}\n\n管理员回复本条消息「同意」或「拒绝 拒绝理由」进行处理",
                        user_id, gid, flag
                    );
                    (comment, GroupSubType::Invite, notice)
                }
                "add" => {
                    let word = parser::extract_answer(comment).to_string();
                    let notice = format!(
                        "【收到新的入群申请】\n申请人: {}\n目标群组: {}\n验证信息: {}\n请求标识: {}\n\n管理员回复本条消息「同意」或「拒绝 拒绝理由」进行处理",
                        user_id, gid, word, flag
                    );
                    (word, GroupSubType::Add, notice)
                }
                other => {
                    warn!(target: "Plugin/Audit", "收到未知类型的群组请求: {}, flag: {}", other, flag);
                    return;
                }
            };

            let sent =
                match api::send_group_msg(ctx, writer, audit_group_id, Message::from(notice)).await
                {
                    Ok(sent) => sent,
                    Err(e) => {
                        error!(target: "Plugin/Audit", "发送审核消息失败: {}", e);
                        return;
                    }
                };

            let request = GroupRequest {
                user_id,
                group_id: gid,
                comment: stored_comment,
                time: now,
                message_id: sent.message_id,
                sub_type: parsed_sub_type,
            };
            if let Err(e) = queue.insert_group(flag, request).await {
                error!(target: "Plugin/Audit", "保存入群请求数据失败: {}", e);
            }
        }
        "friend" => {
            let comment = if comment.is_empty() { "无" } else { comment };
            let notice = format!(
                "【收到新的好友申请】\n申请人: {}\n验证信息: {}\n请求标识: {}\n\n超级管理员回复本条消息「同意」或「拒绝 拒绝理由」进行处理",
                user_id, comment, flag
            );

            let sent =
                match api::send_group_msg(ctx, writer, audit_group_id, Message::from(notice)).await
                {
                    Ok(sent) => sent,
                    Err(e) => {
                        error!(target: "Plugin/Audit", "发送好友审核消息失败: {}", e);
                        return;
                    }
                };

            let request = FriendRequest {
                user_id,
                comment: comment.to_string(),
                time: now,
                message_id: sent.message_id,
            };
            if let Err(e) = queue.insert_friend(flag, request).await {
                error!(target: "Plugin/Audit", "保存好友请求数据失败: {}", e);
            }
        }
        other => {
            warn!(target: "Plugin/Audit", "收到未知类型的请求事件: {}", other);
        }
    }
}

// ================= 审核处理 =================

/// 处理一条审核决定。
/// `quiet_missing`: 回复式处理时请求可能刚被并发处理掉，此时静默忽略。
async fn resolve(
    ctx: &Context,
    writer: LockedWriter,
    queue: &AuditQueue,
    sender: &Sender,
    flag: &str,
    decision: Decision,
    quiet_missing: bool,
) -> Result<(), PluginError> {
    let Some(kind) = queue.kind(flag).await else {
        if !quiet_missing {
            let text = format!("未找到请求标识为 {} 的申请", flag);
            reply(ctx, writer, sender, text).await?;
        }
        return Ok(());
    };

    if !may_resolve(kind, sender) {
        reply(ctx, writer, sender, "只有超级管理员才能处理好友请求".to_string()).await?;
        return Ok(());
    }

    // 取出请求，并发处理同一请求时只有一方能取到
    let Some(claimed) = queue.claim(flag).await else {
        if !quiet_missing {
            let text = format!("未找到请求标识为 {} 的申请", flag);
            reply(ctx, writer, sender, text).await?;
        }
        return Ok(());
    };

    let approve = matches!(decision, Decision::Approve);
    let api_result = match &claimed.entry {
        Entry::Group(request) => {
            let reason = match &decision {
                Decision::Approve => None,
                Decision::Reject { reason } => Some(reason.as_str()),
            };
            api::set_group_add_request(
                ctx,
                writer.clone(),
                flag,
                request.sub_type.as_str(),
                approve,
                reason,
            )
            .await
        }
        Entry::Friend(_) => api::set_friend_add_request(ctx, writer.clone(), flag, approve).await,
    };

    match api_result {
        Ok(()) => {
            let text = success_text(&claimed.entry, claimed.kind, &decision);
            queue
                .confirm(claimed)
                .await
                .map_err(|e| -> PluginError { e.to_string().into() })?;
            reply(ctx, writer, sender, text).await?;
        }
        Err(e) => {
            error!(target: "Plugin/Audit", "处理请求失败: {}", e);
            let text = format!("处理请求失败: {}", e);
            // 平台未确认，放回队列等待重试
            if let Err(restore_err) = queue.restore(claimed).await {
                error!(target: "Plugin/Audit", "恢复请求失败: {}", restore_err);
            }
            reply(ctx, writer, sender, text).await?;
        }
    }
    Ok(())
}

fn success_text(entry: &Entry, kind: RequestKind, decision: &Decision) -> String {
    match (entry, kind, decision) {
        (Entry::Group(r), RequestKind::GroupInvite, Decision::Approve) => format!(
            "已同意接受用户 {} 的群聊邀请，已加入群 {}",
            r.user_id, r.group_id
        ),
        (Entry::Group(r), _, Decision::Approve) => {
            format!("已同意用户 {} 加入群 {}", r.user_id, r.group_id)
        }
        (Entry::Group(r), RequestKind::GroupInvite, Decision::Reject { reason }) => format!(
            "已拒绝接受用户 {} 的群聊邀请，群号: {}，理由: {}",
            r.user_id, r.group_id, reason
        ),
        (Entry::Group(r), _, Decision::Reject { reason }) => format!(
            "已拒绝用户 {} 加入群 {}，理由: {}",
            r.user_id, r.group_id, reason
        ),
        (Entry::Friend(r), _, Decision::Approve) => {
            format!("已同意用户 {} 的好友申请", r.user_id)
        }
        (Entry::Friend(r), _, Decision::Reject { reason }) => {
            format!("已拒绝用户 {} 的好友申请，理由: {}", r.user_id, reason)
        }
    }
}

// ================= 列表呈现 =================

fn format_time(time: i64) -> String {
    match Local.timestamp_opt(time, 0) {
        chrono::LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => time.to_string(),
    }
}

fn render_group_list(requests: &[(String, GroupRequest)]) -> String {
    if requests.is_empty() {
        return "当前没有待处理的入群请求".to_string();
    }
    let mut text = "待处理的入群请求列表：\n\n".to_string();
    for (flag, request) in requests {
        text.push_str(&format!(
            "请求标识: {}\n申请人: {}\n目标群组: {}\n验证信息: {}\n申请时间: {}\n---------------------\n",
            flag,
            request.user_id,
            request.group_id,
            request.comment,
            format_time(request.time)
        ));
    }
    text
}

fn render_friend_list(requests: &[(String, FriendRequest)]) -> String {
    if requests.is_empty() {
        return "当前没有待处理的好友请求".to_string();
    }
    let mut text = "待处理的好友请求列表：\n\n".to_string();
    for (flag, request) in requests {
        text.push_str(&format!(
            "请求标识: {}\n申请人: {}\n验证信息: {}\n申请时间: {}\n---------------------\n",
            flag,
            request.user_id,
            request.comment,
            format_time(request.time)
        ));
    }
    text
}

fn render_increase_notice(
    group_id: i64,
    user_id: i64,
    operator_id: Option<i64>,
    sub_type: &str,
    is_self: bool,
) -> String {
    if sub_type == "invite" && is_self {
        format!(
            "【机器人被邀请入群通知】\n机器人已被 {} 邀请加入群 {}\n时间: {}\n",
            operator_id.unwrap_or(0),
            group_id,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )
    } else {
        format!(
            "【群成员增加通知】\n群号: {}\n新成员: {}\n操作人: {}\n加入方式: {}\n",
            group_id,
            user_id,
            operator_id.unwrap_or(0),
            sub_type
        )
    }
}

/// 查看所有审核：群聊用合并转发呈现，私聊只给数量摘要
async fn list_all(
    ctx: &Context,
    writer: LockedWriter,
    queue: &AuditQueue,
    sender: &Sender,
) -> Result<(), PluginError> {
    let group = queue.group_snapshot().await;
    let friend = queue.friend_snapshot().await;

    if group.is_empty() && friend.is_empty() {
        reply(ctx, writer, sender, "当前没有任何待处理的请求".to_string()).await?;
        return Ok(());
    }

    if sender.group_id.is_none() {
        // 私聊摘要
        let add = group
            .iter()
            .filter(|(_, r)| r.sub_type == GroupSubType::Add)
            .count();
        let invite = group.len() - add;
        let mut text = "当前待处理的请求如下，请在审核群中处理：\n\n".to_string();
        if add > 0 {
            text.push_str(&format!("入群申请: {}个\n", add));
        }
        if invite > 0 {
            text.push_str(&format!("群聊邀请: {}个\n", invite));
        }
        if !friend.is_empty() {
            text.push_str(&format!("好友申请: {}个\n", friend.len()));
        }
        reply(ctx, writer, sender, text).await?;
        return Ok(());
    }

    let bot_id = sender.self_id;
    let mut nodes = Message::new().node_custom(
        bot_id,
        "审核系统",
        Message::from("📋 待处理的审核请求列表"),
    );

    if !group.is_empty() {
        nodes = nodes.node_custom(bot_id, "审核系统", Message::from("🔹 入群请求列表"));
        for (flag, request) in &group {
            let info_text = match request.sub_type {
                GroupSubType::Invite => format!(
                    "【群聊邀请】\n邀请人: {}\n目标群组: {}",
                    request.user_id, request.group_id
                ),
                GroupSubType::Add => format!(
                    "【入群申请】\n申请人: {}\n目标群组: {}\n验证信息: {}",
                    request.user_id, request.group_id, request.comment
                ),
            };
            let content = format!(
                "{}\n请求标识: {}\n申请时间: {}\n\n回复「同意 {}」或「拒绝 {} 原因」处理",
                info_text,
                flag,
                format_time(request.time),
                flag,
                flag
            );
            nodes = nodes.node_custom(bot_id, "入群申请", Message::from(content));
        }
    }

    if !friend.is_empty() {
        nodes = nodes.node_custom(bot_id, "审核系统", Message::from("🔸 好友请求列表"));
        for (flag, request) in &friend {
            let content = format!(
                "【好友申请】\n申请人: {}\n验证信息: {}\n请求标识: {}\n申请时间: {}\n\n回复「同意 {}」或「拒绝 {} 原因」处理",
                request.user_id,
                request.comment,
                flag,
                format_time(request.time),
                flag,
                flag
            );
            nodes = nodes.node_custom(bot_id, "好友申请", Message::from(content));
        }
    }

    nodes = nodes.node_custom(
        bot_id,
        "审核系统",
        Message::from(
            "✅ 使用说明：\n1. 回复消息「同意」或「拒绝 原因」\n2. 直接发送「/同意 请求标识」\n3. 直接发送「/拒绝 请求标识 原因」",
        ),
    );

    api::send_forward_msg(ctx, writer, sender.group_id, None, nodes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_request(sub_type: GroupSubType) -> GroupRequest {
        GroupRequest {
            user_id: 10001,
            group_id: 20002,
            comment: "朋友推荐".to_string(),
            time: 1_700_000_000,
            message_id: 1,
            sub_type,
        }
    }

    #[test]
    fn command_permission_matrix() {
        let superuser = Sender {
            user_id: 1,
            group_id: None,
            self_id: 0,
            is_admin: false,
            is_superuser: true,
        };
        assert!(command_allowed(&superuser));

        let group_admin = Sender {
            user_id: 2,
            group_id: Some(100),
            self_id: 0,
            is_admin: true,
            is_superuser: false,
        };
        assert!(command_allowed(&group_admin));

        let plain_member = Sender {
            user_id: 3,
            group_id: Some(100),
            self_id: 0,
            is_admin: false,
            is_superuser: false,
        };
        assert!(!command_allowed(&plain_member));

        let private_stranger = Sender {
            user_id: 4,
            group_id: None,
            self_id: 0,
            is_admin: false,
            is_superuser: false,
        };
        assert!(!command_allowed(&private_stranger));
    }

    #[test]
    fn friend_requests_require_superuser() {
        let group_admin = Sender {
            user_id: 2,
            group_id: Some(100),
            self_id: 0,
            is_admin: true,
            is_superuser: false,
        };
        // 群管理员可以处理入群请求，但不能处理好友请求
        assert!(may_resolve(RequestKind::GroupAdd, &group_admin));
        assert!(may_resolve(RequestKind::GroupInvite, &group_admin));
        assert!(!may_resolve(RequestKind::Friend, &group_admin));

        let superuser = Sender {
            user_id: 1,
            group_id: None,
            self_id: 0,
            is_admin: false,
            is_superuser: true,
        };
        assert!(may_resolve(RequestKind::Friend, &superuser));
    }

    #[test]
    fn success_texts_per_kind() {
        let add = Entry::Group(group_request(GroupSubType::Add));
        assert_eq!(
            success_text(&add, RequestKind::GroupAdd, &Decision::Approve),
            "已同意用户 10001 加入群 20002"
        );
        assert_eq!(
            success_text(
                &add,
                RequestKind::GroupAdd,
                &Decision::Reject {
                    reason: "年龄太小".to_string()
                }
            ),
            "已拒绝用户 10001 加入群 20002，理由: 年龄太小"
        );

        let invite = Entry::Group(group_request(GroupSubType::Invite));
        assert_eq!(
            success_text(&invite, RequestKind::GroupInvite, &Decision::Approve),
            "已同意接受用户 10001 的群聊邀请，已加入群 20002"
        );

        let friend = Entry::Friend(FriendRequest {
            user_id: 10003,
            comment: "加个好友".to_string(),
            time: 1_700_000_100,
            message_id: 2,
        });
        assert_eq!(
            success_text(&friend, RequestKind::Friend, &Decision::Approve),
            "已同意用户 10003 的好友申请"
        );
    }

    #[test]
    fn empty_lists_have_placeholder_text() {
        assert_eq!(render_group_list(&[]), "当前没有待处理的入群请求");
        assert_eq!(render_friend_list(&[]), "当前没有待处理的好友请求");
    }

    #[test]
    fn group_list_keeps_insertion_order() {
        let entries = vec![
            ("flag-b".to_string(), group_request(GroupSubType::Add)),
            ("flag-a".to_string(), group_request(GroupSubType::Invite)),
        ];
        let text = render_group_list(&entries);
        assert!(text.starts_with("待处理的入群请求列表："));
        let pos_b = text.find("flag-b").unwrap();
        let pos_a = text.find("flag-a").unwrap();
        assert!(pos_b < pos_a);
    }

    #[test]
    fn increase_notice_distinguishes_self_invite() {
        let self_invited = render_increase_notice(100, 42, Some(7), "invite", true);
        assert!(self_invited.starts_with("【机器人被邀请入群通知】"));

        let member_joined = render_increase_notice(100, 42, Some(7), "approve", false);
        assert!(member_joined.starts_with("【群成员增加通知】"));
        assert!(member_joined.contains("新成员: 42"));
    }
}
