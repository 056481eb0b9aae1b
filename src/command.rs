use crate::event::Context;
use simd_json::OwnedValue;
use simd_json::base::ValueAsScalar;
use simd_json::derived::{ValueObjectAccess, ValueObjectAccessAsScalar};

/// 指令匹配结果
#[derive(Debug, Default)]
pub struct CommandMatch {
    /// 指令名之后的剩余文本 (已去除首尾空白)
    pub rest: String,
}

fn segments(event: &OwnedValue) -> Option<&[OwnedValue]> {
    match event.get("message") {
        Some(OwnedValue::Array(arr)) => Some(arr.as_slice()),
        _ => None,
    }
}

fn segment_text(seg: &OwnedValue) -> Option<&str> {
    if seg.get_str("type") == Some("text") {
        seg.get("data").and_then(|d| d.get_str("text"))
    } else {
        None
    }
}

// NapCat 下 reply 段的 id 可能是字符串或数字
fn reply_id(seg: &OwnedValue) -> Option<String> {
    let data = seg.get("data")?;
    data.get_str("id")
        .map(|s| s.to_string())
        .or_else(|| data.get("id").and_then(|v| v.as_i64()).map(|v| v.to_string()))
}

/// 提取消息开头引用回复的消息 ID (reply 段之前只允许空白文本)
pub fn reply_target(event: &OwnedValue) -> Option<String> {
    for seg in segments(event)? {
        match seg.get_str("type") {
            Some("reply") => return reply_id(seg),
            Some("text") if segment_text(seg).is_some_and(|t| t.trim().is_empty()) => continue,
            _ => return None,
        }
    }
    None
}

/// 拼接消息中全部文本段的纯文本内容 (忽略 reply/at 等非文本段)
pub fn plain_text(event: &OwnedValue) -> String {
    let mut text = String::new();
    if let Some(segs) = segments(event) {
        for seg in segs {
            if let Some(t) = segment_text(seg) {
                text.push_str(t);
            }
        }
    }
    text.trim().to_string()
}

/// 匹配指令：忽略消息开头的 reply / at / 空白段，
/// 然后在第一个非空文本段上匹配 [前缀][指令名]，前缀可省略。
/// 返回 None 表示未匹配。
pub fn match_command(ctx: &Context, command: &str) -> Option<CommandMatch> {
    let message = ctx.as_message()?;
    let segs = segments(message.0)?;

    let prefixes = ctx.config.read().unwrap().command_prefix.clone();

    for (idx, seg) in segs.iter().enumerate() {
        match seg.get_str("type") {
            Some("reply") | Some("at") => {}
            Some("text") => {
                let text = segment_text(seg)?.trim_start();
                if text.is_empty() {
                    continue;
                }

                let body = prefixes
                    .iter()
                    .find_map(|p| text.strip_prefix(p.as_str()))
                    .unwrap_or(text);

                let rest = body.strip_prefix(command)?;
                // 指令名之后必须是分界 (空白或结尾)，避免 "同意" 匹配到 "同意见"
                if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
                    return None;
                }

                let mut rest = rest.trim().to_string();
                // 后续文本段一并拼入参数
                for later in &segs[idx + 1..] {
                    if let Some(t) = segment_text(later) {
                        let t = t.trim();
                        if t.is_empty() {
                            continue;
                        }
                        if !rest.is_empty() {
                            rest.push(' ');
                        }
                        rest.push_str(t);
                    }
                }

                return Some(CommandMatch { rest });
            }
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::event::{BotStatus, EventType};
    use crate::matcher::Matcher;
    use simd_json::json_typed;
    use std::sync::{Arc, RwLock};

    fn message_ctx(event: OwnedValue) -> Context {
        Context {
            event: EventType::Onebot(event),
            config: Arc::new(RwLock::new(AppConfig::default())),
            matcher: Arc::new(Matcher::new()),
            bot: BotStatus::default(),
        }
    }

    fn text_event(text: &str) -> OwnedValue {
        json_typed!(owned, {
            "post_type": "message",
            "message_type": "group",
            "message": [
                { "type": "text", "data": { "text": text } }
            ]
        })
    }

    fn reply_event(id: &str, text: &str) -> OwnedValue {
        json_typed!(owned, {
            "post_type": "message",
            "message_type": "group",
            "message": [
                { "type": "reply", "data": { "id": id } },
                { "type": "text", "data": { "text": text } }
            ]
        })
    }

    #[test]
    fn bare_command_with_args() {
        let ctx = message_ctx(text_event("拒绝 flag-1 年龄太小"));
        let matched = match_command(&ctx, "拒绝").unwrap();
        assert_eq!(matched.rest, "flag-1 年龄太小");
    }

    #[test]
    fn prefixed_command_matches() {
        let ctx = message_ctx(text_event("/同意 flag-2"));
        let matched = match_command(&ctx, "同意").unwrap();
        assert_eq!(matched.rest, "flag-2");
    }

    #[test]
    fn longer_word_does_not_match() {
        let ctx = message_ctx(text_event("同意见书"));
        assert!(match_command(&ctx, "同意").is_none());
    }

    #[test]
    fn command_after_reply_segment_matches() {
        let ctx = message_ctx(reply_event("10086", "/同意 flag-3"));
        let matched = match_command(&ctx, "同意").unwrap();
        assert_eq!(matched.rest, "flag-3");
    }

    #[test]
    fn non_command_text_is_ignored() {
        let ctx = message_ctx(text_event("大家好"));
        assert!(match_command(&ctx, "同意").is_none());
        assert!(match_command(&ctx, "查看入群审核").is_none());
    }

    #[test]
    fn reply_target_extracts_leading_reply() {
        let event = reply_event("10086", "同意");
        assert_eq!(reply_target(&event).as_deref(), Some("10086"));
    }

    #[test]
    fn reply_target_normalizes_numeric_id() {
        let event = json_typed!(owned, {
            "post_type": "message",
            "message_type": "group",
            "message": [
                { "type": "reply", "data": { "id": 10087_i64 } },
                { "type": "text", "data": { "text": "拒绝 理由" } }
            ]
        });
        assert_eq!(reply_target(&event).as_deref(), Some("10087"));
    }

    #[test]
    fn reply_target_ignores_plain_message() {
        assert_eq!(reply_target(&text_event("同意")), None);
    }

    #[test]
    fn plain_text_joins_text_segments_only() {
        let event = reply_event("1", " 拒绝太小 ");
        assert_eq!(plain_text(&event), "拒绝太小");
    }
}
