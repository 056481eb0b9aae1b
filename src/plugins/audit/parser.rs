use regex::Regex;
use std::sync::OnceLock;

const DEFAULT_REJECT_REASON: &str = "管理员拒绝";

/// 审核决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject { reason: String },
}

/// 解析回复文本中的审核决定。
/// "同意" 开头视为同意；"拒绝" 开头视为拒绝，其后的文本作为理由。
/// 其余文本与审核无关，返回 None。
pub fn parse_decision(text: &str) -> Option<Decision> {
    let text = text.trim();
    if text.starts_with("同意") {
        return Some(Decision::Approve);
    }
    if let Some(rest) = text.strip_prefix("拒绝") {
        let reason = rest.trim();
        let reason = if reason.is_empty() {
            DEFAULT_REJECT_REASON.to_string()
        } else {
            reason.to_string()
        };
        return Some(Decision::Reject { reason });
    }
    None
}

/// 从入群验证信息中提取问题答案。
/// 平台格式形如 "问题：xxx\n答案：yyy"；没有答案行时原样返回。
pub fn extract_answer(comment: &str) -> &str {
    static ANSWER_RE: OnceLock<Regex> = OnceLock::new();
    let re = ANSWER_RE.get_or_init(|| Regex::new(r"答案：(.*)").unwrap());

    match re.captures(comment) {
        Some(caps) => caps.get(1).map(|m| m.as_str().trim()).unwrap_or(comment),
        None => comment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approve_with_trailing_text() {
        assert_eq!(parse_decision("同意"), Some(Decision::Approve));
        assert_eq!(parse_decision(" 同意 这人没问题"), Some(Decision::Approve));
    }

    #[test]
    fn reject_uses_default_reason_when_absent() {
        assert_eq!(
            parse_decision("拒绝"),
            Some(Decision::Reject {
                reason: "管理员拒绝".to_string()
            })
        );
    }

    #[test]
    fn reject_reason_needs_no_separator() {
        assert_eq!(
            parse_decision("拒绝太小"),
            Some(Decision::Reject {
                reason: "太小".to_string()
            })
        );
    }

    #[test]
    fn reject_carries_free_text_reason() {
        assert_eq!(
            parse_decision("拒绝 年龄太小"),
            Some(Decision::Reject {
                reason: "年龄太小".to_string()
            })
        );
    }

    #[test]
    fn unrelated_text_is_ignored() {
        assert_eq!(parse_decision("这是什么"), None);
        assert_eq!(parse_decision(""), None);
    }

    #[test]
    fn answer_extraction() {
        assert_eq!(
            extract_answer("问题：你从哪里知道本群？\n答案：朋友推荐"),
            "朋友推荐"
        );
        assert_eq!(extract_answer("我想加群"), "我想加群");
        assert_eq!(extract_answer(""), "");
    }
}
