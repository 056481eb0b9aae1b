use crate::warn;
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;

const GROUP_FILE: &str = "pending_requests.json";
const FRIEND_FILE: &str = "pending_friend_requests.json";
const MESSAGE_MAP_FILE: &str = "message_to_flag.json";
const KIND_MAP_FILE: &str = "flag_type.json";

/// 请求类别 (显式标记，不靠字段缺省推断)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    GroupAdd,
    GroupInvite,
    Friend,
}

impl RequestKind {
    pub fn is_friend(self) -> bool {
        matches!(self, RequestKind::Friend)
    }
}

/// 入群请求的平台子类型，原样传回处理 API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupSubType {
    Add,
    Invite,
}

impl GroupSubType {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupSubType::Add => "add",
            GroupSubType::Invite => "invite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRequest {
    pub user_id: i64,
    pub group_id: i64,
    pub comment: String,
    /// Unix 秒
    pub time: i64,
    /// 审核群通知消息的 ID (回复式处理靠它关联)
    pub message_id: i64,
    pub sub_type: GroupSubType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendRequest {
    pub user_id: i64,
    pub comment: String,
    pub time: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Group(GroupRequest),
    Friend(FriendRequest),
}

/// 已从队列中取出但尚未确认落盘的请求。
/// API 调用成功后 confirm，失败后 restore 放回队列。
#[derive(Debug)]
pub struct Claimed {
    pub flag: String,
    pub kind: RequestKind,
    pub entry: Entry,
}

#[derive(Default)]
struct State {
    // Vec 保持插入顺序，列表按此顺序呈现
    group: Vec<(String, GroupRequest)>,
    friend: Vec<(String, FriendRequest)>,
    message_to_flag: HashMap<i64, String>,
    flag_kind: HashMap<String, RequestKind>,
}

/// 审核队列：全部变更经由单把锁，落盘采用临时文件加原子改名
pub struct AuditQueue {
    data_dir: PathBuf,
    inner: AsyncMutex<State>,
}

impl AuditQueue {
    /// 从数据目录载入队列。文件缺失或损坏时从空队列开始并告警。
    pub async fn load(data_dir: PathBuf) -> Self {
        let mut state = State::default();

        match load_ordered_map::<GroupRequest>(&data_dir.join(GROUP_FILE)).await {
            Ok(entries) => state.group = entries,
            Err(e) => warn!(target: "Plugin/Audit", "读取 {} 失败，按空队列处理: {}", GROUP_FILE, e),
        }
        match load_ordered_map::<FriendRequest>(&data_dir.join(FRIEND_FILE)).await {
            Ok(entries) => state.friend = entries,
            Err(e) => warn!(target: "Plugin/Audit", "读取 {} 失败，按空队列处理: {}", FRIEND_FILE, e),
        }
        match load_ordered_map::<String>(&data_dir.join(MESSAGE_MAP_FILE)).await {
            Ok(entries) => {
                for (key, flag) in entries {
                    match key.parse::<i64>() {
                        Ok(id) => {
                            state.message_to_flag.insert(id, flag);
                        }
                        Err(_) => {
                            warn!(target: "Plugin/Audit", "忽略无效的消息 ID 键: {}", key)
                        }
                    }
                }
            }
            Err(e) => {
                warn!(target: "Plugin/Audit", "读取 {} 失败，按空映射处理: {}", MESSAGE_MAP_FILE, e)
            }
        }
        match load_ordered_map::<RequestKind>(&data_dir.join(KIND_MAP_FILE)).await {
            Ok(entries) => state.flag_kind = entries.into_iter().collect(),
            Err(e) => {
                warn!(target: "Plugin/Audit", "读取 {} 失败，按空映射处理: {}", KIND_MAP_FILE, e)
            }
        }

        Self {
            data_dir,
            inner: AsyncMutex::new(state),
        }
    }

    /// 登记一条入群/邀请请求并落盘
    pub async fn insert_group(&self, flag: String, request: GroupRequest) -> Result<()> {
        let mut state = self.inner.lock().await;
        let kind = match request.sub_type {
            GroupSubType::Add => RequestKind::GroupAdd,
            GroupSubType::Invite => RequestKind::GroupInvite,
        };
        // 同一 flag 重复投递时丢弃旧通知的关联
        state.message_to_flag.retain(|_, f| f != &flag);
        state.message_to_flag.insert(request.message_id, flag.clone());
        state.flag_kind.insert(flag.clone(), kind);
        state.group.retain(|(f, _)| f != &flag);
        state.group.push((flag, request));
        persist(&self.data_dir, &state).await
    }

    /// 登记一条好友请求并落盘
    pub async fn insert_friend(&self, flag: String, request: FriendRequest) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.message_to_flag.retain(|_, f| f != &flag);
        state.message_to_flag.insert(request.message_id, flag.clone());
        state.flag_kind.insert(flag.clone(), RequestKind::Friend);
        state.friend.retain(|(f, _)| f != &flag);
        state.friend.push((flag, request));
        persist(&self.data_dir, &state).await
    }

    /// 查询请求类别 (用于处理前的权限判断)
    pub async fn kind(&self, flag: &str) -> Option<RequestKind> {
        self.inner.lock().await.flag_kind.get(flag).copied()
    }

    /// 按通知消息 ID 反查 flag (回复式处理)
    pub async fn flag_for_message(&self, message_id: i64) -> Option<String> {
        self.inner
            .lock()
            .await
            .message_to_flag
            .get(&message_id)
            .cloned()
    }

    /// 取出请求：从内存队列移除但不落盘。
    /// 并发处理同一 flag 时恰有一方取到 Some。
    pub async fn claim(&self, flag: &str) -> Option<Claimed> {
        let mut state = self.inner.lock().await;
        let kind = state.flag_kind.get(flag).copied()?;

        let entry = if kind.is_friend() {
            let pos = state.friend.iter().position(|(f, _)| f == flag)?;
            Entry::Friend(state.friend.remove(pos).1)
        } else {
            let pos = state.group.iter().position(|(f, _)| f == flag)?;
            Entry::Group(state.group.remove(pos).1)
        };

        state.flag_kind.remove(flag);
        // 按值清除该 flag 的全部消息关联，残留的旧关联也一并带走
        state.message_to_flag.retain(|_, f| f != flag);

        Some(Claimed {
            flag: flag.to_string(),
            kind,
            entry,
        })
    }

    /// 平台确认处理成功后调用，把移除结果落盘
    pub async fn confirm(&self, _claimed: Claimed) -> Result<()> {
        let state = self.inner.lock().await;
        persist(&self.data_dir, &state).await
    }

    /// 平台处理失败后调用，把请求放回队列 (排在末尾)
    pub async fn restore(&self, claimed: Claimed) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.flag_kind.insert(claimed.flag.clone(), claimed.kind);
        state.message_to_flag.retain(|_, f| f != &claimed.flag);
        match claimed.entry {
            Entry::Group(request) => {
                state
                    .message_to_flag
                    .insert(request.message_id, claimed.flag.clone());
                state.group.push((claimed.flag, request));
            }
            Entry::Friend(request) => {
                state
                    .message_to_flag
                    .insert(request.message_id, claimed.flag.clone());
                state.friend.push((claimed.flag, request));
            }
        }
        persist(&self.data_dir, &state).await
    }

    /// 入群请求快照 (插入顺序)
    pub async fn group_snapshot(&self) -> Vec<(String, GroupRequest)> {
        self.inner.lock().await.group.clone()
    }

    /// 好友请求快照 (插入顺序)
    pub async fn friend_snapshot(&self) -> Vec<(String, FriendRequest)> {
        self.inner.lock().await.friend.clone()
    }

    /// (入群请求数, 好友请求数)
    pub async fn counts(&self) -> (usize, usize) {
        let state = self.inner.lock().await;
        (state.group.len(), state.friend.len())
    }
}

// ================= 落盘 =================

async fn load_ordered_map<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Vec<(String, T)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path).await.context("读取文件失败")?;
    let map: JsonMap<String, JsonValue> =
        serde_json::from_slice(&bytes).context("解析 JSON 失败")?;

    let mut entries = Vec::with_capacity(map.len());
    for (key, value) in map {
        let parsed: T = serde_json::from_value(value).context("解析条目失败")?;
        entries.push((key, parsed));
    }
    Ok(entries)
}

async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await.context("写入临时文件失败")?;
    fs::rename(&tmp, path).await.context("替换数据文件失败")?;
    Ok(())
}

async fn persist(data_dir: &Path, state: &State) -> Result<()> {
    let mut group = JsonMap::new();
    for (flag, request) in &state.group {
        group.insert(flag.clone(), serde_json::to_value(request)?);
    }
    let mut friend = JsonMap::new();
    for (flag, request) in &state.friend {
        friend.insert(flag.clone(), serde_json::to_value(request)?);
    }
    let mut messages = JsonMap::new();
    for (message_id, flag) in &state.message_to_flag {
        messages.insert(message_id.to_string(), JsonValue::String(flag.clone()));
    }
    let mut kinds = JsonMap::new();
    for (flag, kind) in &state.flag_kind {
        kinds.insert(flag.clone(), serde_json::to_value(kind)?);
    }

    write_atomic(&data_dir.join(GROUP_FILE), serde_json::to_vec_pretty(&group)?).await?;
    write_atomic(
        &data_dir.join(FRIEND_FILE),
        serde_json::to_vec_pretty(&friend)?,
    )
    .await?;
    write_atomic(
        &data_dir.join(MESSAGE_MAP_FILE),
        serde_json::to_vec_pretty(&messages)?,
    )
    .await?;
    write_atomic(&data_dir.join(KIND_MAP_FILE), serde_json::to_vec_pretty(&kinds)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_request(message_id: i64) -> GroupRequest {
        GroupRequest {
            user_id: 10001,
            group_id: 20002,
            comment: "我是来学习的".to_string(),
            time: 1_700_000_000,
            message_id,
            sub_type: GroupSubType::Add,
        }
    }

    fn friend_request(message_id: i64) -> FriendRequest {
        FriendRequest {
            user_id: 10003,
            comment: "加个好友".to_string(),
            time: 1_700_000_100,
            message_id,
        }
    }

    #[tokio::test]
    async fn reload_preserves_entries_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        {
            let queue = AuditQueue::load(path.clone()).await;
            queue
                .insert_group("flag-b".to_string(), group_request(100))
                .await
                .unwrap();
            queue
                .insert_group("flag-a".to_string(), group_request(101))
                .await
                .unwrap();
            queue
                .insert_friend("flag-f".to_string(), friend_request(102))
                .await
                .unwrap();
        }

        let queue = AuditQueue::load(path).await;
        let group = queue.group_snapshot().await;
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].0, "flag-b");
        assert_eq!(group[1].0, "flag-a");
        assert_eq!(group[1].1, group_request(101));

        assert_eq!(queue.kind("flag-f").await, Some(RequestKind::Friend));
        assert_eq!(queue.kind("flag-a").await, Some(RequestKind::GroupAdd));
        assert_eq!(queue.flag_for_message(102).await.as_deref(), Some("flag-f"));
    }

    #[tokio::test]
    async fn claim_removes_from_memory_until_restored() {
        let dir = tempfile::tempdir().unwrap();
        let queue = AuditQueue::load(dir.path().to_path_buf()).await;
        queue
            .insert_group("flag-1".to_string(), group_request(200))
            .await
            .unwrap();

        let claimed = queue.claim("flag-1").await.unwrap();
        assert_eq!(claimed.kind, RequestKind::GroupAdd);
        assert!(queue.group_snapshot().await.is_empty());
        assert_eq!(queue.kind("flag-1").await, None);
        assert_eq!(queue.flag_for_message(200).await, None);

        queue.restore(claimed).await.unwrap();
        assert_eq!(queue.group_snapshot().await.len(), 1);
        assert_eq!(queue.kind("flag-1").await, Some(RequestKind::GroupAdd));
        assert_eq!(queue.flag_for_message(200).await.as_deref(), Some("flag-1"));
    }

    #[tokio::test]
    async fn confirm_persists_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        {
            let queue = AuditQueue::load(path.clone()).await;
            queue
                .insert_friend("flag-2".to_string(), friend_request(300))
                .await
                .unwrap();
            let claimed = queue.claim("flag-2").await.unwrap();
            queue.confirm(claimed).await.unwrap();
            assert!(queue.claim("flag-2").await.is_none());
        }

        // 重启后也不应复活
        let queue = AuditQueue::load(path).await;
        assert!(queue.friend_snapshot().await.is_empty());
        assert_eq!(queue.kind("flag-2").await, None);
    }

    #[tokio::test]
    async fn crash_before_confirm_keeps_entry_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        {
            let queue = AuditQueue::load(path.clone()).await;
            queue
                .insert_group("flag-3".to_string(), group_request(400))
                .await
                .unwrap();
            let _claimed = queue.claim("flag-3").await.unwrap();
            // claim 不落盘，模拟此处进程退出
        }

        let queue = AuditQueue::load(path).await;
        assert_eq!(queue.group_snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn redelivered_flag_leaves_no_stale_correlation() {
        let dir = tempfile::tempdir().unwrap();
        let queue = AuditQueue::load(dir.path().to_path_buf()).await;

        // 平台重复投递同一 flag，第二次通知换了消息 ID
        queue
            .insert_group("flag-x".to_string(), group_request(1))
            .await
            .unwrap();
        queue
            .insert_group("flag-x".to_string(), group_request(2))
            .await
            .unwrap();
        assert_eq!(queue.flag_for_message(1).await, None);
        assert_eq!(queue.flag_for_message(2).await.as_deref(), Some("flag-x"));

        let claimed = queue.claim("flag-x").await.unwrap();
        queue.confirm(claimed).await.unwrap();

        // 处理完成后任何消息 ID 都不应再指向该 flag
        assert_eq!(queue.flag_for_message(1).await, None);
        assert_eq!(queue.flag_for_message(2).await, None);
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let queue = std::sync::Arc::new(AuditQueue::load(dir.path().to_path_buf()).await);
        queue
            .insert_group("flag-4".to_string(), group_request(500))
            .await
            .unwrap();

        let q1 = queue.clone();
        let q2 = queue.clone();
        let (a, b) = tokio::join!(q1.claim("flag-4"), q2.claim("flag-4"));
        assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);
    }

    #[tokio::test]
    async fn malformed_files_load_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(GROUP_FILE), b"not json at all").unwrap();
        std::fs::write(dir.path().join(KIND_MAP_FILE), b"[1,2,3]").unwrap();

        let queue = AuditQueue::load(dir.path().to_path_buf()).await;
        assert!(queue.group_snapshot().await.is_empty());
        assert_eq!(queue.counts().await, (0, 0));
    }
}
