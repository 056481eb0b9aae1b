use crate::event::Event;
use simd_json::derived::ValueObjectAccessAsScalar;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::oneshot;

struct Waiter {
    echo: String,
    sender: oneshot::Sender<Event>,
}

/// API 响应匹配器：调用方按 echo 注册等待，响应帧到达时在此被拦截分发
#[derive(Default)]
pub struct Matcher {
    waiters: AsyncMutex<Vec<Waiter>>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个 API 响应等待者 (按 echo 匹配)，超时返回 None
    pub async fn wait_resp(&self, echo: String, timeout: Duration) -> Option<Event> {
        let (tx, rx) = oneshot::channel();

        {
            let mut waiters = self.waiters.lock().await;
            waiters.push(Waiter { echo, sender: tx });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Some(event),
            _ => None,
        }
    }

    /// 分发事件：若有等待者匹配则将事件交给它并返回 None (事件被消耗)，
    /// 否则原样返回事件继续走插件流水线
    pub async fn dispatch(&self, event: Event) -> Option<Event> {
        let mut waiters = self.waiters.lock().await;

        // 已断开的等待者 (超时后 rx 被 drop) 顺带清理
        waiters.retain(|w| !w.sender.is_closed());

        let echo = match event.get_str("echo") {
            Some(e) => e,
            None => return Some(event),
        };

        let pos = waiters.iter().position(|w| w.echo == echo);
        if let Some(pos) = pos {
            let waiter = waiters.remove(pos);
            // 发送失败说明等待者刚刚超时，事件照常丢弃
            let _ = waiter.sender.send(event);
            None
        } else {
            Some(event)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simd_json::json_typed;

    #[tokio::test]
    async fn echo_waiter_receives_matching_frame() {
        let matcher = Matcher::new();

        let frame = json_typed!(owned, {
            "echo": "api-req-1",
            "retcode": 0
        });

        let wait = matcher.wait_resp("api-req-1".to_string(), Duration::from_secs(1));
        let dispatch = async {
            // 给等待者注册留出一个调度间隙
            tokio::task::yield_now().await;
            matcher.dispatch(frame).await
        };

        let (received, leftover) = tokio::join!(wait, dispatch);
        assert!(received.is_some());
        assert!(leftover.is_none());
    }

    #[tokio::test]
    async fn ordinary_event_passes_through() {
        let matcher = Matcher::new();
        let event = json_typed!(owned, {
            "post_type": "message",
            "group_id": 123_i64,
            "user_id": 456_i64
        });
        assert!(matcher.dispatch(event).await.is_some());
    }

    #[tokio::test]
    async fn unmatched_echo_passes_through() {
        let matcher = Matcher::new();
        let frame = json_typed!(owned, { "echo": "api-req-99", "retcode": 0 });
        assert!(matcher.dispatch(frame).await.is_some());
    }
}
