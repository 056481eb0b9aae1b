pub mod log;

mod adapters;
mod command;
mod config;
mod event;
mod matcher;
mod message;
mod plugins;

use crate::config::AppConfig;
use crate::event::{BotStatus, Context, EventType};
use crate::matcher::Matcher;
use std::path::Path;
use std::sync::{Arc, RwLock};

const CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() {
    info!(target: "System", "审核 Bot 启动中...");

    let existed = Path::new(CONFIG_PATH).exists();
    let mut app_config = if existed {
        match tokio::fs::read_to_string(CONFIG_PATH).await {
            Ok(content) => match toml::from_str::<AppConfig>(&content) {
                Ok(config) => config,
                Err(e) => {
                    error!(target: "System", "配置文件解析失败: {}", e);
                    return;
                }
            },
            Err(e) => {
                error!(target: "System", "读取配置文件失败: {}", e);
                return;
            }
        }
    } else {
        info!(target: "System", "未找到 {}，正在生成默认配置...", CONFIG_PATH);
        AppConfig::default()
    };

    // 补齐缺失的插件配置段
    let mut dirty = !existed;
    for plugin in plugins::get_plugins() {
        if !app_config.plugins.contains_key(plugin.name) {
            app_config
                .plugins
                .insert(plugin.name.to_string(), (plugin.default_config)());
            dirty = true;
        }
    }
    if dirty {
        if let Err(e) = app_config.save(CONFIG_PATH).await {
            error!(target: "System", "写入配置文件失败: {}", e);
        } else {
            info!(target: "System", "配置文件已更新: {}", CONFIG_PATH);
        }
    }

    if app_config.superusers.is_empty() {
        warn!(target: "System", "未配置超级管理员 (superusers)，好友申请将无人可处理");
    }

    let shared_config = Arc::new(RwLock::new(app_config));

    // 插件初始化
    let init_ctx = Context {
        event: EventType::Init,
        config: shared_config.clone(),
        matcher: Arc::new(Matcher::new()),
        bot: BotStatus {
            adapter: "system".to_string(),
            platform: "internal".to_string(),
            login_user: Default::default(),
        },
    };
    if let Err(e) = plugins::do_init(init_ctx).await {
        error!(target: "System", "插件初始化失败: {}", e);
    }

    // 启动已启用的 Bot
    let bots = shared_config.read().unwrap().bots.clone();
    let mut started = 0;
    for bot in bots {
        if !bot.enabled {
            continue;
        }
        match adapters::find_adapter(&bot.protocol) {
            Some(adapter) => {
                info!(target: "System", "启动 Bot 适配器: {}", bot.protocol);
                tokio::spawn((adapter.handler)(bot, shared_config.clone()));
                started += 1;
            }
            None => warn!(target: "System", "未知的协议类型: {}", bot.protocol),
        }
    }

    if started == 0 {
        warn!(target: "System", "没有启用任何 Bot，请检查 {}", CONFIG_PATH);
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        info!(target: "System", "收到退出信号，正在关闭...");
    }
}
