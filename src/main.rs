//! ioloop 服务器入口
//! 基于定长帧编解码的回显服务，周期性输出事件循环统计

use std::net::SocketAddr;
use std::path::Path;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use ioloop::{Channel, ChannelContext, FixedLengthCodec, Frame, IoConfig, IoEventHandle, IoServer};

/// 服务器启动参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.toml", env = "IOLOOP_CONFIG")]
    config: String,

    /// 绑定地址，覆盖配置文件
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

/// 原样回写收到的数据帧
struct EchoHandler;

impl IoEventHandle for EchoHandler {
    fn on_frame(&self, ch: &mut Channel, frame: Frame) {
        if let Err(e) = ch.write_and_flush(frame) {
            warn!("回写 {} 失败: {}", ch, e);
        }
    }

    fn on_open(&self, ch: &mut Channel) {
        info!("新连接 {}", ch);
    }

    fn on_close(&self, ch: &mut Channel) {
        info!("连接关闭 {}", ch);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // 解析命令行参数
    let args = Args::parse();

    let mut config = if Path::new(&args.config).exists() {
        ioloop::config::load(&args.config)?
    } else {
        IoConfig::default()
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    ioloop::init(&config.log)?;
    info!("ioloop 启动，配置文件: {}", args.config);

    let codec = FixedLengthCodec::new(config.event_loop.max_frame_length);
    let server = IoServer::start(&config, ChannelContext::new(codec, EchoHandler))?;
    info!("回显服务已启动，监听地址: {}", server.local_addr());

    if config.log.stats_interval_secs == 0 {
        loop {
            thread::park();
        }
    }
    let interval = Duration::from_secs(config.log.stats_interval_secs);
    loop {
        thread::sleep(interval);
        for snapshot in server.stats() {
            info!("{}", serde_json::to_string(&snapshot)?);
        }
    }
}
