//! 端到端测试：回显与轮询分配

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use ioloop::config::BackendKind;
use ioloop::{
    Channel, ChannelConnector, ChannelContext, EventLoopGroup, FixedLengthCodec, Frame, IoConfig,
    IoEventHandle, IoServer,
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum Event {
    Open,
    Frame(Vec<u8>),
    Close,
}

/// 记录生命周期事件；`echo` 为真时回写帧，否则收到帧后发起关闭
struct Recorder {
    events: Mutex<Sender<Event>>,
    echo: bool,
    greeting: Option<&'static str>,
}

impl Recorder {
    fn new(echo: bool, greeting: Option<&'static str>) -> (Self, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                events: Mutex::new(tx),
                echo,
                greeting,
            },
            rx,
        )
    }

    fn record(&self, event: Event) {
        let _ = self.events.lock().unwrap().send(event);
    }
}

impl IoEventHandle for Recorder {
    fn on_frame(&self, ch: &mut Channel, frame: Frame) {
        self.record(Event::Frame(frame.content().to_vec()));
        if self.echo {
            ch.write_and_flush(frame).unwrap();
        } else {
            ch.close();
        }
    }

    fn on_open(&self, ch: &mut Channel) {
        self.record(Event::Open);
        if let Some(greeting) = self.greeting {
            ch.write_and_flush(Frame::data(greeting)).unwrap();
        }
    }

    fn on_close(&self, _ch: &mut Channel) {
        self.record(Event::Close);
    }
}

fn server_config(threads: usize) -> IoConfig {
    let mut config = IoConfig::default();
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.event_loop.threads = threads;
    config
}

fn expect(rx: &Receiver<Event>, events: &[Event]) {
    for want in events {
        assert_eq!(&rx.recv_timeout(TIMEOUT).unwrap(), want);
    }
}

/// 按后端与读写顺序组合运行一次回显
fn run_echo(backend: BackendKind, read_first: bool) {
    let mut config = server_config(2);
    config.event_loop.backend = backend;
    config.event_loop.channel_read_first = read_first;

    let (server_handler, server_events) = Recorder::new(true, None);
    let server = IoServer::start(
        &config,
        ChannelContext::new(FixedLengthCodec::default(), server_handler),
    )
    .unwrap();

    config.event_loop.threads = 1;
    let clients = EventLoopGroup::new("client", &config).unwrap();
    let (client_handler, client_events) = Recorder::new(false, Some("HELLOWORLD"));
    let (done_tx, done_rx) = mpsc::channel();
    ChannelConnector::connect(
        "127.0.0.1",
        server.local_addr().port(),
        Some(TIMEOUT),
        &clients,
        ChannelContext::new(FixedLengthCodec::default(), client_handler),
        move |r| done_tx.send(r.is_ok()).unwrap(),
    );
    assert!(done_rx.recv_timeout(TIMEOUT).unwrap());

    let hello = Event::Frame(b"HELLOWORLD".to_vec());
    expect(&client_events, &[Event::Open, hello, Event::Close]);
    let hello = Event::Frame(b"HELLOWORLD".to_vec());
    expect(&server_events, &[Event::Open, hello, Event::Close]);

    // 没有多余的事件
    thread::sleep(Duration::from_millis(200));
    assert!(client_events.try_recv().is_err());
    assert!(server_events.try_recv().is_err());

    clients.shutdown();
    clients.join();
    server.shutdown();
}

#[test]
fn echo_helloworld_one_open_one_close_each_side() {
    run_echo(BackendKind::Auto, true);
}

#[test]
fn echo_native_read_first() {
    run_echo(BackendKind::Native, true);
}

#[test]
fn echo_native_write_first() {
    run_echo(BackendKind::Native, false);
}

#[test]
fn echo_portable_read_first() {
    run_echo(BackendKind::Portable, true);
}

#[test]
fn echo_portable_write_first() {
    run_echo(BackendKind::Portable, false);
}

#[test]
fn large_frame_echoed_intact_on_every_backend() {
    const LEN: usize = 512 * 1024;

    let payload: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
    let mut wire = (LEN as i32).to_be_bytes().to_vec();
    wire.extend_from_slice(&payload);

    for backend in [BackendKind::Native, BackendKind::Portable] {
        for read_first in [true, false] {
            let mut config = server_config(1);
            config.event_loop.backend = backend;
            config.event_loop.channel_read_first = read_first;
            let (handler, _events) = Recorder::new(true, None);
            let server = IoServer::start(
                &config,
                ChannelContext::new(FixedLengthCodec::default(), handler),
            )
            .unwrap();

            let mut peer = TcpStream::connect(server.local_addr()).unwrap();
            peer.set_read_timeout(Some(TIMEOUT)).unwrap();
            let mut writer = peer.try_clone().unwrap();
            let sent = wire.clone();
            let sender = thread::spawn(move || writer.write_all(&sent).unwrap());

            let mut echoed = vec![0u8; wire.len()];
            peer.read_exact(&mut echoed).unwrap();
            sender.join().unwrap();
            assert!(echoed == wire, "{:?} read_first={}", backend, read_first);

            drop(peer);
            server.shutdown();
        }
    }
}

#[test]
fn accepted_channels_round_robin_across_workers() {
    const LOOPS: usize = 3;
    const CONNECTIONS: usize = 7;

    let (handler, _events) = Recorder::new(true, None);
    let server = IoServer::start(
        &server_config(LOOPS),
        ChannelContext::new(FixedLengthCodec::default(), handler),
    )
    .unwrap();

    let peers: Vec<TcpStream> = (0..CONNECTIONS)
        .map(|_| TcpStream::connect(server.local_addr()).unwrap())
        .collect();

    let counts = || -> Vec<usize> {
        server
            .workers()
            .loops()
            .iter()
            .map(|l| {
                let (tx, rx) = mpsc::channel();
                l.submit(move |ctx| tx.send(ctx.channel_count()).unwrap())
                    .unwrap();
                rx.recv_timeout(TIMEOUT).unwrap()
            })
            .collect()
    };
    let mut owned = counts();
    for _ in 0..250 {
        if owned.iter().sum::<usize>() == CONNECTIONS {
            break;
        }
        thread::sleep(Duration::from_millis(20));
        owned = counts();
    }

    assert_eq!(owned.iter().sum::<usize>(), CONNECTIONS);
    let (lo, hi) = (CONNECTIONS / LOOPS, CONNECTIONS.div_ceil(LOOPS));
    assert!(owned.iter().all(|&n| n == lo || n == hi), "{:?}", owned);

    drop(peers);
    server.shutdown();
}
