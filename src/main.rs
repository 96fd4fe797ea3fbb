#[macro_use]
extern crate log;
extern crate log4rs;

extern crate log_panics;

extern crate tokio;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

extern crate rust_pox;
use rust_pox::apps::{EventLogger, StatsProbing};
use rust_pox::clock::MonotonicClock;
use rust_pox::config::{ControllerConfig, DEFAULT_ADDRESS, DEFAULT_PORT};
use rust_pox::ofp_connection::ConnectionId;
use rust_pox::ofp_controller::DeviceController;
use rust_pox::ofp_transport::Transport;

const MESSAGES_CHANNEL_BUFFER: usize = 1000;
const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[clap(version, about = "OpenFlow 1.0 controller")]
struct Args {
    /// Address to listen on
    #[clap(long, default_value = DEFAULT_ADDRESS)]
    address: String,

    /// Port to listen on
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Do not keep a mirror of each switch flow table
    #[clap(long)]
    no_sync: bool,

    /// Leave the flows of a connecting switch alone (only without mirrored tables)
    #[clap(long)]
    keep_flows: bool,

    /// Re-send flow table updates whose barrier is unanswered after this many seconds
    #[clap(long)]
    barrier_timeout: Option<u64>,

    /// Seconds of silence before a switch is probed with an echo request
    #[clap(long, default_value_t = 20)]
    echo_interval: u64,

    /// Request port and flow stats every this many ticks (one tick per second), 0 disables
    #[clap(long, default_value_t = 0)]
    stats_interval: u32,

    /// log4rs configuration file
    #[clap(long, default_value = "log4rs.yml")]
    log_config: String,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            address: self.address.clone(),
            port: self.port,
            sync_flow_tables: !self.no_sync,
            clear_flows_on_connect: !self.keep_flows,
            barrier_timeout: self.barrier_timeout.map(Duration::from_secs),
            echo_interval: Duration::from_secs(self.echo_interval),
            ..ControllerConfig::default()
        }
    }
}

/// Write side of an accepted socket. Reads happen in the connection's read task.
struct TcpTransport {
    stream: Arc<TcpStream>,
    closed: Arc<Notify>,
}

impl Transport for TcpTransport {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    fn shutdown(&self) {
        self.closed.notify_one();
    }
}

enum Input {
    Accepted(TcpStream, SocketAddr),
    Data(ConnectionId, Vec<u8>),
    Closed(ConnectionId),
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Input>) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                if tx.send(Input::Accepted(socket, addr)).await.is_err() {
                    break;
                }
            }
            Err(e) => error!("accept error = {:?}", e),
        }
    }
}

async fn read_loop(
    id: ConnectionId,
    stream: Arc<TcpStream>,
    closed: Arc<Notify>,
    tx: mpsc::Sender<Input>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = closed.notified() => break,
            ready = stream.readable() => {
                if let Err(e) = ready {
                    warn!("Connection {}: {}", id, e);
                    break;
                }
                match stream.try_read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Input::Data(id, buf[..n].to_vec())).await.is_err() {
                            return;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        warn!("Connection {}: read failed: {}", id, e);
                        break;
                    }
                }
            }
        }
    }
    debug!("Connection {}: read task done", id);
    if tx.send(Input::Closed(id)).await.is_err() {
        debug!("Controller loop is gone");
    }
}

fn init_logging(path: &str) {
    let error = match log4rs::init_file(path, Default::default()) {
        Ok(()) => return,
        Err(e) => e,
    };
    let stdout = ConsoleAppender::builder().build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info));
    match config {
        Ok(config) => {
            if let Err(e) = log4rs::init_config(config) {
                eprintln!("Could not set up logging: {}", e);
            }
        }
        Err(e) => eprintln!("Could not set up logging: {}", e),
    }
    warn!("Could not load {}: {}; logging to the console", path, error);
}

async fn run(args: Args) -> io::Result<()> {
    let config = args.controller_config();
    let mut controller = DeviceController::new(config.clone(), Arc::new(MonotonicClock::new()))?;
    controller.register_app(Box::new(EventLogger));
    controller.register_app(Box::new(StatsProbing::new(args.stats_interval)));
    controller.start();

    let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
    info!("OF controller running on {}:{}", config.address, config.port);

    let (tx, mut rx) = mpsc::channel(MESSAGES_CHANNEL_BUFFER);
    tokio::spawn(accept_loop(listener, tx.clone()));

    let mut ticker = tokio::time::interval(config.tick_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => controller.tick(),
            input = rx.recv() => match input {
                Some(Input::Accepted(socket, addr)) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        warn!("{}: could not disable Nagle: {}", addr, e);
                    }
                    let stream = Arc::new(socket);
                    let closed = Arc::new(Notify::new());
                    let transport = TcpTransport {
                        stream: stream.clone(),
                        closed: closed.clone(),
                    };
                    let id = controller.register_connection(Arc::new(transport));
                    info!("New device connected from {} as connection {}", addr, id);
                    tokio::spawn(read_loop(id, stream, closed, tx.clone()));
                }
                Some(Input::Data(id, data)) => controller.handle_bytes(id, &data),
                Some(Input::Closed(id)) => controller.handle_disconnect(id),
                None => break,
            }
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    log_panics::init();
    init_logging(&args.log_config);
    info!("rust_pox starting");

    if let Err(e) = run(args).await {
        error!("Controller stopped: {}", e);
        std::process::exit(1);
    }
}
