use cartbot::hal::SystemClock;
use cartbot::sim::{SimHardware, SimRadio, CENTRAL_OUTBOX_DEPTH};
use cartbot::{ArmController, CartConfig, CommandChannel, CommandQueue, ControlLoop, DriveController};
use clap::{App, Arg};
use static_cell::StaticCell;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver};
use tracing::{error, info, warn, Level};

const DEFAULT_TCP_PORT: u16 = 8080;

static COMMAND_QUEUE: StaticCell<CommandQueue> = StaticCell::new();

type SimChannel = CommandChannel<'static, Arc<SimRadio>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("cartbot-sim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Runs the cart control loop on simulated hardware, bridging the BLE link to TCP")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port for centrals (one line per command write)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("obstacle-cm")
                .long("obstacle-cm")
                .value_name("CM")
                .help("Simulated distance to the nearest obstacle (no echo when omitted)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log every control tick"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let port = match matches.value_of("port") {
        Some(port) => port.parse::<u16>()?,
        None => DEFAULT_TCP_PORT,
    };
    let config = match matches.value_of("config") {
        Some(path) => CartConfig::load(path)?,
        None => CartConfig::default(),
    };
    let obstacle_cm = matches
        .value_of("obstacle-cm")
        .map(str::parse::<f32>)
        .transpose()?;

    println!("🚚 Cartbot Simulator");
    println!("====================");

    let hardware = SimHardware::new();
    hardware.echo.set_distance_cm(obstacle_cm);
    let clock = SystemClock::new();

    let (sender, receiver) = COMMAND_QUEUE.init(CommandQueue::new()).split();

    let radio = Arc::new(SimRadio::new());
    let channel: Arc<SimChannel> = Arc::new(CommandChannel::start(
        Arc::clone(&radio),
        &config.channel_settings()?,
        sender,
    )?);

    let drive = DriveController::new(hardware.drive_lines())?;
    let arm = ArmController::new(hardware.arm_servos(), clock, config.arm_settings());
    let sensors = hardware.sensors(clock, &config.sensors);
    let mut cart = ControlLoop::new(
        drive,
        arm,
        sensors,
        Arc::clone(&channel),
        receiver,
        clock,
        config.loop_settings(),
    );

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, name = %config.radio.name, "📡 advertising, centrals connect over TCP");
    let server = tokio::spawn(accept_centrals(listener, Arc::clone(&radio), Arc::clone(&channel)));

    let stop = Arc::new(AtomicBool::new(false));
    let loop_stop = Arc::clone(&stop);
    let mut control = tokio::task::spawn_blocking(move || cart.run(&loop_stop));

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupt received, stopping control loop");
            stop.store(true, Ordering::Release);
            control.await?
        }
        finished = &mut control => finished?,
    };

    server.abort();
    if let Err(e) = channel.stop() {
        warn!(error = %e, "failed to stop advertising");
    }

    let stats = channel.stats();
    info!(
        queued = stats.commands_queued,
        dropped = stats.commands_dropped,
        notified = stats.notifications_delivered,
        "link statistics"
    );

    match outcome {
        Ok(()) => {
            println!("🛑 Cartbot Simulator stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "control loop terminated");
            Err(e.into())
        }
    }
}

async fn accept_centrals(listener: TcpListener, radio: Arc<SimRadio>, channel: Arc<SimChannel>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                // single peripheral link: advertising stops while a central is connected
                if !radio.is_advertising() {
                    warn!(%addr, "rejecting client, a central is already connected");
                    continue;
                }

                let (outbox, notifications) = mpsc::channel(CENTRAL_OUTBOX_DEPTH);
                let (conn, event) = radio.connect_central(outbox);
                channel.handle_event(event);
                info!(%addr, conn, "🔗 central connected");

                let radio = Arc::clone(&radio);
                let channel = Arc::clone(&channel);
                tokio::spawn(async move {
                    if let Err(e) = handle_central(stream, conn, notifications, &radio, &channel).await {
                        warn!(%addr, error = %e, "client error");
                    }
                    channel.handle_event(radio.disconnect_central(conn));
                    info!(%addr, conn, "🔌 central disconnected");
                });
            }
            Err(e) => {
                error!(error = %e, "failed to accept connection");
            }
        }
    }
}

async fn handle_central(
    stream: TcpStream,
    conn: u16,
    mut notifications: Receiver<Vec<u8>>,
    radio: &SimRadio,
    channel: &SimChannel,
) -> std::io::Result<()> {
    let peer: Option<SocketAddr> = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let command_handle = channel.command_handle();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => match radio.central_write(conn, command_handle, line.as_bytes()) {
                    Ok(event) => channel.handle_event(event),
                    Err(e) => warn!(?peer, conn, error = %e, "write rejected by GATT server"),
                },
                None => return Ok(()),
            },
            Some(value) = notifications.recv() => {
                write_line(&mut writer, &value).await?;
            }
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, value: &[u8]) -> std::io::Result<()> {
    writer.write_all(value).await?;
    writer.write_all(b"\n").await
}
