use clap::{Args, Parser, Subcommand, ValueEnum};
use sliding_counter::{
    CounterError, CounterOptions, Interrupt, LineServer, ServerOptions, WindowedCounter, exclaim,
};
use spdlog::{Level, LevelFilter, error, info};
use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Counter(#[from] CounterError),
    #[error("line server: {0}")]
    Server(#[from] io::Error),
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

#[derive(Parser, Debug)]
#[command(name = "sliding-counter", version, about = "Sliding-window event counter")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add at a fixed interval and print the windowed count, then watch it decay.
    Demo(DemoArgs),
    /// Run the line server and report how many lines it answered per window.
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct WindowArgs {
    /// Length of the sliding window in milliseconds.
    #[arg(long, default_value_t = 1000)]
    window_ms: u64,
    /// Number of segments the window is split into.
    #[arg(long, default_value_t = 5)]
    buckets: usize,
    /// Log rotation tick lag when the counter stops.
    #[arg(long)]
    rotation_stats: bool,
}

impl WindowArgs {
    fn counter(&self, name: &str) -> Result<WindowedCounter, CounterError> {
        WindowedCounter::with_options(
            Duration::from_millis(self.window_ms),
            self.buckets,
            CounterOptions {
                name: name.into(),
                rotation_stats: self.rotation_stats,
            },
        )
    }
}

#[derive(Args, Debug)]
struct DemoArgs {
    #[command(flatten)]
    window: WindowArgs,
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,
    #[arg(long, default_value_t = 20)]
    iterations: usize,
    #[arg(long, default_value_t = 10, allow_negative_numbers = true)]
    delta: i64,
    /// Reads taken after the last add.
    #[arg(long, default_value_t = 5)]
    decay_reads: usize,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    window: WindowArgs,
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: String,
    #[arg(long, default_value_t = 5000)]
    shutdown_timeout_ms: u64,
    /// Close connections idle for this long.
    #[arg(long)]
    idle_timeout_ms: Option<u64>,
    /// Shut down after this many seconds.
    #[arg(long)]
    run_for_secs: Option<u64>,
    /// Shut down when stdin reaches EOF.
    #[arg(long)]
    stop_on_eof: bool,
    /// Interval between rate reports.
    #[arg(long, default_value_t = 1000)]
    report_ms: u64,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum LogLevel {
    Critical,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Critical => Level::Critical,
            LogLevel::Error => Level::Error,
            LogLevel::Warn => Level::Warn,
            LogLevel::Info => Level::Info,
            LogLevel::Debug => Level::Debug,
            LogLevel::Trace => Level::Trace,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    spdlog::default_logger().set_level_filter(LevelFilter::MoreSevereEqual(cli.log_level.into()));

    let result = match cli.command {
        Command::Demo(args) => run_demo(args),
        Command::Serve(args) => run_serve(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let counter = args.window.counter("demo")?;
    info!(
        "window={:?}, segment={:?}, buckets={}",
        counter.window(),
        counter.segment_duration(),
        counter.bucket_count()
    );

    let interval = Duration::from_millis(args.interval_ms);
    for _ in 0..args.iterations {
        thread::sleep(interval);
        counter.add(args.delta);
        println!("current value of counter is: {}", counter.count());
    }

    for _ in 0..args.decay_reads {
        thread::sleep(interval);
        println!("current value of counter is: {}", counter.count());
    }

    counter.stop();
    Ok(())
}

fn run_serve(args: ServeArgs) -> Result<(), AppError> {
    let counter = Arc::new(args.window.counter("lines")?);
    let interrupt = Interrupt::new();

    {
        // SIGINT and SIGTERM.
        let interrupt = interrupt.clone();
        ctrlc::set_handler(move || {
            if interrupt.raise() {
                info!("interrupt signal received, shutting down");
            }
        })?;
    }

    if args.stop_on_eof {
        let interrupt = interrupt.clone();
        // Blocks on stdin for the life of the process; never joined.
        thread::spawn(move || {
            if let Err(err) = io::copy(&mut io::stdin().lock(), &mut io::sink()) {
                error!("stdin: {}", err);
            }
            if interrupt.raise() {
                info!("stdin closed, shutting down");
            }
        });
    }

    let deadline = args.run_for_secs.map(|secs| {
        let interrupt = interrupt.clone();
        thread::spawn(move || {
            if !interrupt.wait_timeout(Duration::from_secs(secs)) && interrupt.raise() {
                info!("run time of {}s elapsed, shutting down", secs);
            }
        })
    });

    let reporter = {
        let counter = counter.clone();
        let interrupt = interrupt.clone();
        let every = Duration::from_millis(args.report_ms);
        thread::spawn(move || {
            while !interrupt.wait_timeout(every) {
                info!("lines in the last {:?}: {}", counter.window(), counter.count());
            }
        })
    };

    let server = LineServer::bind(ServerOptions {
        addr: args.addr,
        shutdown_timeout: Duration::from_millis(args.shutdown_timeout_ms),
        idle_timeout: args.idle_timeout_ms.map(Duration::from_millis),
        ..Default::default()
    })?;

    let tally = counter.clone();
    let served = server.serve(&interrupt, move |line| {
        tally.add(1);
        exclaim(line)
    });

    // Release the helper threads even when serving failed.
    interrupt.raise();
    for handle in deadline.into_iter().chain([reporter]) {
        if handle.join().is_err() {
            error!("helper thread panicked");
        }
    }
    counter.stop();

    let report = served?;
    info!(
        "served {} connection(s), {} line(s), {} forced close(s)",
        report.connections, report.lines, report.forced
    );
    Ok(())
}
