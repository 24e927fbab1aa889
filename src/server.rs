use crate::interrupt::Interrupt;
use spdlog::{debug, info, warn};
use std::io::{self, BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub addr: String,
    /// How long in-flight connections may keep running once the interrupt is raised.
    pub shutdown_timeout: Duration,
    /// Granularity at which the accept loop and connection reads notice the interrupt.
    pub poll_interval: Duration,
    /// Close connections that send nothing for this long.
    pub idle_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".into(),
            shutdown_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            idle_timeout: None,
            write_timeout: None,
        }
    }
}

/// What a finished [`LineServer::serve`] run handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeReport {
    /// Connections accepted.
    pub connections: usize,
    /// Lines answered across all connections.
    pub lines: u64,
    /// Connections still open at the shutdown deadline and closed by force.
    pub forced: usize,
}

/// A TCP server answering newline-delimited requests, one thread per connection.
pub struct LineServer {
    listener: TcpListener,
    options: ServerOptions,
}

struct Connection {
    peer: SocketAddr,
    control: TcpStream,
    handle: thread::JoinHandle<()>,
}

impl Connection {
    fn join(self) {
        if self.handle.join().is_err() {
            warn!("handler for {} panicked", self.peer);
        }
    }
}

impl LineServer {
    pub fn bind(options: ServerOptions) -> io::Result<Self> {
        let listener = TcpListener::bind(options.addr.as_str())?;
        listener.set_nonblocking(true)?;
        info!("line server listening on {}", listener.local_addr()?);
        Ok(Self { listener, options })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `interrupt` is raised, then drains them.
    ///
    /// Every line read from a connection (terminator stripped) is passed to `transform` and
    /// the result is written back followed by `\n`. After the interrupt no new connections
    /// are accepted; open ones finish their current line and close. Connections still open
    /// after `shutdown_timeout` are shut down and counted in [`ServeReport::forced`].
    pub fn serve<F>(self, interrupt: &Interrupt, transform: F) -> io::Result<ServeReport>
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        let LineServer { listener, options } = self;
        let transform = Arc::new(transform);
        let lines = Arc::new(AtomicU64::new(0));
        let mut connections: Vec<Connection> = Vec::new();
        let mut accepted = 0;

        while !interrupt.is_raised() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    accepted += 1;
                    debug!("accepted connection from {}", peer);
                    match spawn_connection(stream, peer, &options, interrupt, &transform, &lines)
                    {
                        Ok(connection) => connections.push(connection),
                        Err(err) => warn!("failed to start handler for {}: {}", peer, err),
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    interrupt.wait_timeout(options.poll_interval);
                }
                Err(err) => {
                    warn!("accept error: {}", err);
                    interrupt.wait_timeout(options.poll_interval);
                }
            }

            let (finished, running): (Vec<_>, Vec<_>) = connections
                .into_iter()
                .partition(|connection| connection.handle.is_finished());
            finished.into_iter().for_each(Connection::join);
            connections = running;
        }

        drop(listener);
        info!(
            "interrupt received, draining {} connection(s)",
            connections.len()
        );
        let forced = drain(connections, &options);

        Ok(ServeReport {
            connections: accepted,
            lines: lines.load(Ordering::Relaxed),
            forced,
        })
    }
}

fn spawn_connection<F>(
    stream: TcpStream,
    peer: SocketAddr,
    options: &ServerOptions,
    interrupt: &Interrupt,
    transform: &Arc<F>,
    lines: &Arc<AtomicU64>,
) -> io::Result<Connection>
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    // Some platforms hand out accepted sockets in the listener's non-blocking mode.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(options.poll_interval))?;
    stream.set_write_timeout(options.write_timeout)?;
    let control = stream.try_clone()?;
    let reader = BufReader::new(stream.try_clone()?);
    let writer = BufWriter::new(stream);

    let interrupt = interrupt.clone();
    let transform = transform.clone();
    let lines = lines.clone();
    let idle_timeout = options.idle_timeout;

    let handle = thread::Builder::new()
        .name(format!("line-conn-{}", peer))
        .spawn(move || {
            let counted = |line: &str| {
                lines.fetch_add(1, Ordering::Relaxed);
                (*transform)(line)
            };
            match handle_lines(reader, writer, &interrupt, idle_timeout, counted) {
                Ok(handled) => debug!("connection {} closed after {} line(s)", peer, handled),
                Err(err) => debug!("connection {} ended: {}", peer, err),
            }
        })?;

    Ok(Connection {
        peer,
        control,
        handle,
    })
}

fn drain(connections: Vec<Connection>, options: &ServerOptions) -> usize {
    let deadline = Instant::now().checked_add(options.shutdown_timeout);
    while connections.iter().any(|c| !c.handle.is_finished())
        && deadline.is_none_or(|deadline| Instant::now() < deadline)
    {
        thread::sleep(options.poll_interval);
    }

    let mut forced = 0;
    for connection in connections {
        if !connection.handle.is_finished() {
            forced += 1;
            warn!("forcing close of connection {}", connection.peer);
            if let Err(err) = connection.control.shutdown(Shutdown::Both) {
                debug!("shutdown of {} failed: {}", connection.peer, err);
            }
        }
        connection.join();
    }
    forced
}

/// Serves one line-oriented session until EOF, idle timeout, or interrupt.
///
/// Reads that time out (`WouldBlock`/`TimedOut`) are how the loop observes `interrupt`: with
/// no partial line buffered it returns, otherwise it keeps reading to finish that line.
/// Returns the number of lines answered.
pub fn handle_lines<R, W, F>(
    mut reader: R,
    mut writer: W,
    interrupt: &Interrupt,
    idle_timeout: Option<Duration>,
    transform: F,
) -> io::Result<u64>
where
    R: BufRead,
    W: Write,
    F: Fn(&str) -> String,
{
    let mut buf = Vec::new();
    let mut handled = 0;
    let mut last_activity = Instant::now();

    loop {
        let buffered = buf.len();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                // EOF, possibly with an unterminated last line from earlier partial reads.
                if !buf.is_empty() {
                    reply(&mut writer, &transform, &buf)?;
                    handled += 1;
                }
                return Ok(handled);
            }
            Ok(_) => {
                last_activity = Instant::now();
                if buf.last() != Some(&b'\n') {
                    // EOF mid-line: the next read reports it.
                    continue;
                }
                reply(&mut writer, &transform, &buf)?;
                handled += 1;
                buf.clear();
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                // A timed-out read keeps whatever part of the line it received.
                if buf.len() > buffered {
                    last_activity = Instant::now();
                }
                if interrupt.is_raised() && buf.is_empty() {
                    return Ok(handled);
                }
                if let Some(idle) = idle_timeout
                    && last_activity.elapsed() >= idle
                {
                    debug!("closing idle connection");
                    return Ok(handled);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn reply<W: Write, F: Fn(&str) -> String>(
    writer: &mut W,
    transform: &F,
    raw: &[u8],
) -> io::Result<()> {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let mut response = transform(&String::from_utf8_lossy(line));
    response.push('\n');
    writer.write_all(response.as_bytes())?;
    writer.flush()
}

/// Turns a question into an exclamation: drops "吗", maps "?" and "？" to "!", and makes
/// sure the reply ends with "!".
pub fn exclaim(line: &str) -> String {
    let mut reply = line.replace('吗', "").replace(['?', '？'], "!");
    if !reply.ends_with('!') {
        reply.push('!');
    }
    reply
}
