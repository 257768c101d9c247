//! UART bridging between the SMC's serial registers and a host transport.
//!
//! The guest selects a transport by writing the UART configuration register. Opening, sending and
//! receiving all happen on the SMC's UART threads; a transport that fails is dropped and the UART
//! goes quiet until the guest reconfigures it.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use tracing::debug;

use crate::config::SmcConfig;

/// Bit of the configuration word selecting the socket target instead of the named port.
pub const UART_CONFIG_SOCKET: u32 = 0x8000_0000;
/// Line settings (baud divisor, framing). Stored, not modeled.
pub const UART_CONFIG_LINE_MASK: u32 = 0xFFFF;

/// Maximum number of received bytes buffered for the guest.
pub const RX_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UartTarget {
    /// Host serial port (or any path that can be opened read/write).
    NamedPort(String),
    Socket { addr: String, port: u16 },
}

impl UartTarget {
    /// Decode the guest's configuration word. `None` means the UART is disabled.
    pub fn from_config_word(word: u32, config: &SmcConfig) -> Option<Self> {
        if word == 0 {
            return None;
        }
        if word & UART_CONFIG_SOCKET != 0 {
            Some(Self::Socket {
                addr: config.socket_addr.clone(),
                port: config.socket_port,
            })
        } else {
            Some(Self::NamedPort(config.com_port.clone()))
        }
    }
}

impl std::fmt::Display for UartTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NamedPort(name) => f.write_str(name),
            Self::Socket { addr, port } => write!(f, "{addr}:{port}"),
        }
    }
}

/// Guest-selected UART configuration.
///
/// `requested` increases on every configuration write; the UART thread compares it against the
/// generation it last applied to decide whether the transport must be reopened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UartSettings {
    pub word: u32,
    pub target: Option<UartTarget>,
    pub requested: u64,
}

impl UartSettings {
    pub fn reconfigure(&mut self, word: u32, config: &SmcConfig) {
        self.word = word;
        self.target = UartTarget::from_config_word(word, config);
        self.requested += 1;
    }

    pub fn line_config(&self) -> u32 {
        self.word & UART_CONFIG_LINE_MASK
    }
}

/// Byte stream behind the UART.
///
/// All methods take `&self`: one thread blocks in [`UartTransport::receive`] while another sends
/// or shuts the transport down.
pub trait UartTransport: Send + Sync {
    fn send(&self, bytes: &[u8]) -> io::Result<()>;

    /// Block until at least one byte is available. `Ok(0)` means the stream is closed.
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Close the transport, waking any blocked [`UartTransport::receive`]. Further receives
    /// return `Ok(0)`.
    fn shutdown(&self);
}

impl<T: UartTransport + ?Sized> UartTransport for Arc<T> {
    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        (**self).send(bytes)
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).receive(buf)
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }
}

/// Opens transports for a [`UartTarget`].
pub trait TransportFactory: Send + Sync {
    fn open(&self, target: &UartTarget) -> io::Result<Arc<dyn UartTransport>>;
}

impl<F> TransportFactory for F
where
    F: Fn(&UartTarget) -> io::Result<Arc<dyn UartTransport>> + Send + Sync,
{
    fn open(&self, target: &UartTarget) -> io::Result<Arc<dyn UartTransport>> {
        self(target)
    }
}

/// Opens sockets with [`TcpStream`] and named ports as read/write files.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostTransportFactory;

impl TransportFactory for HostTransportFactory {
    fn open(&self, target: &UartTarget) -> io::Result<Arc<dyn UartTransport>> {
        match target {
            UartTarget::Socket { addr, port } => {
                let stream = TcpStream::connect((addr.as_str(), *port))?;
                stream.set_nodelay(true)?;
                Ok(Arc::new(TcpTransport { stream }))
            }
            UartTarget::NamedPort(path) => {
                Ok(Arc::new(FileTransport::open(path)?))
            }
        }
    }
}

#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl UartTransport for TcpTransport {
    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        (&self.stream).write_all(bytes)
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn shutdown(&self) {
        // Already-closed sockets report NotConnected; nothing left to do either way.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Serial device or other path opened read/write.
///
/// Reads run on a detached `smc-uart-file` thread that feeds an internal pipe, so
/// [`UartTransport::shutdown`] wakes a pending [`UartTransport::receive`] even while the device
/// is silent. The feeder exits on EOF, on a read error, or on its first read after shutdown.
#[derive(Debug)]
pub struct FileTransport {
    file: File,
    incoming: Arc<Pipe>,
    closed: AtomicBool,
}

impl FileTransport {
    pub fn open(path: &str) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let reader = file.try_clone()?;
        let incoming = Arc::new(Pipe::default());
        let feed = incoming.clone();
        let path = path.to_owned();
        thread::Builder::new()
            .name("smc-uart-file".to_owned())
            .spawn(move || feed_pipe(reader, &feed, &path))?;
        Ok(Self {
            file,
            incoming,
            closed: AtomicBool::new(false),
        })
    }
}

fn feed_pipe(mut reader: File, pipe: &Pipe, path: &str) {
    let mut buf = [0u8; 256];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if pipe.write(&buf[..n]).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                debug!(path, %err, "named port read failed");
                break;
            }
        }
    }
    pipe.close();
}

impl UartTransport for FileTransport {
    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        (&self.file).write_all(bytes)?;
        (&self.file).flush()
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.incoming.read(buf))
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.incoming.close();
    }
}

#[derive(Debug, Default)]
struct PipeState {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// One direction of an in-memory byte stream.
#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.bytes.extend(bytes);
        self.ready.notify_all();
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        let mut state = self.lock();
        while state.bytes.is_empty() && !state.closed {
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        let n = buf.len().min(state.bytes.len());
        for (dst, src) in buf.iter_mut().zip(state.bytes.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }
}

/// In-memory transport; see [`loopback_pair`].
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    tx: Arc<Pipe>,
    rx: Arc<Pipe>,
}

/// Two connected in-memory endpoints. Bytes sent on one are received on the other.
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let a = Arc::new(Pipe::default());
    let b = Arc::new(Pipe::default());
    (
        LoopbackTransport {
            tx: a.clone(),
            rx: b.clone(),
        },
        LoopbackTransport { tx: b, rx: a },
    )
}

impl UartTransport for LoopbackTransport {
    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        self.tx.write(bytes)
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.rx.read(buf))
    }

    /// Closes both directions, so the peer sees EOF once it has drained what was sent.
    fn shutdown(&self) {
        self.tx.close();
        self.rx.close();
    }
}

/// Hands out one pre-made loopback endpoint. Later opens fail with `AddrInUse`.
#[derive(Debug)]
pub struct LoopbackFactory {
    endpoint: Mutex<Option<LoopbackTransport>>,
}

impl LoopbackFactory {
    /// Returns the factory and the host-side end of the stream.
    pub fn new() -> (Self, LoopbackTransport) {
        let (device, host) = loopback_pair();
        (
            Self {
                endpoint: Mutex::new(Some(device)),
            },
            host,
        )
    }
}

impl TransportFactory for LoopbackFactory {
    fn open(&self, _target: &UartTarget) -> io::Result<Arc<dyn UartTransport>> {
        self.endpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .map(|endpoint| Arc::new(endpoint) as Arc<dyn UartTransport>)
            .ok_or_else(|| io::ErrorKind::AddrInUse.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn config_word_selects_target() {
        let config = SmcConfig::default();
        assert_eq!(UartTarget::from_config_word(0, &config), None);
        assert_eq!(
            UartTarget::from_config_word(0x0000_01E6, &config),
            Some(UartTarget::NamedPort(config.com_port.clone()))
        );
        assert_eq!(
            UartTarget::from_config_word(0x8000_01E6, &config),
            Some(UartTarget::Socket {
                addr: "127.0.0.1".to_owned(),
                port: 7000
            })
        );

        let mut settings = UartSettings::default();
        settings.reconfigure(0x8000_01E6, &config);
        assert_eq!(settings.line_config(), 0x01E6);
        assert_eq!(settings.requested, 1);
    }

    #[test]
    fn loopback_shutdown_wakes_blocked_receiver() {
        let (a, b) = loopback_pair();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 8];
            let n = b.receive(&mut buf).unwrap();
            let first = buf[..n].to_vec();
            let eof = b.receive(&mut buf).unwrap();
            (first, eof)
        });

        a.send(b"hi").unwrap();
        a.shutdown();

        let (first, eof) = reader.join().unwrap();
        assert_eq!(first, b"hi");
        assert_eq!(eof, 0);
        assert!(a.send(b"late").is_err());
    }

    #[test]
    fn loopback_factory_is_single_use() {
        let (factory, _host) = LoopbackFactory::new();
        let target = UartTarget::NamedPort("loop".to_owned());
        assert!(factory.open(&target).is_ok());
        assert_eq!(
            factory.open(&target).err().map(|e| e.kind()),
            Some(io::ErrorKind::AddrInUse)
        );
    }

    #[test]
    fn tcp_transport_roundtrips_and_shuts_down() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = UartTarget::Socket {
            addr: "127.0.0.1".to_owned(),
            port,
        };

        let transport = HostTransportFactory.open(&target).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        transport.send(b"xenon").unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"xenon");

        peer.write_all(b"ok").unwrap();
        let mut buf = [0u8; 2];
        let mut got = 0;
        while got < 2 {
            got += transport.receive(&mut buf[got..]).unwrap();
        }
        assert_eq!(&buf, b"ok");

        transport.shutdown();
        assert_eq!(transport.receive(&mut buf).unwrap(), 0);
    }

    #[test]
    fn missing_named_port_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let target = UartTarget::NamedPort(dir.path().join("absent").display().to_string());
        assert!(HostTransportFactory.open(&target).is_err());
    }

    #[test]
    fn named_port_writes_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uart.log");
        std::fs::write(&path, b"").unwrap();

        let target = UartTarget::NamedPort(path.display().to_string());
        let transport = HostTransportFactory.open(&target).unwrap();
        transport.send(b"boot\n").unwrap();
        transport.shutdown();
        assert!(transport.send(b"more").is_err());

        assert_eq!(std::fs::read(&path).unwrap(), b"boot\n");
    }

    #[cfg(unix)]
    #[test]
    fn shutdown_wakes_receive_on_a_silent_named_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ttyFake");
        let status = std::process::Command::new("mkfifo")
            .arg(&path)
            .status()
            .unwrap();
        assert!(status.success());

        let target = UartTarget::NamedPort(path.display().to_string());
        let transport = HostTransportFactory.open(&target).unwrap();
        let receiver = transport.clone();
        let (done, finished) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; 8];
            done.send(receiver.receive(&mut buf).unwrap()).unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        transport.shutdown();
        assert_eq!(finished.recv_timeout(Duration::from_secs(3)), Ok(0));
    }
}
