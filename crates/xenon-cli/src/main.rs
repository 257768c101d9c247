#![forbid(unsafe_code)]

use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use xenon_iic::{interrupt_name, reg as iic_reg, XenonIic};
use xenon_platform::{MmioBus, PciBdf};
use xenon_smc::device::SMC_SMI_INTERRUPT;
use xenon_smc::regs::*;
use xenon_smc::{
    FifoCommand, Frame, Smc, SmcConfig, UnknownCode, FRAME_LEN, SMC_BAR0_BASE, SMC_DEVICE_ID,
    SMC_VENDOR_ID,
};

/// Physical base of the interrupt controller's register window.
const IIC_BASE: u64 = 0x0000_0200_0005_0000;
const SMC_BDF: PciBdf = PciBdf::new(0, 0x0A, 0);
/// How long a query may take to raise its SMI before it is treated as unanswered.
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
const UART_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Parser)]
#[command(about = "Bring-up harness for the Xenon SMC and interrupt controller")]
struct Args {
    /// Host serial port used when the guest selects the named-port UART target.
    #[arg(long)]
    com_port: Option<String>,

    /// Host connected to when the guest selects the socket UART target.
    #[arg(long)]
    socket_addr: Option<String>,

    #[arg(long)]
    socket_port: Option<u16>,

    /// Time the tray spends in each intermediate state, in milliseconds.
    #[arg(long)]
    tray_step_ms: Option<u64>,

    /// Clock interrupt period, in milliseconds.
    #[arg(long)]
    clock_interval_ms: Option<u64>,

    /// Power-on reason reported to the guest (hex byte, e.g. `0x12`).
    #[arg(long, value_parser = parse_wire::<PowerOnReason>)]
    power_on_reason: Option<PowerOnReason>,

    /// AV pack reported to the guest (hex byte, e.g. `0x1F`).
    #[arg(long, value_parser = parse_wire::<AvPackType>)]
    avpack: Option<AvPackType>,

    /// Command frame to push through the FIFO, as hex (`12`, `8b60`). May be repeated.
    ///
    /// Without any, a short identification sequence is sent.
    #[arg(long = "command", value_parser = parse_frame)]
    commands: Vec<Frame>,

    /// Value written to the UART configuration register after the commands (hex).
    #[arg(long, value_parser = parse_hex_u32)]
    uart_config: Option<u32>,

    /// Keep running this many milliseconds after the commands, copying UART input to stdout.
    #[arg(long, default_value_t = 0)]
    run_ms: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    let iic = Arc::new(XenonIic::with_line(Arc::new(|core: usize| {
        debug!(core, "external interrupt line asserted")
    })));
    let smc = Arc::new(Smc::new(config, iic.clone()).context("failed to start SMC")?);

    let mut bus = MmioBus::new();
    bus.map(IIC_BASE, iic.clone());
    bus.map_pci(SMC_BDF, u64::from(SMC_BAR0_BASE), smc);
    let harness = Harness { bus, iic };

    harness.identify()?;
    harness.write_smc(SMI_INT_ENABLE, INT_BIT);

    let commands = if args.commands.is_empty() {
        default_commands()
    } else {
        args.commands.clone()
    };

    let mut out = io::stdout().lock();
    for frame in &commands {
        let line = match harness.transact(frame) {
            Some(response) => hex(&response),
            None => "-".to_owned(),
        };
        writeln!(out, "{:<20} {line}", describe(frame[0])).context("failed to write to stdout")?;
    }

    if let Some(word) = args.uart_config {
        info!(word = format_args!("{word:#010x}"), "configuring UART");
        harness.write_smc(UART_CONFIG, word);
    }
    if args.run_ms > 0 {
        harness.echo_uart(&mut out, Duration::from_millis(args.run_ms))?;
    }

    info!("shutting down");
    Ok(())
}

fn build_config(args: &Args) -> Result<SmcConfig> {
    let mut config = SmcConfig::from_env().context("invalid XENON_SMC_* environment")?;
    if let Some(port) = &args.com_port {
        config.com_port = port.clone();
    }
    if let Some(addr) = &args.socket_addr {
        config.socket_addr = addr.clone();
    }
    if let Some(port) = args.socket_port {
        config.socket_port = port;
    }
    if let Some(ms) = args.tray_step_ms {
        config.tray_step = Duration::from_millis(ms);
    }
    if let Some(ms) = args.clock_interval_ms {
        config.clock_interval = Duration::from_millis(ms);
    }
    if let Some(reason) = args.power_on_reason {
        config.power_on_reason = reason;
    }
    if let Some(avpack) = args.avpack {
        config.avpack = avpack;
    }
    config.validate().context("invalid SMC configuration")?;
    Ok(config)
}

/// Drives the devices from the CPU side: register traffic over the bus, interrupts from core 0.
struct Harness {
    bus: MmioBus,
    iic: Arc<XenonIic>,
}

impl Harness {
    fn smc_addr(reg: u64) -> u64 {
        u64::from(SMC_BAR0_BASE) + reg
    }

    fn read_smc(&self, reg: u64) -> u32 {
        self.bus.read_u32(Self::smc_addr(reg))
    }

    fn write_smc(&self, reg: u64, value: u32) {
        self.bus.write_u32(Self::smc_addr(reg), value);
    }

    fn read_iic(&self, reg: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.bus.read(IIC_BASE + reg, &mut buf);
        u64::from_be_bytes(buf)
    }

    fn write_iic(&self, reg: u64, value: u64) {
        self.bus.write(IIC_BASE + reg, &value.to_be_bytes());
    }

    fn identify(&self) -> Result<()> {
        let mut id = [0u8; 4];
        self.bus.config_read(SMC_BDF, 0, &mut id);
        let vendor = u16::from_le_bytes([id[0], id[1]]);
        let device = u16::from_le_bytes([id[2], id[3]]);
        if (vendor, device) != (SMC_VENDOR_ID, SMC_DEVICE_ID) {
            bail!("unexpected PCI id {vendor:04x}:{device:04x} at {SMC_BDF:?}");
        }
        info!(
            "SMC {vendor:04x}:{device:04x} at {:#x}, IIC at {IIC_BASE:#x}",
            SMC_BAR0_BASE
        );
        Ok(())
    }

    /// Send one command frame and, for queries, collect the response the SMI announces.
    fn transact(&self, frame: &Frame) -> Option<Frame> {
        self.write_smc(FIFO_IN_STATUS, FIFO_STATUS_READY);
        for word in frame.chunks(4) {
            self.bus.write(Self::smc_addr(FIFO_IN_MSG), word);
        }
        self.write_smc(FIFO_IN_STATUS, 0);

        if frame[0] >= 0x80 {
            return None;
        }

        let start = Instant::now();
        while !self.iic.check_ext_interrupt(0) {
            if start.elapsed() >= RESPONSE_TIMEOUT {
                warn!(code = frame[0], "no response to SMC command");
                return None;
            }
            thread::sleep(UART_POLL);
        }

        let vector = self.read_iic(iic_reg::ACK) as u8;
        if vector != SMC_SMI_INTERRUPT {
            warn!(vector = interrupt_name(vector), "unexpected interrupt on core 0");
        }

        self.write_smc(FIFO_OUT_STATUS, FIFO_STATUS_READY);
        let mut response = [0u8; FRAME_LEN];
        for word in response.chunks_mut(4) {
            self.bus.read(Self::smc_addr(FIFO_OUT_MSG), word);
        }
        self.write_smc(FIFO_OUT_STATUS, 0);

        self.write_smc(SMI_INT_ACK, INT_BIT);
        self.write_iic(iic_reg::EOI, 0);
        Some(response)
    }

    fn echo_uart(&self, out: &mut impl Write, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.read_smc(UART_STATUS) & UART_STATUS_RX_AVAILABLE != 0 {
                let byte = self.read_smc(UART_IN) as u8;
                out.write_all(&[byte]).context("failed to write UART output")?;
                continue;
            }
            out.flush().context("failed to flush UART output")?;
            thread::sleep(UART_POLL);
        }
        Ok(())
    }
}

fn default_commands() -> Vec<Frame> {
    [
        FifoCommand::QueryVersion,
        FifoCommand::PowerOnType,
        FifoCommand::QueryAvPack,
        FifoCommand::QueryTrayState,
        FifoCommand::QueryTemperatures,
    ]
    .into_iter()
    .map(|cmd| {
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = cmd.code();
        frame
    })
    .collect()
}

fn describe(code: u8) -> String {
    FifoCommand::try_from(code).map_or_else(|_| format!("{code:#04x}"), |cmd| format!("{cmd:?}"))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

fn parse_hex_u32(s: &str) -> Result<u32, String> {
    u32::from_str_radix(strip_hex_prefix(s), 16).map_err(|err| format!("invalid hex value: {err}"))
}

fn parse_wire<T>(s: &str) -> Result<T, String>
where
    T: TryFrom<u8, Error = UnknownCode>,
{
    let code = u8::from_str_radix(strip_hex_prefix(s), 16)
        .map_err(|err| format!("invalid hex byte: {err}"))?;
    T::try_from(code).map_err(|err| err.to_string())
}

fn parse_frame(s: &str) -> Result<Frame, String> {
    let digits = strip_hex_prefix(s);
    if digits.is_empty() || digits.len() % 2 != 0 || digits.len() > FRAME_LEN * 2 {
        return Err(format!(
            "expected 1 to {FRAME_LEN} bytes as an even number of hex digits"
        ));
    }
    let mut frame = [0u8; FRAME_LEN];
    for (i, slot) in frame.iter_mut().take(digits.len() / 2).enumerate() {
        *slot = u8::from_str_radix(&digits[2 * i..2 * i + 2], 16)
            .map_err(|err| format!("invalid hex byte: {err}"))?;
    }
    Ok(frame)
}
