use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::iter::Peekable;
use std::str::SplitWhitespace;
use std::sync::mpsc;
use std::time::Duration;

use seracc_proto::master::Master;
use seracc_proto::Width;

fn cmd_read<IO: Read + Write>(args: &mut CmdScanner, master: &mut Master<IO>) -> Result<()> {
    let address = args.parse_u32()?;
    let width = match args.peek() {
        Some(_) => Width::try_from(args.parse_u32()?)
            .ok()
            .context("Width must be 8, 16 or 32")?,
        None => Width::Word,
    };
    println!("{:#010x}", master.read_register(address, width)?);
    Ok(())
}

fn cmd_write<IO: Read + Write>(args: &mut CmdScanner, master: &mut Master<IO>) -> Result<()> {
    let address = args.parse_u32()?;
    let value = args.parse_u32()?;
    master.write_register(address, value, Width::Word)?;
    Ok(())
}

fn cmd_modify<IO: Read + Write>(args: &mut CmdScanner, master: &mut Master<IO>) -> Result<()> {
    let address = args.parse_u32()?;
    let mask = args.parse_u32()?;
    let value = args.parse_u32()?;
    master.write_field(address, mask, value)?;
    Ok(())
}

fn cmd_poll<IO: Read + Write>(args: &mut CmdScanner, master: &mut Master<IO>) -> Result<()> {
    let address = args.parse_u32()?;
    let delay = Duration::from_secs_f32(args.parse_next()?);

    println!("Press enter to stop polling.");
    // check that the first read is ok before starting the poll stop thread
    println!("{:#010x}", master.read_register(address, Width::Word)?);
    let (io_tx, io_rx) = mpsc::channel::<()>();
    std::thread::spawn(move || {
        let _ch = io_tx;
        let mut buf = String::new();
        let _ = std::io::stdin().read_line(&mut buf);
    });
    loop {
        if io_rx.recv_timeout(delay) == Err(mpsc::RecvTimeoutError::Disconnected) {
            break;
        }
        println!("{:#010x}", master.read_register(address, Width::Word)?);
    }
    Ok(())
}

fn cmd_wait<IO: Read + Write>(args: &mut CmdScanner, master: &mut Master<IO>) -> Result<()> {
    let address = args.parse_u32()?;
    let mask = args.parse_u32()?;
    let value = args.parse_u32()?;
    master.wait_until(address, mask, value, Duration::from_secs(1))?;
    Ok(())
}

/// Stop recording and print the accesses as C, or save them to a file.
fn cmd_endlog<IO: Read + Write>(args: &mut CmdScanner, master: &mut Master<IO>) -> Result<()> {
    let log = master.stop_logging().context("Not logging")?;
    match args.peek() {
        Some(_) => {
            let path = args.next()?;
            let file = File::create(path).with_context(|| format!("Failed to create {}", path))?;
            log.render(file)?;
        }
        None => log.render(std::io::stdout())?,
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args();
    args.next(); // Skip program name
    let port = args.next().unwrap_or_else(|| "/dev/ttyACM0".to_string());

    let serial = serialport::new(&port, 1_000_000)
        .timeout(Duration::from_millis(100))
        .open()
        .with_context(|| format!("Failed to open serial port {}", port))?;

    let mut stdout = std::io::stdout();

    let mut master = Master::new(serial);
    loop {
        print!(">> ");
        stdout.flush()?;
        let mut cmd = String::new();
        let mut scan = match CmdScanner::read_stdin(&mut cmd)? {
            Some(scan) => scan,
            None => return Ok(()),
        };
        if let Err(err) = match scan.next() {
            Err(_) => continue,
            Ok("read") | Ok("r") => cmd_read(&mut scan, &mut master),
            Ok("write") | Ok("w") => cmd_write(&mut scan, &mut master),
            Ok("modify") | Ok("m") => cmd_modify(&mut scan, &mut master),
            Ok("poll") => cmd_poll(&mut scan, &mut master),
            Ok("wait") => cmd_wait(&mut scan, &mut master),
            Ok("sync") => master.sync().map_err(Into::into),
            Ok("log") => {
                master.start_logging();
                Ok(())
            }
            Ok("endlog") => cmd_endlog(&mut scan, &mut master),
            Ok(cmd) => {
                println!("Unknown command {}", cmd);
                continue;
            }
        } {
            println!("{:?}", err)
        }
    }
}

struct CmdScanner<'a> {
    splt: Peekable<SplitWhitespace<'a>>,
}

impl<'a> CmdScanner<'a> {
    /// `None` at the end of input.
    fn read_stdin(buf: &'a mut String) -> Result<Option<Self>> {
        buf.clear();
        if std::io::stdin().read_line(buf)? == 0 {
            return Ok(None);
        }
        let splt = buf.split_whitespace().peekable();
        Ok(Some(Self { splt }))
    }

    fn next(&mut self) -> Result<&str> {
        self.splt.next().context("End of stream")
    }

    fn peek(&mut self) -> Option<&&str> {
        self.splt.peek()
    }

    fn parse_next<T: std::str::FromStr>(&mut self) -> Result<T> {
        self.next()?.parse::<T>().ok().context("Parse error")
    }

    /// Decimal, or hexadecimal with a `0x` prefix.
    fn parse_u32(&mut self) -> Result<u32> {
        let arg = self.next()?;
        let value = match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
            None => arg.parse(),
        };
        value.with_context(|| format!("Invalid number {}", arg))
    }
}
