use ferrite::logging;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

/// Commands for the serial writer thread. Writes and baudrate switches are
/// applied strictly in order, so a response frame queued before a switch
/// leaves at the old rate.
#[derive(Debug)]
pub enum SerialCmd {
    Write(Vec<u8>),
    SetBaud(u32),
    Shutdown,
}

/// The two pump threads around the serial device. Only byte buffers cross
/// this boundary; all protocol state stays on the scheduler thread.
pub struct SerialLink {
    pub rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pub tx: mpsc::UnboundedSender<SerialCmd>,
}

pub fn open(port: &str, baud: u32) -> Result<Box<dyn SerialPort>, serialport::Error> {
    serialport::new(port, baud)
        .timeout(Duration::from_millis(20))
        .open()
}

/// Spawns the reader and writer threads over the device.
pub fn start(port: Box<dyn SerialPort>, log: &logging::Logger) -> serialport::Result<SerialLink> {
    let (rx_tx, rx_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (tx_tx, mut tx_rx) = mpsc::unbounded_channel::<SerialCmd>();

    let mut reader = port.try_clone()?;
    let mut writer = port;

    let read_log = log.new(logging::o!());
    thread::spawn(move || {
        let mut buf = [0u8; 512];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => continue,
                Ok(count) => {
                    if rx_tx.send(buf[..count].to_vec()).is_err() {
                        break; // daemon gone
                    }
                }
                Err(ref error) if error.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(ref error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    logging::error!(read_log, "serial read failed"; "error" => %error);
                    break;
                }
            }
        }
    });

    let write_log = log.new(logging::o!());
    thread::spawn(move || {
        while let Some(cmd) = tx_rx.blocking_recv() {
            match cmd {
                SerialCmd::Write(bytes) => {
                    if let Err(error) = writer.write_all(&bytes) {
                        logging::error!(write_log, "serial write failed"; "error" => %error);
                        break;
                    }
                }
                SerialCmd::SetBaud(baud) => {
                    match writer.set_baud_rate(baud) {
                        Ok(()) => {
                            logging::info!(write_log, "serial baudrate changed"; "baud" => baud);
                        }
                        Err(error) => {
                            logging::error!(write_log, "baudrate change failed";
                                            "baud" => baud,
                                            "error" => %error);
                        }
                    }
                }
                SerialCmd::Shutdown => break,
            }
        }
    });

    Ok(SerialLink { rx: rx_rx, tx: tx_tx })
}
