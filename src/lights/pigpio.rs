//! PWM output through the pigpio daemon's socket interface

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::LightingError;

/// `set_PWM_dutycycle`
const PI_CMD_PWM: u32 = 5;
const IO_TIMEOUT: Duration = Duration::from_millis(500);

/// Sets duty cycles (0-255) on numbered channels
pub trait PwmDriver: Send {
    fn name(&self) -> &str;

    fn set_duty_cycle(&mut self, channel: u32, duty: u8) -> Result<(), LightingError>;
}

/// Client for pigpiod (default `127.0.0.1:8888`). Channels are BCM GPIO
/// numbers. Reconnects once if the daemon dropped the socket.
pub struct PigpioDriver {
    addr: SocketAddr,
    name: String,
    stream: Option<TcpStream>,
}

impl PigpioDriver {
    pub fn connect(addr: &str) -> Result<Self, LightingError> {
        let resolved = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| LightingError::DeviceUnavailable(format!("cannot resolve {addr}")))?;

        let stream = open(resolved)?;
        info!("Connected to pigpiod at {resolved}");

        Ok(Self {
            addr: resolved,
            name: format!("pigpiod@{resolved}"),
            stream: Some(stream),
        })
    }

    /// Send one command and return the daemon's (non-negative) result
    fn command(&mut self, cmd: u32, p1: u32, p2: u32) -> Result<i32, LightingError> {
        let mut request = [0u8; 16];
        request[0..4].copy_from_slice(&cmd.to_le_bytes());
        request[4..8].copy_from_slice(&p1.to_le_bytes());
        request[8..12].copy_from_slice(&p2.to_le_bytes());

        match self.exchange(&request) {
            Ok(res) => Ok(res),
            Err(e) => {
                warn!("pigpiod exchange failed ({e}), reconnecting");
                self.stream = Some(open(self.addr)?);
                self.exchange(&request)
            }
        }
    }

    fn exchange(&mut self, request: &[u8; 16]) -> Result<i32, LightingError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| LightingError::DeviceUnavailable("not connected".into()))?;

        let result = (|| {
            stream.write_all(request)?;
            let mut reply = [0u8; 16];
            stream.read_exact(&mut reply)?;
            Ok::<_, std::io::Error>(i32::from_le_bytes([reply[12], reply[13], reply[14], reply[15]]))
        })();

        if result.is_err() {
            self.stream = None;
        }
        Ok(result?)
    }
}

fn open(addr: SocketAddr) -> Result<TcpStream, LightingError> {
    let stream = TcpStream::connect_timeout(&addr, IO_TIMEOUT)
        .map_err(|e| LightingError::DeviceUnavailable(format!("pigpiod at {addr}: {e}")))?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    Ok(stream)
}

impl PwmDriver for PigpioDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_duty_cycle(&mut self, channel: u32, duty: u8) -> Result<(), LightingError> {
        let res = self.command(PI_CMD_PWM, channel, u32::from(duty))?;
        if res < 0 {
            return Err(LightingError::Driver {
                channel,
                reason: format!("pigpio error {res}"),
            });
        }
        debug!(channel, duty, "PWM duty cycle set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// Fake daemon: answers `count` commands with `result`, returns what it saw
    fn fake_daemon(count: usize, result: i32) -> (String, thread::JoinHandle<Vec<[u32; 3]>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            for _ in 0..count {
                let mut req = [0u8; 16];
                conn.read_exact(&mut req).unwrap();
                let word = |i: usize| u32::from_le_bytes(req[i..i + 4].try_into().unwrap());
                seen.push([word(0), word(4), word(8)]);

                let mut reply = req;
                reply[12..16].copy_from_slice(&result.to_le_bytes());
                conn.write_all(&reply).unwrap();
            }
            seen
        });

        (addr, handle)
    }

    #[test]
    fn sends_pwm_commands() {
        let (addr, daemon) = fake_daemon(2, 0);
        let mut pwm = PigpioDriver::connect(&addr).unwrap();

        pwm.set_duty_cycle(17, 255).unwrap();
        pwm.set_duty_cycle(22, 10).unwrap();

        assert_eq!(daemon.join().unwrap(), vec![[5, 17, 255], [5, 22, 10]]);
    }

    #[test]
    fn negative_result_is_a_driver_error() {
        let (addr, daemon) = fake_daemon(1, -2);
        let mut pwm = PigpioDriver::connect(&addr).unwrap();

        let err = pwm.set_duty_cycle(99, 1).unwrap_err();
        assert!(matches!(err, LightingError::Driver { channel: 99, .. }));
        daemon.join().unwrap();
    }

    #[test]
    fn missing_daemon_is_unavailable() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let err = PigpioDriver::connect(&addr.to_string()).err().unwrap();
        assert!(matches!(err, LightingError::DeviceUnavailable(_)));
    }
}
