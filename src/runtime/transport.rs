//! Interpreter process launch and the wire seam.
//!
//! The bridge is the listening side: it opens a loopback listener on an
//! OS-assigned port, spawns the interpreter with `RIDE_INIT=CONNECT:...`
//! pointing back at it, and accepts the single inbound connection. The write
//! half hides behind [`RideTransport`] so the session core can be driven
//! against a recording transport in tests.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use log::info;

use super::codec::{encode_frame, trunc};
use super::error::Error;

/// Bounded wait for the spawned interpreter to connect back.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Greeting sent on accept: protocol negotiation, identification, and the
/// status subscription. The `UsingProtocol=2` acknowledgment must come back
/// decoded before the session is usable.
pub const GREETING: [&str; 6] = [
    "SupportedProtocols=2",
    "UsingProtocol=2",
    r#"["Identify",{"identity":1}]"#,
    r#"["Connect",{"remoteId":2}]"#,
    r#"["GetWindowLayout",{}]"#,
    r#"["Subscribe",{"status":true}]"#,
];

/// Outbound frame writer.
pub trait RideTransport: Send {
    fn send(&mut self, payload: &str) -> Result<(), Error>;
}

pub struct TcpLink {
    stream: TcpStream,
}

impl TcpLink {
    pub fn new(stream: TcpStream) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl RideTransport for TcpLink {
    fn send(&mut self, payload: &str) -> Result<(), Error> {
        use std::io::Write;
        log::debug!(target: "transport", "send {}", trunc(payload));
        self.stream.write_all(&encode_frame(payload))?;
        self.stream.flush()?;
        Ok(())
    }
}

/// Environment for the spawned interpreter: keyboard/UI handling off, classic
/// mode, single-trace, pause-on-error, and the callback address.
pub fn interpreter_env(addr: &SocketAddr, config_file: Option<&str>) -> Vec<(String, String)> {
    let mut env = vec![
        ("APLK0".to_string(), "default".to_string()),
        ("AUTOCOMPLETE_PREFIXSIZE".to_string(), "0".to_string()),
        ("CLASSICMODE".to_string(), "1".to_string()),
        ("SINGLETRACE".to_string(), "1".to_string()),
        ("AUTO_PAUSE_THREADS".to_string(), "1".to_string()),
        ("RIDE_SPAWNED".to_string(), "1".to_string()),
        ("RIDE_INIT".to_string(), format!("CONNECT:{addr}")),
    ];
    if let Some(config) = config_file {
        env.push(("CONFIGFILE".to_string(), config.to_string()));
    }
    env
}

pub fn spawn_interpreter(
    exe: &str,
    cwd: &str,
    addr: &SocketAddr,
    config_file: Option<&str>,
) -> Result<Child, Error> {
    let mut cmd = Command::new(exe);
    cmd.args(["+s", "-q", "-nokbd"])
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .envs(interpreter_env(addr, config_file));
    info!(target: "transport", "spawning interpreter {exe:?}");
    cmd.spawn().map_err(|e| Error::Spawn(exe.to_string(), e))
}

/// Bind the loopback listener the interpreter will call back to.
pub fn bind_listener() -> Result<TcpListener, Error> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(Error::Bind)?;
    let addr = listener.local_addr().map_err(Error::Bind)?;
    info!(target: "transport", "listening for the spawned interpreter on {addr}");
    Ok(listener)
}

/// Accept the interpreter's inbound connection within `timeout`. A child
/// that exits first is a distinct failure from a timeout.
pub fn accept_interpreter(
    listener: &TcpListener,
    child: Option<&mut Child>,
    timeout: Duration,
) -> Result<TcpStream, Error> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;
    let mut child = child;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!(target: "transport", "spawned interpreter connected from {peer}");
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if let Some(child) = child.as_mut() {
                    if child.try_wait()?.is_some() {
                        return Err(Error::ExitedBeforeHandshake);
                    }
                }
                if Instant::now() >= deadline {
                    return Err(Error::AcceptTimeout(timeout));
                }
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write the greeting sequence as one burst of frames.
pub fn send_greeting(link: &mut dyn RideTransport) -> Result<(), Error> {
    for line in GREETING {
        link.send(line)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_interpreter_env() {
        let addr: SocketAddr = "127.0.0.1:4502".parse().unwrap();
        let env = interpreter_env(&addr, None);
        let get = |k: &str| {
            env.iter()
                .find(|(name, _)| name == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("RIDE_INIT"), Some("CONNECT:127.0.0.1:4502"));
        assert_eq!(get("SINGLETRACE"), Some("1"));
        assert_eq!(get("CLASSICMODE"), Some("1"));
        assert_eq!(get("RIDE_SPAWNED"), Some("1"));
        assert_eq!(get("CONFIGFILE"), None);

        let env = interpreter_env(&addr, Some("/etc/dyalog.config"));
        assert!(env.contains(&("CONFIGFILE".to_string(), "/etc/dyalog.config".to_string())));
    }

    #[test]
    fn test_accept_timeout() {
        let listener = bind_listener().unwrap();
        let err = accept_interpreter(&listener, None, Duration::from_millis(60));
        assert!(matches!(err, Err(Error::AcceptTimeout(_))));
    }
}
