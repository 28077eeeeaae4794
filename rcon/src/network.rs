//! Remote-administration client speaking the out-of-band UDP protocol

use log::{debug, warn};
use shared::{encode_command, parse_cvar_response, parse_status, Player, STATUS_COMMAND};
use std::io::{Error, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

/// Idle window per read attempt. Reading stops once no datagram arrives within it.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

const RECV_BUFFER: usize = 16 * 1024;

/// Stateless client: every call binds its own socket, so concurrent callers
/// never share connection state.
#[derive(Debug, Clone)]
pub struct RconClient {
    server_addr: String,
    password: String,
    idle_timeout: Duration,
}

impl RconClient {
    pub fn new(host: &str, port: u16, password: &str) -> Self {
        let server_addr = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };

        Self {
            server_addr,
            password: password.to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Sends one datagram and collects every response datagram until the
    /// idle window elapses. Any transport failure yields what was read so
    /// far, usually an empty string.
    pub async fn call(&self, payload: &[u8]) -> String {
        match self.exchange(payload).await {
            Ok(response) => response,
            Err(e) => {
                warn!("rcon call to {} failed: {}", self.server_addr, e);
                String::new()
            }
        }
    }

    async fn exchange(&self, payload: &[u8]) -> std::io::Result<String> {
        let target = lookup_host(self.server_addr.as_str())
            .await?
            .next()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "host did not resolve"))?;

        // Local socket must match the target's address family
        let local = match target {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        socket.send(payload).await?;

        let mut chunks = Vec::new();
        let mut buffer = vec![0u8; RECV_BUFFER];

        loop {
            match timeout(self.idle_timeout, socket.recv(&mut buffer)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(len)) => {
                    debug!("Received {} bytes from {}", len, self.server_addr);
                    chunks.push(String::from_utf8_lossy(&buffer[..len]).into_owned());
                }
                Ok(Err(e)) => {
                    if chunks.is_empty() {
                        return Err(e);
                    }
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(chunks.concat())
    }

    /// Authenticated command: `rcon <password> <command>`
    pub async fn rcon(&self, command: &str) -> String {
        self.call(&encode_command(Some(&self.password), command))
            .await
    }

    /// Bare console command without authentication
    pub async fn console(&self, command: &str) -> String {
        self.call(&encode_command(None, command)).await
    }

    pub async fn say(&self, message: &str) -> String {
        self.rcon(&format!("svsay {}", message)).await
    }

    pub async fn tell(&self, player_id: &str, message: &str) -> String {
        self.rcon(&format!("svtell {} {}", player_id, message))
            .await
    }

    /// Reads a cvar. Returns None when the server did not answer or the
    /// response has neither known shape.
    pub async fn get_cvar(&self, key: &str) -> Option<String> {
        let response = self.rcon(key).await;
        let value = parse_cvar_response(&response);
        if value.is_none() {
            warn!("Unknown or invalid cvar response for {}", key);
        }
        value
    }

    pub async fn set_cvar(&self, key: &str, value: &str) -> String {
        self.rcon(&format!("set {} {}", key, value)).await
    }

    pub async fn players(&self) -> Vec<Player> {
        parse_status(&self.rcon(STATUS_COMMAND).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket as StdUdpSocket;
    use std::thread;

    /// Replies to the first datagram with each chunk as its own datagram
    fn spawn_fake_server(chunks: Vec<&'static str>) -> (u16, thread::JoinHandle<Vec<u8>>) {
        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 2048];
            let (len, addr) = socket.recv_from(&mut buf).unwrap();
            for chunk in chunks {
                socket.send_to(chunk.as_bytes(), addr).unwrap();
            }
            buf[..len].to_vec()
        });

        (port, handle)
    }

    #[tokio::test]
    async fn test_rcon_payload_and_concatenation() {
        let (port, handle) = spawn_fake_server(vec!["print\nfirst ", "second"]);
        let client = RconClient::new("127.0.0.1", port, "secret")
            .with_idle_timeout(Duration::from_millis(200));

        let response = client.rcon("status").await;
        assert_eq!(response, "print\nfirst second");

        let received = handle.join().unwrap();
        assert_eq!(&received[..4], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&received[4..], b"rcon secret status");
    }

    #[tokio::test]
    async fn test_ipv6_server_is_reachable() {
        // Hosts without an IPv6 loopback have nothing to test
        let Ok(socket) = StdUdpSocket::bind("[::1]:0") else {
            return;
        };
        let port = socket.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 256];
            let (_, addr) = socket.recv_from(&mut buf).unwrap();
            socket.send_to(b"print\npong", addr).unwrap();
        });

        let client = RconClient::new("::1", port, "pw")
            .with_idle_timeout(Duration::from_millis(200));
        assert_eq!(client.server_addr(), format!("[::1]:{}", port));

        assert_eq!(client.rcon("status").await, "print\npong");
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_console_payload_is_bare() {
        let (port, handle) = spawn_fake_server(vec!["ok"]);
        let client = RconClient::new("127.0.0.1", port, "secret")
            .with_idle_timeout(Duration::from_millis(200));

        assert_eq!(client.console("getinfo").await, "ok");
        let received = handle.join().unwrap();
        assert_eq!(&received[4..], b"getinfo");
    }

    #[test]
    fn test_silent_server_yields_empty_response() {
        let silent = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();
        let client = RconClient::new("127.0.0.1", port, "secret")
            .with_idle_timeout(Duration::from_millis(100));

        assert_eq!(tokio_test::block_on(client.rcon("status")), "");
        assert!(tokio_test::block_on(client.players()).is_empty());
        drop(silent);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 256];
            let (_, addr) = socket.recv_from(&mut buf).unwrap();
            socket.send_to(&[0xFF, 0xFF, b'o', b'k'], addr).unwrap();
        });

        let client = RconClient::new("127.0.0.1", port, "pw")
            .with_idle_timeout(Duration::from_millis(200));
        let response = client.rcon("x").await;
        handle.join().unwrap();

        assert!(response.ends_with("ok"));
        assert!(response.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn test_get_cvar_strips_colors() {
        let (port, _handle) =
            spawn_fake_server(vec!["print\n\"mapname\" is:\"mb2_cmp_arena^7\" default:\"nomap^7\""]);
        let client = RconClient::new("127.0.0.1", port, "pw")
            .with_idle_timeout(Duration::from_millis(200));

        assert_eq!(
            client.get_cvar("mapname").await.as_deref(),
            Some("mb2_cmp_arena")
        );
    }
}
