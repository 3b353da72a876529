//! Transport Client (spec §4.1, wire protocol in §6.2).
//!
//! Carries 32-bit register read/write operations to the hardware backdoor
//! server over a framed, optionally AES-encrypted TCP socket. Every frame on
//! the wire is an 8-hex-digit cleartext-byte-count header followed by that
//! many (post-encryption, if e2e is active) bytes.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::crypto;
use crate::error::{SumpError, SumpResult};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// An open connection to the backdoor register server.
pub struct TransportSession {
    stream: TcpStream,
    /// Whether frames after the handshake are AES-encrypted, per the
    /// "e2e" token observed in the server's greeting.
    e2e: bool,
    aes_key: Option<[u8; 32]>,
}

impl TransportSession {
    pub async fn connect(
        host: &str,
        port: u16,
        aes_key: Option<[u8; 32]>,
        authenticate: bool,
    ) -> SumpResult<Self> {
        let lookup = format!("{host}:{port}");
        let mut addrs = tokio::net::lookup_host(&lookup).await.map_err(|_| {
            SumpError::TransportUnavailable {
                host: host.to_string(),
                resolved: None,
                message: "host not found".to_string(),
            }
        })?;
        let resolved = addrs.next().ok_or_else(|| SumpError::TransportUnavailable {
            host: host.to_string(),
            resolved: None,
            message: "host not found".to_string(),
        })?;
        let ip: IpAddr = resolved.ip();

        let stream = TcpStream::connect(resolved)
            .await
            .map_err(|e| SumpError::TransportUnavailable {
                host: host.to_string(),
                resolved: Some(ip),
                message: e.to_string(),
            })?;

        let mut session = Self {
            stream,
            e2e: false,
            aes_key,
        };

        if !ip.is_loopback() && authenticate {
            session.authenticate().await?;
        }

        Ok(session)
    }

    async fn authenticate(&mut self) -> SumpResult<()> {
        let key = self.aes_key.ok_or_else(|| SumpError::TransportAuth {
            message: "authentication requested but no AES key configured".to_string(),
        })?;

        self.send_frame(b"opensesame", true).await?;

        let challenge = self.recv_frame(true).await?;
        let challenge = String::from_utf8_lossy(&challenge);
        let n: u32 = challenge
            .trim()
            .strip_prefix("challenge ")
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| SumpError::TransportAuth {
                message: format!("unexpected challenge frame: {challenge:?}"),
            })?;

        let response = format!("response {:08x}", n);
        self.send_frame(response.as_bytes(), true).await?;

        let ack = self.recv_frame(true).await?;
        let ack = String::from_utf8_lossy(&ack).to_string();
        if !ack.starts_with("Greetings") {
            return Err(SumpError::TransportAuth {
                message: format!("authentication rejected: {ack:?}"),
            });
        }
        self.e2e = ack.contains("e2e");
        let _ = key; // key is used inside send_frame/recv_frame via self.aes_key
        Ok(())
    }

    async fn send_frame(&mut self, payload: &[u8], force_encrypt: bool) -> SumpResult<()> {
        let encrypt = force_encrypt || self.e2e;
        let bytes = if encrypt {
            let key = self.aes_key.ok_or_else(|| SumpError::TransportAuth {
                message: "e2e active but no AES key configured".to_string(),
            })?;
            crypto::encrypt(&key, payload)
        } else {
            payload.to_vec()
        };

        let header = format!("{:08x}", bytes.len());
        let write = async {
            self.stream.write_all(header.as_bytes()).await?;
            self.stream.write_all(&bytes).await?;
            self.stream.flush().await
        };
        tokio::time::timeout(RESPONSE_TIMEOUT, write)
            .await
            .map_err(|_| SumpError::TransportTimeout {
                operation: "send_frame".to_string(),
            })?
            .map_err(|e| SumpError::TransportUnavailable {
                host: String::new(),
                resolved: None,
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn recv_frame(&mut self, force_decrypt: bool) -> SumpResult<Vec<u8>> {
        let decrypt = force_decrypt || self.e2e;

        let read = async {
            let mut header = [0u8; 8];
            self.stream.read_exact(&mut header).await?;
            let len = usize::from_str_radix(std::str::from_utf8(&header).unwrap_or(""), 16)
                .unwrap_or(0);
            let mut body = vec![0u8; len];
            self.stream.read_exact(&mut body).await?;
            Ok::<_, std::io::Error>(body)
        };
        let body = tokio::time::timeout(RESPONSE_TIMEOUT, read)
            .await
            .map_err(|_| SumpError::TransportTimeout {
                operation: "recv_frame".to_string(),
            })?
            .map_err(|e| SumpError::TransportUnavailable {
                host: String::new(),
                resolved: None,
                message: e.to_string(),
            })?;

        if decrypt {
            let key = self.aes_key.ok_or_else(|| SumpError::TransportAuth {
                message: "e2e active but no AES key configured".to_string(),
            })?;
            crypto::decrypt(&key, &body).ok_or_else(|| SumpError::TransportAuth {
                message: "failed to decrypt frame".to_string(),
            })
        } else {
            Ok(body)
        }
    }

    /// Read `n` consecutive (or, if `repeat`, same-address) 32-bit words
    /// starting at `addr`.
    pub async fn read(&mut self, addr: u32, n: usize, repeat: bool) -> SumpResult<Vec<u32>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let letter = if repeat { 'k' } else { 'r' };
        let request = if n == 1 {
            format!("{letter} {addr:08x}\n")
        } else {
            format!("{letter} {addr:08x} {:08x}\n", n - 1)
        };
        self.send_frame(request.as_bytes(), false).await?;
        let response = self.recv_frame(false).await?;
        parse_hex_words(&response)
    }

    /// Write `data` starting at `addr`. `repeat` selects the same-address
    /// burst form ('W') over the auto-incrementing form ('w').
    pub async fn write(&mut self, addr: u32, data: &[u32], repeat: bool) -> SumpResult<()> {
        let letter = if repeat { 'W' } else { 'w' };
        let mut request = format!("{letter} {addr:08x}");
        for d in data {
            request.push_str(&format!(" {d:08x}"));
        }
        request.push('\n');
        self.send_frame(request.as_bytes(), false).await
    }

    /// Close the session. No response is expected.
    pub async fn quit(mut self) -> SumpResult<()> {
        self.send_frame(b"q\n", false).await?;
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

fn parse_hex_words(response: &[u8]) -> SumpResult<Vec<u32>> {
    let text = String::from_utf8_lossy(response);
    text.split_whitespace()
        .map(|tok| {
            u32::from_str_radix(tok, 16).map_err(|e| SumpError::ConfigParse {
                context: "transport response".to_string(),
                message: format!("bad hex word {tok:?}: {e}"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    #[test]
    fn read_request_matches_scenario_s4() {
        // S4: read of address 0x98 requesting 3 DWORDs -> "r 00000098 00000002\n"
        let addr = 0x0000_0098u32;
        let n = 3usize;
        let request = format!("r {addr:08x} {:08x}\n", n - 1);
        assert_eq!(request, "r 00000098 00000002\n");
    }

    #[test]
    fn single_dword_read_omits_length_field() {
        let addr = 0x10u32;
        let request = format!("r {addr:08x}\n");
        assert_eq!(request, "r 00000010\n");
    }

    #[test]
    fn parses_space_separated_hex_reply() {
        let words = parse_hex_words(b"00000001 00000002 00000003\n").unwrap();
        assert_eq!(words, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn connect_and_single_read_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 8];
            sock.read_exact(&mut header).await.unwrap();
            let len = usize::from_str_radix(std::str::from_utf8(&header).unwrap(), 16).unwrap();
            let mut body = vec![0u8; len];
            sock.read_exact(&mut body).await.unwrap();
            assert_eq!(&body, b"r 00000098 00000002\n");

            let reply = b"00000001 00000002 00000003\n";
            sock.write_all(format!("{:08x}", reply.len()).as_bytes())
                .await
                .unwrap();
            sock.write_all(reply).await.unwrap();
        });

        let mut session = TransportSession::connect("127.0.0.1", addr.port(), None, false)
            .await
            .unwrap();
        let words = session.read(0x98, 3, false).await.unwrap();
        assert_eq!(words, vec![1, 2, 3]);
        server.await.unwrap();
    }

    async fn read_encrypted_frame(sock: &mut TcpStream, key: &[u8; 32]) -> Vec<u8> {
        let mut header = [0u8; 8];
        sock.read_exact(&mut header).await.unwrap();
        let len = usize::from_str_radix(std::str::from_utf8(&header).unwrap(), 16).unwrap();
        let mut body = vec![0u8; len];
        sock.read_exact(&mut body).await.unwrap();
        crypto::decrypt(key, &body).unwrap()
    }

    async fn write_encrypted_frame(sock: &mut TcpStream, key: &[u8; 32], plaintext: &[u8]) {
        let ct = crypto::encrypt(key, plaintext);
        sock.write_all(format!("{:08x}", ct.len()).as_bytes()).await.unwrap();
        sock.write_all(&ct).await.unwrap();
    }

    /// S5: a non-loopback peer with authentication enabled completes the
    /// encrypted challenge/response handshake and, when the server's
    /// greeting advertises "e2e", every later frame is encrypted too.
    #[tokio::test]
    async fn s5_authenticate_completes_challenge_response_handshake() {
        let key = [0x7au8; 32];
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();

            let hello = read_encrypted_frame(&mut sock, &key).await;
            assert_eq!(hello, b"opensesame");

            write_encrypted_frame(&mut sock, &key, b"challenge 7").await;

            let response = read_encrypted_frame(&mut sock, &key).await;
            assert_eq!(response, format!("response {:08x}", 7).into_bytes());

            write_encrypted_frame(&mut sock, &key, b"Greetings, e2e active").await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut session = TransportSession {
            stream,
            e2e: false,
            aes_key: Some(key),
        };
        session.authenticate().await.unwrap();
        assert!(session.e2e);

        server.await.unwrap();
    }
}
