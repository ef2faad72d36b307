//! Minimal SNTPv3 client.
//!
//! Sends one 48-byte client request over UDP and takes the server's transmit
//! timestamp as the current time. Good to the second, which is all the
//! record log can show.

use super::{TimeFuture, TimeSource, TimeSyncError};
use log::debug;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::net::{UdpSocket, lookup_host};

/// Default SNTP port.
pub const NTP_PORT: u16 = 123;

/// Seconds between the NTP era origin (1900-01-01) and the Unix epoch.
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const PACKET_LEN: usize = 48;

/// LI = 0, VN = 3, Mode = 3 (client).
const CLIENT_REQUEST_HEADER: u8 = 0x1B;

const MODE_SERVER: u8 = 4;

/// SNTP time source talking to a single server.
#[derive(Debug)]
pub struct SntpTimeSource {
    server: String,
    socket: Option<UdpSocket>,
}

impl SntpTimeSource {
    /// Create a time source for `server`, given as `host` or `host:port`.
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            socket: None,
        }
    }

    fn server_addr(&self) -> String {
        if self.server.contains(':') {
            self.server.clone()
        } else {
            format!("{}:{}", self.server, NTP_PORT)
        }
    }
}

/// Build a client request packet.
pub fn request_packet() -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = CLIENT_REQUEST_HEADER;
    packet
}

/// Extract the transmit timestamp of a server response as Unix seconds.
pub fn parse_response(packet: &[u8]) -> Result<i64, TimeSyncError> {
    if packet.len() < PACKET_LEN {
        return Err(TimeSyncError::InvalidResponse(format!(
            "response too short: {} bytes",
            packet.len()
        )));
    }

    let mode = packet[0] & 0x07;
    if mode != MODE_SERVER {
        return Err(TimeSyncError::InvalidResponse(format!(
            "unexpected mode {mode}"
        )));
    }

    let stratum = packet[1];
    if stratum == 0 {
        return Err(TimeSyncError::InvalidResponse(
            "kiss-o'-death from server".into(),
        ));
    }

    let seconds = u64::from(u32::from_be_bytes([
        packet[40], packet[41], packet[42], packet[43],
    ]));
    // Era 1 starts in 2036; a clear top bit means the counter has wrapped.
    let seconds = if seconds & 0x8000_0000 == 0 {
        seconds + (1 << 32)
    } else {
        seconds
    };
    Ok((seconds - NTP_UNIX_OFFSET) as i64)
}

impl TimeSource for SntpTimeSource {
    fn connect(&mut self) -> TimeFuture<'_, ()> {
        Box::pin(async move {
            let addr = self.server_addr();
            let target = lookup_host(&addr)
                .await
                .map_err(|e| TimeSyncError::Connect(format!("{addr}: {e}")))?
                .next()
                .ok_or_else(|| TimeSyncError::Connect(format!("{addr}: no address")))?;

            let local = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
            let socket = UdpSocket::bind(local)
                .await
                .map_err(|e| TimeSyncError::Connect(e.to_string()))?;
            socket
                .connect(target)
                .await
                .map_err(|e| TimeSyncError::Connect(format!("{addr}: {e}")))?;
            debug!("SNTP socket connected to {addr} ({target})");
            self.socket = Some(socket);
            Ok(())
        })
    }

    fn query_time(&mut self) -> TimeFuture<'_, PrimitiveDateTime> {
        Box::pin(async move {
            let socket = self
                .socket
                .as_ref()
                .ok_or_else(|| TimeSyncError::Query("not connected".into()))?;

            socket
                .send(&request_packet())
                .await
                .map_err(|e| TimeSyncError::Query(e.to_string()))?;

            let mut buf = [0u8; 128];
            let n = socket
                .recv(&mut buf)
                .await
                .map_err(|e| TimeSyncError::Query(e.to_string()))?;

            let unix = parse_response(&buf[..n])?;
            let now = OffsetDateTime::from_unix_timestamp(unix)
                .map_err(|e| TimeSyncError::InvalidResponse(e.to_string()))?;
            Ok(PrimitiveDateTime::new(now.date(), now.time()))
        })
    }

    fn disconnect(&mut self) {
        self.socket = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(seconds: u32) -> [u8; PACKET_LEN] {
        let mut packet = [0u8; PACKET_LEN];
        packet[0] = 0x1C; // LI 0, VN 3, mode 4
        packet[1] = 2;
        packet[40..44].copy_from_slice(&seconds.to_be_bytes());
        packet
    }

    #[test]
    fn test_request_packet() {
        let packet = request_packet();
        assert_eq!(packet[0], 0x1B);
        assert!(packet[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_parse_response() {
        // 2025-01-01 12:00:00 UTC
        let unix = 1_735_732_800u64;
        let packet = response((unix + NTP_UNIX_OFFSET) as u32);
        assert_eq!(parse_response(&packet).unwrap(), unix as i64);
    }

    #[test]
    fn test_parse_response_rejects_short() {
        assert!(matches!(
            parse_response(&[0x1C; 12]),
            Err(TimeSyncError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_response_rejects_client_mode() {
        let mut packet = response(3_900_000_000);
        packet[0] = 0x1B;
        assert!(parse_response(&packet).is_err());
    }

    #[test]
    fn test_parse_response_rejects_kiss_of_death() {
        let mut packet = response(3_900_000_000);
        packet[1] = 0;
        assert!(parse_response(&packet).is_err());
    }

    #[test]
    fn test_parse_response_after_era_rollover() {
        // 2040-01-01 00:00:00 UTC, past the 2036 wrap of the 32-bit counter
        let unix = 2_208_988_800u64;
        let wrapped = (unix + NTP_UNIX_OFFSET - (1 << 32)) as u32;
        assert_eq!(parse_response(&response(wrapped)).unwrap(), unix as i64);
    }

    #[test]
    fn test_server_addr_default_port() {
        assert_eq!(
            SntpTimeSource::new("time.google.com").server_addr(),
            "time.google.com:123"
        );
        assert_eq!(
            SntpTimeSource::new("127.0.0.1:1123").server_addr(),
            "127.0.0.1:1123"
        );
    }

    #[tokio::test]
    async fn test_query_against_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let unix = 1_735_732_800u64;
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            server
                .send_to(&response((unix + NTP_UNIX_OFFSET) as u32), peer)
                .await
                .unwrap();
        });

        let mut source = SntpTimeSource::new(addr.to_string());
        source.connect().await.unwrap();
        let now = source.query_time().await.unwrap();
        source.disconnect();

        assert_eq!(now, time::macros::datetime!(2025-01-01 12:00:00));
    }

    #[tokio::test]
    async fn test_query_without_connect_fails() {
        let mut source = SntpTimeSource::new("localhost");
        assert!(matches!(
            source.query_time().await,
            Err(TimeSyncError::Query(_))
        ));
    }
}
