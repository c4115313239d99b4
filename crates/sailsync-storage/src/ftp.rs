//! Passive-mode FTP sessions to the supplier feed.
//!
//! Only the handful of commands the sync needs: login, binary mode, NLST,
//! RETR, NOOP and QUIT. Each transfer opens its own PASV data connection.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::session::{Connector, FileSession, SessionError};

#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct FtpConnector {
    config: FtpConfig,
}

impl FtpConnector {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for FtpConnector {
    async fn connect(&self) -> Result<Box<dyn FileSession>, SessionError> {
        let cfg = &self.config;
        let stream = timeout(
            cfg.connect_timeout,
            TcpStream::connect((cfg.host.as_str(), cfg.port)),
        )
        .await
        .map_err(|_| SessionError::Timeout(cfg.connect_timeout))?
        .map_err(|err| SessionError::Connect(format!("{}:{}: {err}", cfg.host, cfg.port)))?;

        let mut session = FtpSession {
            control: BufReader::new(stream),
            host: cfg.host.clone(),
            io_timeout: cfg.io_timeout,
            closed: false,
        };
        session.login(&cfg.user, &cfg.password).await?;
        debug!(host = %cfg.host, "ftp session established");
        Ok(Box::new(session))
    }

    fn describe(&self) -> String {
        format!("ftp://{}@{}:{}", self.config.user, self.config.host, self.config.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn is(&self, codes: &[u16]) -> bool {
        codes.contains(&self.code)
    }
}

struct FtpSession {
    control: BufReader<TcpStream>,
    host: String,
    io_timeout: Duration,
    closed: bool,
}

impl FtpSession {
    async fn login(&mut self, user: &str, password: &str) -> Result<(), SessionError> {
        let greeting = self.read_reply().await?;
        if !greeting.is(&[220]) {
            return Err(SessionError::Connect(format!(
                "unexpected greeting {} {}",
                greeting.code, greeting.text
            )));
        }

        let reply = self.command(&format!("USER {user}")).await?;
        let reply = if reply.is(&[331, 332]) {
            self.command(&format!("PASS {password}")).await?
        } else {
            reply
        };
        if !reply.is(&[230, 202]) {
            return Err(SessionError::Connect(format!(
                "login rejected: {} {}",
                reply.code, reply.text
            )));
        }

        let reply = self.command("TYPE I").await?;
        expect(&reply, &[200])?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, SessionError> {
        let mut line = String::new();
        let read = timeout(self.io_timeout, self.control.read_line(&mut line))
            .await
            .map_err(|_| SessionError::Timeout(self.io_timeout))??;
        if read == 0 {
            self.closed = true;
            return Err(SessionError::Disconnected(
                "control connection closed".to_string(),
            ));
        }
        Ok(line)
    }

    async fn read_reply(&mut self) -> Result<Reply, SessionError> {
        let first = self.read_line().await?;
        let code = reply_code(&first)?;
        let multiline = first.as_bytes().get(3) == Some(&b'-');
        let mut text = first.get(4..).unwrap_or_default().trim_end().to_string();

        if multiline {
            let terminator = format!("{code} ");
            loop {
                let line = self.read_line().await?;
                if line.starts_with(&terminator) {
                    text.push('\n');
                    text.push_str(line.get(4..).unwrap_or_default().trim_end());
                    break;
                }
            }
        }

        if code == 421 {
            self.closed = true;
            return Err(SessionError::Disconnected(text));
        }
        Ok(Reply { code, text })
    }

    async fn command(&mut self, command: &str) -> Result<Reply, SessionError> {
        if self.closed {
            return Err(SessionError::Disconnected("session closed".to_string()));
        }
        let line = format!("{command}\r\n");
        let write = async {
            self.control.get_mut().write_all(line.as_bytes()).await?;
            self.control.get_mut().flush().await
        };
        timeout(self.io_timeout, write)
            .await
            .map_err(|_| SessionError::Timeout(self.io_timeout))??;
        self.read_reply().await
    }

    async fn open_data(&mut self) -> Result<TcpStream, SessionError> {
        let reply = self.command("PASV").await?;
        expect(&reply, &[227])?;
        let (addr, port) = parse_pasv(&reply.text)?;
        // Servers behind NAT often advertise an unroutable address.
        let host = if addr.is_unspecified() || addr.is_private() {
            self.host.clone()
        } else {
            addr.to_string()
        };
        timeout(self.io_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| SessionError::Timeout(self.io_timeout))?
            .map_err(|err| SessionError::Disconnected(format!("data connection: {err}")))
    }

    /// Runs one transfer command and returns everything sent on the data channel.
    async fn transfer(&mut self, command: &str, target: &str) -> Result<Vec<u8>, SessionError> {
        let mut data = self.open_data().await?;
        let reply = self.command(&format!("{command} {target}")).await?;
        if reply.is(&[450, 550]) {
            return Err(SessionError::NotFound(target.to_string()));
        }
        expect(&reply, &[125, 150])?;

        let mut body = Vec::new();
        timeout(self.io_timeout, data.read_to_end(&mut body))
            .await
            .map_err(|_| SessionError::Timeout(self.io_timeout))??;
        drop(data);

        let done = self.read_reply().await?;
        expect(&done, &[226, 250])?;
        Ok(body)
    }
}

#[async_trait]
impl FileSession for FtpSession {
    async fn list(&mut self, dir: &str) -> Result<Vec<String>, SessionError> {
        let body = self.transfer("NLST", dir).await?;
        let text = String::from_utf8_lossy(&body);
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, SessionError> {
        self.transfer("RETR", path).await
    }

    async fn probe(&mut self) -> Result<(), SessionError> {
        let reply = self.command("NOOP").await?;
        expect(&reply, &[200])
    }

    async fn close(&mut self) {
        if !self.closed {
            let _ = self.command("QUIT").await;
            self.closed = true;
        }
    }
}

fn expect(reply: &Reply, codes: &[u16]) -> Result<(), SessionError> {
    if reply.is(codes) {
        Ok(())
    } else {
        Err(SessionError::Protocol(format!(
            "expected {codes:?}, got {} {}",
            reply.code, reply.text
        )))
    }
}

fn reply_code(line: &str) -> Result<u16, SessionError> {
    line.get(..3)
        .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| SessionError::Protocol(format!("malformed reply line: {}", line.trim_end())))
}

/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
fn parse_pasv(text: &str) -> Result<(Ipv4Addr, u16), SessionError> {
    let malformed = || SessionError::Protocol(format!("malformed PASV reply: {text}"));
    let start = text.find('(').ok_or_else(malformed)?;
    let end = text[start..].find(')').ok_or_else(malformed)? + start;
    let numbers: Vec<u8> = text[start + 1..end]
        .split(',')
        .map(|part| part.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| malformed())?;
    let [a, b, c, d, p1, p2] = numbers.as_slice() else {
        return Err(malformed());
    };
    Ok((
        Ipv4Addr::new(*a, *b, *c, *d),
        u16::from(*p1) * 256 + u16::from(*p2),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn pasv_reply_is_parsed() {
        let (addr, port) = parse_pasv("Entering Passive Mode (10,1,2,3,19,137).").unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(port, 19 * 256 + 137);
        assert!(parse_pasv("Entering Passive Mode").is_err());
        assert!(parse_pasv("(1,2,3)").is_err());
    }

    #[test]
    fn reply_codes_must_be_numeric() {
        assert_eq!(reply_code("230 Logged in\r\n").unwrap(), 230);
        assert!(reply_code("OK\r\n").is_err());
    }

    async fn serve_one(listener: TcpListener, data: TcpListener, file: &'static [u8]) {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut lines = tokio::io::BufReader::new(read).lines();
        write.write_all(b"220-Welcome\r\n220 Ready\r\n").await.unwrap();
        let data_port = data.local_addr().unwrap().port();
        while let Some(line) = lines.next_line().await.unwrap() {
            let reply = match line.split_whitespace().next().unwrap_or_default() {
                "USER" => "331 Password required\r\n".to_string(),
                "PASS" => "230 Logged in\r\n".to_string(),
                "TYPE" => "200 Binary\r\n".to_string(),
                "NOOP" => "200 OK\r\n".to_string(),
                "PASV" => format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})\r\n",
                    data_port / 256,
                    data_port % 256
                ),
                "RETR" if line.ends_with("missing.json") => {
                    "550 No such file\r\n".to_string()
                }
                "RETR" => {
                    write.write_all(b"150 Opening\r\n").await.unwrap();
                    let (mut conn, _) = data.accept().await.unwrap();
                    conn.write_all(file).await.unwrap();
                    drop(conn);
                    "226 Transfer complete\r\n".to_string()
                }
                "QUIT" => {
                    write.write_all(b"221 Bye\r\n").await.unwrap();
                    break;
                }
                _ => "502 Not implemented\r\n".to_string(),
            };
            write.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn session_logs_in_and_retrieves() {
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = control.local_addr().unwrap().port();
        let server = tokio::spawn(serve_one(control, data, b"{\"cruise\":1}"));

        let connector = FtpConnector::new(FtpConfig {
            host: "127.0.0.1".to_string(),
            port,
            user: "feed".to_string(),
            password: "secret".to_string(),
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(2),
        });
        let mut session = connector.connect().await.unwrap();
        session.probe().await.unwrap();
        assert_eq!(
            session.retrieve("2025/05/7/231/1.json").await.unwrap(),
            b"{\"cruise\":1}"
        );
        assert!(matches!(
            session.retrieve("2025/05/7/231/missing.json").await,
            Err(SessionError::NotFound(_))
        ));
        session.close().await;
        server.await.unwrap();
    }
}
