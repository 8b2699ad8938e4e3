//! SMTP session handler

use super::auth::{login_challenge_password, login_challenge_username};
use super::{AuthOutcome, Credentials, SessionHandler, SmtpReply};
use smtp2signal_common::config::SmtpConfig;
use smtp2signal_common::types::Envelope;
use smtp2signal_common::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Longest command line, CRLF included (RFC 5321 4.5.3.1.4)
const MAX_COMMAND_LINE: usize = 512;

/// Longest AUTH command or response line (RFC 4954 4)
const MAX_AUTH_LINE: usize = 12288;

/// Longest line of message text, CRLF included (RFC 5321 4.5.3.1.6)
const MAX_TEXT_LINE: usize = 1000;

/// SMTP session state
#[derive(Debug, Clone, PartialEq)]
enum SessionState {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

/// Result of reading one line from the client
enum Line {
    Text(String),
    TooLong,
    Closed,
    TimedOut,
}

/// Result of a length-limited line read
enum Bounded {
    /// A complete line, or the unterminated tail of the stream
    Line,
    /// The limit was hit; the rest of the line has been discarded
    TooLong,
    Eof,
}

/// One SMTP session with a connected peer
pub struct SmtpSession {
    config: SmtpConfig,
    handler: Arc<dyn SessionHandler>,
    peer_addr: SocketAddr,
}

impl SmtpSession {
    /// Create a new session
    pub fn new(config: SmtpConfig, handler: Arc<dyn SessionHandler>, peer_addr: SocketAddr) -> Self {
        Self {
            config,
            handler,
            peer_addr,
        }
    }

    /// Handle an SMTP session on a TCP connection
    pub async fn handle(self, stream: TcpStream) -> Result<()> {
        let (reader, writer) = stream.into_split();
        self.run(BufReader::new(reader), BufWriter::new(writer))
            .await
    }

    async fn run<R, W>(self, mut reader: R, mut writer: BufWriter<W>) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut state = SessionState::Connected;
        let mut helo: Option<String> = None;
        let mut mail_from = String::new();
        let mut rcpt_to: Vec<String> = Vec::new();
        let mut authenticated = false;

        self.send_response(
            &mut writer,
            220,
            &format!("{} ESMTP smtp2signal", self.config.hostname),
        )
        .await?;

        loop {
            let line = match self.read_line(&mut reader, MAX_AUTH_LINE).await? {
                Line::Text(line) => line,
                Line::TooLong => {
                    self.send_response(&mut writer, 500, "5.5.0 Line too long")
                        .await?;
                    continue;
                }
                Line::Closed => {
                    debug!("Client {} disconnected", self.peer_addr);
                    break;
                }
                Line::TimedOut => {
                    self.send_response(&mut writer, 421, "4.4.2 Idle timeout, closing connection")
                        .await?;
                    break;
                }
            };

            debug!("SMTP from {}: {}", self.peer_addr, redact_auth(&line));

            let (command, args) = parse_command(&line);

            // Only AUTH may exceed the plain command line limit
            if line.len() + 2 > MAX_COMMAND_LINE && !command.eq_ignore_ascii_case("AUTH") {
                warn!("Command line from {} exceeds {} bytes", self.peer_addr, MAX_COMMAND_LINE);
                self.send_response(&mut writer, 500, "5.5.0 Line too long")
                    .await?;
                continue;
            }

            match command.to_uppercase().as_str() {
                "HELO" => {
                    helo = Some(args.to_string());
                    mail_from.clear();
                    rcpt_to.clear();
                    state = SessionState::Greeted;
                    self.send_response(&mut writer, 250, &format!("Hello {}", args))
                        .await?;
                }

                "EHLO" => {
                    helo = Some(args.to_string());
                    mail_from.clear();
                    rcpt_to.clear();
                    state = SessionState::Greeted;

                    let responses = [
                        format!("{} Hello {}", self.config.hostname, args),
                        format!("SIZE {}", self.config.max_message_size),
                        "8BITMIME".to_string(),
                        "PIPELINING".to_string(),
                        "ENHANCEDSTATUSCODES".to_string(),
                        "AUTH PLAIN LOGIN".to_string(),
                    ];

                    for (i, resp) in responses.iter().enumerate() {
                        if i == responses.len() - 1 {
                            self.send_response(&mut writer, 250, resp).await?;
                        } else {
                            self.send_response_continue(&mut writer, 250, resp).await?;
                        }
                    }
                }

                "AUTH" => {
                    if state != SessionState::Greeted {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    if authenticated {
                        self.send_response(&mut writer, 503, "5.5.1 Already authenticated")
                            .await?;
                        continue;
                    }

                    let (mechanism, initial_response) = match args.split_once(' ') {
                        Some((mechanism, initial)) => (mechanism, Some(initial.trim())),
                        None => (args, None),
                    };

                    let credentials = match self
                        .read_credentials(&mut reader, &mut writer, mechanism, initial_response)
                        .await?
                    {
                        Ok(credentials) => credentials,
                        Err(reply) => {
                            self.send_response(&mut writer, reply.code, &reply.message)
                                .await?;
                            continue;
                        }
                    };

                    let outcome = self
                        .handler
                        .authenticate(self.peer_addr, mechanism, &credentials);
                    authenticated = outcome == AuthOutcome::Authorized;

                    let reply = outcome.reply();
                    self.send_response(&mut writer, reply.code, &reply.message)
                        .await?;
                }

                "MAIL" => {
                    if state != SessionState::Greeted {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    if !authenticated {
                        self.send_response(&mut writer, 530, "5.7.0 Authentication required")
                            .await?;
                        continue;
                    }

                    if let Some(from_addr) = parse_mail_from(args) {
                        mail_from = from_addr;
                        state = SessionState::MailFrom;
                        self.send_response(&mut writer, 250, "2.1.0 OK").await?;
                    } else {
                        self.send_response(&mut writer, 501, "5.1.7 Bad sender address syntax")
                            .await?;
                    }
                }

                "RCPT" => {
                    if state != SessionState::MailFrom && state != SessionState::RcptTo {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    if rcpt_to.len() >= self.config.max_recipients {
                        self.send_response(&mut writer, 452, "4.5.3 Too many recipients")
                            .await?;
                        continue;
                    }

                    if let Some(to_addr) = parse_rcpt_to(args) {
                        rcpt_to.push(to_addr);
                        state = SessionState::RcptTo;
                        self.send_response(&mut writer, 250, "2.1.5 OK").await?;
                    } else {
                        self.send_response(&mut writer, 501, "5.1.3 Bad recipient address syntax")
                            .await?;
                    }
                }

                "DATA" => {
                    if state != SessionState::RcptTo {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    self.send_response(&mut writer, 354, "Start mail input; end with <CRLF>.<CRLF>")
                        .await?;

                    let reply = match self.read_data(&mut reader).await? {
                        Ok(data) => {
                            let envelope = Envelope {
                                peer: self.peer_addr,
                                helo: helo.clone(),
                                mail_from: std::mem::take(&mut mail_from),
                                rcpt_to: std::mem::take(&mut rcpt_to),
                                data,
                            };
                            info!(
                                "Message of {} bytes received from {} for {:?}",
                                envelope.data.len(),
                                self.peer_addr,
                                envelope.rcpt_to
                            );
                            self.handler.handle_data(envelope).await
                        }
                        Err(reply) => {
                            warn!("Message from {} rejected: {}", self.peer_addr, reply);
                            reply
                        }
                    };

                    self.send_response(&mut writer, reply.code, &reply.message)
                        .await?;

                    // Reset state for next message
                    state = SessionState::Greeted;
                    mail_from.clear();
                    rcpt_to.clear();
                }

                "RSET" => {
                    mail_from.clear();
                    rcpt_to.clear();
                    if state != SessionState::Connected {
                        state = SessionState::Greeted;
                    }
                    self.send_response(&mut writer, 250, "2.0.0 OK").await?;
                }

                "NOOP" => {
                    self.send_response(&mut writer, 250, "2.0.0 OK").await?;
                }

                "QUIT" => {
                    self.send_response(&mut writer, 221, "2.0.0 Bye").await?;
                    break;
                }

                "VRFY" => {
                    self.send_response(&mut writer, 252, "2.5.2 Cannot VRFY user")
                        .await?;
                }

                _ => {
                    self.send_response(&mut writer, 500, "5.5.2 Command not recognized")
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Run the challenge/response exchange of an AUTH command
    ///
    /// Returns the reply to send instead when the exchange fails.
    async fn read_credentials<R, W>(
        &self,
        reader: &mut R,
        writer: &mut BufWriter<W>,
        mechanism: &str,
        initial_response: Option<&str>,
    ) -> Result<std::result::Result<Credentials, SmtpReply>>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match mechanism.to_uppercase().as_str() {
            "PLAIN" => {
                let response = match initial_response {
                    Some(response) => response.to_string(),
                    None => match self.challenge(reader, writer, "").await? {
                        Ok(response) => response,
                        Err(reply) => return Ok(Err(reply)),
                    },
                };
                Ok(Credentials::from_plain(&response).map_err(|e| {
                    warn!("AUTH PLAIN from {}: {}", self.peer_addr, e);
                    invalid_encoding()
                }))
            }
            "LOGIN" => {
                let username = match initial_response {
                    Some(username) => username.to_string(),
                    None => match self
                        .challenge(reader, writer, &login_challenge_username())
                        .await?
                    {
                        Ok(username) => username,
                        Err(reply) => return Ok(Err(reply)),
                    },
                };
                let password = match self
                    .challenge(reader, writer, &login_challenge_password())
                    .await?
                {
                    Ok(password) => password,
                    Err(reply) => return Ok(Err(reply)),
                };
                Ok(Credentials::from_login(&username, &password).map_err(|e| {
                    warn!("AUTH LOGIN from {}: {}", self.peer_addr, e);
                    invalid_encoding()
                }))
            }
            // No exchange is possible; the authenticator rejects the mechanism
            _ => Ok(Ok(Credentials::default())),
        }
    }

    /// Send a 334 challenge and read the response
    ///
    /// A cancelled or over-long response yields the reply to send instead.
    async fn challenge<R, W>(
        &self,
        reader: &mut R,
        writer: &mut BufWriter<W>,
        prompt: &str,
    ) -> Result<std::result::Result<String, SmtpReply>>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.send_response(writer, 334, prompt).await?;
        match self.read_line(reader, MAX_AUTH_LINE).await? {
            Line::Text(line) if line.trim() == "*" => Ok(Err(cancelled())),
            Line::Text(line) => Ok(Ok(line)),
            Line::TooLong => Ok(Err(line_too_long())),
            Line::Closed | Line::TimedOut => Err(Error::Smtp(
                "Connection closed during AUTH".to_string(),
            )),
        }
    }

    /// Read one CRLF terminated line of at most `limit` bytes, honouring the
    /// idle timeout
    async fn read_line<R: AsyncBufRead + Unpin>(&self, reader: &mut R, limit: usize) -> Result<Line> {
        let mut buf = Vec::new();
        let read = tokio::time::timeout(
            self.config.connection_timeout(),
            read_bounded(reader, &mut buf, limit),
        )
        .await;

        match read {
            Err(_) => {
                debug!("Client {} timed out", self.peer_addr);
                Ok(Line::TimedOut)
            }
            Ok(Ok(Bounded::Eof)) => Ok(Line::Closed),
            Ok(Ok(Bounded::TooLong)) => {
                warn!("Line from {} exceeds {} bytes", self.peer_addr, limit);
                Ok(Line::TooLong)
            }
            Ok(Ok(Bounded::Line)) => Ok(Line::Text(
                String::from_utf8_lossy(&buf).trim().to_string(),
            )),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Read message data until <CRLF>.<CRLF>
    ///
    /// An oversized message or an over-long text line yields the reply to
    /// send instead; the data is still consumed so the session stays in sync.
    async fn read_data<R: AsyncBufRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<std::result::Result<Vec<u8>, SmtpReply>> {
        let mut data = Vec::new();
        let mut line = Vec::new();
        let max_size = self.config.max_message_size;
        let mut rejection: Option<SmtpReply> = None;

        loop {
            let read = tokio::time::timeout(
                self.config.connection_timeout(),
                read_bounded(reader, &mut line, MAX_TEXT_LINE),
            )
            .await
            .map_err(|_| Error::Smtp("Timed out during DATA".to_string()))??;

            match read {
                Bounded::Eof => {
                    return Err(Error::Smtp("Connection closed during DATA".to_string()))
                }
                Bounded::TooLong => {
                    if rejection.is_none() {
                        rejection = Some(line_too_long());
                    }
                    data = Vec::new();
                    continue;
                }
                Bounded::Line => {}
            }

            // Check for end of data
            if line == b".\r\n" || line == b".\n" {
                break;
            }

            if rejection.is_some() {
                continue;
            }

            // Dot-stuffing: drop the leading dot of any line that has one
            let line_bytes = line.strip_prefix(b".").unwrap_or(&line[..]);
            data.extend_from_slice(line_bytes);

            if data.len() > max_size {
                rejection = Some(SmtpReply::new(552, "5.3.4 Message size exceeds fixed limit"));
                data = Vec::new();
            }
        }

        Ok(match rejection {
            Some(reply) => Err(reply),
            None => Ok(data),
        })
    }

    /// Send an SMTP response
    async fn send_response<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{} {}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!("SMTP to {}: {}", self.peer_addr, response.trim());
        Ok(())
    }

    /// Send a multi-line response (intermediate line)
    async fn send_response_continue<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{}-{}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!("SMTP to {}: {}", self.peer_addr, response.trim());
        Ok(())
    }
}

fn cancelled() -> SmtpReply {
    SmtpReply::new(501, "5.7.0 Authentication cancelled")
}

fn line_too_long() -> SmtpReply {
    SmtpReply::new(500, "5.5.0 Line too long")
}

fn invalid_encoding() -> SmtpReply {
    SmtpReply::new(501, "5.5.2 Invalid credentials encoding")
}

/// Read one line of at most `limit` bytes into `buf`
///
/// Past the limit the remainder of the line is drained without buffering.
async fn read_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<Bounded> {
    buf.clear();
    let read = (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', buf)
        .await?;

    if read == 0 {
        return Ok(Bounded::Eof);
    }
    if buf.last() == Some(&b'\n') || read < limit {
        return Ok(Bounded::Line);
    }

    buf.clear();
    skip_line(reader).await?;
    Ok(Bounded::TooLong)
}

/// Discard input up to and including the next newline
async fn skip_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(used);
        if done {
            return Ok(());
        }
    }
}

/// Keep AUTH initial responses out of the logs
fn redact_auth(line: &str) -> &str {
    let (command, args) = parse_command(line);
    if command.eq_ignore_ascii_case("AUTH") && args.contains(' ') {
        "AUTH ***"
    } else {
        line
    }
}

/// Parse an SMTP command line into command and arguments
fn parse_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((command, args)) => (command, args.trim()),
        None => (line, ""),
    }
}

/// Extract the address of a `FROM:`/`TO:` argument, dropping any parameters
fn parse_path<'a>(args: &'a str, prefix: &str) -> Option<&'a str> {
    let args = args.trim();
    match args.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => {}
        _ => return None,
    }

    let addr_part = args[prefix.len()..].trim();

    // Extract address from angle brackets
    if addr_part.starts_with('<') {
        let end = addr_part.find('>')?;
        Some(&addr_part[1..end])
    } else {
        addr_part.split_whitespace().next()
    }
}

/// Parse MAIL FROM:<address>; the null sender yields an empty string
fn parse_mail_from(args: &str) -> Option<String> {
    parse_path(args, "FROM:").map(str::to_string)
}

/// Parse RCPT TO:<address>
fn parse_rcpt_to(args: &str) -> Option<String> {
    parse_path(args, "TO:")
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
}
