//! PostgreSQL client for the feeder.
//!
//! Low-level TCP client speaking the frontend/backend protocol directly:
//! startup and password authentication (cleartext, MD5, SCRAM-SHA-256),
//! simple queries, and the three-phase `COPY ... FROM STDIN` bulk load.
//! One client owns one connection for the whole process lifetime; there is
//! no pooling and no reconnect.

mod conninfo;

pub use conninfo::ConnParams;

use bytes::{BufMut, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication;
use postgres_protocol::authentication::sasl::{self, ChannelBinding, ScramSha256};
use postgres_protocol::message::backend::{self, ErrorFields};
use postgres_protocol::message::frontend;
use snafu::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{
    AuthUnsupportedSnafu, BulkLoadSnafu, ClientError, ConnectSnafu, EncodeSnafu, IoSnafu,
    PasswordRequiredSnafu, ProtocolSnafu, SaslSnafu, StartupSnafu, StatementSnafu,
};

/// PostgreSQL connection owned by the feeder.
#[derive(Debug)]
pub struct PgClient {
    stream: BufReader<TcpStream>,
    /// Log a status line for every completed statement and bulk load.
    pub verbose: bool,
}

impl PgClient {
    /// Establish the connection described by a libpq-style descriptor.
    ///
    /// One blocking attempt: descriptor parsing, TCP connect, startup and
    /// authentication, then waiting for `ReadyForQuery`. Any failure is
    /// final; the supervisor owns retries.
    pub async fn connect(descriptor: &str) -> Result<Self, ClientError> {
        let params = ConnParams::parse(descriptor)?;
        debug!(
            host = %params.host,
            port = params.port,
            user = %params.user,
            database = %params.database,
            "Connecting"
        );

        let stream = TcpStream::connect((params.host.as_str(), params.port))
            .await
            .context(ConnectSnafu)?;
        let mut client = Self {
            stream: BufReader::new(stream),
            verbose: false,
        };

        let startup = [
            ("user", params.user.as_str()),
            ("database", params.database.as_str()),
            ("application_name", "feeder"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(startup, &mut buf).context(EncodeSnafu)?;
        client.send(&buf).await?;

        client.authenticate(&params).await?;
        client.wait_ready().await?;
        debug!("Connection ready");
        Ok(client)
    }

    /// Run a single non-bulk statement.
    ///
    /// Succeeds only if the server reports command completion or returns
    /// rows; anything else is a [`ClientError::Statement`] carrying the
    /// server message.
    pub async fn execute(&mut self, sql: &str) -> Result<(), ClientError> {
        self.send_query(sql).await?;

        let mut tag = None;
        let mut returned_rows = false;
        let mut error = None;
        loop {
            match self.read_message().await? {
                backend::Message::CommandComplete(body) => {
                    tag = Some(command_tag(&body)?);
                }
                backend::Message::RowDescription(_) | backend::Message::DataRow(_) => {
                    returned_rows = true;
                }
                backend::Message::EmptyQueryResponse => {}
                backend::Message::ErrorResponse(body) => {
                    error = Some(server_message(body.fields())?);
                }
                backend::Message::ReadyForQuery(_) => break,
                _ => {
                    return ProtocolSnafu {
                        message: "unexpected message in statement response",
                    }
                    .fail()
                }
            }
        }

        if let Some(message) = error {
            return StatementSnafu { message }.fail();
        }
        ensure!(
            tag.is_some() || returned_rows,
            StatementSnafu {
                message: "server reported no command status",
            }
        );
        if self.verbose {
            info!(tag = tag.as_deref().unwrap_or("rows"), "Statement complete");
        }
        Ok(())
    }

    /// Bulk-load `payload` into `relation` with `COPY ... FROM STDIN`.
    ///
    /// Three phases: the server must acknowledge copy-in before any bytes
    /// are sent; the payload goes out as a single chunk followed by
    /// end-of-data; then the commit acknowledgement is awaited. On any
    /// server error the caller must leave the buffer untouched so a restart
    /// retries the same bytes. Returns the committed row count.
    pub async fn copy_in(&mut self, relation: &str, payload: &[u8]) -> Result<u64, ClientError> {
        let statement = format!(
            "COPY \"{}\" FROM STDIN WITH (FORMAT csv, DELIMITER ';', QUOTE '\"', ESCAPE '\\')",
            relation.replace('"', "\"\"")
        );
        self.send_query(&statement).await?;

        match self.read_message().await? {
            backend::Message::CopyInResponse(_) => {}
            backend::Message::ErrorResponse(body) => {
                let message = server_message(body.fields())?;
                self.drain_ready().await?;
                return BulkLoadSnafu { message }.fail();
            }
            _ => {
                return ProtocolSnafu {
                    message: "server did not enter copy-in mode",
                }
                .fail()
            }
        }

        let mut buf = BytesMut::new();
        frontend::CopyData::new(payload)
            .context(EncodeSnafu)?
            .write(&mut buf);
        frontend::copy_done(&mut buf);
        self.send(&buf).await?;

        let mut rows = None;
        let mut error = None;
        loop {
            match self.read_message().await? {
                backend::Message::CommandComplete(body) => {
                    let tag = command_tag(&body)?;
                    rows = Some(copied_rows(&tag));
                    if self.verbose {
                        info!(%tag, "Bulk load complete");
                    }
                }
                backend::Message::ErrorResponse(body) => {
                    error = Some(server_message(body.fields())?);
                }
                backend::Message::ReadyForQuery(_) => break,
                _ => {
                    return ProtocolSnafu {
                        message: "unexpected message in copy response",
                    }
                    .fail()
                }
            }
        }

        if let Some(message) = error {
            return BulkLoadSnafu { message }.fail();
        }
        rows.context(BulkLoadSnafu {
            message: "server ended the copy without confirming the commit",
        })
    }

    /// Close the session gracefully with a `Terminate` message.
    pub async fn close(mut self) -> Result<(), ClientError> {
        let mut buf = BytesMut::new();
        frontend::terminate(&mut buf);
        self.send(&buf).await
    }

    async fn send_query(&mut self, sql: &str) -> Result<(), ClientError> {
        let mut buf = BytesMut::new();
        frontend::query(sql, &mut buf).context(EncodeSnafu)?;
        self.send(&buf).await
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(bytes).await.context(IoSnafu)?;
        self.stream.flush().await.context(IoSnafu)
    }

    /// Run the authentication exchange until the server accepts the session.
    async fn authenticate(&mut self, params: &ConnParams) -> Result<(), ClientError> {
        loop {
            match self.read_message().await? {
                backend::Message::AuthenticationOk => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                backend::Message::AuthenticationCleartextPassword => {
                    let password = required_password(params)?;
                    let mut buf = BytesMut::new();
                    frontend::password_message(password.as_bytes(), &mut buf)
                        .context(EncodeSnafu)?;
                    self.send(&buf).await?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let password = required_password(params)?;
                    let hashed = authentication::md5_hash(
                        params.user.as_bytes(),
                        password.as_bytes(),
                        body.salt(),
                    );
                    let mut buf = BytesMut::new();
                    frontend::password_message(hashed.as_bytes(), &mut buf).context(EncodeSnafu)?;
                    self.send(&buf).await?;
                }
                backend::Message::AuthenticationSasl(body) => {
                    self.authenticate_sasl(body, params).await?;
                }
                backend::Message::ErrorResponse(body) => {
                    return StartupSnafu {
                        message: server_message(body.fields())?,
                    }
                    .fail()
                }
                _ => {
                    return ProtocolSnafu {
                        message: "unexpected message during authentication",
                    }
                    .fail()
                }
            }
        }
    }

    /// SCRAM-SHA-256 exchange (the only SASL mechanism the client speaks).
    async fn authenticate_sasl(
        &mut self,
        body: backend::AuthenticationSaslBody,
        params: &ConnParams,
    ) -> Result<(), ClientError> {
        let mut offered = Vec::new();
        let mut mechanisms = body.mechanisms();
        while let Some(mechanism) = mechanisms.next().context(IoSnafu)? {
            offered.push(mechanism.to_string());
        }
        ensure!(
            offered.iter().any(|m| m == sasl::SCRAM_SHA_256),
            AuthUnsupportedSnafu {
                mechanism: offered.join(", "),
            }
        );

        let password = required_password(params)?;
        let mut scram = ScramSha256::new(password.as_bytes(), ChannelBinding::unsupported());

        let mut buf = BytesMut::new();
        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut buf)
            .context(EncodeSnafu)?;
        self.send(&buf).await?;

        match self.read_message().await? {
            backend::Message::AuthenticationSaslContinue(body) => {
                scram.update(body.data()).context(SaslSnafu)?;
            }
            backend::Message::ErrorResponse(body) => {
                return StartupSnafu {
                    message: server_message(body.fields())?,
                }
                .fail()
            }
            _ => {
                return ProtocolSnafu {
                    message: "expected SASL continuation",
                }
                .fail()
            }
        }

        let mut buf = BytesMut::new();
        frontend::sasl_response(scram.message(), &mut buf).context(EncodeSnafu)?;
        self.send(&buf).await?;

        match self.read_message().await? {
            backend::Message::AuthenticationSaslFinal(body) => {
                scram.finish(body.data()).context(SaslSnafu)
            }
            backend::Message::ErrorResponse(body) => StartupSnafu {
                message: server_message(body.fields())?,
            }
            .fail(),
            _ => ProtocolSnafu {
                message: "expected SASL completion",
            }
            .fail(),
        }
    }

    /// Wait for `ReadyForQuery` after authentication.
    async fn wait_ready(&mut self) -> Result<(), ClientError> {
        loop {
            match self.read_message().await? {
                backend::Message::ReadyForQuery(_) => return Ok(()),
                backend::Message::ErrorResponse(body) => {
                    return StartupSnafu {
                        message: server_message(body.fields())?,
                    }
                    .fail()
                }
                _ => {
                    return ProtocolSnafu {
                        message: "unexpected message before ready",
                    }
                    .fail()
                }
            }
        }
    }

    /// Discard messages until the transaction boundary after a server error.
    async fn drain_ready(&mut self) -> Result<(), ClientError> {
        loop {
            if let backend::Message::ReadyForQuery(_) = self.read_message().await? {
                return Ok(());
            }
        }
    }

    /// Read the next backend message, skipping the asynchronous ones.
    async fn read_message(&mut self) -> Result<backend::Message, ClientError> {
        loop {
            let tag = self.stream.read_u8().await.context(IoSnafu)?;
            let len = self.stream.read_i32().await.context(IoSnafu)?;
            ensure!(
                len >= 4,
                ProtocolSnafu {
                    message: format!("invalid message length {len}"),
                }
            );
            let mut body = vec![0u8; len as usize - 4];
            self.stream.read_exact(&mut body).await.context(IoSnafu)?;

            let mut frame = BytesMut::with_capacity(1 + len as usize);
            frame.put_u8(tag);
            frame.put_i32(len);
            frame.put_slice(&body);

            let message = match backend::Message::parse(&mut frame) {
                Ok(Some(message)) => message,
                Ok(None) => {
                    return ProtocolSnafu {
                        message: "truncated server message",
                    }
                    .fail()
                }
                Err(source) => {
                    return ProtocolSnafu {
                        message: source.to_string(),
                    }
                    .fail()
                }
            };

            match message {
                backend::Message::NoticeResponse(body) => {
                    let notice = server_message(body.fields())?;
                    debug!(notice = %notice, "Server notice");
                }
                backend::Message::ParameterStatus(_) | backend::Message::BackendKeyData(_) => {}
                message => return Ok(message),
            }
        }
    }
}

fn required_password(params: &ConnParams) -> Result<&str, ClientError> {
    params.password.as_deref().context(PasswordRequiredSnafu)
}

fn command_tag(body: &backend::CommandCompleteBody) -> Result<String, ClientError> {
    body.tag()
        .map(str::to_string)
        .map_err(|source| ClientError::Protocol {
            message: source.to_string(),
        })
}

/// Row count from a `COPY <n>` command tag.
fn copied_rows(tag: &str) -> u64 {
    tag.rsplit(' ')
        .next()
        .and_then(|count| count.parse().ok())
        .unwrap_or(0)
}

/// Human-readable `severity: message` line from error or notice fields.
fn server_message(mut fields: ErrorFields<'_>) -> Result<String, ClientError> {
    let mut severity = None;
    let mut message = None;
    while let Some(field) = fields.next().context(IoSnafu)? {
        let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
        match field.type_() {
            b'S' => severity = Some(value),
            b'M' => message = Some(value),
            _ => {}
        }
    }
    Ok(match (severity, message) {
        (Some(severity), Some(message)) => format!("{severity}: {message}"),
        (None, Some(message)) => message,
        _ => "unknown server response".to_string(),
    })
}
