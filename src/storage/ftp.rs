//! FTP provider over a small passive-mode client.
//!
//! Each operation opens its own control connection; concurrency is bounded by
//! the pool wrapped around the provider. Parts are appended to `<key>.partial`
//! and renamed into place on completion.

use super::{
    not_found, secret_from_env, ObjectInfo, ProviderConfig, ProviderKind, ProviderSettings,
    StorageProvider, UploadHandle,
};
use crate::backup::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    fn is_positive(&self) -> bool {
        (100..400).contains(&self.code)
    }
}

/// Parses the `(h1,h2,h3,h4,p1,p2)` tuple of a 227 reply into a port.
pub fn parse_pasv_port(text: &str) -> Option<u16> {
    let start = text.find('(')?;
    let end = text[start..].find(')')? + start;
    let numbers: Vec<u16> = text[start + 1..end]
        .split(',')
        .map(|n| n.trim().parse::<u16>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    if numbers.len() != 6 || numbers[4] > 255 || numbers[5] > 255 {
        return None;
    }
    Some(numbers[4] * 256 + numbers[5])
}

struct FtpSession {
    provider: String,
    host: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FtpSession {
    fn io_error(&self, e: std::io::Error) -> BackupError {
        BackupError::unavailable(&self.provider, format!("ftp connection error: {e}"))
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| self.io_error(e))?;
        if read == 0 {
            return Err(BackupError::unavailable(
                &self.provider,
                "ftp server closed the connection",
            ));
        }
        let code: u16 = line
            .get(..3)
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| BackupError::storage(format!("malformed ftp reply: {}", line.trim())))?;

        let mut text = line[3..].trim().to_string();
        if line.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{code} ");
            loop {
                let mut next = String::new();
                let read = self
                    .reader
                    .read_line(&mut next)
                    .await
                    .map_err(|e| self.io_error(e))?;
                if read == 0 {
                    break;
                }
                text.push('\n');
                text.push_str(next.trim());
                if next.starts_with(&terminator) {
                    break;
                }
            }
        }
        Ok(Reply { code, text })
    }

    async fn command(&mut self, command: &str) -> Result<Reply> {
        self.writer
            .write_all(format!("{command}\r\n").as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        self.read_reply().await
    }

    fn reply_error(&self, command: &str, reply: &Reply) -> BackupError {
        let verb = command.split_whitespace().next().unwrap_or(command);
        match reply.code {
            530 => BackupError::config(format!(
                "provider {}: ftp login rejected: {}",
                self.provider, reply.text
            )),
            400..=499 => BackupError::unavailable(
                &self.provider,
                format!("{verb} failed: {} {}", reply.code, reply.text),
            ),
            _ => BackupError::storage(format!(
                "provider {}: {verb} failed: {} {}",
                self.provider, reply.code, reply.text
            )),
        }
    }

    async fn expect(&mut self, command: &str) -> Result<Reply> {
        let reply = self.command(command).await?;
        if reply.is_positive() {
            Ok(reply)
        } else {
            Err(self.reply_error(command, &reply))
        }
    }

    async fn open_data(&mut self) -> Result<TcpStream> {
        let reply = self.expect("PASV").await?;
        let port = parse_pasv_port(&reply.text).ok_or_else(|| {
            BackupError::storage(format!("unparseable PASV reply: {}", reply.text))
        })?;
        // the control host is reused; servers behind NAT often advertise a private address
        TcpStream::connect((self.host.as_str(), port))
            .await
            .map_err(|e| self.io_error(e))
    }

    async fn store(&mut self, verb: &str, path: &str, data: &[u8]) -> Result<()> {
        let mut data_stream = self.open_data().await?;
        let command = format!("{verb} {path}");
        self.expect(&command).await?;
        data_stream
            .write_all(data)
            .await
            .map_err(|e| self.io_error(e))?;
        data_stream.shutdown().await.map_err(|e| self.io_error(e))?;
        drop(data_stream);
        let done = self.read_reply().await?;
        if !done.is_positive() {
            return Err(self.reply_error(&command, &done));
        }
        Ok(())
    }

    async fn retrieve(&mut self, command: &str) -> Result<Vec<u8>> {
        let mut data_stream = self.open_data().await?;
        let reply = self.command(command).await?;
        if !reply.is_positive() {
            return Err(self.reply_error(command, &reply));
        }
        let mut buffer = Vec::new();
        data_stream
            .read_to_end(&mut buffer)
            .await
            .map_err(|e| self.io_error(e))?;
        let done = self.read_reply().await?;
        if !done.is_positive() {
            return Err(self.reply_error(command, &done));
        }
        Ok(buffer)
    }

    async fn quit(mut self) {
        let _ = self.command("QUIT").await;
    }
}

#[derive(Debug)]
pub struct FtpProvider {
    name: String,
    host: String,
    port: u16,
    username: String,
    password: String,
    root_dir: String,
    connect_timeout: Duration,
}

impl FtpProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let ProviderSettings::Ftp {
            host,
            port,
            username,
            password_env,
            root_dir,
        } = &config.settings
        else {
            return Err(BackupError::config(format!(
                "provider {} is not an ftp server",
                config.name
            )));
        };

        Ok(Self {
            name: config.name.clone(),
            host: host.clone(),
            port: *port,
            username: username.clone(),
            password: secret_from_env(&config.name, password_env)?,
            root_dir: root_dir.trim_end_matches('/').to_string(),
            connect_timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn remote_path(&self, key: &str) -> String {
        if self.root_dir.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root_dir, key.trim_start_matches('/'))
        }
    }

    async fn connect(&self) -> Result<FtpSession> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| BackupError::unavailable(&self.name, "ftp connect timed out"))?
        .map_err(|e| BackupError::unavailable(&self.name, format!("ftp connect failed: {e}")))?;

        let (read_half, write_half) = stream.into_split();
        let mut session = FtpSession {
            provider: self.name.clone(),
            host: self.host.clone(),
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        let greeting = session.read_reply().await?;
        if greeting.code != 220 {
            return Err(session.reply_error("connect", &greeting));
        }
        let user = session
            .expect(&format!("USER {}", self.username))
            .await?;
        if user.code == 331 {
            session.expect(&format!("PASS {}", self.password)).await?;
        }
        session.expect("TYPE I").await?;
        Ok(session)
    }

    async fn make_parents(&self, session: &mut FtpSession, path: &str) -> Result<()> {
        let Some((parent, _)) = path.rsplit_once('/') else {
            return Ok(());
        };
        let mut current = String::new();
        for segment in parent.split('/') {
            if segment.is_empty() {
                current.push('/');
                continue;
            }
            current.push_str(segment);
            // 550 when the directory already exists
            let _ = session.command(&format!("MKD {current}")).await?;
            current.push('/');
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for FtpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ftp
    }

    async fn begin_upload(&self, key: &str) -> Result<UploadHandle> {
        let path = self.remote_path(key);
        let mut session = self.connect().await?;
        self.make_parents(&mut session, &path).await?;
        // clear a leftover partial from an earlier crashed upload
        let _ = session
            .command(&format!("DELE {path}{PARTIAL_SUFFIX}"))
            .await?;
        session.quit().await;
        Ok(UploadHandle::new(key))
    }

    async fn upload_part(&self, handle: &mut UploadHandle, data: Bytes) -> Result<()> {
        let path = format!("{}{PARTIAL_SUFFIX}", self.remote_path(&handle.key));
        let mut session = self.connect().await?;
        session.store("APPE", &path, &data).await?;
        session.quit().await;
        handle.part_count += 1;
        handle.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn complete_upload(&self, handle: UploadHandle) -> Result<u64> {
        let path = self.remote_path(&handle.key);
        let mut session = self.connect().await?;
        if handle.part_count == 0 {
            session.store("STOR", &path, &[]).await?;
        } else {
            session
                .expect(&format!("RNFR {path}{PARTIAL_SUFFIX}"))
                .await?;
            session.expect(&format!("RNTO {path}")).await?;
        }
        session.quit().await;
        debug!(provider = %self.name, key = %handle.key, bytes = handle.bytes_written, "Upload completed");
        Ok(handle.bytes_written)
    }

    async fn abort_upload(&self, handle: UploadHandle) -> Result<()> {
        let path = format!("{}{PARTIAL_SUFFIX}", self.remote_path(&handle.key));
        let mut session = self.connect().await?;
        let reply = session.command(&format!("DELE {path}")).await?;
        session.quit().await;
        if reply.is_positive() || reply.code == 550 {
            Ok(())
        } else {
            Err(BackupError::unavailable(
                &self.name,
                format!("abort failed: {} {}", reply.code, reply.text),
            ))
        }
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        let path = self.remote_path(key);
        let mut session = self.connect().await?;
        let data = match session.retrieve(&format!("RETR {path}")).await {
            Err(BackupError::Storage { message }) if message.contains(" 550 ") => {
                return Err(not_found(&self.name, key))
            }
            other => other?,
        };
        session.quit().await;
        Ok(Bytes::from(data))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let dir_key = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let dir = self.remote_path(dir_key);
        let mut session = self.connect().await?;

        let listing = match session.retrieve(&format!("NLST {dir}")).await {
            Ok(listing) => listing,
            Err(BackupError::Storage { message }) if message.contains(" 550 ") => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut objects = Vec::new();
        for name in String::from_utf8_lossy(&listing).lines() {
            let name = name.trim();
            if name.is_empty() || name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let base = name.rsplit('/').next().unwrap_or(name);
            let key = if dir_key.is_empty() {
                base.to_string()
            } else {
                format!("{dir_key}/{base}")
            };
            if !key.starts_with(prefix) {
                continue;
            }
            let size = session
                .command(&format!("SIZE {}", self.remote_path(&key)))
                .await
                .ok()
                .filter(|reply| reply.code == 213)
                .and_then(|reply| reply.text.trim().parse().ok())
                .unwrap_or(0);
            objects.push(ObjectInfo {
                key,
                size_bytes: size,
                modified_at: None,
            });
        }
        session.quit().await;
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut session = self.connect().await?;
        let command = format!("DELE {}", self.remote_path(key));
        let reply = session.command(&command).await?;
        let result = match reply.code {
            250 | 200 => Ok(()),
            550 => Err(not_found(&self.name, key)),
            _ => Err(session.reply_error(&command, &reply)),
        };
        session.quit().await;
        result
    }

    async fn test_connection(&self) -> Result<()> {
        let mut session = self.connect().await?;
        session.expect("NOOP").await?;
        session.quit().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pasv_port() {
        assert_eq!(
            parse_pasv_port("Entering Passive Mode (192,168,1,10,195,80)."),
            Some(195 * 256 + 80)
        );
        assert_eq!(parse_pasv_port("Entering Passive Mode"), None);
        assert_eq!(parse_pasv_port("(1,2,3,4,300,1)"), None);
    }

    #[test]
    fn test_remote_path_joins_root() {
        let provider = FtpProvider {
            name: "ftp".to_string(),
            host: "localhost".to_string(),
            port: 21,
            username: "backup".to_string(),
            password: "secret".to_string(),
            root_dir: "/srv/backups".to_string(),
            connect_timeout: Duration::from_secs(1),
        };
        assert_eq!(
            provider.remote_path("nightly/a.bkc"),
            "/srv/backups/nightly/a.bkc"
        );
    }
}
