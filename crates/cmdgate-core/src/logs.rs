//! Per-execution output logs and short-lived download keys for them.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::AsyncWriteExt;

use crate::config::LogsConfig;

pub const LOG_ACCESS_TTL: Duration = Duration::from_secs(3 * 60);
pub const LOG_KEY_LEN: usize = 30;

/// Maps random keys to log file names. Entries expire after the TTL and are
/// dropped lazily on the next access.
pub struct LogAccessCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl Default for LogAccessCache {
    fn default() -> Self {
        Self::new(LOG_ACCESS_TTL)
    }
}

impl LogAccessCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&self, filename: impl Into<String>) -> String {
        let key = random_key();
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, at)| now.duration_since(*at) < self.ttl);
        entries.insert(key.clone(), (filename.into(), now));
        key
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        let (filename, at) = entries.get(key)?;
        if at.elapsed() < self.ttl {
            return Some(filename.clone());
        }
        entries.remove(key);
        None
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn random_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(LOG_KEY_LEN)
        .map(char::from)
        .collect()
}

/// Identifies one execution's log: the issued-at second plus a sequence
/// number for runs of the same command within that second. Shown as
/// `1700000000` for the first run and `1700000000-1` onwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStamp {
    pub unix: i64,
    pub seq: u32,
}

impl LogStamp {
    pub fn new(unix: i64) -> Self {
        Self { unix, seq: 0 }
    }
}

impl fmt::Display for LogStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seq == 0 {
            write!(f, "{}", self.unix)
        } else {
            write!(f, "{}-{}", self.unix, self.seq)
        }
    }
}

impl FromStr for LogStamp {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((unix, seq)) => Ok(Self {
                unix: unix.parse()?,
                seq: seq.parse()?,
            }),
            None => Ok(Self::new(s.parse()?)),
        }
    }
}

/// Where execution logs live and how they are handed out.
#[derive(Clone)]
pub struct ExecLogs {
    dir: PathBuf,
    public_origin: String,
    cache: Arc<LogAccessCache>,
}

impl ExecLogs {
    pub fn new(dir: impl Into<PathBuf>, public_origin: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            public_origin: public_origin.into(),
            cache: Arc::new(LogAccessCache::default()),
        }
    }

    pub fn from_config(config: &LogsConfig) -> Self {
        Self::new(config.dir.clone(), config.public_origin.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache(&self) -> Arc<LogAccessCache> {
        self.cache.clone()
    }

    /// `exec-<path joined by '-'>-<stamp>`
    pub fn file_name(path: &[String], stamp: LogStamp) -> String {
        format!("exec-{}-{stamp}", path.join("-"))
    }

    pub fn file_path(&self, path: &[String], stamp: LogStamp) -> PathBuf {
        self.dir.join(Self::file_name(path, stamp))
    }

    /// Store `output` under the first free stamp for `unix`. Existing logs are
    /// never overwritten.
    pub async fn write(&self, path: &[String], unix: i64, output: &[u8]) -> std::io::Result<LogStamp> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut stamp = LogStamp::new(unix);
        let mut file = loop {
            let opened = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.file_path(path, stamp))
                .await;
            match opened {
                Ok(file) => break file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => stamp.seq += 1,
                Err(err) => return Err(err),
            }
        };
        file.write_all(output).await?;
        file.flush().await?;
        Ok(stamp)
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/log/{key}", self.public_origin.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_alphanumeric_and_unique() {
        let cache = LogAccessCache::default();
        let a = cache.insert("exec-a-1");
        let b = cache.insert("exec-b-2");
        assert_eq!(a.len(), LOG_KEY_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
        assert_eq!(cache.get(&a).as_deref(), Some("exec-a-1"));
        assert_eq!(cache.get(&b).as_deref(), Some("exec-b-2"));
        assert!(cache.get("nope").is_none());
    }

    #[test]
    fn entries_expire() {
        let cache = LogAccessCache::new(Duration::from_millis(20));
        let key = cache.insert("exec-a-1");
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entries_are_purged_on_insert() {
        let cache = LogAccessCache::new(Duration::from_millis(20));
        cache.insert("old");
        std::thread::sleep(Duration::from_millis(40));
        cache.insert("new");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn file_names_join_the_command_path() {
        let path = vec!["deploy".to_string(), "web".to_string()];
        assert_eq!(
            ExecLogs::file_name(&path, LogStamp::new(1700000000)),
            "exec-deploy-web-1700000000"
        );
        let second = LogStamp { unix: 1700000000, seq: 2 };
        assert_eq!(ExecLogs::file_name(&path, second), "exec-deploy-web-1700000000-2");
    }

    #[test]
    fn stamps_parse_with_and_without_sequence() {
        assert_eq!("42".parse::<LogStamp>().unwrap(), LogStamp::new(42));
        assert_eq!(
            "42-3".parse::<LogStamp>().unwrap(),
            LogStamp { unix: 42, seq: 3 }
        );
        assert!("42-".parse::<LogStamp>().is_err());
        assert!("abc".parse::<LogStamp>().is_err());
    }

    #[test]
    fn url_uses_public_origin() {
        let logs = ExecLogs::new("/tmp", "https://bot.example.com/");
        assert_eq!(logs.url_for("abc"), "https://bot.example.com/log/abc");
    }

    #[tokio::test]
    async fn write_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = ExecLogs::new(dir.path().join("nested"), "http://localhost");
        let stamp = logs.write(&["ping".to_string()], 42, b"pong\n").await.unwrap();
        assert_eq!(stamp, LogStamp::new(42));
        let file = dir.path().join("nested").join("exec-ping-42");
        assert_eq!(std::fs::read(&file).unwrap(), b"pong\n");
    }

    #[tokio::test]
    async fn runs_in_the_same_second_get_separate_logs() {
        let dir = tempfile::tempdir().unwrap();
        let logs = ExecLogs::new(dir.path(), "http://localhost");
        let path = ["slow".to_string()];
        let (a, b) = tokio::join!(
            logs.write(&path, 42, b"first\n"),
            logs.write(&path, 42, b"second\n")
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a, b);
        let mut seqs = [a.seq, b.seq];
        seqs.sort();
        assert_eq!(seqs, [0, 1]);

        let mut contents = [
            std::fs::read_to_string(logs.file_path(&path, a)).unwrap(),
            std::fs::read_to_string(logs.file_path(&path, b)).unwrap(),
        ];
        contents.sort();
        assert_eq!(contents, ["first\n", "second\n"]);
    }
}
