use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const RULE: &str = "----------------------------------------------------------------";

/// Timestamp used in the banner and on every captured line.
pub const LOG_DATE_FORMAT: &str = "%Y-%b-%d %H:%M:%S";

// ---------------------------------------------------------------------------
// Banner / footer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Banner<'a> {
    pub owner: &'a str,
    pub service: &'a str,
    pub node: &'a str,
    pub argv: &'a [String],
}

impl Banner<'_> {
    pub fn render(&self, started: chrono::DateTime<chrono::Local>) -> String {
        format!(
            "{RULE}\n Server started at {}\n Owner: {}\n Service: {}\n Node: {}\n Hostline: {}\n{RULE}\n",
            started.format(LOG_DATE_FORMAT),
            self.owner,
            self.service,
            self.node,
            self.argv.join(" "),
        )
    }
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("{n} {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

/// "D days H hours M minutes and S seconds".
pub fn format_uptime_long(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    format!(
        "{} {} {} and {}",
        plural(days, "day"),
        plural(hours, "hour"),
        plural(minutes, "minute"),
        plural(seconds, "second"),
    )
}

// ---------------------------------------------------------------------------
// InstanceLog: append-only per-instance log file
// ---------------------------------------------------------------------------

pub struct InstanceLog {
    file: tokio::fs::File,
}

impl InstanceLog {
    /// Open (append) the log and write the start banner.
    pub async fn create(
        path: &Path,
        banner: &Banner<'_>,
        started: chrono::DateTime<chrono::Local>,
    ) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(banner.render(started).as_bytes()).await?;
        file.flush().await?;
        Ok(Self { file })
    }

    pub async fn line(&mut self, line: &str) -> io::Result<()> {
        let ts = chrono::Local::now().format(LOG_DATE_FORMAT);
        self.file
            .write_all(format!("{ts} {line}\n").as_bytes())
            .await?;
        self.file.flush().await
    }

    pub async fn finish(mut self, uptime_secs: u64) -> io::Result<()> {
        let ts = chrono::Local::now().format(LOG_DATE_FORMAT);
        let footer = format!(
            "{ts} Server stopped! Uptime was {}.\n",
            format_uptime_long(uptime_secs)
        );
        self.file.write_all(footer.as_bytes()).await?;
        self.file.flush().await
    }
}

// ---------------------------------------------------------------------------
// OutputPipe: one pipe shared by a child's stdout and stderr
// ---------------------------------------------------------------------------

/// A single pipe whose write end is handed to the child twice, as stdout and
/// as stderr. Lines come out of `reader` in the order the child wrote them.
pub struct OutputPipe {
    pub reader: pipe::Receiver,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl OutputPipe {
    /// Must be called inside a tokio runtime. The parent's copies of the
    /// write end live in the `Command` the `Stdio` values are given to; drop
    /// it after spawning or the reader never sees EOF.
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = io::pipe()?;
        let stderr = writer.try_clone()?;
        let reader = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
        Ok(Self {
            reader,
            stdout: Stdio::from(writer),
            stderr: Stdio::from(stderr),
        })
    }
}

// ---------------------------------------------------------------------------
// spawn_line_forwarder: tokio task that reads piped child output
// ---------------------------------------------------------------------------

/// Forward every line of `reader` into `tx`. The task ends at EOF or when
/// the receiver is gone.
pub fn spawn_line_forwarder(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        let mut lines = TokioBufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "child output read failed");
                    break;
                }
            }
        }
    });
}

// ---------------------------------------------------------------------------
// tail_file: read last N lines from a file
// ---------------------------------------------------------------------------

pub fn tail_file(path: &Path, n: usize) -> io::Result<Vec<String>> {
    use std::io::{Read, Seek};

    if n == 0 {
        return Ok(Vec::new());
    }

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(Vec::new());
    }

    // Scan backwards for the offset of the n-th newline from the end.
    const CHUNK: u64 = 8192;
    let mut seen = 0usize;
    let mut pos = len;
    let mut start = 0u64;

    'scan: while pos > 0 {
        let from = pos.saturating_sub(CHUNK);
        let mut buf = vec![0u8; (pos - from) as usize];
        file.seek(io::SeekFrom::Start(from))?;
        file.read_exact(&mut buf)?;

        for (i, &b) in buf.iter().enumerate().rev() {
            if b == b'\n' {
                seen += 1;
                if seen > n {
                    start = from + i as u64 + 1;
                    break 'scan;
                }
            }
        }
        pos = from;
    }

    file.seek(io::SeekFrom::Start(start))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let mut lines: Vec<String> = String::from_utf8_lossy(&bytes)
        .lines()
        .map(String::from)
        .collect();
    lines.truncate(n);
    Ok(lines)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_format_uptime_long() {
        assert_eq!(
            format_uptime_long(0),
            "0 days 0 hours 0 minutes and 0 seconds"
        );
        assert_eq!(
            format_uptime_long(86_400 + 3600 + 60 + 1),
            "1 day 1 hour 1 minute and 1 second"
        );
        assert_eq!(
            format_uptime_long(2 * 86_400 + 5 * 3600 + 7 * 60 + 9),
            "2 days 5 hours 7 minutes and 9 seconds"
        );
    }

    #[test]
    fn test_banner_layout() {
        let argv = vec!["/srv/odasrv".to_string(), "-port".to_string(), "10666".to_string()];
        let banner = Banner {
            owner: "alice",
            service: "TestService",
            node: "node1",
            argv: &argv,
        };
        let text = banner.render(chrono::Local::now());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], RULE);
        assert!(lines[1].starts_with(" Server started at "));
        assert_eq!(lines[2], " Owner: alice");
        assert_eq!(lines[3], " Service: TestService");
        assert_eq!(lines[4], " Node: node1");
        assert_eq!(lines[5], " Hostline: /srv/odasrv -port 10666");
        assert_eq!(lines[6], RULE);
    }

    #[tokio::test]
    async fn test_instance_log_writes_banner_lines_and_footer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("abc.txt");
        let argv = vec!["server".to_string()];
        let banner = Banner {
            owner: "bob",
            service: "S",
            node: "n",
            argv: &argv,
        };

        let mut log = InstanceLog::create(&path, &banner, chrono::Local::now())
            .await
            .unwrap();
        log.line("UDP Initialized.").await.unwrap();
        log.finish(61).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 9);
        let stamped = regex::Regex::new(r"^\d{4}-[A-Z][a-z]{2}-\d{2} \d{2}:\d{2}:\d{2} ").unwrap();
        assert!(stamped.is_match(lines[7]), "{}", lines[7]);
        assert!(lines[7].ends_with(" UDP Initialized."));
        assert!(
            lines[8].ends_with(
                "Server stopped! Uptime was 0 days 0 hours 1 minute and 1 second."
            ),
            "{}",
            lines[8]
        );
    }

    #[tokio::test]
    async fn test_line_forwarder_stops_at_eof() {
        let (tx, mut rx) = mpsc::channel(8);
        spawn_line_forwarder(std::io::Cursor::new(b"a\nb\n".to_vec()), tx);

        let mut got = Vec::new();
        while let Some(line) = rx.recv().await {
            got.push(line);
        }
        assert_eq!(got, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_output_pipe_keeps_stdout_and_stderr_in_write_order() {
        let output = OutputPipe::new().unwrap();
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args([
            "-c",
            "echo 'Server using alternate port 22004.'; echo 'UDP Initialized.' >&2; \
             echo one; echo two >&2; echo three",
        ])
        .stdin(Stdio::null())
        .stdout(output.stdout)
        .stderr(output.stderr);
        let mut child = cmd.spawn().unwrap();
        drop(cmd);

        let (tx, mut rx) = mpsc::channel(8);
        spawn_line_forwarder(output.reader, tx);
        let mut got = Vec::new();
        while let Some(line) = rx.recv().await {
            got.push(line);
        }
        child.wait().await.unwrap();

        assert_eq!(
            got,
            vec![
                "Server using alternate port 22004.",
                "UDP Initialized.",
                "one",
                "two",
                "three"
            ]
        );
    }

    #[test]
    fn test_tail_file_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        let lines = tail_file(&dir.path().join("nope.txt"), 10).unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn test_tail_file_last_n() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("many.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        for i in 1..=20 {
            writeln!(f, "line{i}").unwrap();
        }
        assert_eq!(
            tail_file(&path, 3).unwrap(),
            vec!["line18", "line19", "line20"]
        );
        assert_eq!(tail_file(&path, 50).unwrap().len(), 20);
        assert!(tail_file(&path, 0).unwrap().is_empty());
    }
}
