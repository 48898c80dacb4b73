//! Detector adapter that runs an external command per file.
//!
//! The command is invoked as
//! `<program> <args...> <file> --interval-ms <n> [--roi x,y,w,h]` and must
//! write one JSON object per detection to stdout:
//!
//! ```text
//! {"offset_ms": 1500, "code": "ORD-42", "hands": 2}
//! ```
//!
//! Every field other than `offset_ms` becomes the opaque payload. Exit code
//! `2` reports corrupt or unsupported media; any other non-zero exit is a
//! transient failure. Dropping the stream kills the process.

use std::process::Stdio;

use futures::StreamExt;
use packline_core::detector::{DetectRequest, DetectionRecord, DetectionStream, Detector, DetectorError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;

/// Exit code the detector uses for unreadable media.
pub const EXIT_CORRUPT_MEDIA: i32 = 2;

/// Records buffered between the reader task and the consumer.
const CHANNEL_CAPACITY: usize = 64;

pub struct CommandDetector {
    program: String,
    args: Vec<String>,
}

impl CommandDetector {
    /// `command[0]` is the program, the rest are leading arguments.
    pub fn new(command: Vec<String>) -> Self {
        let mut parts = command.into_iter();
        let program = parts.next().unwrap_or_else(|| "packline-detect".to_string());
        Self {
            program,
            args: parts.collect(),
        }
    }

    fn command(&self, request: &DetectRequest) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&request.path)
            .arg("--interval-ms")
            .arg(request.frame_interval.as_millis().to_string());
        if let Some(roi) = request.roi {
            cmd.arg("--roi").arg(roi.to_string());
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Detector for CommandDetector {
    fn detect(&self, request: DetectRequest) -> DetectionStream {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cmd = self.command(&request);
        let path = request.path.display().to_string();
        tokio::spawn(drive(cmd, path, tx));

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }
}

type Sender = mpsc::Sender<Result<DetectionRecord, DetectorError>>;

/// Run the process, forwarding parsed records until it exits or the
/// consumer goes away.
async fn drive(mut cmd: tokio::process::Command, path: String, tx: Sender) {
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = tx
                .send(Err(DetectorError::Failed(format!("failed to start detector: {e}"))))
                .await;
            return;
        }
    };

    let (Some(stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = tx
            .send(Err(DetectorError::Failed("detector pipes unavailable".to_string())))
            .await;
        return;
    };

    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf).await;
        buf
    });

    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!(path = %path, "Detection stream dropped, killing detector");
                let _ = child.kill().await;
                return;
            }
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                let parsed = parse_detection_line(&line);
                let fatal = parsed.is_err();
                if tx.send(parsed).await.is_err() || fatal {
                    let _ = child.kill().await;
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx
                    .send(Err(DetectorError::Failed(format!("reading detector output: {e}"))))
                    .await;
                let _ = child.kill().await;
                return;
            }
        }
    }

    let status = tokio::select! {
        _ = tx.closed() => {
            let _ = child.kill().await;
            return;
        }
        status = child.wait() => status,
    };
    let status = match status {
        Ok(status) => status,
        Err(e) => {
            let _ = tx.send(Err(DetectorError::Failed(format!("waiting for detector: {e}")))).await;
            return;
        }
    };
    if status.success() {
        return;
    }

    let stderr = stderr_task.await.unwrap_or_default();
    let stderr = stderr.trim().to_string();
    let err = match status.code() {
        Some(EXIT_CORRUPT_MEDIA) => DetectorError::CorruptMedia(stderr),
        code => DetectorError::Failed(format!("exit code {code:?}: {stderr}")),
    };
    let _ = tx.send(Err(err)).await;
}

/// Parse one stdout line into a record.
pub fn parse_detection_line(line: &str) -> Result<DetectionRecord, DetectorError> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| DetectorError::Failed(format!("malformed detector output: {e}")))?;
    let serde_json::Value::Object(mut fields) = value else {
        return Err(DetectorError::Failed(
            "detector output is not a JSON object".to_string(),
        ));
    };
    let offset_ms = fields
        .remove("offset_ms")
        .and_then(|v| v.as_i64())
        .filter(|offset| *offset >= 0)
        .ok_or_else(|| DetectorError::Failed("detector output lacks a valid offset_ms".to_string()))?;
    Ok(DetectionRecord::new(offset_ms, serde_json::Value::Object(fields)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use std::time::Duration;

    fn request() -> DetectRequest {
        DetectRequest {
            path: "/tmp/clip.mp4".into(),
            frame_interval: Duration::from_millis(500),
            roi: None,
        }
    }

    fn script(body: &str) -> CommandDetector {
        // `sh -c <body> <file> ...`: the file becomes $0.
        CommandDetector::new(vec!["sh".into(), "-c".into(), body.into()])
    }

    #[test]
    fn parses_offset_and_keeps_other_fields() {
        let rec = parse_detection_line(r#"{"offset_ms": 1500, "code": "ORD-1"}"#).unwrap();
        assert_eq!(rec.offset_ms, 1500);
        assert_eq!(rec.code(), Some("ORD-1"));
        assert!(rec.payload.get("offset_ms").is_none());
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_matches!(parse_detection_line("not json"), Err(DetectorError::Failed(_)));
        assert_matches!(parse_detection_line("[1,2]"), Err(DetectorError::Failed(_)));
        assert_matches!(parse_detection_line(r#"{"code": "x"}"#), Err(DetectorError::Failed(_)));
        assert_matches!(parse_detection_line(r#"{"offset_ms": -5}"#), Err(DetectorError::Failed(_)));
    }

    #[tokio::test]
    async fn streams_records_from_process_output() {
        let detector = script(r#"echo '{"offset_ms": 0}'; echo; echo '{"offset_ms": 500, "code": "A"}'"#);
        let results: Vec<_> = detector.detect(request()).collect().await;
        assert_eq!(results.len(), 2);
        let second = results[1].as_ref().unwrap();
        assert_eq!(second.offset_ms, 500);
        assert_eq!(second.code(), Some("A"));
    }

    #[tokio::test]
    async fn exit_code_two_is_corrupt_media() {
        let detector = script("echo 'bad header' >&2; exit 2");
        let results: Vec<_> = detector.detect(request()).collect().await;
        assert_eq!(results.len(), 1);
        assert_matches!(&results[0], Err(DetectorError::CorruptMedia(msg)) if msg == "bad header");
    }

    #[tokio::test]
    async fn other_exit_codes_are_transient() {
        let detector = script(r#"echo '{"offset_ms": 0}'; exit 1"#);
        let results: Vec<_> = detector.detect(request()).collect().await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert_matches!(&results[1], Err(DetectorError::Failed(_)));
    }

    #[tokio::test]
    async fn missing_program_fails() {
        let detector = CommandDetector::new(vec!["/nonexistent/packline-detect".into()]);
        let results: Vec<_> = detector.detect(request()).collect().await;
        assert_matches!(results.as_slice(), [Err(DetectorError::Failed(_))]);
    }
}
