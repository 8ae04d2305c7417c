//! Line framing for subprocess and forwarded log streams.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::message::{Kind, Message, Sink};

/// Copies `reader` onto `sink`, one message per line.
///
/// The trailing `\n` is stripped; a final unterminated fragment is flushed as its own
/// message when the stream ends. Invalid UTF-8 is replaced lossily. Returns the number
/// of messages sent, stopping early if the sink is closed.
pub async fn frame<R>(reader: R, source: &str, kind: Kind, sink: &Sink) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut sent = 0;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        let content = String::from_utf8_lossy(&line).into_owned();
        if sink.send(Message::new(source, kind, content)).await.is_err() {
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn collect(input: &[u8]) -> Vec<Message> {
        let (tx, mut rx) = mpsc::channel(64);
        let sent = frame(input, "api", Kind::Log, &tx).await.unwrap();
        drop(tx);
        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            out.push(msg);
        }
        assert_eq!(sent, out.len());
        out
    }

    #[tokio::test]
    async fn splits_terminated_lines() {
        let messages = collect(b"one\ntwo\nthree\n").await;
        let lines: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert!(messages.iter().all(|m| m.source == "api" && m.kind == Kind::Log));
    }

    #[tokio::test]
    async fn flushes_trailing_fragment() {
        let messages = collect(b"one\ntwo\npartial").await;
        let lines: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(lines, vec!["one", "two", "partial"]);
    }

    #[tokio::test]
    async fn keeps_empty_lines_and_carriage_returns() {
        let messages = collect(b"\nwin\r\n").await;
        let lines: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(lines, vec!["", "win\r"]);
    }

    #[tokio::test]
    async fn empty_stream_emits_nothing() {
        assert!(collect(b"").await.is_empty());
    }

    #[tokio::test]
    async fn stops_when_sink_closed() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let sent = frame(&b"a\nb\n"[..], "api", Kind::Error, &tx).await.unwrap();
        assert_eq!(sent, 0);
    }
}
