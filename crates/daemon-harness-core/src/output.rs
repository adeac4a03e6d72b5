use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, warn};

/// Lines longer than this are split so a chatty child cannot grow the buffer unbounded
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Which pipe a line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSource::Stdout => f.write_str("stdout"),
            OutputSource::Stderr => f.write_str("stderr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub source: OutputSource,
    pub text: String,
}

/// Merged stdout/stderr of a child process, one line at a time
///
/// The stream ends once every writer (one pump per pipe) has finished.
pub struct OutputLines {
    rx: mpsc::UnboundedReceiver<OutputLine>,
}

impl OutputLines {
    pub fn new(rx: mpsc::UnboundedReceiver<OutputLine>) -> Self {
        Self { rx }
    }

    /// A closed stream that yields `lines` from stdout and then ends
    pub fn from_lines<S: ToString, I: IntoIterator<Item = S>>(lines: I) -> Self {
        let (tx, rx) = output_channel();
        for line in lines {
            let _ = tx.send(OutputLine {
                source: OutputSource::Stdout,
                text: line.to_string(),
            });
        }
        rx
    }

    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.rx.recv().await
    }
}

pub fn output_channel() -> (mpsc::UnboundedSender<OutputLine>, OutputLines) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, OutputLines::new(rx))
}

/// Decodes newline-terminated lines, lossily converting invalid UTF-8
#[derive(Debug, Default)]
pub struct LineDecoder {
    next_index: usize,
}

impl LineDecoder {
    fn take_line(&mut self, src: &mut BytesMut, len: usize, skip: usize) -> String {
        let raw = src.split_to(len);
        src.advance(skip);
        self.next_index = 0;

        let mut bytes = &raw[..];
        if let Some(stripped) = bytes.strip_suffix(b"\r") {
            bytes = stripped;
        }
        String::from_utf8_lossy(bytes).into_owned()
    }
}

impl Decoder for LineDecoder {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') {
            let len = self.next_index + offset;
            return Ok(Some(self.take_line(src, len, 1)));
        }

        if src.len() >= MAX_LINE_BYTES {
            return Ok(Some(self.take_line(src, MAX_LINE_BYTES, 0)));
        }

        self.next_index = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                let len = src.len();
                Ok(Some(self.take_line(src, len, 0)))
            }
        }
    }
}

/// Forward every line of `io` into `tx`, logging it under the `daemon_output` target
///
/// Keeps draining after the receiver is gone so the child never blocks on a full pipe.
pub fn spawn_output_pump<R>(
    io: R,
    source: OutputSource,
    process: String,
    tx: mpsc::UnboundedSender<OutputLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut frames = FramedRead::with_capacity(io, LineDecoder::default(), 8 * 1024);

        while let Some(frame) = frames.next().await {
            match frame {
                Ok(text) => {
                    debug!(target: "daemon_output", process = %process, stream = %source, "{text}");
                    let _ = tx.send(OutputLine { source, text });
                }
                Err(e) => {
                    warn!("Failed to read {source} of {process}: {e}");
                    break;
                }
            }
        }
    })
}
