//! Line-based frame driver: each stdin line is one text frame, each reply
//! is printed as one stdout line.

use actors::InboundFrame;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use wire::Frame;

/// Feed stdin into the realtime ingress until stdin closes.
pub async fn run_stdin(ingress: mpsc::UnboundedSender<InboundFrame>) -> std::io::Result<()> {
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_replies(reply_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if ingress
            .send(InboundFrame::new(Frame::Text(line), reply_tx.clone()))
            .is_err()
        {
            tracing::warn!("Realtime ingress is closed, stopping stdin driver");
            break;
        }
    }

    drop(reply_tx);
    printer.abort();
    Ok(())
}

async fn print_replies(mut replies: mpsc::UnboundedReceiver<Frame>) {
    let mut stdout = tokio::io::stdout();
    while let Some(frame) = replies.recv().await {
        let line = match frame {
            Frame::Text(text) => text,
            Frame::Binary(bytes) => format!("<binary frame, {} bytes>", bytes.len()),
        };
        if let Err(e) = stdout.write_all(format!("{line}\n").as_bytes()).await {
            tracing::warn!("Could not write reply: {}", e);
            break;
        }
        let _ = stdout.flush().await;
    }
}
