//! Interactive terminal client
//!
//! Two tasks per session: one forwards typed lines to the server, the other
//! prints whatever the server sends. Whichever finishes first ends the
//! session, so a closed connection never leaves the other side blocked.
//!
//! Until the server accepts a username, every line is a registration
//! attempt, and the next line waits for the server's answer. Lines typed
//! ahead of that answer are therefore never sent under the wrong kind.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::protocol::{read_message, write_message, Message, Received};
use crate::transport::is_peer_gone;

/// Shown after every server message
pub const PROMPT: &str = "> ";

/// How long to keep printing after the user closed their input
const LINGER: Duration = Duration::from_secs(1);

/// Where the session stands with the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Waiting for the welcome prompt
    Connecting,
    /// Server is waiting for a username
    Unregistered,
    /// A username was sent and has not been answered
    Pending,
    /// Username accepted; lines are chat from now on
    Registered,
}

impl Registration {
    /// Whether the next input line can be sent now
    fn settled(&self) -> bool {
        matches!(self, Registration::Unregistered | Registration::Registered)
    }
}

/// Why the incoming half of a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Server sent an orderly `Disconnect`
    ServerDisconnected,
    /// Socket closed without a goodbye
    ServerClosed,
}

/// Run one chat session over `stream` using the process's stdin and stdout.
pub async fn run(stream: TcpStream) -> Result<(), TransportError> {
    let (mut reader, mut writer) = stream.into_split();
    let registration = Arc::new(watch::Sender::new(Registration::Connecting));

    let read_state = registration.clone();
    let mut read_task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        print_incoming(&mut reader, &mut stdout, &read_state).await
    });

    let mut write_task = tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        forward_input(stdin, &mut writer, &registration).await
    });

    tokio::select! {
        result = &mut read_task => {
            write_task.abort();
            match result {
                Ok(Ok(end)) => debug!("Session ended: {:?}", end),
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => warn!("Reader task failed: {}", e),
            }
        }
        result = &mut write_task => {
            match result {
                Ok(Ok(())) => debug!("Input closed"),
                Ok(Err(e)) if is_peer_gone(&e) => debug!("Server went away while sending"),
                Ok(Err(e)) => {
                    read_task.abort();
                    return Err(e.into());
                }
                Err(e) => warn!("Writer task failed: {}", e),
            }
            // Let the farewell from the server arrive before exiting.
            if tokio::time::timeout(LINGER, &mut read_task).await.is_err() {
                read_task.abort();
            }
        }
    }

    Ok(())
}

/// Print server messages until the server says goodbye or the socket closes.
///
/// Any server text received while connecting or while a username is pending
/// is the answer the input side is waiting for.
pub async fn print_incoming<R, W>(
    reader: &mut R,
    out: &mut W,
    registration: &watch::Sender<Registration>,
) -> std::io::Result<SessionEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        match read_message(reader).await {
            Ok(Received::Message(Message::ServerMessage { content })) => {
                out.write_all(format!("{content}\n{PROMPT}").as_bytes()).await?;
                out.flush().await?;
                registration.send_if_modified(|state| match state {
                    Registration::Connecting | Registration::Pending => {
                        *state = Registration::Unregistered;
                        true
                    }
                    _ => false,
                });
            }
            Ok(Received::Message(Message::RegistrationSuccess)) => {
                registration.send_replace(Registration::Registered);
            }
            Ok(Received::Message(Message::Disconnect)) => {
                out.write_all(b"\nServer closed the connection.\n").await?;
                out.flush().await?;
                return Ok(SessionEnd::ServerDisconnected);
            }
            Ok(Received::Message(other)) => {
                debug!("Ignoring unexpected message from server: {:?}", other);
            }
            Ok(Received::Malformed(e)) => {
                // Should not happen with a well-behaved server; skip it.
                warn!("Malformed frame from server: {}", e);
            }
            Ok(Received::Closed) => {
                out.write_all(b"\nServer closed. Please quit the program.\n")
                    .await?;
                out.flush().await?;
                return Ok(SessionEnd::ServerClosed);
            }
            Err(e) if is_peer_gone(&e) => return Ok(SessionEnd::ServerClosed),
            Err(e) => return Err(e),
        }
    }
}

/// Send each input line to the server.
///
/// Lines are usernames until the server accepts one, chat lines afterwards.
/// End of input sends `Disconnect`.
pub async fn forward_input<I, W>(
    input: I,
    writer: &mut W,
    registration: &watch::Sender<Registration>,
) -> std::io::Result<()>
where
    I: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut state = registration.subscribe();
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let Ok(current) = state.wait_for(Registration::settled).await.map(|s| *s) else {
            return Ok(());
        };

        let message = if current == Registration::Registered {
            Message::ClientMessage {
                content: line,
                recipient: None,
            }
        } else {
            registration.send_replace(Registration::Pending);
            Message::ClientRegistration { username: line }
        };
        write_message(writer, &message).await?;
    }

    debug!("Input closed, sending disconnect");
    write_message(writer, &Message::Disconnect).await?;
    writer.shutdown().await
}
